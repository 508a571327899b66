use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::broker::job::JobPriority;
use crate::protocol::{self, Command};

pub type SessionId = u64;

/// The broker's write path to one connected peer: the session id plus
/// a clone of the session's outbound packet queue. Dropping every
/// handle closes the queue and lets the session's writer task exit.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl SessionHandle {
    pub fn new(id: SessionId, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { id, outbound }
    }

    /// Queue a packet for the session's writer. A closed queue means
    /// the peer is gone; the packet is silently dropped.
    pub fn send(&self, packet: Vec<u8>) {
        if self.outbound.send(packet).is_err() {
            tracing::trace!(session_id = self.id, "outbound queue closed, packet dropped");
        }
    }
}

/// A work report from a worker, keyed by job handle.
#[derive(Debug, Clone)]
pub enum WorkUpdate {
    Data {
        handle: String,
        payload: Vec<u8>,
    },
    Warning {
        handle: String,
        payload: Vec<u8>,
    },
    Status {
        handle: String,
        numerator: u32,
        denominator: u32,
    },
    Complete {
        handle: String,
        payload: Vec<u8>,
    },
    Fail {
        handle: String,
    },
    Exception {
        handle: String,
        payload: Vec<u8>,
    },
}

impl WorkUpdate {
    pub fn handle(&self) -> &str {
        match self {
            WorkUpdate::Data { handle, .. }
            | WorkUpdate::Warning { handle, .. }
            | WorkUpdate::Status { handle, .. }
            | WorkUpdate::Complete { handle, .. }
            | WorkUpdate::Fail { handle }
            | WorkUpdate::Exception { handle, .. } => handle,
        }
    }

    /// Terminal reports remove the job from the in-flight table.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkUpdate::Complete { .. } | WorkUpdate::Fail { .. } | WorkUpdate::Exception { .. }
        )
    }

    pub fn command(&self) -> Command {
        match self {
            WorkUpdate::Data { .. } => Command::WorkData,
            WorkUpdate::Warning { .. } => Command::WorkWarning,
            WorkUpdate::Status { .. } => Command::WorkStatus,
            WorkUpdate::Complete { .. } => Command::WorkComplete,
            WorkUpdate::Fail { .. } => Command::WorkFail,
            WorkUpdate::Exception { .. } => Command::WorkException,
        }
    }

    /// Re-encode the report as a `\0RES` packet for the submitting
    /// client.
    pub fn to_response_packet(&self) -> Vec<u8> {
        match self {
            WorkUpdate::Data { handle, payload }
            | WorkUpdate::Warning { handle, payload }
            | WorkUpdate::Complete { handle, payload }
            | WorkUpdate::Exception { handle, payload } => protocol::packet::encode_response(
                self.command(),
                &[handle.as_bytes(), payload.as_slice()],
            ),
            WorkUpdate::Status {
                handle,
                numerator,
                denominator,
            } => protocol::packet::encode_response(
                Command::WorkStatus,
                &[
                    handle.as_bytes(),
                    numerator.to_string().as_bytes(),
                    denominator.to_string().as_bytes(),
                ],
            ),
            WorkUpdate::Fail { handle } => {
                protocol::packet::encode_response(Command::WorkFail, &[handle.as_bytes()])
            }
        }
    }
}

/// A grabbed job, as the session needs it to build `JOB_ASSIGN` or
/// `JOB_ASSIGN_UNIQ`.
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub handle: String,
    pub func_name: String,
    pub unique_id: String,
    pub data: Vec<u8>,
}

/// One protocol or control event, serialized through the broker loop.
/// Request/response commands bundle a single-use reply channel; the
/// broker sends exactly once and never receives.
#[derive(Debug)]
pub enum Event {
    CanDo {
        worker: SessionHandle,
        func_name: String,
        /// 0 for plain `CAN_DO`; last writer wins per function.
        timeout_secs: u32,
    },
    CantDo {
        session_id: SessionId,
        func_name: String,
    },
    ResetAbilities {
        session_id: SessionId,
    },
    SetClientId {
        session_id: SessionId,
        worker_id: String,
    },
    PreSleep {
        worker: SessionHandle,
    },
    GrabJob {
        session_id: SessionId,
        unique: bool,
        reply: oneshot::Sender<Option<JobAssignment>>,
    },
    SubmitJob {
        client: SessionHandle,
        func_name: String,
        unique_id: String,
        data: Vec<u8>,
        priority: JobPriority,
        background: bool,
        reply: oneshot::Sender<String>,
    },
    WorkReport {
        session_id: SessionId,
        update: WorkUpdate,
    },
    CloseSession {
        session_id: SessionId,
        reply: oneshot::Sender<bool>,
    },
    /// Read-only state dump for the admin endpoint.
    Snapshot {
        reply: oneshot::Sender<BrokerSnapshot>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub func_name: String,
    pub waiting: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub session_id: SessionId,
    pub worker_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FuncSnapshot {
    pub func_name: String,
    pub timeout_secs: u32,
    pub workers: Vec<WorkerSnapshot>,
}

/// Consistent point-in-time view of the broker tables, produced on the
/// broker task itself so it cannot race mutations.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerSnapshot {
    pub queues: Vec<QueueSnapshot>,
    pub working: usize,
    pub pending_events: usize,
    pub funcs: Vec<FuncSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
    pub clients: Vec<SessionId>,
}
