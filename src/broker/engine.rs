use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::event::{
    BrokerSnapshot, Event, FuncSnapshot, JobAssignment, QueueSnapshot, SessionHandle, SessionId,
    WorkUpdate, WorkerSnapshot,
};
use crate::broker::job::{HandleGenerator, Job, JobPriority};
use crate::protocol::packet::encode_response;
use crate::protocol::Command;
use crate::queue::{JobQueue, MemJobQueue};

/// How often the broker checks in-flight and queued jobs for expired
/// deadlines.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Connected,
    Running,
    PrepareForSleep,
    Sleep,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Connected => write!(f, "connected"),
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::PrepareForSleep => write!(f, "prepare_for_sleep"),
            WorkerStatus::Sleep => write!(f, "sleep"),
        }
    }
}

/// A session acting as worker. `can_do` maps function name to an
/// active flag; `last_grabbed` is the round-robin cursor for
/// `pop_job`.
#[derive(Debug)]
struct Worker {
    handle: SessionHandle,
    worker_id: Option<String>,
    status: WorkerStatus,
    can_do: BTreeMap<String, bool>,
    last_grabbed: Option<String>,
}

impl Worker {
    fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            worker_id: None,
            status: WorkerStatus::Connected,
            can_do: BTreeMap::new(),
            last_grabbed: None,
        }
    }
}

/// A session acting as client.
#[derive(Debug)]
struct Client {
    handle: SessionHandle,
}

/// The event-loop broker. Owns every piece of mutable server state and
/// processes exactly one event at a time; sessions and the admin
/// endpoint reach it only through the event channel.
pub struct Broker {
    event_rx: mpsc::Receiver<Event>,
    try_times: usize,
    handles: HandleGenerator,
    func_workers: HashMap<String, Vec<SessionId>>,
    func_timeout: HashMap<String, u32>,
    job_stores: HashMap<String, Box<dyn JobQueue>>,
    work_jobs: HashMap<String, Job>,
    workers: HashMap<SessionId, Worker>,
    clients: HashMap<SessionId, Client>,
    // Constant replies, built once.
    wakeup_packet: Vec<u8>,
    timeout_packet: Vec<u8>,
}

impl Broker {
    pub fn new(try_times: usize) -> (Self, mpsc::Sender<Event>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let broker = Self {
            event_rx,
            try_times,
            handles: HandleGenerator::from_env(),
            func_workers: HashMap::new(),
            func_timeout: HashMap::new(),
            job_stores: HashMap::new(),
            work_jobs: HashMap::new(),
            workers: HashMap::new(),
            clients: HashMap::new(),
            wakeup_packet: encode_response(Command::Noop, &[]),
            timeout_packet: encode_response(Command::WorkFail, &[b"job timeout"]),
        };

        (broker, event_tx)
    }

    /// Run the event loop until the channel closes or shutdown is
    /// requested. This is the serialization point for all state.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                maybe_event = self.event_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event),
                        None => {
                            tracing::info!("event channel closed, broker stopping");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_timeouts();
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, broker stopping");
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::CanDo {
                worker,
                func_name,
                timeout_secs,
            } => self.handle_can_do(worker, func_name, timeout_secs),
            Event::CantDo {
                session_id,
                func_name,
            } => self.handle_cant_do(session_id, &func_name),
            Event::ResetAbilities { session_id } => self.handle_reset_abilities(session_id),
            Event::SetClientId {
                session_id,
                worker_id,
            } => self.handle_set_client_id(session_id, worker_id),
            Event::PreSleep { worker } => self.handle_pre_sleep(worker),
            Event::GrabJob {
                session_id, reply, ..
            } => self.handle_grab_job(session_id, reply),
            Event::SubmitJob {
                client,
                func_name,
                unique_id,
                data,
                priority,
                background,
                reply,
            } => self.handle_submit_job(client, func_name, unique_id, data, priority, background, reply),
            Event::WorkReport { session_id, update } => self.handle_work_report(session_id, update),
            Event::CloseSession { session_id, reply } => self.handle_close_session(session_id, reply),
            Event::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Register the worker for `func_name`. Last writer wins on the
    /// function timeout, matching the wire semantics of
    /// `CAN_DO_TIMEOUT`.
    fn handle_can_do(&mut self, worker: SessionHandle, func_name: String, timeout_secs: u32) {
        let session_id = worker.id;

        let entry = self
            .workers
            .entry(session_id)
            .or_insert_with(|| Worker::new(worker));
        entry.can_do.insert(func_name.clone(), true);

        let roster = self.func_workers.entry(func_name.clone()).or_default();
        if !roster.contains(&session_id) {
            roster.push(session_id);
        }

        self.func_timeout.insert(func_name.clone(), timeout_secs);
        self.ensure_job_store(&func_name);

        tracing::debug!(session_id, %func_name, timeout_secs, "worker registered for function");
    }

    fn handle_cant_do(&mut self, session_id: SessionId, func_name: &str) {
        if let Some(roster) = self.func_workers.get_mut(func_name) {
            roster.retain(|id| *id != session_id);
        }
        match self.workers.get_mut(&session_id) {
            Some(worker) => {
                worker.can_do.remove(func_name);
                tracing::debug!(session_id, func_name, "worker dropped function");
            }
            None => {
                tracing::warn!(session_id, func_name, "CANT_DO from unregistered worker");
            }
        }
    }

    fn handle_reset_abilities(&mut self, session_id: SessionId) {
        let Some(worker) = self.workers.get_mut(&session_id) else {
            tracing::warn!(session_id, "RESET_ABILITIES from unregistered worker");
            return;
        };
        let funcs: Vec<String> = worker.can_do.keys().cloned().collect();
        worker.can_do.clear();
        worker.last_grabbed = None;
        for func_name in funcs {
            if let Some(roster) = self.func_workers.get_mut(&func_name) {
                roster.retain(|id| *id != session_id);
            }
        }
        tracing::debug!(session_id, "worker abilities reset");
    }

    fn handle_set_client_id(&mut self, session_id: SessionId, worker_id: String) {
        match self.workers.get_mut(&session_id) {
            Some(worker) => {
                tracing::debug!(session_id, %worker_id, "worker id set");
                worker.worker_id = Some(worker_id);
            }
            None => {
                tracing::warn!(session_id, "SET_CLIENT_ID from unregistered worker");
            }
        }
    }

    /// Put the worker to sleep, then immediately re-check its
    /// functions: a job may have arrived between its failed grab and
    /// this event, and that job's wakeup fan-out is already spent.
    fn handle_pre_sleep(&mut self, worker: SessionHandle) {
        let session_id = worker.id;

        let entry = self.workers.entry(session_id).or_insert_with(|| {
            tracing::warn!(session_id, "PRE_SLEEP from unregistered worker, re-registering");
            Worker::new(worker)
        });
        entry.status = WorkerStatus::Sleep;
        let handle = entry.handle.clone();
        let funcs: Vec<String> = entry
            .can_do
            .iter()
            .filter(|(_, active)| **active)
            .map(|(func, _)| func.clone())
            .collect();

        for func_name in funcs {
            if self.queue_len(&func_name) > 0 {
                tracing::trace!(session_id, %func_name, "waking worker on pre-sleep");
                handle.send(self.wakeup_packet.clone());
                break;
            }
        }
    }

    fn handle_grab_job(
        &mut self,
        session_id: SessionId,
        reply: tokio::sync::oneshot::Sender<Option<JobAssignment>>,
    ) {
        if !self.workers.contains_key(&session_id) {
            tracing::warn!(session_id, "GRAB_JOB from unregistered worker");
            let _ = reply.send(None);
            return;
        }

        if let Some(worker) = self.workers.get_mut(&session_id) {
            worker.status = WorkerStatus::Running;
        }

        match self.pop_job(session_id) {
            Some(mut job) => {
                job.process_at = Some(Utc::now());
                job.process_by = Some(session_id);
                let assignment = JobAssignment {
                    handle: job.handle.clone(),
                    func_name: job.func_name.clone(),
                    unique_id: job.unique_id.clone(),
                    data: job.data.clone(),
                };
                tracing::debug!(session_id, handle = %job.handle, "job assigned");
                self.work_jobs.insert(job.handle.clone(), job);
                let _ = reply.send(Some(assignment));
            }
            None => {
                if let Some(worker) = self.workers.get_mut(&session_id) {
                    worker.status = WorkerStatus::PrepareForSleep;
                }
                let _ = reply.send(None);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_submit_job(
        &mut self,
        client: SessionHandle,
        func_name: String,
        unique_id: String,
        data: Vec<u8>,
        priority: JobPriority,
        background: bool,
        reply: tokio::sync::oneshot::Sender<String>,
    ) {
        let session_id = client.id;
        self.clients
            .insert(session_id, Client { handle: client });

        let timeout_secs = self.func_timeout.get(&func_name).copied().unwrap_or(0);
        let job = Job::new(
            self.handles.next(),
            unique_id,
            func_name,
            data,
            priority,
            background,
            session_id,
            timeout_secs,
        );

        tracing::debug!(
            session_id,
            handle = %job.handle,
            func_name = %job.func_name,
            priority = %job.priority,
            background = job.background,
            "job submitted"
        );

        let _ = reply.send(job.handle.clone());
        self.enqueue_job(job);
    }

    /// Park the job and wake registered workers in insertion order, up
    /// to `try_times` of them (0 wakes all). Worker status is not
    /// consulted; `NOOP` is idempotent on the worker side.
    fn enqueue_job(&mut self, job: Job) {
        let func_name = job.func_name.clone();
        self.ensure_job_store(&func_name).push_job(job);

        let roster = match self.func_workers.get(&func_name) {
            Some(roster) => roster.clone(),
            None => return,
        };

        let mut woken = 0usize;
        for session_id in roster {
            let Some(worker) = self.workers.get(&session_id) else {
                continue;
            };
            tracing::trace!(session_id, %func_name, "wakeup sent");
            worker.handle.send(self.wakeup_packet.clone());
            woken += 1;
            if self.try_times > 0 && woken >= self.try_times {
                break;
            }
        }
    }

    fn handle_work_report(&mut self, session_id: SessionId, update: WorkUpdate) {
        let handle = update.handle().to_string();

        let Some(job) = self.work_jobs.get_mut(&handle) else {
            tracing::warn!(session_id, %handle, cmd = %update.command(), "work report for unknown handle dropped");
            return;
        };

        if let WorkUpdate::Status {
            numerator,
            denominator,
            ..
        } = &update
        {
            job.percent = *numerator;
            job.denominator = *denominator;
        }

        let background = job.background;
        let create_by = job.create_by;

        if update.is_terminal() {
            tracing::debug!(session_id, %handle, cmd = %update.command(), "job finished");
            self.work_jobs.remove(&handle);
        }

        if background {
            return;
        }

        match self.clients.get(&create_by) {
            Some(client) => client.handle.send(update.to_response_packet()),
            None => {
                tracing::trace!(%handle, create_by, "submitting client gone, forward dropped");
            }
        }
    }

    fn handle_close_session(
        &mut self,
        session_id: SessionId,
        reply: tokio::sync::oneshot::Sender<bool>,
    ) {
        if self.workers.remove(&session_id).is_some() {
            for roster in self.func_workers.values_mut() {
                roster.retain(|id| *id != session_id);
            }
            tracing::debug!(session_id, "worker removed");
        }
        if self.clients.remove(&session_id).is_some() {
            tracing::debug!(session_id, "client removed");
        }
        let _ = reply.send(true);
    }

    /// Round-robin over the worker's active functions in lexicographic
    /// order, resuming after the function that served the previous
    /// grab, so one busy function cannot starve the others.
    fn pop_job(&mut self, session_id: SessionId) -> Option<Job> {
        let (funcs, cursor) = {
            let worker = self.workers.get(&session_id)?;
            let funcs: Vec<String> = worker
                .can_do
                .iter()
                .filter(|(_, active)| **active)
                .map(|(func, _)| func.clone())
                .collect();
            (funcs, worker.last_grabbed.clone())
        };
        if funcs.is_empty() {
            return None;
        }

        let start = cursor
            .and_then(|last| funcs.iter().position(|func| *func == last))
            .map(|idx| idx + 1)
            .unwrap_or(0);

        for offset in 0..funcs.len() {
            let func_name = &funcs[(start + offset) % funcs.len()];
            if let Some(queue) = self.job_stores.get_mut(func_name) {
                if let Some(job) = queue.pop_job() {
                    tracing::trace!(session_id, handle = %job.handle, "job popped");
                    if let Some(worker) = self.workers.get_mut(&session_id) {
                        worker.last_grabbed = Some(func_name.clone());
                    }
                    return Some(job);
                }
            }
        }
        None
    }

    /// Expire jobs whose deadline has passed, both in-flight and still
    /// queued. Each expired job sends the constant
    /// `WORK_FAIL("job timeout")` to its creating client, if still
    /// connected. The assigned worker is not notified; its next report
    /// for the handle is dropped.
    fn sweep_timeouts(&mut self) {
        let now = Utc::now();

        let expired: Vec<String> = self
            .work_jobs
            .values()
            .filter(|job| job.timed_out(now))
            .map(|job| job.handle.clone())
            .collect();

        let mut dead: Vec<Job> = expired
            .into_iter()
            .filter_map(|handle| self.work_jobs.remove(&handle))
            .collect();

        for queue in self.job_stores.values_mut() {
            dead.extend(queue.take_expired(now));
        }

        for job in dead {
            tracing::warn!(handle = %job.handle, func_name = %job.func_name, "job timed out");
            if let Some(client) = self.clients.get(&job.create_by) {
                client.handle.send(self.timeout_packet.clone());
            }
        }
    }

    fn snapshot(&self) -> BrokerSnapshot {
        let mut queues: Vec<QueueSnapshot> = self
            .job_stores
            .iter()
            .map(|(func_name, queue)| QueueSnapshot {
                func_name: func_name.clone(),
                waiting: queue.len(),
            })
            .collect();
        queues.sort_by(|a, b| a.func_name.cmp(&b.func_name));

        let mut funcs: Vec<FuncSnapshot> = self
            .func_workers
            .iter()
            .map(|(func_name, roster)| FuncSnapshot {
                func_name: func_name.clone(),
                timeout_secs: self.func_timeout.get(func_name).copied().unwrap_or(0),
                workers: roster
                    .iter()
                    .filter_map(|id| self.workers.get(id))
                    .map(Self::worker_snapshot)
                    .collect(),
            })
            .collect();
        funcs.sort_by(|a, b| a.func_name.cmp(&b.func_name));

        let mut workers: Vec<WorkerSnapshot> =
            self.workers.values().map(Self::worker_snapshot).collect();
        workers.sort_by_key(|w| w.session_id);

        let mut clients: Vec<SessionId> = self.clients.keys().copied().collect();
        clients.sort_unstable();

        BrokerSnapshot {
            queues,
            working: self.work_jobs.len(),
            pending_events: self.event_rx.len(),
            funcs,
            workers,
            clients,
        }
    }

    fn worker_snapshot(worker: &Worker) -> WorkerSnapshot {
        WorkerSnapshot {
            session_id: worker.handle.id,
            worker_id: worker.worker_id.clone(),
            status: worker.status.to_string(),
        }
    }

    fn ensure_job_store(&mut self, func_name: &str) -> &mut Box<dyn JobQueue> {
        self.job_stores
            .entry(func_name.to_string())
            .or_insert_with(|| Box::new(MemJobQueue::new(func_name)))
    }

    fn queue_len(&self, func_name: &str) -> usize {
        self.job_stores
            .get(func_name)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }
}
