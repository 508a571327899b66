//! Per-connection session handling: frames the wire protocol into
//! typed events, pushes them to the broker, and writes reply packets
//! back. The read loop and the writer are independent tasks so the
//! broker can never block on a slow peer.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::broker::{Event, JobPriority, SessionHandle, SessionId, WorkUpdate};
use crate::error::{GearmanError, Result};
use crate::protocol::packet::encode_response;
use crate::protocol::{Command, Packet, PacketHeader, ProtocolError, HEADER_LEN, REQ_MAGIC};

struct Session {
    id: SessionId,
    handle: SessionHandle,
    event_tx: mpsc::Sender<Event>,
    idle_timeout: Option<Duration>,
}

/// Serve one TCP connection until EOF, error, idle timeout, or
/// shutdown, then announce `CloseSession` to the broker and wait for
/// its acknowledgment so the broker tables are clean before the
/// session ends.
pub async fn handle_connection(
    id: SessionId,
    stream: TcpStream,
    event_tx: mpsc::Sender<Event>,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(id, write_half, outbound_rx));

    let session = Session {
        id,
        handle: SessionHandle::new(id, outbound_tx),
        event_tx,
        idle_timeout,
    };

    tracing::debug!(session_id = id, ?peer, "session opened");

    if let Err(error) = session.read_loop(read_half, &shutdown).await {
        tracing::warn!(session_id = id, %error, "session ended with error");
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    if session
        .event_tx
        .send(Event::CloseSession {
            session_id: id,
            reply: reply_tx,
        })
        .await
        .is_ok()
    {
        let _ = reply_rx.await;
    }

    // Dropping the session drops the last outbound sender once the
    // broker has forgotten this session, letting the writer drain and
    // exit.
    drop(session);
    let _ = writer.await;
    tracing::debug!(session_id = id, "session closed");
}

async fn write_loop(
    session_id: SessionId,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(packet) = outbound_rx.recv().await {
        if let Err(error) = writer.write_all(&packet).await {
            tracing::debug!(session_id, %error, "write failed, stopping writer");
            break;
        }
    }
}

impl Session {
    async fn read_loop(
        &self,
        mut reader: OwnedReadHalf,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut header_buf = [0u8; HEADER_LEN];
        loop {
            let header = tokio::select! {
                read = self.read_header(&mut reader, &mut header_buf) => {
                    match read? {
                        Some(header) => header,
                        None => return Ok(()),
                    }
                }
                _ = shutdown.cancelled() => return Ok(()),
            };

            let mut payload = vec![0u8; header.payload_len];
            if header.payload_len > 0 {
                reader.read_exact(&mut payload).await?;
            }

            let cmd = match Command::from_code(header.code) {
                Ok(cmd) => cmd,
                Err(error) => {
                    tracing::warn!(session_id = self.id, %error, "unknown command ignored");
                    continue;
                }
            };

            let packet = match Packet::decode(cmd, &payload) {
                Ok(packet) => packet,
                Err(error) => {
                    tracing::warn!(session_id = self.id, %cmd, %error, "malformed packet dropped");
                    continue;
                }
            };

            if let Err(error) = self.dispatch(packet).await {
                match error {
                    GearmanError::Protocol(error) => {
                        tracing::warn!(session_id = self.id, %cmd, %error, "malformed packet dropped");
                    }
                    fatal => return Err(fatal),
                }
            }
        }
    }

    /// Read the next packet header. `Ok(None)` means a clean end of
    /// the session: EOF before a header started, or the idle timeout
    /// expired.
    async fn read_header(
        &self,
        reader: &mut OwnedReadHalf,
        buf: &mut [u8; HEADER_LEN],
    ) -> Result<Option<PacketHeader>> {
        let read = match self.idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.read_exact(buf)).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::debug!(session_id = self.id, "idle timeout, closing session");
                    return Ok(None);
                }
            },
            None => reader.read_exact(buf).await,
        };

        match read {
            Ok(_) => {
                let header = PacketHeader::parse(buf)?;
                // Peers must frame with \0REQ; anything else is an
                // unrecoverable framing error.
                if header.magic != REQ_MAGIC {
                    return Err(ProtocolError::BadMagic(header.magic).into());
                }
                Ok(Some(header))
            }
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Translate one decoded packet into a broker event. For
    /// request/response commands this blocks on a fresh one-shot reply
    /// channel before the next read, preserving per-session ordering.
    async fn dispatch(&self, packet: Packet) -> Result<()> {
        match packet.cmd {
            Command::CanDo => {
                let func_name = packet.str_arg(0)?.to_string();
                self.send_event(Event::CanDo {
                    worker: self.handle.clone(),
                    func_name,
                    timeout_secs: 0,
                })
                .await
            }
            Command::CanDoTimeout => {
                let func_name = packet.str_arg(0)?.to_string();
                let timeout_secs = match packet.str_arg(1)?.parse() {
                    Ok(secs) => secs,
                    Err(_) => {
                        tracing::warn!(
                            session_id = self.id,
                            %func_name,
                            "bad CAN_DO_TIMEOUT seconds, using 0"
                        );
                        0
                    }
                };
                self.send_event(Event::CanDo {
                    worker: self.handle.clone(),
                    func_name,
                    timeout_secs,
                })
                .await
            }
            Command::CantDo => {
                let func_name = packet.str_arg(0)?.to_string();
                self.send_event(Event::CantDo {
                    session_id: self.id,
                    func_name,
                })
                .await
            }
            Command::ResetAbilities => {
                self.send_event(Event::ResetAbilities { session_id: self.id })
                    .await
            }
            Command::SetClientId => {
                let worker_id = packet.str_arg(0)?.to_string();
                self.send_event(Event::SetClientId {
                    session_id: self.id,
                    worker_id,
                })
                .await
            }
            Command::PreSleep => {
                self.send_event(Event::PreSleep {
                    worker: self.handle.clone(),
                })
                .await
            }
            Command::GrabJob | Command::GrabJobUniq => {
                self.grab_job(packet.cmd == Command::GrabJobUniq).await
            }
            cmd if cmd.is_submit() => self.submit_job(packet).await,
            Command::WorkStatus
            | Command::WorkComplete
            | Command::WorkData
            | Command::WorkWarning
            | Command::WorkFail
            | Command::WorkException => {
                let update = work_update_from(packet)?;
                self.send_event(Event::WorkReport {
                    session_id: self.id,
                    update,
                })
                .await
            }
            other => {
                tracing::warn!(session_id = self.id, cmd = %other, "unsupported command ignored");
                Ok(())
            }
        }
    }

    async fn grab_job(&self, unique: bool) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_event(Event::GrabJob {
            session_id: self.id,
            unique,
            reply: reply_tx,
        })
        .await?;

        let assignment = reply_rx.await.map_err(|_| GearmanError::ReplyDropped)?;
        let reply = match assignment {
            Some(job) if unique => encode_response(
                Command::JobAssignUniq,
                &[
                    job.handle.as_bytes(),
                    job.func_name.as_bytes(),
                    job.unique_id.as_bytes(),
                    job.data.as_slice(),
                ],
            ),
            Some(job) => encode_response(
                Command::JobAssign,
                &[
                    job.handle.as_bytes(),
                    job.func_name.as_bytes(),
                    job.data.as_slice(),
                ],
            ),
            None => encode_response(Command::NoJob, &[]),
        };
        self.handle.send(reply);
        Ok(())
    }

    async fn submit_job(&self, mut packet: Packet) -> Result<()> {
        let func_name = packet.str_arg(0)?.to_string();
        let unique_id = packet.str_arg(1)?.to_string();
        let data = packet.args.pop().unwrap_or_default();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_event(Event::SubmitJob {
            client: self.handle.clone(),
            func_name,
            unique_id,
            data,
            priority: submit_priority(packet.cmd),
            background: packet.cmd.is_background_submit(),
            reply: reply_tx,
        })
        .await?;

        let handle = reply_rx.await.map_err(|_| GearmanError::ReplyDropped)?;
        self.handle
            .send(encode_response(Command::JobCreated, &[handle.as_bytes()]));
        Ok(())
    }

    async fn send_event(&self, event: Event) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| GearmanError::BrokerUnavailable)
    }
}

fn submit_priority(cmd: Command) -> JobPriority {
    match cmd {
        Command::SubmitJobHigh | Command::SubmitJobHighBg => JobPriority::High,
        Command::SubmitJobLow | Command::SubmitJobLowBg => JobPriority::Low,
        _ => JobPriority::Normal,
    }
}

fn work_update_from(mut packet: Packet) -> Result<WorkUpdate> {
    let handle = packet.str_arg(0)?.to_string();
    let update = match packet.cmd {
        Command::WorkStatus => WorkUpdate::Status {
            handle,
            numerator: packet.str_arg(1)?.parse().unwrap_or(0),
            denominator: packet.str_arg(2)?.parse().unwrap_or(0),
        },
        Command::WorkFail => WorkUpdate::Fail { handle },
        Command::WorkData => WorkUpdate::Data {
            handle,
            payload: packet.args.pop().unwrap_or_default(),
        },
        Command::WorkWarning => WorkUpdate::Warning {
            handle,
            payload: packet.args.pop().unwrap_or_default(),
        },
        Command::WorkComplete => WorkUpdate::Complete {
            handle,
            payload: packet.args.pop().unwrap_or_default(),
        },
        Command::WorkException => WorkUpdate::Exception {
            handle,
            payload: packet.args.pop().unwrap_or_default(),
        },
        // dispatch() only routes the six work commands here
        other => return Err(crate::protocol::ProtocolError::UnknownCommand(other.code()).into()),
    };
    Ok(update)
}
