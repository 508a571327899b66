use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admin::{self, AdminState};
use crate::broker::{Broker, Event};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::session;

/// Ties the pieces together: the listener, the broker task, the admin
/// endpoint, and one session task per accepted connection.
pub struct GearmanServer {
    config: ServerConfig,
    listener: TcpListener,
    broker: Broker,
    event_tx: mpsc::Sender<Event>,
}

impl GearmanServer {
    /// Bind the protocol listener. Splitting bind from run lets tests
    /// use port 0 and read back the actual address.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let (broker, event_tx) = Broker::new(config.try_times);
        Ok(Self {
            config,
            listener,
            broker,
            event_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sender into the broker loop, for embedding or tests.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    /// Serve until SIGTERM or SIGINT. The signal watcher cancels a
    /// shared token, which drains the accept loop, the broker loop,
    /// the admin server, and every open session together.
    pub async fn run_until_signalled(self) {
        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();

        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(sigint) => sigint,
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, draining sessions");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, draining sessions");
                }
            }
            on_signal.cancel();
        });

        self.run(shutdown).await;
    }

    /// Accept connections until shutdown. The broker and the admin
    /// endpoint run as spawned tasks; accept errors are logged and
    /// skipped.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            config,
            listener,
            broker,
            event_tx,
        } = self;

        let broker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            broker.run(broker_shutdown).await;
        });

        if let Some(admin_addr) = config.admin_addr {
            let state = AdminState {
                event_tx: event_tx.clone(),
            };
            let admin_shutdown = shutdown.clone();
            tokio::spawn(async move {
                admin::run_admin(admin_addr, state, admin_shutdown).await;
            });
        }

        let idle_timeout =
            (config.keepalive_ms > 0).then(|| Duration::from_millis(config.keepalive_ms));
        let next_session_id = AtomicU64::new(0);

        match listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "listening for gearman connections"),
            Err(_) => tracing::info!("listening for gearman connections"),
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let session_id = next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::debug!(session_id, %peer, "connection accepted");
                            tokio::spawn(session::handle_connection(
                                session_id,
                                stream,
                                event_tx.clone(),
                                idle_timeout,
                                shutdown.clone(),
                            ));
                        }
                        Err(error) => {
                            tracing::warn!(%error, "accept failed, continuing");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, accept loop stopping");
                    break;
                }
            }
        }
    }
}
