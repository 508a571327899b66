//! Read-only monitoring endpoint. Every snapshot is produced by the
//! broker loop itself (via a `Snapshot` event), so the dumps can never
//! race a mutation.

use std::fmt::Write as _;
use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::{BrokerSnapshot, Event};

#[derive(Clone)]
pub struct AdminState {
    pub event_tx: mpsc::Sender<Event>,
}

pub async fn run_admin(addr: SocketAddr, state: AdminState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(%addr, "starting admin server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%addr, %error, "failed to bind admin server");
            return;
        }
    };

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(error) = serve.await {
        tracing::error!(%error, "admin server failed");
    }
}

pub fn router(state: AdminState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/job", get(job_status_handler))
        .route("/funcworker", get(func_worker_status_handler))
        .route("/worker", get(worker_status_handler))
        .route("/client", get(client_status_handler))
        .route("/api/status", get(api_status_handler))
        .layer(cors)
        .with_state(state)
}

async fn fetch_snapshot(state: &AdminState) -> Option<BrokerSnapshot> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .event_tx
        .send(Event::Snapshot { reply: reply_tx })
        .await
        .ok()?;
    reply_rx.await.ok()
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "broker unavailable\n").into_response()
}

pub async fn job_status_handler(State(state): State<AdminState>) -> Response {
    let Some(snapshot) = fetch_snapshot(&state).await else {
        return unavailable();
    };
    let mut out = String::from("waiting:[");
    for queue in &snapshot.queues {
        let _ = write!(out, "{}:{},", queue.func_name, queue.waiting);
    }
    out.push_str("]\n");
    let _ = writeln!(
        out,
        "pending:{}, working:{}",
        snapshot.pending_events, snapshot.working
    );
    out.into_response()
}

pub async fn func_worker_status_handler(State(state): State<AdminState>) -> Response {
    let Some(snapshot) = fetch_snapshot(&state).await else {
        return unavailable();
    };
    let mut out = String::new();
    for func in &snapshot.funcs {
        let _ = write!(out, "func {} to {}[", func.func_name, func.timeout_secs);
        for worker in &func.workers {
            let _ = write!(
                out,
                "id:{} cid:{} stats:{},",
                worker.session_id,
                worker.worker_id.as_deref().unwrap_or(""),
                worker.status
            );
        }
        out.push_str("]\n");
    }
    out.into_response()
}

pub async fn worker_status_handler(State(state): State<AdminState>) -> Response {
    let Some(snapshot) = fetch_snapshot(&state).await else {
        return unavailable();
    };
    let mut out = String::from("work[");
    for worker in &snapshot.workers {
        let _ = write!(
            out,
            "id:{} cid:{} stats:{},",
            worker.session_id,
            worker.worker_id.as_deref().unwrap_or(""),
            worker.status
        );
    }
    out.push_str("]\n");
    out.into_response()
}

pub async fn client_status_handler(State(state): State<AdminState>) -> Response {
    let Some(snapshot) = fetch_snapshot(&state).await else {
        return unavailable();
    };
    let mut out = String::from("client[");
    for session_id in &snapshot.clients {
        let _ = write!(out, "id:{},", session_id);
    }
    out.push_str("]\n");
    out.into_response()
}

pub async fn api_status_handler(State(state): State<AdminState>) -> Response {
    match fetch_snapshot(&state).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => unavailable(),
    }
}
