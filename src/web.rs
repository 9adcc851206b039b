use crate::parser;
use crate::probe::{self, ProbeReport, ProxiedRequest};
use crate::session::SessionManager;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tower_http::trace::TraceLayer;

/// Sampling cadence floor for live monitoring.
const MIN_SAMPLE_INTERVAL: f64 = 0.2;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub shutdown_tx: broadcast::Sender<()>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/monitor/ws", get(monitor_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn monitor_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_monitor(socket, state))
}

#[derive(Deserialize)]
struct InitMessage {
    #[serde(default)]
    link: String,
    #[serde(default = "default_interval")]
    interval: f64,
}

fn default_interval() -> f64 {
    1.0
}

/// One live-monitor connection: the client sends a single `{link, interval}`
/// message, then receives a sample per tick until it disconnects. The
/// connection owns its persistent engine session; every exit path below
/// reaches `session.stop()`, and an abandoned task still reclaims process
/// and directory via the session's drop guards.
async fn handle_monitor(mut socket: WebSocket, state: AppState) {
    let init = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };

    let init: InitMessage = match serde_json::from_str(&init) {
        Ok(init) => init,
        Err(e) => {
            send_error(&mut socket, &format!("bad init message: {e}")).await;
            return;
        }
    };

    let link = init.link.trim();
    if link.is_empty() {
        send_error(&mut socket, "link is required").await;
        return;
    }
    let secs = if init.interval.is_finite() {
        init.interval.clamp(MIN_SAMPLE_INTERVAL, 86_400.0)
    } else {
        default_interval()
    };
    let interval = Duration::from_secs_f64(secs);

    // Parse failures surface synchronously to the caller.
    let endpoint = match parser::parse_link(link) {
        Ok(parsed) => parsed.into_endpoint(0),
        Err(e) => {
            send_error(&mut socket, &format!("invalid link: {e}")).await;
            return;
        }
    };

    let session = match state.sessions.open(&endpoint).await {
        Ok(session) => session,
        Err(e) => {
            send_error(&mut socket, &format!("engine session failed: {e}")).await;
            return;
        }
    };
    tracing::info!(
        "live monitor started for {} (socks port {})",
        endpoint.name,
        session.socks_port()
    );

    let engine = state.sessions.engine();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    loop {
        let report = match probe::socks_client(session.proxy_url()) {
            Ok(client) => ProbeReport::from_result(
                probe::timed_request(
                    &client,
                    &ProxiedRequest::get(&engine.test_url, engine.monitor_timeout()),
                )
                .await,
            ),
            Err(e) => ProbeReport::down(format!("proxy client error: {e}")),
        };

        let sample = json!({
            "type": "sample",
            "ts": Utc::now().to_rfc3339(),
            "ok": report.ok,
            "latency_ms": report.latency_ms,
            "error": report.error,
        });
        if socket.send(Message::Text(sample.to_string())).await.is_err() {
            break;
        }

        tokio::select! {
            _ = sleep(interval) => {}
            message = socket.recv() => {
                match message {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // Anything else from the client is ignored.
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    tracing::info!("live monitor for {} closed", endpoint.name);
    session.stop().await;
}

/// One terminal error message; the socket closes when it drops.
async fn send_error(socket: &mut WebSocket, message: &str) {
    let body = json!({ "type": "error", "message": message });
    let _ = socket.send(Message::Text(body.to_string())).await;
}
