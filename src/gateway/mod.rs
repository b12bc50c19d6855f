//! Websocket gateway.
//!
//! Thin transport layer over the session event loop: `GET /ws` upgrades
//! the connection, frames are JSON text both ways, and the first message
//! a client receives is a `session_ready` system event carrying its
//! session id. Decode failures produce exactly one
//! `error_event{invalid_client_message}` per bad frame; the session
//! logic never sees them.

use crate::messages::{ClientMessage, ErrorSource, OutboundMessage};
use crate::outbound::OutboundScheduler;
use crate::session::event_loop::SessionDeps;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inbound client-message queue depth per connection.
const INBOUND_QUEUE_SIZE: usize = 64;

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    pub deps: SessionDeps,
    pub server_cancel: CancellationToken,
}

/// Build the HTTP router: websocket upgrade plus a health endpoint.
pub fn router(deps: SessionDeps, server_cancel: CancellationToken) -> Router {
    let state = AppState {
        deps,
        server_cancel,
    };
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let config = &state.deps.config;
    let session = state.deps.sessions.create(
        "local",
        "default",
        &config.voice.voice_id,
    );
    let session_id = session.id.clone();
    info!(session_id = session_id.as_str(), "websocket connected");

    let cancel = state.server_cancel.child_token();
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientMessage>(INBOUND_QUEUE_SIZE);
    let (outbound, mut outbound_rx) =
        OutboundScheduler::new(&config.outbound, std::sync::Arc::clone(&state.deps.metrics));

    let session_task =
        state
            .deps
            .spawn_session(session, inbound_rx, outbound.clone(), cancel.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    // The client needs its session id before it can send frames.
    outbound
        .send(OutboundMessage::system("session_ready", session_id.clone()))
        .await;

    // Egress: outbound queue → JSON text frames.
    let egress = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "outbound encode failed");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Ingest: text frames → validated client messages.
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let parsed = serde_json::from_str::<ClientMessage>(&text)
                    .map_err(|e| e.to_string())
                    .and_then(|message| message.validate().map(|()| message));
                match parsed {
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            // Session loop gone (e.g. STT stream closed).
                            break;
                        }
                    }
                    Err(detail) => {
                        state.deps.metrics.incr("invalid_client_message");
                        debug!(detail = detail.as_str(), "invalid client frame");
                        outbound
                            .send(OutboundMessage::error(
                                "invalid_client_message",
                                ErrorSource::Gateway,
                                false,
                                detail,
                            ))
                            .await;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        }
    }

    // Client side is gone: tear the session scope down, then stop egress.
    drop(inbound_tx);
    cancel.cancel();
    let _ = session_task.await;
    drop(outbound);
    let _ = egress.await;
    info!(session_id = session_id.as_str(), "websocket closed");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::brain::mock::MockBrain;
    use crate::config::CompanionConfig;
    use crate::metrics::Metrics;
    use crate::session::SessionManager;
    use crate::stt::mock::MockSttProvider;
    use crate::tts::mock::MockTtsProvider;
    use std::sync::Arc;
    use std::time::Duration;

    fn deps() -> SessionDeps {
        let config = Arc::new(CompanionConfig::default());
        SessionDeps {
            stt: Arc::new(MockSttProvider::new()),
            tts: Arc::new(MockTtsProvider::new()),
            brain: Arc::new(MockBrain::new()),
            memory: None,
            tasks: None,
            sessions: SessionManager::new(
                config.session.inactivity_timeout(),
                config.session.retention(),
            ),
            metrics: Arc::new(Metrics::new()),
            config,
        }
    }

    #[tokio::test]
    async fn healthz_responds() {
        let router = router(deps(), CancellationToken::new());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let body = reqwest::get(format!("http://{addr}/healthz"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn upgrade_creates_a_session() {
        let deps = deps();
        let sessions = deps.sessions.clone();
        let router = router(deps, CancellationToken::new());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.len(), 1);
        let _ = ws.close(None).await;
    }
}
