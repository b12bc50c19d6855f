//! Frame-level gateway tests over a real websocket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sylph::brain::mock::{MockBrain, MockReply};
use sylph::config::CompanionConfig;
use sylph::gateway;
use sylph::messages::OutboundMessage;
use sylph::metrics::Metrics;
use sylph::session::event_loop::SessionDeps;
use sylph::session::SessionManager;
use sylph::stt::mock::MockSttProvider;
use sylph::tts::mock::MockTtsProvider;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Server {
    stt: Arc<MockSttProvider>,
    metrics: Arc<Metrics>,
    addr: std::net::SocketAddr,
}

async fn start_server(replies: Vec<MockReply>) -> Server {
    let config = Arc::new(CompanionConfig::default());
    let stt = Arc::new(MockSttProvider::new());
    let metrics = Arc::new(Metrics::new());
    let deps = SessionDeps {
        stt: Arc::clone(&stt) as _,
        tts: Arc::new(MockTtsProvider::new()) as _,
        brain: Arc::new(MockBrain::with_replies(replies)) as _,
        memory: None,
        tasks: None,
        sessions: SessionManager::new(
            config.session.inactivity_timeout(),
            config.session.retention(),
        ),
        metrics: Arc::clone(&metrics),
        config,
    };

    let router = gateway::router(deps, CancellationToken::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Server { stt, metrics, addr }
}

async fn connect(server: &Server) -> (WsClient, String) {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    // First frame is session_ready with the session id.
    let session_id = loop {
        match next_message(&mut ws).await {
            OutboundMessage::SystemEvent { code, detail } if code == "session_ready" => {
                break detail;
            }
            _ => {}
        }
    };
    (ws, session_id)
}

async fn next_message(ws: &mut WsClient) -> OutboundMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("read failed");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("frame decodes as outbound message");
        }
    }
}

#[tokio::test]
async fn invalid_frame_yields_single_error_event() {
    let server = start_server(Vec::new()).await;
    let (mut ws, _session_id) = connect(&server).await;

    ws.send(Message::Text("{\"type\":\"nonsense\"}".to_owned().into()))
        .await
        .unwrap();

    match next_message(&mut ws).await {
        OutboundMessage::ErrorEvent { code, .. } => assert_eq!(code, "invalid_client_message"),
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(server.metrics.counter("invalid_client_message"), 1);
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn audio_chunks_reach_the_stt_provider() {
    let server = start_server(Vec::new()).await;
    let (mut ws, session_id) = connect(&server).await;

    let frame = json!({
        "type": "client_audio_chunk",
        "session_id": session_id,
        "seq": 1,
        "pcm16_base64": "AAAA",
        "sample_rate": 16000,
        "ts_ms": 1,
    });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let chunks = server.stt.handle(&session_id).unwrap().sent_chunks();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].pcm16_base64, "AAAA");
    assert_eq!(chunks[0].sample_rate, 16_000);
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn committed_speech_round_trips_to_text_and_audio() {
    let server = start_server(vec![MockReply::streamed(&[
        "All tests are green today.",
    ])])
    .await;
    let (mut ws, session_id) = connect(&server).await;

    server
        .stt
        .handle(&session_id)
        .unwrap()
        .committed("how are the tests", "endpoint")
        .await;

    let mut saw_committed = false;
    let mut text = String::new();
    let mut audio_chunks = 0usize;
    loop {
        match next_message(&mut ws).await {
            OutboundMessage::SttCommitted { text: t, .. } => {
                assert_eq!(t, "how are the tests");
                saw_committed = true;
            }
            OutboundMessage::AssistantTextDelta { text: t, .. } => text.push_str(&t),
            OutboundMessage::AssistantAudioChunk { .. } => audio_chunks += 1,
            OutboundMessage::AssistantTurnEnd { .. } => break,
            _ => {}
        }
    }

    assert!(saw_committed);
    assert_eq!(text, "All tests are green today.");
    assert!(audio_chunks > 0);
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn zero_sample_rate_is_rejected() {
    let server = start_server(Vec::new()).await;
    let (mut ws, session_id) = connect(&server).await;

    let frame = json!({
        "type": "client_audio_chunk",
        "session_id": session_id,
        "seq": 1,
        "pcm16_base64": "AAAA",
        "sample_rate": 0,
        "ts_ms": 1,
    });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();

    match next_message(&mut ws).await {
        OutboundMessage::ErrorEvent { code, .. } => assert_eq!(code, "invalid_client_message"),
        other => panic!("expected error event, got {other:?}"),
    }
    let _ = ws.close(None).await;
}
