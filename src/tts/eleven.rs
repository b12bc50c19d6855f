//! ElevenLabs-style websocket streaming TTS adapter.
//!
//! Opens one websocket per turn against the provider's streaming input
//! endpoint, sends an initial settings frame, then text frames as prosody
//! segments arrive. A read task converts incoming audio frames into
//! [`TtsEvent`]s. Audio payloads and their format tag pass through to the
//! client untouched.

use super::{TtsEvent, TtsProvider, TtsStream, VoiceSettings};
use crate::config::VoiceConfig;
use crate::error::{CompanionError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Incoming frame from the provider.
#[derive(Debug, Deserialize)]
struct ProviderFrame {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Websocket streaming TTS provider.
pub struct ElevenTtsProvider {
    endpoint: String,
    api_key: String,
    /// Format tag attached to outgoing audio chunks.
    format: String,
}

impl ElevenTtsProvider {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            format: "mp3_44100_128".to_owned(),
        }
    }

    fn stream_url(&self, voice_id: &str, model_id: &str) -> Result<Url> {
        let raw = format!(
            "{}/v1/text-to-speech/{voice_id}/stream-input?model_id={model_id}",
            self.endpoint.trim_end_matches('/')
        );
        Url::parse(&raw).map_err(|e| CompanionError::Tts(format!("bad endpoint url: {e}")))
    }
}

#[async_trait]
impl TtsProvider for ElevenTtsProvider {
    async fn start_stream(
        &self,
        cancel: CancellationToken,
        voice_id: &str,
        model_id: &str,
        settings: VoiceSettings,
    ) -> Result<(Box<dyn TtsStream>, mpsc::Receiver<TtsEvent>)> {
        let url = self.stream_url(voice_id, model_id)?;
        let (ws_stream, _) = tokio::select! {
            () = cancel.cancelled() => return Err(CompanionError::Cancelled),
            connected = tokio_tungstenite::connect_async(url.as_str()) => connected
                .map_err(|e| CompanionError::Tts(format!("connect failed: {e}")))?,
        };
        let (mut write, mut read) = ws_stream.split();

        // Opening frame: voice settings plus auth. The provider requires a
        // space in the initial text field to arm the stream.
        let init = serde_json::json!({
            "text": " ",
            "voice_settings": {
                "stability": settings.stability,
                "similarity_boost": settings.similarity_boost,
                "speed": settings.speed,
            },
            "xi_api_key": self.api_key,
        });
        write
            .send(Message::Text(init.to_string().into()))
            .await
            .map_err(|e| CompanionError::Tts(format!("settings frame failed: {e}")))?;

        let (events_tx, events_rx) = mpsc::channel(64);
        let format = self.format.clone();
        let read_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = read_cancel.cancelled() => break,
                    frame = read.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: ProviderFrame = match serde_json::from_str(&text) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                debug!(error = %e, "unparseable tts frame, skipping");
                                continue;
                            }
                        };
                        if let Some(message) = parsed.error {
                            let _ = events_tx
                                .send(TtsEvent::Error {
                                    code: parsed.code.unwrap_or_else(|| "tts_stream_error".to_owned()),
                                    detail: message,
                                    retryable: true,
                                })
                                .await;
                            continue;
                        }
                        if let Some(audio) = parsed.audio {
                            if !audio.is_empty()
                                && events_tx
                                    .send(TtsEvent::Audio {
                                        audio_base64: audio,
                                        format: format.clone(),
                                    })
                                    .await
                                    .is_err()
                            {
                                break;
                            }
                        }
                        if parsed.is_final == Some(true) {
                            let _ = events_tx.send(TtsEvent::Final).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events_tx.send(TtsEvent::Final).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "tts websocket read failed");
                        let _ = events_tx
                            .send(TtsEvent::Error {
                                code: "tts_read_failed".to_owned(),
                                detail: e.to_string(),
                                retryable: true,
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        let stream = ElevenTtsStream {
            write: Mutex::new(write),
        };
        Ok((Box::new(stream), events_rx))
    }

    fn name(&self) -> &'static str {
        "elevenlabs"
    }
}

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

struct ElevenTtsStream {
    write: Mutex<WsWrite>,
}

#[async_trait]
impl TtsStream for ElevenTtsStream {
    async fn send_text(&self, text: &str, try_trigger: bool) -> Result<()> {
        // Provider protocol expects a trailing space between chunks.
        let frame = serde_json::json!({
            "text": format!("{text} "),
            "try_trigger_generation": try_trigger,
        });
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| CompanionError::Tts(format!("text frame failed: {e}")))
    }

    async fn close_input(&self) -> Result<()> {
        // An empty text frame flushes and closes the input side.
        let frame = serde_json::json!({ "text": "" });
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|e| CompanionError::Tts(format!("close frame failed: {e}")))
    }

    async fn close(&self) {
        let mut write = self.write.lock().await;
        let _ = write.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn stream_url_includes_voice_and_model() {
        let provider = ElevenTtsProvider::new(&VoiceConfig {
            endpoint: "wss://api.example.com/".to_owned(),
            ..VoiceConfig::default()
        });
        let url = provider.stream_url("v9", "m2").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.example.com/v1/text-to-speech/v9/stream-input?model_id=m2"
        );
    }

    #[test]
    fn provider_frame_parses_audio_and_final() {
        let frame: ProviderFrame =
            serde_json::from_str(r#"{"audio":"QUJD","isFinal":true}"#).unwrap();
        assert_eq!(frame.audio.as_deref(), Some("QUJD"));
        assert_eq!(frame.is_final, Some(true));
        assert!(frame.error.is_none());
    }

    #[test]
    fn provider_frame_parses_error() {
        let frame: ProviderFrame =
            serde_json::from_str(r#"{"error":"quota exceeded","code":"quota"}"#).unwrap();
        assert_eq!(frame.error.as_deref(), Some("quota exceeded"));
        assert_eq!(frame.code.as_deref(), Some("quota"));
    }
}
