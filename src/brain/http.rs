//! HTTP reasoning adapter.
//!
//! Sends the request as JSON and reads deltas from a streaming response
//! body, either as server-sent events (`data: {...}` lines, terminated by
//! `data: [DONE]`) or as newline-delimited JSON. A single shared
//! `reqwest::Client` provides connection pooling across turns.

use super::{BrainRequest, BrainResponse, ReasoningAdapter};
use crate::config::{BrainConfig, BrainStreamFormat};
use crate::error::{CompanionError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One parsed line of the delta stream.
#[derive(Debug, Deserialize)]
struct StreamLine {
    /// Incremental text.
    #[serde(default)]
    delta: Option<String>,
    /// Final text, sent once at the end.
    #[serde(default)]
    text: Option<String>,
    /// Stream end marker for NDJSON bodies.
    #[serde(default)]
    done: bool,
}

/// Reasoning adapter over HTTP with a streaming body.
pub struct HttpBrain {
    client: reqwest::Client,
    url: String,
    format: BrainStreamFormat,
}

impl HttpBrain {
    /// Build the adapter and its pooled client.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed.
    pub fn new(config: &BrainConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CompanionError::Brain(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            format: config.stream_format,
        })
    }

    /// Accumulates split lines across body chunks.
    fn push_chunk(buffer: &mut String, chunk: &[u8]) -> Vec<String> {
        buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_owned();
            buffer.drain(..=pos);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Parse one line according to the configured framing.
    fn parse_line(&self, line: &str) -> Option<StreamLine> {
        let payload = match self.format {
            BrainStreamFormat::Sse => {
                let data = line.strip_prefix("data:")?.trim();
                if data == "[DONE]" {
                    return Some(StreamLine {
                        delta: None,
                        text: None,
                        done: true,
                    });
                }
                data.to_owned()
            }
            BrainStreamFormat::Ndjson => line.to_owned(),
        };
        match serde_json::from_str::<StreamLine>(&payload) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(error = %e, "skipping unparseable stream line");
                None
            }
        }
    }
}

#[async_trait]
impl ReasoningAdapter for HttpBrain {
    async fn stream(
        &self,
        cancel: CancellationToken,
        request: BrainRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<BrainResponse> {
        let body = serde_json::json!({
            "user_id": request.user_id,
            "session_id": request.session_id,
            "turn_id": request.turn_id,
            "input": request.input,
            "memory_context": request.memory_context,
            "persona_id": request.persona_id,
            "stream": true,
        });

        let send = self.client.post(&self.url).json(&body).send();
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(CompanionError::Cancelled),
            result = send => result
                .map_err(|e| CompanionError::Brain(format!("request failed: {e}")))?,
        };
        let response = response
            .error_for_status()
            .map_err(|e| CompanionError::Brain(format!("bad status: {e}")))?;

        let mut body_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut streamed = String::new();
        let mut final_text: Option<String> = None;

        'outer: loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(CompanionError::Cancelled),
                maybe = body_stream.next() => match maybe {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        return Err(CompanionError::Brain(format!("stream read failed: {e}")));
                    }
                    None => break,
                },
            };

            for line in Self::push_chunk(&mut buffer, &chunk) {
                let Some(parsed) = self.parse_line(&line) else {
                    continue;
                };
                if let Some(delta) = parsed.delta {
                    if !delta.is_empty() {
                        streamed.push_str(&delta);
                        if deltas.send(delta).await.is_err() {
                            return Err(CompanionError::Cancelled);
                        }
                    }
                }
                if let Some(text) = parsed.text {
                    final_text = Some(text);
                }
                if parsed.done {
                    break 'outer;
                }
            }
        }

        Ok(BrainResponse {
            text: final_text.unwrap_or(streamed),
        })
    }

    async fn prewarm(&self, session_id: &str) -> Result<()> {
        let body = serde_json::json!({ "session_id": session_id, "prewarm": true });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompanionError::Brain(format!("prewarm failed: {e}")))?;
        response
            .error_for_status()
            .map_err(|e| CompanionError::Brain(format!("prewarm bad status: {e}")))?;
        Ok(())
    }

    fn supports_prewarm(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str, format: BrainStreamFormat) -> BrainConfig {
        BrainConfig {
            url: url.to_owned(),
            stream_format: format,
            ..BrainConfig::default()
        }
    }

    fn request() -> BrainRequest {
        BrainRequest {
            user_id: "u1".to_owned(),
            session_id: "s1".to_owned(),
            turn_id: "t1".to_owned(),
            input: "plan my day".to_owned(),
            memory_context: vec!["likes coffee".to_owned()],
            persona_id: "default".to_owned(),
        }
    }

    #[tokio::test]
    async fn sse_body_streams_deltas() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"delta\":\"Good\"}\n",
            "data: {\"delta\":\" morning\"}\n",
            "data: {\"text\":\"Good morning\"}\n",
            "data: [DONE]\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/respond"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let brain =
            HttpBrain::new(&config(&format!("{}/v1/respond", server.uri()), BrainStreamFormat::Sse))
                .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let response = brain
            .stream(CancellationToken::new(), request(), tx)
            .await
            .unwrap();

        assert_eq!(response.text, "Good morning");
        assert_eq!(rx.recv().await.as_deref(), Some("Good"));
        assert_eq!(rx.recv().await.as_deref(), Some(" morning"));
    }

    #[tokio::test]
    async fn ndjson_body_streams_deltas() {
        let server = MockServer::start().await;
        let body = "{\"delta\":\"a\"}\n{\"delta\":\"b\"}\n{\"done\":true}\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let brain =
            HttpBrain::new(&config(&server.uri(), BrainStreamFormat::Ndjson)).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let response = brain
            .stream(CancellationToken::new(), request(), tx)
            .await
            .unwrap();

        // No explicit final text: the concatenated deltas stand in.
        assert_eq!(response.text, "ab");
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn http_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let brain = HttpBrain::new(&config(&server.uri(), BrainStreamFormat::Sse)).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let err = brain
            .stream(CancellationToken::new(), request(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, CompanionError::Brain(_)));
    }

    #[test]
    fn split_lines_reassemble_across_chunks() {
        let mut buffer = String::new();
        assert!(HttpBrain::push_chunk(&mut buffer, b"data: {\"del").is_empty());
        let lines = HttpBrain::push_chunk(&mut buffer, b"ta\":\"x\"}\n");
        assert_eq!(lines, vec!["data: {\"delta\":\"x\"}".to_owned()]);
    }
}
