//! Wire message types exchanged with clients.
//!
//! Both directions are closed sum types tagged by a `type` field, so the
//! outbound scheduler can dispatch delivery discipline on the tag and the
//! gateway can reject unknown frames with a single error event.

use serde::{Deserialize, Serialize};

/// A message received from the client over the websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A chunk of microphone audio, base64-encoded PCM16.
    ClientAudioChunk {
        session_id: String,
        seq: u64,
        pcm16_base64: String,
        sample_rate: u32,
        ts_ms: i64,
    },
    /// A control action (interrupt, stop, wake-word toggles, task controls).
    ClientControl {
        session_id: String,
        action: ControlAction,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        approved: Option<bool>,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        ts_ms: Option<i64>,
    },
}

impl ClientMessage {
    /// Validate field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::ClientAudioChunk {
                session_id,
                sample_rate,
                ..
            } => {
                if session_id.is_empty() {
                    return Err("session_id must be non-empty".to_owned());
                }
                if *sample_rate == 0 {
                    return Err("sample_rate must be > 0".to_owned());
                }
                Ok(())
            }
            Self::ClientControl { session_id, .. } => {
                if session_id.is_empty() {
                    return Err("session_id must be non-empty".to_owned());
                }
                Ok(())
            }
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::ClientAudioChunk { session_id, .. } | Self::ClientControl { session_id, .. } => {
                session_id
            }
        }
    }
}

/// Client control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Interrupt,
    Stop,
    Start,
    Mute,
    Unmute,
    WakewordOn,
    WakewordOff,
    ManualArm,
    ApproveTaskStep,
    DenyTaskStep,
    CancelTask,
    PauseTask,
    ResumeTask,
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEndReason {
    Completed,
    Failed,
    Interrupted,
    BargeIn,
    ConnectionClosed,
    SttClosed,
}

impl TurnEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::BargeIn => "barge_in",
            Self::ConnectionClosed => "connection_closed",
            Self::SttClosed => "stt_closed",
        }
    }
}

/// Which subsystem produced an error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Gateway,
    Stt,
    Tts,
    Orchestrator,
    TaskRuntime,
}

/// Summary row in a task status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub title: String,
    pub status: String,
}

/// A message sent to the client over the websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    SttPartial {
        text: String,
        confidence: f32,
        ts_ms: i64,
    },
    SttCommitted {
        text: String,
        source: String,
        ts_ms: i64,
    },
    SemanticEndpointHint {
        reason: String,
        confidence: f32,
        hold_ms: u64,
        should_commit: bool,
    },
    AssistantThinkingDelta {
        turn_id: String,
        text: String,
    },
    AssistantTextDelta {
        turn_id: String,
        text: String,
    },
    AssistantAudioChunk {
        turn_id: String,
        seq: u64,
        format: String,
        audio_base64: String,
    },
    AssistantTurnEnd {
        turn_id: String,
        reason: TurnEndReason,
    },
    SystemEvent {
        code: String,
        detail: String,
    },
    ErrorEvent {
        code: String,
        source: ErrorSource,
        retryable: bool,
        detail: String,
    },
    TaskStarted {
        task_id: String,
        title: String,
    },
    TaskStep {
        task_id: String,
        step_id: String,
        description: String,
        needs_approval: bool,
    },
    TaskCompleted {
        task_id: String,
        detail: String,
    },
    TaskFailed {
        task_id: String,
        detail: String,
    },
    TaskPaused {
        task_id: String,
    },
    TaskResumed {
        task_id: String,
    },
    TaskCancelled {
        task_id: String,
    },
    TaskStatusSnapshot {
        tasks: Vec<TaskSummary>,
    },
}

impl OutboundMessage {
    /// The wire tag for this message, used as the metrics key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SttPartial { .. } => "stt_partial",
            Self::SttCommitted { .. } => "stt_committed",
            Self::SemanticEndpointHint { .. } => "semantic_endpoint_hint",
            Self::AssistantThinkingDelta { .. } => "assistant_thinking_delta",
            Self::AssistantTextDelta { .. } => "assistant_text_delta",
            Self::AssistantAudioChunk { .. } => "assistant_audio_chunk",
            Self::AssistantTurnEnd { .. } => "assistant_turn_end",
            Self::SystemEvent { .. } => "system_event",
            Self::ErrorEvent { .. } => "error_event",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskStep { .. } => "task_step",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskPaused { .. } => "task_paused",
            Self::TaskResumed { .. } => "task_resumed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::TaskStatusSnapshot { .. } => "task_status_snapshot",
        }
    }

    /// Whether delivery uses the critical (bounded blocking) discipline.
    ///
    /// Critical messages are lifecycle signals the client must not miss;
    /// everything else is bulk streaming data that may be shed under
    /// backpressure.
    pub fn is_critical(&self) -> bool {
        match self {
            Self::AssistantTurnEnd { .. }
            | Self::SystemEvent { .. }
            | Self::ErrorEvent { .. }
            | Self::TaskStarted { .. }
            | Self::TaskStep { .. }
            | Self::TaskCompleted { .. }
            | Self::TaskFailed { .. }
            | Self::TaskPaused { .. }
            | Self::TaskResumed { .. }
            | Self::TaskCancelled { .. }
            | Self::TaskStatusSnapshot { .. } => true,
            Self::SttPartial { .. }
            | Self::SttCommitted { .. }
            | Self::SemanticEndpointHint { .. }
            | Self::AssistantThinkingDelta { .. }
            | Self::AssistantTextDelta { .. }
            | Self::AssistantAudioChunk { .. } => false,
        }
    }

    /// Shorthand for a system event.
    pub fn system(code: &str, detail: impl Into<String>) -> Self {
        Self::SystemEvent {
            code: code.to_owned(),
            detail: detail.into(),
        }
    }

    /// Shorthand for an error event.
    pub fn error(code: &str, source: ErrorSource, retryable: bool, detail: impl Into<String>) -> Self {
        Self::ErrorEvent {
            code: code.to_owned(),
            source,
            retryable,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn audio_chunk_roundtrip() {
        let json = r#"{"type":"client_audio_chunk","session_id":"s1","seq":3,"pcm16_base64":"AAAA","sample_rate":16000,"ts_ms":1000}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        msg.validate().unwrap();
        assert_eq!(msg.session_id(), "s1");

        let out = serde_json::to_string(&msg).unwrap();
        assert!(out.contains("\"type\":\"client_audio_chunk\""));
    }

    #[test]
    fn control_optional_fields_default() {
        let json = r#"{"type":"client_control","session_id":"s1","action":"interrupt"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        msg.validate().unwrap();
        match msg {
            ClientMessage::ClientControl { action, reason, .. } => {
                assert_eq!(action, ControlAction::Interrupt);
                assert!(reason.is_none());
            }
            ClientMessage::ClientAudioChunk { .. } => panic!("expected control"),
        }
    }

    #[test]
    fn zero_sample_rate_rejected() {
        let json = r#"{"type":"client_audio_chunk","session_id":"s1","seq":0,"pcm16_base64":"","sample_rate":0,"ts_ms":0}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn unknown_frame_type_fails_parse() {
        let json = r#"{"type":"client_video_chunk","session_id":"s1"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn outbound_tag_matches_kind() {
        let msg = OutboundMessage::AssistantTurnEnd {
            turn_id: "t1".to_owned(),
            reason: TurnEndReason::BargeIn,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"assistant_turn_end\""));
        assert!(json.contains("\"reason\":\"barge_in\""));
        assert_eq!(msg.kind(), "assistant_turn_end");
    }

    #[test]
    fn delivery_classification() {
        let critical = OutboundMessage::error("stt_send_audio_failed", ErrorSource::Stt, true, "");
        assert!(critical.is_critical());
        assert!(OutboundMessage::system("wake_word", "").is_critical());
        assert!(
            OutboundMessage::TaskStatusSnapshot { tasks: Vec::new() }.is_critical()
        );

        let bulk = OutboundMessage::AssistantAudioChunk {
            turn_id: "t1".to_owned(),
            seq: 1,
            format: "pcm_24000".to_owned(),
            audio_base64: "AAAA".to_owned(),
        };
        assert!(!bulk.is_critical());
    }
}
