//! Error types for the sylph orchestration core.

/// Top-level error type for the voice companion server.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Client transport / websocket framing error.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Speech-to-text provider error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech provider error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Reasoning adapter error.
    #[error("brain error: {0}")]
    Brain(String),

    /// Memory store error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Task runtime error.
    #[error("task runtime error: {0}")]
    Task(String),

    /// Session lifecycle error.
    #[error("session error: {0}")]
    Session(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cooperative cancellation or deadline expiry.
    ///
    /// A terminal state, not a failure: the orchestrator never surfaces it
    /// to clients as an `error_event`.
    #[error("cancelled")]
    Cancelled,
}

impl CompanionError {
    /// Whether this error is the cancellation terminal state.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CompanionError>;
