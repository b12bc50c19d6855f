//! Configuration for the sylph voice companion server.
//!
//! Every timing knob of the orchestration core lives here so deployments
//! can tune latency behavior without rebuilding. All sections fall back to
//! defaults for missing fields, so a minimal TOML file is valid.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Gateway bind address and protocol limits.
    pub gateway: GatewayConfig,
    /// Session lifecycle and janitor.
    pub session: SessionConfig,
    /// Turn driver timing.
    pub turn: TurnConfig,
    /// Outbound delivery discipline.
    pub outbound: OutboundConfig,
    /// Wake-word gating.
    pub wake_word: WakeWordConfig,
    /// Semantic endpointing.
    pub semantic: SemanticConfig,
    /// Prosody-aware TTS segmentation.
    pub prosody: ProsodyConfig,
    /// Speculative reasoning pre-fetch.
    pub speculator: SpeculatorConfig,
    /// Reasoning adapter selection and retry.
    pub brain: BrainConfig,
    /// STT provider selection.
    pub stt: SttConfig,
    /// Voice (TTS) provider selection.
    pub voice: VoiceConfig,
    /// Memory store.
    pub memory: MemoryConfig,
    /// Task runtime bridge.
    pub tasks: TaskConfig,
}

/// Websocket gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address for the HTTP/websocket listener.
    pub bind_addr: String,
    /// Maximum accepted client text frame size in bytes.
    pub max_frame_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_owned(),
            max_frame_bytes: 512 * 1024,
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which the janitor ends a session, in seconds.
    pub inactivity_timeout_secs: u64,
    /// How long ended sessions are retained before removal, in seconds.
    pub retention_secs: u64,
    /// Janitor sweep interval in seconds.
    pub janitor_interval_secs: u64,
    /// Bound on graceful server shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 300,
            retention_secs: 900,
            janitor_interval_secs: 30,
            shutdown_timeout_secs: 10,
        }
    }
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Turn driver timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Target latency from STT commit to first audio chunk, in ms.
    /// 0 disables SLO tracking.
    pub first_audio_slo_ms: u64,
    /// Delay before the `assistant_working` system event when no text
    /// delta has been observed, in ms.
    pub assistant_working_delay_ms: u64,
    /// Bound on waiting for the TTS forwarder to drain at finalization, in ms.
    pub tts_finalize_timeout_ms: u64,
    /// Bound on best-effort memory saves, in ms.
    pub memory_save_timeout_ms: u64,
    /// Hard timeout for the in-turn memory context lookup, in ms.
    pub memory_context_timeout_ms: u64,
    /// How long the turn driver waits for the memory lookup before
    /// proceeding without it, in ms.
    pub memory_context_soft_wait_ms: u64,
    /// Whether to emit best-effort `assistant_thinking_delta` previews.
    pub thinking_preview: bool,
    /// Maximum preview length in characters.
    pub thinking_preview_max_chars: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            first_audio_slo_ms: 0,
            assistant_working_delay_ms: 1_200,
            tts_finalize_timeout_ms: 10_000,
            memory_save_timeout_ms: 1_500,
            memory_context_timeout_ms: 1_500,
            memory_context_soft_wait_ms: 400,
            thinking_preview: true,
            thinking_preview_max_chars: 92,
        }
    }
}

impl TurnConfig {
    pub fn first_audio_slo(&self) -> Option<Duration> {
        (self.first_audio_slo_ms > 0).then(|| Duration::from_millis(self.first_audio_slo_ms))
    }

    pub fn assistant_working_delay(&self) -> Duration {
        Duration::from_millis(self.assistant_working_delay_ms)
    }

    pub fn tts_finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.tts_finalize_timeout_ms)
    }

    pub fn memory_save_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_save_timeout_ms)
    }

    pub fn memory_context_timeout(&self) -> Duration {
        Duration::from_millis(self.memory_context_timeout_ms)
    }

    pub fn memory_context_soft_wait(&self) -> Duration {
        Duration::from_millis(self.memory_context_soft_wait_ms)
    }
}

/// Outbound backpressure mode for bulk messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Non-blocking try-send; drop on a full queue.
    Drop,
    /// Bounded blocking send with a short timeout.
    Block,
}

/// Outbound scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Outbound queue capacity per connection.
    pub queue_size: usize,
    /// Delivery mode for bulk messages.
    pub ws_backpressure_mode: BackpressureMode,
    /// Force `block` mode for bulk messages regardless of
    /// `ws_backpressure_mode`.
    pub strict_outbound: bool,
    /// Bound on blocking sends of critical messages, in ms.
    pub critical_timeout_ms: u64,
    /// Bound on blocking sends of bulk messages in `block` mode, in ms.
    pub bulk_timeout_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            ws_backpressure_mode: BackpressureMode::Drop,
            strict_outbound: false,
            critical_timeout_ms: 600,
            bulk_timeout_ms: 120,
        }
    }
}

impl OutboundConfig {
    pub fn critical_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_timeout_ms)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    /// The bulk delivery mode actually in force.
    pub fn effective_mode(&self) -> BackpressureMode {
        if self.strict_outbound {
            BackpressureMode::Block
        } else {
            self.ws_backpressure_mode
        }
    }
}

/// Wake-word gating configuration.
///
/// Gating applies to committed transcripts; enabling/disabling at runtime
/// happens through `client_control` actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    /// Whether sessions start with wake-word gating enabled.
    pub enabled: bool,
    /// The wake phrase a gated utterance must start with.
    pub phrase: String,
    /// Awake window after an accepted utterance, in seconds.
    pub window_secs: u64,
    /// Manual-arm window after a `manual_arm` control, in seconds.
    pub manual_arm_secs: u64,
    /// How long to wait for a query after a bare wake phrase, in seconds.
    pub awaiting_query_secs: u64,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            phrase: "hey sylph".to_owned(),
            window_secs: 8,
            manual_arm_secs: 10,
            awaiting_query_secs: 6,
        }
    }
}

impl WakeWordConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn manual_arm_window(&self) -> Duration {
        Duration::from_secs(self.manual_arm_secs)
    }

    pub fn awaiting_query_window(&self) -> Duration {
        Duration::from_secs(self.awaiting_query_secs)
    }
}

/// Semantic endpointer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    /// Lower clamp on hint hold duration, in ms.
    pub hold_min_ms: u64,
    /// Upper clamp on hint hold duration, in ms.
    pub hold_max_ms: u64,
    /// Re-emit an unchanged hint tuple after this long, in ms.
    pub emit_refresh_ms: u64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            hold_min_ms: 40,
            hold_max_ms: 900,
            emit_refresh_ms: 1_200,
        }
    }
}

impl SemanticConfig {
    pub fn hold_min(&self) -> Duration {
        Duration::from_millis(self.hold_min_ms)
    }

    pub fn hold_max(&self) -> Duration {
        Duration::from_millis(self.hold_max_ms)
    }

    pub fn emit_refresh(&self) -> Duration {
        Duration::from_millis(self.emit_refresh_ms)
    }
}

/// Prosody planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProsodyConfig {
    /// Minimum characters before the first segment may be emitted.
    pub first_chunk_min: usize,
    /// Minimum characters for subsequent segments.
    pub next_chunk_min: usize,
    /// Minimum accumulated characters before a comma may split a segment.
    pub comma_chunk_min: usize,
    /// How far past the minimum to scan for a whitespace cut, in characters.
    pub cut_window: usize,
}

impl Default for ProsodyConfig {
    fn default() -> Self {
        Self {
            first_chunk_min: 24,
            next_chunk_min: 42,
            comma_chunk_min: 42,
            cut_window: 44,
        }
    }
}

/// Brain speculator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculatorConfig {
    /// Master switch for speculative pre-fetch.
    pub enabled: bool,
    /// Minimum canonical length (chars) before a pre-fetch may launch.
    pub min_canonical: usize,
    /// Minimum canonical word count before a pre-fetch may launch.
    pub min_words: usize,
    /// Utterance age that admits an early start with >= 3 words, in ms.
    pub early_age_ms: u64,
    /// Word-count floor for the early-start exception.
    pub early_min_words: usize,
    /// Required consecutive stable observations of the canonical.
    pub stable_repeats: u32,
    /// Minimum spacing between pre-fetch launches, in ms.
    pub debounce_ms: u64,
    /// How long a ready result stays consumable, in ms.
    pub fresh_ms: u64,
    /// Commit-time wait budget for an in-flight pre-fetch, in ms.
    pub wait_budget_ms: u64,
    /// Wait budget once the call is mature, in ms.
    pub wait_budget_mature_ms: u64,
    /// Wait budget for short utterances, in ms.
    pub wait_budget_short_ms: u64,
    /// Short-utterance wait budget once the call is mature, in ms.
    pub wait_budget_short_mature_ms: u64,
    /// Age at which an in-flight call counts as mature, in ms.
    pub wait_mature_after_ms: u64,
    /// Maximum word count for the short-utterance wait budgets.
    pub short_max_words: usize,
    /// How many recent memory lines ride along on a speculative request.
    pub memory_ctx_limit: usize,
    /// Result cache capacity.
    pub cache_max_entries: usize,
    /// Result cache entry freshness bound, in seconds.
    pub cache_fresh_secs: u64,
}

impl Default for SpeculatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_canonical: 4,
            min_words: 2,
            early_age_ms: 1_200,
            early_min_words: 2,
            stable_repeats: 1,
            debounce_ms: 260,
            fresh_ms: 3_000,
            wait_budget_ms: 280,
            wait_budget_mature_ms: 1_600,
            wait_budget_short_ms: 900,
            wait_budget_short_mature_ms: 2_400,
            wait_mature_after_ms: 220,
            short_max_words: 3,
            memory_ctx_limit: 3,
            cache_max_entries: 24,
            cache_fresh_secs: 90,
        }
    }
}

impl SpeculatorConfig {
    pub fn early_age(&self) -> Duration {
        Duration::from_millis(self.early_age_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fresh(&self) -> Duration {
        Duration::from_millis(self.fresh_ms)
    }

    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms)
    }

    pub fn wait_budget_mature(&self) -> Duration {
        Duration::from_millis(self.wait_budget_mature_ms)
    }

    pub fn wait_budget_short(&self) -> Duration {
        Duration::from_millis(self.wait_budget_short_ms)
    }

    pub fn wait_budget_short_mature(&self) -> Duration {
        Duration::from_millis(self.wait_budget_short_mature_ms)
    }

    pub fn wait_mature_after(&self) -> Duration {
        Duration::from_millis(self.wait_mature_after_ms)
    }

    pub fn cache_fresh(&self) -> Duration {
        Duration::from_secs(self.cache_fresh_secs)
    }
}

/// Reasoning adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrainProvider {
    /// HTTP adapter speaking SSE or NDJSON.
    Http,
    /// Deterministic in-process mock (tests, demos).
    Mock,
}

/// Delta stream framing for the HTTP adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrainStreamFormat {
    /// `data: {...}` server-sent event lines.
    Sse,
    /// One JSON object per line.
    Ndjson,
}

/// Reasoning adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// Which adapter to construct.
    pub provider: BrainProvider,
    /// Endpoint URL for the HTTP adapter.
    pub url: String,
    /// Delta stream framing for the HTTP adapter.
    pub stream_format: BrainStreamFormat,
    /// Fallback endpoint URL; empty disables the fallback composite.
    pub fallback_url: String,
    /// First-delta deadline before the composite fails over, in ms.
    pub fallback_first_delta_ms: u64,
    /// First-delta deadline for the retry wrapper, in ms.
    pub first_delta_retry_timeout_ms: u64,
    /// Maximum first-delta retries.
    pub first_delta_retry_max: u32,
    /// Bound on the connection pre-warm call, in ms.
    pub warmup_timeout_ms: u64,
    /// Overall bound on a single adapter request, in ms.
    pub request_timeout_ms: u64,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            provider: BrainProvider::Http,
            url: "http://127.0.0.1:8900/v1/respond".to_owned(),
            stream_format: BrainStreamFormat::Sse,
            fallback_url: String::new(),
            fallback_first_delta_ms: 1_300,
            first_delta_retry_timeout_ms: 1_400,
            first_delta_retry_max: 1,
            warmup_timeout_ms: 1_800,
            request_timeout_ms: 60_000,
        }
    }
}

impl BrainConfig {
    pub fn fallback_first_delta(&self) -> Duration {
        Duration::from_millis(self.fallback_first_delta_ms)
    }

    pub fn first_delta_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.first_delta_retry_timeout_ms)
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// STT provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProviderKind {
    /// Deterministic in-process mock (tests, demos).
    Mock,
}

/// STT provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Which provider to construct.
    pub provider: SttProviderKind,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: SttProviderKind::Mock,
        }
    }
}

/// TTS provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceProviderKind {
    /// Pick elevenlabs when an endpoint is configured, otherwise mock.
    Auto,
    /// ElevenLabs-style websocket streaming synthesis.
    Elevenlabs,
    /// Deterministic in-process mock (tests, demos).
    Mock,
}

/// Voice (TTS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Which provider to construct.
    pub provider: VoiceProviderKind,
    /// Websocket endpoint for the elevenlabs provider.
    pub endpoint: String,
    /// API key for the elevenlabs provider; empty sends no auth header.
    pub api_key: String,
    /// Default voice id when the session does not carry one.
    pub voice_id: String,
    /// Default synthesis model id.
    pub model_id: String,
    /// Voice stability, 0.0–1.0.
    pub stability: f32,
    /// Similarity boost, 0.0–1.0.
    pub similarity_boost: f32,
    /// Speaking speed multiplier.
    pub speed: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            provider: VoiceProviderKind::Auto,
            endpoint: String::new(),
            api_key: String::new(),
            voice_id: "sylph-default".to_owned(),
            model_id: "eleven_turbo_v2_5".to_owned(),
            stability: 0.5,
            similarity_boost: 0.75,
            speed: 1.0,
        }
    }
}

/// Memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Whether the memory store is wired into sessions.
    pub enabled: bool,
    /// SQLite database path. Empty resolves under the platform data dir.
    pub db_path: String,
    /// How many recent lines a context lookup returns.
    pub context_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: String::new(),
            context_limit: 6,
        }
    }
}

impl MemoryConfig {
    /// Resolve the database path, defaulting under the platform data dir.
    pub fn resolved_db_path(&self) -> PathBuf {
        if !self.db_path.is_empty() {
            return PathBuf::from(&self.db_path);
        }
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        base.join("sylph").join("memory.db")
    }
}

/// Task runtime bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Whether task events and voice shortcuts are wired into sessions.
    pub enabled: bool,
    /// Bound on forwarded task-control calls, in seconds.
    pub task_timeout_secs: u64,
    /// Window for deduplicating repeated task controls, in seconds.
    pub idempotency_window_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            task_timeout_secs: 30,
            idempotency_window_secs: 10,
        }
    }
}

impl TaskConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

impl CompanionConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::CompanionError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::CompanionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path under the platform config dir.
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("/tmp/sylph-config"));
        base.join("sylph").join("config.toml")
    }
}
