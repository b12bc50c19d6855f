//! Sylph: realtime full-duplex voice companion server.
//!
//! A client holds a websocket session, streams microphone audio up, and
//! receives incremental transcripts, assistant text deltas, synthesized
//! audio chunks and turn lifecycle signals back.
//!
//! # Architecture
//!
//! Each connection runs an independent pipeline of cooperating tasks:
//! - **Gateway**: JSON websocket framing via `axum`
//! - **Session event loop**: multiplexes client, STT and task events;
//!   owns wake-word, endpointing and barge-in state
//! - **Brain speculator**: starts reasoning calls on stable partial
//!   transcripts, before the STT commit lands
//! - **Turn driver**: one committed utterance → reasoning stream → lead
//!   filter → sanitizer → prosody planner → TTS stream → `turn_end`
//! - **Outbound scheduler**: critical-vs-bulk delivery discipline toward
//!   slow clients
//!
//! STT, TTS, reasoning, memory and the task runtime sit behind traits;
//! mock implementations ship alongside the real adapters.

pub mod brain;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod messages;
pub mod metrics;
pub mod outbound;
pub mod policy;
pub mod session;
pub mod speculate;
pub mod speech;
pub mod stt;
pub mod tasks;
pub mod tts;
pub mod turn;

pub use config::CompanionConfig;
pub use error::{CompanionError, Result};
pub use messages::{ClientMessage, OutboundMessage, TurnEndReason};
pub use session::event_loop::SessionDeps;
pub use session::SessionManager;
