//! Text shaping between the reasoning stream and TTS.

pub mod lead_filter;
pub mod prosody;
pub mod sanitize;

pub use lead_filter::{strip_lead_filler, LeadResponseFilter};
pub use prosody::ProsodyPlanner;
pub use sanitize::SpeechSanitizer;
