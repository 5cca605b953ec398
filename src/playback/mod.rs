//! Agent audio playback
//!
//! ```text
//! DecodedAudio (24kHz) ──▶ PlaybackScheduler ──▶ AudioOutput::start_at(t)
//!                              ▲                        │
//!                              │ on_playback_ended      │ completion channel
//!                              └────────────────────────┘
//! ```
//!
//! The scheduler is owned by a single voice session; nothing else writes the
//! play cursor or the in-flight set.

mod scheduler;
mod speaker;

pub use scheduler::{
    AudioOutput, DecodedAudio, PlaybackChunk, PlaybackHandle, PlaybackScheduler,
    OUTPUT_SAMPLE_RATE,
};
pub use speaker::Speaker;

/// Errors raised while scheduling playback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    /// Zero-duration or otherwise unusable audio buffer
    #[error("Invalid playback chunk: {0}")]
    InvalidPlaybackChunk(String),
}
