//! Live agent streaming: the voice session and its WebSocket channel
//!
//! # Architecture
//!
//! ```text
//!   FrameCapturer (16kHz PCM16)
//!          │ AudioFrame
//!          ▼
//!   VoiceSession ──OutboundMessage──▶ AgentLink ──WebSocket──▶ Gemini Live
//!          ▲                              │
//!          └──────────AgentEvent──────────┘
//!          │
//!          ├──▶ PlaybackScheduler (24kHz) ──▶ Speaker
//!          └──▶ TranscriptBuffer
//! ```
//!
//! # Failure Strategy
//!
//! - Initial connection retries 3 times with exponential backoff
//! - A remote close ends the session; there is no automatic reconnection
//! - Malformed agent audio is dropped chunk by chunk without ending the session

mod live_client;
mod protocol;
mod session;
mod transcript;

use std::fmt;
use std::time::Duration;

use crate::audio::{AudioError, CodecError};
use crate::playback::PlaybackError;

pub use live_client::{
    get_api_key, AgentLink, AgentTransport, GeminiLiveTransport, OutboundMessage,
};
pub use protocol::{
    parse_server_events, AgentEvent, ClientMessage, MediaType, ServerMessage, SessionSetup,
    TransportEnvelope, GEMINI_LIVE_URL,
};
pub use session::{OutputFactory, SessionNotice, SessionOptions, SessionStats, VoiceSession};
pub use transcript::TranscriptBuffer;

/// Lifecycle of a [`VoiceSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors from opening or running a voice session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Gemini API key not configured. Set GEMINI_API_KEY environment variable.")]
    MissingApiKey,

    #[error("Failed to connect to the agent: {0}")]
    ConnectionFailed(String),

    #[error("Agent protocol error: {0}")]
    ProtocolError(String),

    #[error("Agent channel closed: {0}")]
    Disconnected(String),

    #[error("Failed to send to the agent: {0}")]
    SendFailed(String),

    #[error("Agent did not acknowledge setup within {0:?}")]
    SetupTimeout(Duration),

    #[error("Cannot {operation} a session that is {state}")]
    InvalidSessionState {
        state: SessionState,
        operation: &'static str,
    },

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = SessionError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = SessionError::InvalidSessionState {
            state: SessionState::Open,
            operation: "open",
        };
        assert_eq!(err.to_string(), "Cannot open a session that is open");
    }

    #[test]
    fn test_wrapped_errors_keep_their_message() {
        let err: SessionError = AudioError::NoInputDevice.into();
        assert_eq!(err.to_string(), AudioError::NoInputDevice.to_string());
    }
}
