//! Gemini Live protocol types
//!
//! JSON messages exchanged with the Gemini Live `BidiGenerateContent`
//! WebSocket service, plus the transport-neutral [`AgentEvent`] the rest of
//! the crate consumes.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://.../BidiGenerateContent?key=...`
//! 2. Send `{"setup": {...}}` (model, AUDIO modality, voice, system instruction)
//! 3. Receive `{"setupComplete": {}}`
//! 4. Stream microphone audio via `{"realtimeInput": {"mediaChunks": [...]}}`
//! 5. Receive `serverContent` with audio parts, output transcription and
//!    `interrupted` / `turnComplete` flags
//! 6. Send `{"realtimeInput": {"audioStreamEnd": true}}` before closing

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::audio::{encode_binary_to_text, AudioFrame, INPUT_SAMPLE_RATE};
use crate::playback::OUTPUT_SAMPLE_RATE;

/// Gemini Live endpoint
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Declared format of a PCM16 little-endian audio payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaType {
    pub sample_rate: u32,
    pub channels: u16,
}

impl MediaType {
    /// Microphone frames sent to the agent
    pub const INPUT: MediaType = MediaType {
        sample_rate: INPUT_SAMPLE_RATE,
        channels: 1,
    };

    /// Audio the agent speaks
    pub const OUTPUT: MediaType = MediaType {
        sample_rate: OUTPUT_SAMPLE_RATE,
        channels: 1,
    };

    /// Parse a MIME string such as `audio/pcm;rate=24000`.
    ///
    /// Missing parameters default to 24 kHz mono.
    pub fn parse(mime: &str) -> Option<Self> {
        let mut parts = mime.split(';').map(str::trim);
        if !parts.next()?.eq_ignore_ascii_case("audio/pcm") {
            return None;
        }

        let mut media = MediaType::OUTPUT;
        for param in parts {
            let (key, value) = param.split_once('=')?;
            match key.trim() {
                "rate" => media.sample_rate = value.trim().parse().ok()?,
                "channels" => media.channels = value.trim().parse().ok()?,
                _ => {}
            }
        }
        Some(media)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "audio/pcm;rate={}", self.sample_rate)?;
        if self.channels != 1 {
            write!(f, ";channels={}", self.channels)?;
        }
        Ok(())
    }
}

/// One base64 audio payload with its declared media type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    pub mime_type: String,
    pub data: String,
}

impl TransportEnvelope {
    pub fn new(pcm: &[u8], media: MediaType) -> Self {
        Self {
            mime_type: media.to_string(),
            data: encode_binary_to_text(pcm),
        }
    }

    /// Wrap a captured microphone frame
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self::new(frame.as_bytes(), MediaType::INPUT)
    }
}

// ============================================================================
// Session setup
// ============================================================================

/// What the agent should be at session start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    /// Model id, with or without the `models/` prefix
    pub model: String,
    /// Prebuilt voice name
    pub voice_name: String,
    pub system_instruction: String,
    /// Ask the service to transcribe what the agent says
    pub transcribe_output: bool,
}

impl SessionSetup {
    pub fn to_message(&self) -> ClientMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };

        let system_instruction = if self.system_instruction.is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![TextPart {
                    text: self.system_instruction.clone(),
                }],
            })
        };

        ClientMessage::Setup(SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction,
            output_audio_transcription: self.transcribe_output.then_some(EmptyConfig {}),
        })
    }
}

// ============================================================================
// Client Messages (sent TO Gemini)
// ============================================================================

/// Messages sent from client to Gemini Live.
///
/// Externally tagged: `{"setup": {...}}` / `{"realtimeInput": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn audio(envelope: TransportEnvelope) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![envelope],
            audio_stream_end: None,
        })
    }

    /// Tell the service no more microphone audio follows
    pub fn audio_stream_end() -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: Vec::new(),
            audio_stream_end: Some(true),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<EmptyConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmptyConfig {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media_chunks: Vec<TransportEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

// ============================================================================
// Server Messages (received FROM Gemini)
// ============================================================================

/// Any message from Gemini Live. Fields not listed here are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Events delivered by the agent channel, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Setup acknowledged; audio may flow
    Ready,
    /// Base64 PCM16 audio spoken by the agent
    AudioDelta { payload: String, mime_type: String },
    /// Fragment of the agent's output transcript
    TranscriptDelta { text: String },
    /// The agent finished its turn
    TurnComplete,
    /// The user barged in; pending agent audio must stop
    Interrupted,
    /// Remote or transport error. Does not close the session by itself.
    Error { message: String },
    /// The channel is gone
    Closed { reason: Option<String> },
}

impl ServerMessage {
    /// Flatten one server message into events.
    ///
    /// Order within a message: ready, transcript, audio, interrupted,
    /// turn complete, then notices and errors.
    pub fn into_events(self) -> Vec<AgentEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(AgentEvent::Ready);
        }

        if let Some(content) = self.server_content {
            if let Some(transcription) = content.output_transcription {
                if !transcription.text.is_empty() {
                    events.push(AgentEvent::TranscriptDelta {
                        text: transcription.text,
                    });
                }
            }

            for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
                match part.inline_data {
                    Some(inline) if inline.mime_type.starts_with("audio/") => {
                        events.push(AgentEvent::AudioDelta {
                            payload: inline.data,
                            mime_type: inline.mime_type,
                        });
                    }
                    Some(inline) => {
                        log::debug!("Ignoring inline data of type {}", inline.mime_type);
                    }
                    None => {
                        if let Some(text) = part.text {
                            log::trace!("Ignoring model text part ({} chars)", text.len());
                        }
                    }
                }
            }

            if content.interrupted {
                events.push(AgentEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(AgentEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(AgentEvent::Error {
                message: format!(
                    "Server is closing the session (time left: {})",
                    go_away.time_left.as_deref().unwrap_or("unknown")
                ),
            });
        }

        if let Some(error) = self.error {
            let message = match (error.code, error.status) {
                (Some(code), Some(status)) => format!("{} ({} {})", error.message, code, status),
                (Some(code), None) => format!("{} ({})", error.message, code),
                (None, Some(status)) => format!("{} ({})", error.message, status),
                (None, None) => error.message,
            };
            events.push(AgentEvent::Error { message });
        }

        events
    }
}

/// Parse a text frame into events. Returns `None` for non-JSON payloads.
pub fn parse_server_events(text: &str) -> Option<Vec<AgentEvent>> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => Some(msg.into_events()),
        Err(e) => {
            log::warn!("Failed to parse server message: {}", e);
            None
        }
    }
}
