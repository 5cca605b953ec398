//! Audio input side of the studio pipeline
//!
//! Captures microphone audio with CPAL, reduces it to 16 kHz mono, and hands
//! out fixed 4096-sample PCM16 frames. Also hosts the PCM/base64 codec shared
//! with the playback path.

pub mod capture;
mod microphone;
pub mod pcm;

pub use capture::{
    AudioFrame, CaptureState, FrameAssembler, FrameCapturer, InputFormat, InputSource, InputTap,
    RateConverter, SampleTap, FRAME_SIZE, INPUT_SAMPLE_RATE,
};
pub use microphone::Microphone;
pub use pcm::{
    decode_text_to_binary, encode_binary_to_text, float_samples_to_int16_pcm,
    int16_pcm_to_float_samples, CodecError,
};

/// Errors from audio devices and the capture pipeline
#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No audio output device found")]
    NoOutputDevice,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Frame capture is already running")]
    CaptureAlreadyRunning,
}
