//! PCM16 codec and transport text encoding
//!
//! Pure conversions between the float samples used by the audio devices,
//! little-endian signed 16-bit PCM, and the base64 text carried on the wire.
//!
//! Float to int16 conversion does not clamp: a sample is scaled by 32768,
//! truncated toward zero and wrapped into 16 bits, so exactly `1.0` encodes
//! as `-32768`.

use base64::{engine::general_purpose::STANDARD, Engine};

/// Scale between normalized float samples and 16-bit PCM
pub const PCM16_SCALE: f32 = 32768.0;

/// Bytes per PCM16 sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Errors produced by the PCM codec
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Text payload is not valid base64 (bad alphabet or padding)
    #[error("malformed transport encoding: {0}")]
    MalformedEncoding(String),
    /// Byte length is not a whole number of interleaved PCM16 frames
    #[error("invalid PCM buffer length: {len} bytes for {channels} channel(s)")]
    InvalidBufferLength { len: usize, channels: usize },
}

/// Encode raw bytes as standard padded base64.
pub fn encode_binary_to_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard padded base64 into raw bytes.
pub fn decode_text_to_binary(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text)
        .map_err(|e| CodecError::MalformedEncoding(e.to_string()))
}

/// Convert one float sample to int16 with wrap-around semantics.
///
/// Non-finite samples map to silence.
pub fn float_to_int16(sample: f32) -> i16 {
    if !sample.is_finite() {
        return 0;
    }
    let scaled = (sample * PCM16_SCALE).trunc() as f64;
    // rem_euclid keeps the value in [0, 65536) so the final cast wraps like a
    // 16-bit store would.
    scaled.rem_euclid(65536.0) as u16 as i16
}

/// Convert mono float samples to little-endian PCM16 bytes.
///
/// Output length is always `2 * samples.len()`.
pub fn float_samples_to_int16_pcm(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        bytes.extend_from_slice(&float_to_int16(sample).to_le_bytes());
    }
    bytes
}

/// Convert interleaved little-endian PCM16 bytes into one float buffer per channel.
///
/// # Arguments
/// * `bytes` - Interleaved PCM16 LE data
/// * `channels` - Number of interleaved channels (must be non-zero)
///
/// # Returns
/// `channels` buffers, each holding `bytes.len() / (2 * channels)` samples in [-1, 1).
pub fn int16_pcm_to_float_samples(
    bytes: &[u8],
    channels: usize,
) -> Result<Vec<Vec<f32>>, CodecError> {
    let frame_bytes = BYTES_PER_SAMPLE * channels;
    if channels == 0 || bytes.len() % frame_bytes != 0 {
        return Err(CodecError::InvalidBufferLength {
            len: bytes.len(),
            channels,
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut out = vec![Vec::with_capacity(frames); channels];

    for frame in bytes.chunks_exact(frame_bytes) {
        for (channel, sample) in frame.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            out[channel].push(value as f32 / PCM16_SCALE);
        }
    }

    Ok(out)
}
