//! Frame capturer: device samples in, fixed 16 kHz PCM16 frames out
//!
//! ```text
//! InputSource (device rate, N ch, f32)
//!        │  SampleTap (audio thread)
//!        ▼
//! FrameAssembler: downmix ─▶ RateConverter ─▶ accumulate ─▶ PCM16 every 4096 samples
//!        │
//!        ▼
//! on_frame(AudioFrame)
//! ```
//!
//! The tap runs on the platform audio thread. It only touches reusable
//! scratch buffers and the callback supplied by the caller, which must not
//! block (the session uses `try_send` on a bounded channel).

use std::time::{Duration, Instant};

use super::pcm::float_samples_to_int16_pcm;
use super::AudioError;

/// Sample rate of captured frames
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Samples per captured frame
pub const FRAME_SIZE: usize = 4096;

/// Channel layout and rate delivered by an input source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Callback invoked by an input source with interleaved f32 samples
pub type SampleTap = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// A live audio input that samples can be tapped from.
///
/// Implementations own the underlying device stream. Attaching returns an
/// [`InputTap`] guard; the tap stays installed until the guard is dropped.
pub trait InputSource: Send + Sync {
    /// Format of the samples passed to attached taps
    fn format(&self) -> InputFormat;

    /// Install a sample tap
    fn attach(&self, tap: SampleTap) -> Result<InputTap, AudioError>;
}

/// Guard for an installed sample tap. Dropping it detaches the tap.
pub struct InputTap {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl InputTap {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }
}

impl Drop for InputTap {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for InputTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputTap")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// One captured frame: exactly [`FRAME_SIZE`] mono PCM16 LE samples at 16 kHz.
///
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    sequence: u64,
    captured_at: Instant,
    pcm: Vec<u8>,
}

impl AudioFrame {
    /// Monotonic frame counter, starting at 0 for each capture run
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When the last sample of the frame arrived
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// PCM16 little-endian bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.sample_count() as f64 / INPUT_SAMPLE_RATE as f64)
    }
}

/// Streaming sample-rate converter.
///
/// Integer down-sampling ratios use block averaging; every other ratio uses
/// linear interpolation. State carries across calls so chunk boundaries do
/// not introduce clicks.
#[derive(Debug, Clone)]
pub struct RateConverter {
    mode: ConversionMode,
}

#[derive(Debug, Clone)]
enum ConversionMode {
    Passthrough,
    Average {
        factor: usize,
        acc: f32,
        count: usize,
    },
    Interpolate {
        /// Source samples advanced per output sample
        step: f64,
        /// Read position relative to the current input (-1 = previous tail sample)
        position: f64,
        previous: f32,
    },
}

impl RateConverter {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let mode = if source_rate == target_rate {
            ConversionMode::Passthrough
        } else if source_rate > target_rate && source_rate % target_rate == 0 {
            ConversionMode::Average {
                factor: (source_rate / target_rate) as usize,
                acc: 0.0,
                count: 0,
            }
        } else {
            ConversionMode::Interpolate {
                step: source_rate as f64 / target_rate as f64,
                position: 0.0,
                previous: 0.0,
            }
        };
        Self { mode }
    }

    /// Convert `input` and append the result to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        match &mut self.mode {
            ConversionMode::Passthrough => out.extend_from_slice(input),
            ConversionMode::Average { factor, acc, count } => {
                for &sample in input {
                    *acc += sample;
                    *count += 1;
                    if *count == *factor {
                        out.push(*acc / *factor as f32);
                        *acc = 0.0;
                        *count = 0;
                    }
                }
            }
            ConversionMode::Interpolate {
                step,
                position,
                previous,
            } => {
                let Some(&last) = input.last() else {
                    return;
                };
                let end = (input.len() - 1) as f64;
                while *position <= end {
                    let index = position.floor();
                    let frac = (*position - index) as f32;
                    let a = if index < 0.0 {
                        *previous
                    } else {
                        input[index as usize]
                    };
                    let b = input.get((index + 1.0) as usize).copied().unwrap_or(a);
                    out.push(a + (b - a) * frac);
                    *position += *step;
                }
                *position -= input.len() as f64;
                *previous = last;
            }
        }
    }
}

/// Turns arbitrary device callbacks into fixed-size 16 kHz PCM16 frames.
pub struct FrameAssembler {
    channels: usize,
    converter: RateConverter,
    mono: Vec<f32>,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(format: InputFormat) -> Result<Self, AudioError> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} Hz, {} channel(s)",
                format.sample_rate, format.channels
            )));
        }

        Ok(Self {
            channels: format.channels as usize,
            converter: RateConverter::new(format.sample_rate, INPUT_SAMPLE_RATE),
            mono: Vec::with_capacity(FRAME_SIZE),
            pending: Vec::with_capacity(FRAME_SIZE * 2),
            next_sequence: 0,
        })
    }

    /// Feed interleaved device samples; `emit` is called once per completed frame.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(AudioFrame)) {
        self.mono.clear();
        if self.channels == 1 {
            self.mono.extend_from_slice(interleaved);
        } else {
            let scale = 1.0 / self.channels as f32;
            self.mono.extend(
                interleaved
                    .chunks_exact(self.channels)
                    .map(|frame| frame.iter().sum::<f32>() * scale),
            );
        }

        self.converter.process(&self.mono, &mut self.pending);

        while self.pending.len() >= FRAME_SIZE {
            let pcm = float_samples_to_int16_pcm(&self.pending[..FRAME_SIZE]);
            self.pending.drain(..FRAME_SIZE);

            let frame = AudioFrame {
                sequence: self.next_sequence,
                captured_at: Instant::now(),
                pcm,
            };
            self.next_sequence += 1;
            emit(frame);
        }
    }

    /// Samples waiting for the next frame boundary
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Capture state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Running,
}

/// Drives frame capture from an [`InputSource`].
///
/// The capturer does not own the source; it only holds the tap guard.
#[derive(Debug, Default)]
pub struct FrameCapturer {
    tap: Option<InputTap>,
}

impl FrameCapturer {
    pub fn new() -> Self {
        Self { tap: None }
    }

    pub fn state(&self) -> CaptureState {
        if self.tap.is_some() {
            CaptureState::Running
        } else {
            CaptureState::Stopped
        }
    }

    /// Start delivering frames to `on_frame`.
    ///
    /// `on_frame` runs on the audio thread and must return quickly.
    pub fn start<F>(&mut self, source: &dyn InputSource, mut on_frame: F) -> Result<(), AudioError>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        if self.tap.is_some() {
            return Err(AudioError::CaptureAlreadyRunning);
        }

        let format = source.format();
        let mut assembler = FrameAssembler::new(format)?;
        let tap = source.attach(Box::new(move |samples: &[f32]| {
            assembler.push(samples, &mut on_frame);
        }))?;

        log::info!(
            "FrameCapturer: started ({} Hz, {} ch -> {} Hz mono, {} samples/frame)",
            format.sample_rate,
            format.channels,
            INPUT_SAMPLE_RATE,
            FRAME_SIZE
        );
        self.tap = Some(tap);
        Ok(())
    }

    /// Detach from the source. No-op when already stopped.
    pub fn stop(&mut self) {
        if let Some(tap) = self.tap.take() {
            drop(tap);
            log::info!("FrameCapturer: stopped");
        }
    }
}

impl Drop for FrameCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}
