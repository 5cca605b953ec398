//! Gapless playback scheduling with barge-in
//!
//! Each decoded chunk is placed on the output clock directly after the
//! previous one:
//!
//! ```text
//! start = max(next_start_time, clock.now)
//! next_start_time = start + duration
//! ```
//!
//! so back-to-back chunks play without gaps, and a chunk that arrives after
//! the cursor has fallen behind starts immediately. `interrupt()` stops all
//! in-flight chunks and rewinds the cursor to the clock origin; the `max`
//! above makes the next chunk start "now".

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::PlaybackError;

/// Sample rate of agent audio
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Identifies one started chunk on an [`AudioOutput`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackHandle(u64);

impl PlaybackHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Decoded mono audio ready to be scheduled
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl DecodedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds (0 for an empty or zero-rate buffer)
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    fn validate(&self) -> Result<(), PlaybackError> {
        if self.sample_rate == 0 {
            return Err(PlaybackError::InvalidPlaybackChunk(
                "sample rate is zero".to_string(),
            ));
        }
        if self.samples.is_empty() {
            return Err(PlaybackError::InvalidPlaybackChunk(
                "zero-duration buffer".to_string(),
            ));
        }
        if self.samples.iter().any(|s| !s.is_finite()) {
            return Err(PlaybackError::InvalidPlaybackChunk(
                "buffer contains non-finite samples".to_string(),
            ));
        }
        Ok(())
    }
}

/// A chunk that has been placed on the output clock
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    pub handle: PlaybackHandle,
    pub audio: DecodedAudio,
    /// Start time in seconds on the output clock
    pub start_time: f64,
}

impl PlaybackChunk {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.audio.duration()
    }
}

/// Audio sink with its own monotonic clock.
///
/// Completion of a chunk that plays out naturally is reported on the
/// completion channel. Chunks cancelled with [`AudioOutput::stop`] are not
/// reported.
pub trait AudioOutput: Send {
    /// Current output clock position in seconds
    fn current_time(&self) -> f64;

    /// Play `audio` starting at `start_time` on the output clock
    fn start_at(&mut self, audio: &DecodedAudio, start_time: f64) -> PlaybackHandle;

    /// Cancel a started chunk. Unknown or finished handles are ignored.
    fn stop(&mut self, handle: PlaybackHandle);

    /// Take the completion receiver. Returns `None` once taken.
    fn take_completion_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<PlaybackHandle>>;
}

/// Owns the play cursor and the set of chunks still playing.
pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    next_start_time: f64,
    in_flight: HashSet<PlaybackHandle>,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            in_flight: HashSet::new(),
        }
    }

    /// Schedule a chunk to play right after everything already scheduled.
    ///
    /// Invalid chunks are rejected without touching the cursor or the
    /// in-flight set.
    pub fn schedule(&mut self, audio: DecodedAudio) -> Result<PlaybackChunk, PlaybackError> {
        audio.validate()?;

        let start_time = self.next_start_time.max(self.output.current_time());
        let handle = self.output.start_at(&audio, start_time);
        self.in_flight.insert(handle);
        self.next_start_time = start_time + audio.duration();

        log::trace!(
            "PlaybackScheduler: {:?} at {:.3}s for {:.3}s ({} in flight)",
            handle,
            start_time,
            audio.duration(),
            self.in_flight.len()
        );

        Ok(PlaybackChunk {
            handle,
            audio,
            start_time,
        })
    }

    /// Stop everything in flight and rewind the cursor.
    ///
    /// Returns the number of chunks that were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.in_flight.len();
        for handle in self.in_flight.drain() {
            self.output.stop(handle);
        }
        self.next_start_time = 0.0;

        if stopped > 0 {
            log::info!("PlaybackScheduler: interrupted, {} chunk(s) stopped", stopped);
        }
        stopped
    }

    /// Record natural completion of a chunk.
    ///
    /// Returns `false` when the handle was already removed (e.g. by an
    /// interrupt that raced the completion).
    pub fn on_playback_ended(&mut self, handle: PlaybackHandle) -> bool {
        self.in_flight.remove(&handle)
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, handle: PlaybackHandle) -> bool {
        self.in_flight.contains(&handle)
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualOutput;

    fn millis(ms: usize) -> DecodedAudio {
        DecodedAudio::new(vec![0.1; ms * 24], OUTPUT_SAMPLE_RATE)
    }

    #[test]
    fn test_back_to_back_chunks_are_contiguous() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());

        let a = scheduler.schedule(millis(1000)).unwrap();
        let b = scheduler.schedule(millis(500)).unwrap();

        assert_eq!(a.start_time, 0.0);
        assert_eq!(b.start_time, 1.0);
        assert_eq!(scheduler.next_start_time(), 1.5);
        assert_eq!(scheduler.in_flight_count(), 2);
    }

    #[test]
    fn test_contiguity_does_not_depend_on_call_time() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());

        let mut starts = Vec::new();
        for (i, ms) in [200, 300, 250, 500].iter().enumerate() {
            // Each call happens before the previous chunk ends
            scheduler.output_mut().set_time(i as f64 * 0.1);
            starts.push(scheduler.schedule(millis(*ms)).unwrap().start_time);
        }

        assert!((starts[1] - 0.2).abs() < 1e-9);
        assert!((starts[2] - 0.5).abs() < 1e-9);
        assert!((starts[3] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_late_chunk_starts_now() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());
        scheduler.schedule(millis(500)).unwrap();

        scheduler.output_mut().set_time(2.0);
        let late = scheduler.schedule(millis(500)).unwrap();
        assert_eq!(late.start_time, 2.0);
        assert_eq!(scheduler.next_start_time(), 2.5);
    }

    #[test]
    fn test_interrupt_stops_everything_and_rewinds() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());
        let a = scheduler.schedule(millis(1000)).unwrap();
        let b = scheduler.schedule(millis(1000)).unwrap();
        let c = scheduler.schedule(millis(1000)).unwrap();

        scheduler.output_mut().set_time(0.4);
        assert_eq!(scheduler.interrupt(), 3);
        assert_eq!(scheduler.in_flight_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);

        let mut stopped = scheduler.output().stopped().to_vec();
        stopped.sort();
        assert_eq!(stopped, vec![a.handle, b.handle, c.handle]);

        // Next chunk starts from the clock, not from 0
        let next = scheduler.schedule(millis(200)).unwrap();
        assert_eq!(next.start_time, 0.4);
    }

    #[test]
    fn test_interrupt_with_nothing_in_flight() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());
        assert_eq!(scheduler.interrupt(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
    }

    #[test]
    fn test_natural_completion_removes_once() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());
        let a = scheduler.schedule(millis(500)).unwrap();

        assert!(scheduler.on_playback_ended(a.handle));
        assert!(!scheduler.on_playback_ended(a.handle));
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[test]
    fn test_completion_after_interrupt_is_ignored() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());
        let a = scheduler.schedule(millis(500)).unwrap();
        scheduler.interrupt();

        assert!(!scheduler.on_playback_ended(a.handle));
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[test]
    fn test_completions_arrive_through_output_channel() {
        let mut output = ManualOutput::new();
        let mut completions = output.take_completion_receiver().unwrap();
        assert!(output.take_completion_receiver().is_none());

        let mut scheduler = PlaybackScheduler::new(output);
        let a = scheduler.schedule(millis(500)).unwrap();
        let b = scheduler.schedule(millis(500)).unwrap();

        scheduler.output_mut().advance_to(0.6);
        let ended = completions.try_recv().unwrap();
        assert_eq!(ended, a.handle);
        assert!(completions.try_recv().is_err());

        assert!(scheduler.on_playback_ended(ended));
        assert!(scheduler.is_in_flight(b.handle));
    }

    #[test]
    fn test_invalid_chunks_leave_state_untouched() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());
        scheduler.schedule(millis(250)).unwrap();

        let empty = DecodedAudio::new(Vec::new(), OUTPUT_SAMPLE_RATE);
        let zero_rate = DecodedAudio::new(vec![0.0; 10], 0);
        let nan = DecodedAudio::new(vec![0.0, f32::NAN], OUTPUT_SAMPLE_RATE);

        for bad in [empty, zero_rate, nan] {
            let err = scheduler.schedule(bad).unwrap_err();
            assert!(matches!(err, PlaybackError::InvalidPlaybackChunk(_)));
        }

        assert_eq!(scheduler.next_start_time(), 0.25);
        assert_eq!(scheduler.in_flight_count(), 1);
        assert_eq!(scheduler.output().started().len(), 1);
    }

    #[test]
    fn test_duration() {
        assert_eq!(millis(1000).duration(), 1.0);
        assert_eq!(DecodedAudio::new(vec![0.0; 12], 0).duration(), 0.0);
    }
}
