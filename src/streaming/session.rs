//! Voice session: one full-duplex conversation with the agent
//!
//! ```text
//!  InputSource ─▶ FrameCapturer ──try_send──▶ [frame queue] ─▶ bridge task
//!                                                                  │ TransportEnvelope
//!                                                                  ▼
//!                                                              AgentLink ◀──▶ agent
//!                                                                  │ AgentEvent
//!                                                                  ▼
//!  AudioOutput ◀── PlaybackScheduler ◀── handle_event ◀──── next_event
//!                                            │
//!                                            └──▶ TranscriptBuffer
//! ```
//!
//! The session is the only writer of its [`SessionState`], its playback
//! scheduler and its transcript. Inbound events are applied one at a time
//! in arrival order by whoever drives `next_event()` / `handle_event()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::audio::{
    decode_text_to_binary, int16_pcm_to_float_samples, AudioError, AudioFrame, CodecError,
    FrameCapturer, InputSource,
};
use crate::playback::{
    AudioOutput, DecodedAudio, PlaybackHandle, PlaybackScheduler, OUTPUT_SAMPLE_RATE,
};

use super::live_client::{AgentLink, AgentTransport, OutboundMessage};
use super::protocol::{AgentEvent, MediaType, SessionSetup, TransportEnvelope};
use super::transcript::TranscriptBuffer;
use super::{SessionError, SessionState};

/// How long `close()` lets the bridge flush queued frames
const BRIDGE_DRAIN: Duration = Duration::from_secs(1);

/// Builds the audio output for each opened session
pub type OutputFactory<O> = Box<dyn FnMut() -> Result<O, AudioError> + Send>;

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum wait for the agent to acknowledge setup
    pub setup_timeout: Duration,
    /// Captured frames buffered between the audio thread and the network
    pub frame_queue_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(15),
            frame_queue_capacity: 32,
        }
    }
}

/// Counters for one open/close cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub open_latency: Option<Duration>,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_rejected: u64,
    pub interruptions: u64,
    pub remote_errors: u64,
    pub transcript_chars: u64,
}

/// What applying one inbound event did
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// Setup acknowledged again after open (informational)
    Ready,
    /// Agent audio placed on the output clock
    AudioScheduled { start_time: f64, duration: f64 },
    /// A malformed or empty audio chunk was skipped
    ChunkDropped { reason: String },
    /// The transcript grew
    TranscriptUpdated,
    TurnComplete,
    /// Barge-in: in-flight playback was stopped
    Interrupted { stopped: usize },
    /// The agent reported an error; the session stays open
    RemoteError { message: String },
    /// The channel closed from the remote side
    Closed { reason: Option<String> },
}

/// One conversation with the voice agent.
pub struct VoiceSession<T: AgentTransport, O: AudioOutput> {
    id: Uuid,
    state: SessionState,
    transport: T,
    setup: SessionSetup,
    options: SessionOptions,
    open_output: OutputFactory<O>,
    playback: Option<PlaybackScheduler<O>>,
    completions: Option<mpsc::UnboundedReceiver<PlaybackHandle>>,
    capturer: FrameCapturer,
    link: Option<AgentLink>,
    bridge: Option<JoinHandle<()>>,
    transcript: TranscriptBuffer,
    stats: SessionStats,
    frames_sent: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

impl<T: AgentTransport, O: AudioOutput> VoiceSession<T, O> {
    /// Create an idle session.
    ///
    /// # Arguments
    /// * `id` - Identifier used in logs and supervisor events
    /// * `transport` - Opens the agent channel on `open()`
    /// * `setup` - Model, voice and instruction sent at session start
    /// * `open_output` - Builds a fresh audio output on every `open()`
    pub fn new(
        id: Uuid,
        transport: T,
        setup: SessionSetup,
        open_output: impl FnMut() -> Result<O, AudioError> + Send + 'static,
    ) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            transport,
            setup,
            options: SessionOptions::default(),
            open_output: Box::new(open_output),
            playback: None,
            completions: None,
            capturer: FrameCapturer::new(),
            link: None,
            bridge: None,
            transcript: TranscriptBuffer::new(),
            stats: SessionStats::default(),
            frames_sent: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transcript(&self) -> &TranscriptBuffer {
        &self.transcript
    }

    pub fn playback(&self) -> Option<&PlaybackScheduler<O>> {
        self.playback.as_ref()
    }

    pub fn playback_mut(&mut self) -> Option<&mut PlaybackScheduler<O>> {
        self.playback.as_mut()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            ..self.stats.clone()
        }
    }

    /// Open the agent channel and start streaming the microphone.
    ///
    /// Only valid from `Idle` or `Closed`. On failure everything acquired so
    /// far is released and the session ends up `Closed`.
    pub async fn open(&mut self, source: &dyn InputSource) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Idle | SessionState::Closed) {
            return Err(SessionError::InvalidSessionState {
                state: self.state,
                operation: "open",
            });
        }

        log::info!("VoiceSession {}: opening", self.id);
        self.state = SessionState::Opening;
        self.transcript.reset();
        self.stats = SessionStats::default();
        self.frames_sent = Arc::new(AtomicU64::new(0));
        self.frames_dropped = Arc::new(AtomicU64::new(0));
        let started = Instant::now();

        match self.establish(source).await {
            Ok(()) => {
                self.state = SessionState::Open;
                self.stats.open_latency = Some(started.elapsed());
                log::info!(
                    "VoiceSession {}: open after {:?}",
                    self.id,
                    started.elapsed()
                );
                Ok(())
            }
            Err(e) => {
                log::warn!("VoiceSession {}: open failed: {}", self.id, e);
                self.release();
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    async fn establish(&mut self, source: &dyn InputSource) -> Result<(), SessionError> {
        let mut output = (self.open_output)()?;
        self.completions = output.take_completion_receiver();
        self.playback = Some(PlaybackScheduler::new(output));

        let link = self.transport.connect(&self.setup).await?;
        log::info!("VoiceSession {}: channel {} connected", self.id, link.label());
        let link = self.link.insert(link);
        wait_for_ready(link, self.options.setup_timeout).await?;

        self.start_capture(source)
    }

    fn start_capture(&mut self, source: &dyn InputSource) -> Result<(), SessionError> {
        let outbound = match &self.link {
            Some(link) => link.sender(),
            None => {
                return Err(SessionError::Disconnected(
                    "channel closed before capture started".to_string(),
                ))
            }
        };

        let capacity = self.options.frame_queue_capacity.max(1);
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(capacity);
        let dropped = self.frames_dropped.clone();
        self.capturer.start(source, move |frame| {
            if frame_tx.try_send(frame).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        })?;

        self.bridge = Some(tokio::spawn(forward_frames(
            frame_rx,
            outbound,
            self.frames_sent.clone(),
        )));
        Ok(())
    }

    /// Wait for the next inbound event.
    ///
    /// Playback completions reported by the output are applied while
    /// waiting. Returns `None` when there is no channel or it has ended.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        loop {
            let link = self.link.as_mut()?;
            tokio::select! {
                biased;
                Some(handle) = next_completion(&mut self.completions) => {
                    if let Some(playback) = self.playback.as_mut() {
                        playback.on_playback_ended(handle);
                    }
                }
                event = link.recv() => return event,
            }
        }
    }

    /// Apply one inbound event.
    pub fn handle_event(&mut self, event: AgentEvent) -> SessionNotice {
        match event {
            AgentEvent::Ready => SessionNotice::Ready,
            AgentEvent::AudioDelta { payload, mime_type } => self.play_audio(&payload, &mime_type),
            AgentEvent::TranscriptDelta { text } => {
                self.transcript.append(&text);
                self.stats.transcript_chars += text.chars().count() as u64;
                SessionNotice::TranscriptUpdated
            }
            AgentEvent::TurnComplete => {
                self.transcript.mark_turn_complete();
                SessionNotice::TurnComplete
            }
            AgentEvent::Interrupted => {
                let stopped = self
                    .playback
                    .as_mut()
                    .map(|playback| playback.interrupt())
                    .unwrap_or(0);
                self.stats.interruptions += 1;
                SessionNotice::Interrupted { stopped }
            }
            AgentEvent::Error { message } => {
                log::warn!("VoiceSession {}: agent error: {}", self.id, message);
                self.stats.remote_errors += 1;
                SessionNotice::RemoteError { message }
            }
            AgentEvent::Closed { reason } => {
                log::info!(
                    "VoiceSession {}: closed by remote ({})",
                    self.id,
                    reason.as_deref().unwrap_or("no reason")
                );
                if self.state != SessionState::Closed {
                    self.state = SessionState::Closing;
                    self.release();
                    self.state = SessionState::Closed;
                }
                SessionNotice::Closed { reason }
            }
        }
    }

    fn play_audio(&mut self, payload: &str, mime_type: &str) -> SessionNotice {
        let Some(media) = MediaType::parse(mime_type) else {
            log::warn!("VoiceSession {}: unsupported media type {}", self.id, mime_type);
            self.stats.chunks_rejected += 1;
            return SessionNotice::ChunkDropped {
                reason: format!("unsupported media type {}", mime_type),
            };
        };
        if media.sample_rate != OUTPUT_SAMPLE_RATE {
            log::debug!(
                "VoiceSession {}: agent declared {}, playing at {} Hz",
                self.id,
                media,
                OUTPUT_SAMPLE_RATE
            );
        }

        let Some(playback) = self.playback.as_mut() else {
            return SessionNotice::ChunkDropped {
                reason: "no audio output".to_string(),
            };
        };

        let scheduled = decode_agent_audio(payload)
            .map_err(SessionError::from)
            .and_then(|audio| playback.schedule(audio).map_err(SessionError::from));

        match scheduled {
            Ok(chunk) => {
                self.stats.chunks_scheduled += 1;
                SessionNotice::AudioScheduled {
                    start_time: chunk.start_time,
                    duration: chunk.audio.duration(),
                }
            }
            Err(e) => {
                log::warn!("VoiceSession {}: dropping agent audio: {}", self.id, e);
                self.stats.chunks_rejected += 1;
                SessionNotice::ChunkDropped {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Stop capture and close the channel. Idempotent.
    ///
    /// Playback already scheduled keeps running; see [`Self::drain_playback`].
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            log::debug!("VoiceSession {}: close ignored in {}", self.id, self.state);
            return;
        }

        log::info!("VoiceSession {}: closing", self.id);
        self.state = SessionState::Closing;
        self.capturer.stop();

        // Frames already queued still go out before the close frame
        if let Some(mut bridge) = self.bridge.take() {
            if timeout(BRIDGE_DRAIN, &mut bridge).await.is_err() {
                log::warn!("VoiceSession {}: frame bridge did not drain", self.id);
                bridge.abort();
            }
        }

        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }

        self.state = SessionState::Closed;
        let stats = self.stats();
        log::info!(
            "VoiceSession {}: closed ({} frames sent, {} dropped, {} chunks, {} interruptions)",
            self.id,
            stats.frames_sent,
            stats.frames_dropped,
            stats.chunks_scheduled,
            stats.interruptions
        );
    }

    /// Wait for in-flight playback to finish, up to `limit`.
    ///
    /// Returns the number of chunks still in flight when it gave up.
    pub async fn drain_playback(&mut self, limit: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + limit;

        loop {
            let Some(playback) = self.playback.as_mut() else {
                return 0;
            };
            if playback.in_flight_count() == 0 {
                return 0;
            }
            let Some(completions) = self.completions.as_mut() else {
                return playback.in_flight_count();
            };

            match tokio::time::timeout_at(deadline, completions.recv()).await {
                Ok(Some(handle)) => {
                    playback.on_playback_ended(handle);
                }
                Ok(None) | Err(_) => return playback.in_flight_count(),
            }
        }
    }

    /// Drop capture and the channel without the polite close handshake.
    fn release(&mut self) {
        self.capturer.stop();
        if let Some(bridge) = self.bridge.take() {
            bridge.abort();
        }
        self.link = None;
    }
}

impl<T: AgentTransport, O: AudioOutput> Drop for VoiceSession<T, O> {
    fn drop(&mut self) {
        self.release();
    }
}

async fn wait_for_ready(link: &mut AgentLink, limit: Duration) -> Result<(), SessionError> {
    let wait = async {
        while let Some(event) = link.recv().await {
            match event {
                AgentEvent::Ready => return Ok(()),
                AgentEvent::Error { message } => {
                    return Err(SessionError::ConnectionFailed(message));
                }
                AgentEvent::Closed { reason } => {
                    return Err(SessionError::Disconnected(
                        reason.unwrap_or_else(|| "closed during setup".to_string()),
                    ));
                }
                other => log::debug!("Ignoring {:?} before setup completed", other),
            }
        }
        Err(SessionError::Disconnected(
            "channel ended during setup".to_string(),
        ))
    };

    timeout(limit, wait)
        .await
        .map_err(|_| SessionError::SetupTimeout(limit))?
}

async fn next_completion(
    completions: &mut Option<mpsc::UnboundedReceiver<PlaybackHandle>>,
) -> Option<PlaybackHandle> {
    match completions {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Encode captured frames and push them to the agent channel.
///
/// Ends when the capturer stops (frame sender dropped) or the channel closes.
async fn forward_frames(
    mut frames: mpsc::Receiver<AudioFrame>,
    outbound: mpsc::Sender<OutboundMessage>,
    sent: Arc<AtomicU64>,
) {
    while let Some(frame) = frames.recv().await {
        let envelope = TransportEnvelope::from_frame(&frame);
        if outbound.send(OutboundMessage::Audio(envelope)).await.is_err() {
            log::debug!("Frame bridge: channel closed");
            break;
        }
        let count = sent.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 50 == 0 {
            log::debug!(
                "Frame bridge: {} frames sent (latest #{}, {:?} old)",
                count,
                frame.sequence(),
                frame.captured_at().elapsed()
            );
        }
    }
}

/// base64 payload -> PCM16 -> mono f32 at the agent output rate
fn decode_agent_audio(payload: &str) -> Result<DecodedAudio, CodecError> {
    let bytes = decode_text_to_binary(payload)?;
    let mut channels = int16_pcm_to_float_samples(&bytes, 1)?;
    let samples = channels.pop().unwrap_or_default();
    Ok(DecodedAudio::new(samples, OUTPUT_SAMPLE_RATE))
}
