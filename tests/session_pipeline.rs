//! End-to-end tests for the voice session pipeline
//!
//! These tests drive the public API with in-memory doubles for the
//! microphone, the speaker and the agent channel, so no device or network
//! is needed.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test session_pipeline
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use studio_lib::audio::{
    decode_text_to_binary, int16_pcm_to_float_samples, AudioError, InputFormat, InputSource,
    InputTap, SampleTap, FRAME_SIZE,
};
use studio_lib::playback::{AudioOutput, DecodedAudio, PlaybackHandle};
use studio_lib::streaming::{
    AgentEvent, AgentLink, AgentTransport, OutboundMessage, SessionError, SessionNotice,
    SessionSetup, SessionState, VoiceSession,
};
use tokio::sync::mpsc;

// ============================================================================
// Doubles
// ============================================================================

/// A microphone the test speaks into by hand
struct FakeMicrophone {
    format: InputFormat,
    tap: Arc<Mutex<Option<SampleTap>>>,
}

impl FakeMicrophone {
    fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            format: InputFormat {
                sample_rate,
                channels,
            },
            tap: Arc::new(Mutex::new(None)),
        }
    }

    fn speak(&self, interleaved: &[f32]) {
        if let Some(tap) = self.tap.lock().unwrap().as_mut() {
            tap(interleaved);
        }
    }

    fn is_live(&self) -> bool {
        self.tap.lock().unwrap().is_some()
    }
}

impl InputSource for FakeMicrophone {
    fn format(&self) -> InputFormat {
        self.format
    }

    fn attach(&self, tap: SampleTap) -> Result<InputTap, AudioError> {
        *self.tap.lock().unwrap() = Some(tap);
        let slot = self.tap.clone();
        Ok(InputTap::new(move || {
            slot.lock().unwrap().take();
        }))
    }
}

/// Records every start/stop; the clock is set by the test
#[derive(Clone, Default)]
struct SpeakerLog {
    starts: Arc<Mutex<Vec<(f64, f64)>>>,
    stops: Arc<Mutex<Vec<PlaybackHandle>>>,
    now: Arc<Mutex<f64>>,
}

struct FakeSpeaker {
    log: SpeakerLog,
    next: u64,
    completions: Option<mpsc::UnboundedReceiver<PlaybackHandle>>,
    _completion_tx: mpsc::UnboundedSender<PlaybackHandle>,
}

impl FakeSpeaker {
    fn new(log: SpeakerLog) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            log,
            next: 0,
            completions: Some(rx),
            _completion_tx: tx,
        }
    }
}

impl AudioOutput for FakeSpeaker {
    fn current_time(&self) -> f64 {
        *self.log.now.lock().unwrap()
    }

    fn start_at(&mut self, audio: &DecodedAudio, start_time: f64) -> PlaybackHandle {
        self.next += 1;
        self.log
            .starts
            .lock()
            .unwrap()
            .push((start_time, audio.duration()));
        PlaybackHandle::new(self.next)
    }

    fn stop(&mut self, handle: PlaybackHandle) {
        self.log.stops.lock().unwrap().push(handle);
    }

    fn take_completion_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<PlaybackHandle>> {
        self.completions.take()
    }
}

/// Agent channel backed by plain tokio channels
struct LoopbackTransport {
    links: mpsc::UnboundedSender<(mpsc::Receiver<OutboundMessage>, mpsc::Sender<AgentEvent>)>,
}

impl AgentTransport for LoopbackTransport {
    async fn connect(&mut self, _setup: &SessionSetup) -> Result<AgentLink, SessionError> {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        inbound_tx
            .send(AgentEvent::Ready)
            .await
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;
        self.links
            .send((outbound_rx, inbound_tx))
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;
        Ok(AgentLink::new("loopback", outbound_tx, inbound_rx))
    }
}

struct Agent {
    from_studio: mpsc::Receiver<OutboundMessage>,
    to_studio: mpsc::Sender<AgentEvent>,
}

impl Agent {
    async fn say(&self, event: AgentEvent) {
        self.to_studio.send(event).await.unwrap();
    }

    async fn heard(&mut self) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(2), self.from_studio.recv())
            .await
            .expect("nothing sent to the agent")
            .expect("agent channel closed")
    }
}

fn setup() -> SessionSetup {
    SessionSetup {
        model: "gemini-test".to_string(),
        voice_name: "Kore".to_string(),
        system_instruction: String::new(),
        transcribe_output: true,
    }
}

async fn open_session(
    microphone: &FakeMicrophone,
) -> (VoiceSession<LoopbackTransport, FakeSpeaker>, Agent, SpeakerLog) {
    let (links_tx, mut links_rx) = mpsc::unbounded_channel();
    let log = SpeakerLog::default();
    let speaker_log = log.clone();

    let mut session = VoiceSession::new(
        uuid::Uuid::new_v4(),
        LoopbackTransport { links: links_tx },
        setup(),
        move || Ok(FakeSpeaker::new(speaker_log.clone())),
    );
    session.open(microphone).await.expect("open failed");

    let (from_studio, to_studio) = links_rx.recv().await.unwrap();
    (
        session,
        Agent {
            from_studio,
            to_studio,
        },
        log,
    )
}

/// Base64 PCM16 of `ms` milliseconds of agent audio at 24 kHz
fn agent_audio(ms: usize) -> AgentEvent {
    let pcm: Vec<u8> = std::iter::repeat([0x00, 0x08]).take(ms * 24).flatten().collect();
    AgentEvent::AudioDelta {
        payload: studio_lib::audio::encode_binary_to_text(&pcm),
        mime_type: "audio/pcm;rate=24000".to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn stereo_48k_microphone_reaches_agent_as_16k_frames() {
    let microphone = FakeMicrophone::new(48_000, 2);
    let (mut session, mut agent, _) = open_session(&microphone).await;
    assert_eq!(session.state(), SessionState::Open);

    // One frame's worth at 16 kHz is 3x as many 48 kHz stereo pairs
    let interleaved: Vec<f32> = std::iter::repeat([0.25f32, 0.25f32])
        .take(FRAME_SIZE * 3)
        .flatten()
        .collect();
    microphone.speak(&interleaved);

    match agent.heard().await {
        OutboundMessage::Audio(envelope) => {
            assert_eq!(envelope.mime_type, "audio/pcm;rate=16000");
            let pcm = decode_text_to_binary(&envelope.data).unwrap();
            assert_eq!(pcm.len(), FRAME_SIZE * 2);
            let samples = int16_pcm_to_float_samples(&pcm, 1).unwrap();
            assert!(samples[0].iter().all(|s| (s - 0.25).abs() < 1e-3));
        }
        other => panic!("expected audio, got {:?}", other),
    }

    session.close().await;
}

#[tokio::test]
async fn agent_speech_plays_gaplessly_and_barge_in_cuts_it() {
    let microphone = FakeMicrophone::new(16_000, 1);
    let (mut session, agent, speaker) = open_session(&microphone).await;

    for ms in [400, 250, 350] {
        agent.say(agent_audio(ms)).await;
    }
    for _ in 0..3 {
        let event = session.next_event().await.unwrap();
        assert!(matches!(
            session.handle_event(event),
            SessionNotice::AudioScheduled { .. }
        ));
    }

    let starts = speaker.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 3);
    for pair in starts.windows(2) {
        let (start, duration) = pair[0];
        assert!((start + duration - pair[1].0).abs() < 1e-9);
    }

    agent.say(AgentEvent::Interrupted).await;
    let event = session.next_event().await.unwrap();
    assert_eq!(
        session.handle_event(event),
        SessionNotice::Interrupted { stopped: 3 }
    );
    assert_eq!(speaker.stops.lock().unwrap().len(), 3);

    // After the barge-in the next reply starts at the output clock
    *speaker.now.lock().unwrap() = 0.3;
    agent.say(agent_audio(100)).await;
    let event = session.next_event().await.unwrap();
    assert_eq!(
        session.handle_event(event),
        SessionNotice::AudioScheduled {
            start_time: 0.3,
            duration: 0.1
        }
    );

    session.close().await;
}

#[tokio::test]
async fn transcript_and_errors_do_not_end_the_session() {
    let microphone = FakeMicrophone::new(16_000, 1);
    let (mut session, agent, _) = open_session(&microphone).await;

    agent
        .say(AgentEvent::TranscriptDelta {
            text: "Great question, ".to_string(),
        })
        .await;
    agent
        .say(AgentEvent::Error {
            message: "GoAway: reconnect soon".to_string(),
        })
        .await;
    agent
        .say(AgentEvent::TranscriptDelta {
            text: "let me explain.".to_string(),
        })
        .await;
    agent
        .say(AgentEvent::AudioDelta {
            payload: "not base64!".to_string(),
            mime_type: "audio/pcm;rate=24000".to_string(),
        })
        .await;

    for _ in 0..4 {
        let event = session.next_event().await.unwrap();
        session.handle_event(event);
    }

    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(
        session.transcript().text(),
        "Great question, let me explain."
    );
    assert_eq!(session.transcript().tail(8), "explain.");
    let stats = session.stats();
    assert_eq!(stats.remote_errors, 1);
    assert_eq!(stats.chunks_rejected, 1);

    session.close().await;
}

#[tokio::test]
async fn close_releases_microphone_and_ends_audio_stream() {
    let microphone = FakeMicrophone::new(16_000, 1);
    let (mut session, mut agent, _) = open_session(&microphone).await;
    assert!(microphone.is_live());

    session.close().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!microphone.is_live());
    assert!(matches!(agent.heard().await, OutboundMessage::AudioStreamEnd));
    assert!(matches!(agent.heard().await, OutboundMessage::Close));

    // Closing twice is harmless
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn remote_close_ends_the_session() {
    let microphone = FakeMicrophone::new(16_000, 1);
    let (mut session, agent, _) = open_session(&microphone).await;

    agent
        .say(AgentEvent::Closed {
            reason: Some("session expired".to_string()),
        })
        .await;
    let event = session.next_event().await.unwrap();
    let notice = session.handle_event(event);

    assert_eq!(
        notice,
        SessionNotice::Closed {
            reason: Some("session expired".to_string())
        }
    );
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!microphone.is_live());

    // close() after a remote close is a no-op
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn settings_persist_across_runs() {
    use studio_lib::settings::{load_settings, save_settings, AgentSettings};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cohost-studio").join("settings.json");

    let settings = AgentSettings {
        voice_name: "Puck".to_string(),
        input_device: Some("Studio Mic".to_string()),
        ..AgentSettings::default()
    };
    save_settings(&path, &settings).unwrap();

    let loaded = load_settings(&path);
    assert_eq!(loaded.voice_name, "Puck");
    assert_eq!(loaded.input_device.as_deref(), Some("Studio Mic"));
    assert_eq!(loaded.to_session_setup().voice_name, "Puck");
}
