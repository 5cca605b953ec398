//! Deterministic doubles for the audio devices and the agent channel

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::audio::{
    encode_binary_to_text, AudioError, InputFormat, InputSource, InputTap, SampleTap,
};
use crate::playback::{AudioOutput, DecodedAudio, PlaybackHandle};
use crate::streaming::{
    AgentEvent, AgentLink, AgentTransport, OutboundMessage, SessionError, SessionSetup,
};

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartedChunk {
    pub handle: PlaybackHandle,
    pub start_time: f64,
    pub end_time: f64,
}

/// Audio output whose clock only moves when the test says so
pub struct ManualOutput {
    now: f64,
    next_handle: u64,
    started: Vec<StartedChunk>,
    stopped: Vec<PlaybackHandle>,
    finished: HashSet<PlaybackHandle>,
    completion_tx: mpsc::UnboundedSender<PlaybackHandle>,
    completion_rx: Option<mpsc::UnboundedReceiver<PlaybackHandle>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            now: 0.0,
            next_handle: 1,
            started: Vec::new(),
            stopped: Vec::new(),
            finished: HashSet::new(),
            completion_tx,
            completion_rx: Some(completion_rx),
        }
    }

    /// Move the clock without reporting completions
    pub fn set_time(&mut self, now: f64) {
        self.now = now;
    }

    /// Move the clock and report every chunk that has played out by `now`
    pub fn advance_to(&mut self, now: f64) {
        self.now = now;
        for chunk in &self.started {
            let done = chunk.end_time <= now + 1e-9;
            if done
                && !self.stopped.contains(&chunk.handle)
                && self.finished.insert(chunk.handle)
            {
                let _ = self.completion_tx.send(chunk.handle);
            }
        }
    }

    pub fn started(&self) -> &[StartedChunk] {
        &self.started
    }

    pub fn stopped(&self) -> &[PlaybackHandle] {
        &self.stopped
    }
}

impl AudioOutput for ManualOutput {
    fn current_time(&self) -> f64 {
        self.now
    }

    fn start_at(&mut self, audio: &DecodedAudio, start_time: f64) -> PlaybackHandle {
        let handle = PlaybackHandle::new(self.next_handle);
        self.next_handle += 1;
        self.started.push(StartedChunk {
            handle,
            start_time,
            end_time: start_time + audio.duration(),
        });
        handle
    }

    fn stop(&mut self, handle: PlaybackHandle) {
        if !self.finished.contains(&handle) && !self.stopped.contains(&handle) {
            self.stopped.push(handle);
        }
    }

    fn take_completion_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<PlaybackHandle>> {
        self.completion_rx.take()
    }
}

// ============================================================================
// Input
// ============================================================================

/// Input source fed by hand from the test thread
pub struct PushInput {
    format: InputFormat,
    tap: Arc<Mutex<Option<SampleTap>>>,
}

impl PushInput {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            format: InputFormat {
                sample_rate,
                channels,
            },
            tap: Arc::new(Mutex::new(None)),
        }
    }

    /// Deliver interleaved samples to the attached tap, if any
    pub fn push(&self, samples: &[f32]) {
        if let Some(tap) = self.tap.lock().unwrap().as_mut() {
            tap(samples);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.tap.lock().unwrap().is_some()
    }
}

impl InputSource for PushInput {
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

// ============================================================================
// Agent channel
// ============================================================================

#[derive(Default)]
struct Script {
    setups: Vec<SessionSetup>,
    /// Events emitted while no link was connected
    queued: Vec<AgentEvent>,
    inbound: Option<mpsc::Sender<AgentEvent>>,
}

/// Transport that hands out in-memory links driven by a [`ScriptedAgent`]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    outbound: mpsc::Sender<OutboundMessage>,
    failure: Option<String>,
}

/// The test's side of a [`ScriptedTransport`]
pub struct ScriptedAgent {
    script: Arc<Mutex<Script>>,
    outbound: mpsc::Receiver<OutboundMessage>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, ScriptedAgent) {
        let script = Arc::new(Mutex::new(Script::default()));
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        (
            Self {
                script: script.clone(),
                outbound: outbound_tx,
                failure: None,
            },
            ScriptedAgent {
                script,
                outbound: outbound_rx,
            },
        )
    }

    /// Transport whose every connect attempt fails
    pub fn failing(reason: &str) -> (Self, ScriptedAgent) {
        let (mut transport, agent) = Self::new();
        transport.failure = Some(reason.to_string());
        (transport, agent)
    }
}

impl AgentTransport for ScriptedTransport {
    async fn connect(&mut self, setup: &SessionSetup) -> Result<AgentLink, SessionError> {
        if let Some(reason) = &self.failure {
            return Err(SessionError::ConnectionFailed(reason.clone()));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let mut script = self.script.lock().unwrap();
        script.setups.push(setup.clone());
        for event in script.queued.drain(..) {
            let _ = inbound_tx.try_send(event);
        }
        script.inbound = Some(inbound_tx);
        drop(script);

        Ok(AgentLink::new("scripted", self.outbound.clone(), inbound_rx))
    }
}

impl ScriptedAgent {
    /// Send an event to the connected link, or queue it for the next one
    pub fn emit(&self, event: AgentEvent) {
        let mut script = self.script.lock().unwrap();
        let event = match script.inbound.as_ref() {
            Some(tx) => match tx.try_send(event) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            None => event,
        };
        script.inbound = None;
        script.queued.push(event);
    }

    pub fn ready(&self) {
        self.emit(AgentEvent::Ready);
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        self.script.lock().unwrap().setups.clone()
    }

    pub async fn next_outbound(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }
}

pub fn test_setup() -> SessionSetup {
    SessionSetup {
        model: "test-model".to_string(),
        voice_name: "Kore".to_string(),
        system_instruction: "Be brief.".to_string(),
        transcribe_output: true,
    }
}

/// base64 PCM16 payload of `samples` quiet samples
pub fn pcm_payload(samples: usize) -> String {
    let pcm: Vec<u8> = std::iter::repeat([0x00, 0x10]).take(samples).flatten().collect();
    encode_binary_to_text(&pcm)
}
