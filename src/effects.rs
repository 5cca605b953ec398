//! Effect runner for Cohost Studio
//!
//! This module handles executing the session effects produced by the state
//! machine: opening a voice session on the real microphone, speaker and
//! Gemini Live channel, pumping its events back as state machine events, and
//! closing it on request.
//!
//! ```text
//!  OpenSession ──▶ Microphone + Speaker + GeminiLiveTransport
//!                        │ VoiceSession::open
//!                        ▼
//!                  drive_session ──▶ SessionOpened / TranscriptUpdated /
//!                        ▲           SessionError / SessionClosed
//!  CloseSession ──cancel─┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{InputSource, Microphone};
use crate::metrics::MetricsCollector;
use crate::playback::{AudioOutput, Speaker};
use crate::settings::AgentSettings;
use crate::state_machine::{Effect, Event};
use crate::streaming::{
    get_api_key, AgentEvent, AgentTransport, GeminiLiveTransport, SessionError, SessionNotice,
    SessionStats, VoiceSession,
};

/// Extra time `shutdown()` allows beyond the playback drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Live voice sessions driven against the real devices and the Gemini Live API.
pub struct SessionEffectRunner {
    settings: Arc<AgentSettings>,
    metrics: Arc<Mutex<MetricsCollector>>,
    /// Cancellation handles of sessions that are opening or open
    active: Arc<std::sync::Mutex<HashMap<Uuid, CancellationToken>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionEffectRunner {
    pub fn new(settings: AgentSettings, metrics: Arc<Mutex<MetricsCollector>>) -> Arc<Self> {
        Arc::new(Self {
            settings: Arc::new(settings),
            metrics,
            active: Arc::new(std::sync::Mutex::new(HashMap::new())),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsCollector>> {
        self.metrics.clone()
    }

    /// Close every session and wait for them to finish.
    pub async fn shutdown(&self) {
        let tokens: Vec<_> = lock(&self.active).drain().collect();
        for (id, token) in &tokens {
            log::info!("Shutdown: closing session {}", id);
            token.cancel();
        }

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        let limit = self.settings.playback_drain() + SHUTDOWN_GRACE;
        for task in tasks {
            if tokio::time::timeout(limit, task).await.is_err() {
                log::warn!("Shutdown: session task did not finish within {:?}", limit);
            }
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl EffectRunner for SessionEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::OpenSession { id } => {
                // Registered before the task starts so a close request always finds it
                let cancel = CancellationToken::new();
                lock(&self.active).insert(id, cancel.clone());

                let settings = self.settings.clone();
                let metrics = self.metrics.clone();
                let active = self.active.clone();

                let task = tokio::spawn(async move {
                    open_live_session(id, &settings, cancel, &tx, &metrics).await;
                    lock(&active).remove(&id);
                });
                self.track(task);
            }

            Effect::CloseSession { id } => {
                let token = lock(&self.active).remove(&id);
                match token {
                    Some(token) => {
                        log::info!("Effect: closing session {}", id);
                        token.cancel();
                    }
                    None => {
                        // Already gone; still let the state machine settle
                        log::debug!("Effect: session {} not active, reporting closed", id);
                        tokio::spawn(async move {
                            let _ = tx.send(Event::SessionClosed { id, reason: None }).await;
                        });
                    }
                }
            }

            // Roster, transcript and UI effects are applied by the state loop
            other => log::debug!("Effect runner ignoring {:?}", other),
        }
    }
}

/// Acquire devices and the agent channel, open the session, then drive it.
async fn open_live_session(
    id: Uuid,
    settings: &AgentSettings,
    cancel: CancellationToken,
    tx: &mpsc::Sender<Event>,
    metrics: &Mutex<MetricsCollector>,
) {
    metrics.lock().await.start_session(id);

    let acquired = Microphone::open(settings.input_device.as_deref())
        .map_err(SessionError::from)
        .and_then(|microphone| {
            let api_key = get_api_key().ok_or(SessionError::MissingApiKey)?;
            let transport =
                GeminiLiveTransport::new(api_key)?.with_endpoint(settings.endpoint.clone());
            Ok((microphone, transport))
        });

    let (microphone, transport) = match acquired {
        Ok(parts) => parts,
        Err(e) => {
            report_open_failure(id, e, tx, metrics, &SessionStats::default()).await;
            return;
        }
    };

    let output_device = settings.output_device.clone();
    let session = VoiceSession::new(id, transport, settings.to_session_setup(), move || {
        Speaker::open(output_device.as_deref())
    })
    .with_options(settings.session_options());

    drive_session(
        session,
        &microphone,
        cancel,
        tx,
        metrics,
        settings.transcript_tail_chars,
        settings.playback_drain(),
    )
    .await;
}

async fn report_open_failure(
    id: Uuid,
    err: SessionError,
    tx: &mpsc::Sender<Event>,
    metrics: &Mutex<MetricsCollector>,
    stats: &SessionStats,
) {
    log::error!("Session {} failed to open: {}", id, err);
    metrics
        .lock()
        .await
        .session_failed(id, stats, err.to_string());
    let _ = tx
        .send(Event::SessionOpenFailed {
            id,
            err: err.to_string(),
        })
        .await;
}

enum Wake {
    Cancelled,
    Agent(Option<AgentEvent>),
}

/// Open `session` on `source` and pump its events until it closes.
///
/// Sends `SessionOpened` or `SessionOpenFailed`, then `TranscriptUpdated`
/// and `SessionError` while open, and finally `SessionClosed` once the
/// channel is gone and scheduled playback has drained.
pub async fn drive_session<T: AgentTransport, O: AudioOutput>(
    mut session: VoiceSession<T, O>,
    source: &dyn InputSource,
    cancel: CancellationToken,
    tx: &mpsc::Sender<Event>,
    metrics: &Mutex<MetricsCollector>,
    tail_chars: usize,
    playback_drain: Duration,
) {
    let id = session.id();

    if let Err(e) = session.open(source).await {
        report_open_failure(id, e, tx, metrics, &session.stats()).await;
        return;
    }
    metrics.lock().await.session_opened(id, &session.stats());
    let _ = tx.send(Event::SessionOpened { id }).await;

    let reason = loop {
        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            event = session.next_event() => Wake::Agent(event),
        };

        let event = match wake {
            Wake::Cancelled => {
                session.close().await;
                break None;
            }
            Wake::Agent(Some(event)) => event,
            Wake::Agent(None) => {
                session.close().await;
                break Some("Agent channel ended".to_string());
            }
        };

        match session.handle_event(event) {
            SessionNotice::TranscriptUpdated => {
                let tail = session.transcript().tail(tail_chars).to_string();
                let _ = tx.send(Event::TranscriptUpdated { id, tail }).await;
            }
            SessionNotice::RemoteError { message } => {
                metrics
                    .lock()
                    .await
                    .record_error("agent".to_string(), message.clone(), Some(id.to_string()));
                let _ = tx.send(Event::SessionError { id, message }).await;
            }
            SessionNotice::Closed { reason } => break reason,
            SessionNotice::Interrupted { stopped } => {
                log::info!("Session {}: host interrupted, {} chunk(s) stopped", id, stopped);
            }
            SessionNotice::ChunkDropped { reason } => {
                log::debug!("Session {}: chunk dropped: {}", id, reason);
            }
            SessionNotice::AudioScheduled { .. }
            | SessionNotice::TurnComplete
            | SessionNotice::Ready => {}
        }
    };

    let remaining = session.drain_playback(playback_drain).await;
    if remaining > 0 {
        log::warn!(
            "Session {}: {} chunk(s) still playing after {:?}, cutting off",
            id,
            remaining,
            playback_drain
        );
    }

    metrics.lock().await.session_finished(id, &session.stats());
    let _ = tx.send(Event::SessionClosed { id, reason }).await;
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
