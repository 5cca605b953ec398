//! Gemini Live WebSocket client
//!
//! Manages the WebSocket connection lifecycle for a voice-agent session.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket (with retries), send `setup`
//! 2. Writer task - drains [`OutboundMessage`]s into JSON text frames
//! 3. Reader task - parses text/binary JSON frames into [`AgentEvent`]s
//! 4. `AgentLink::shutdown()` - `audioStreamEnd`, close frame, task cleanup
//!
//! The transport does not wait for `setupComplete`; the session does, by
//! watching for [`AgentEvent::Ready`].
//!
//! # Retry Strategy
//!
//! Initial connection retries 3 times with exponential backoff (1s, 2s).
//! Mid-session disconnects do NOT reconnect - the session reports `Closed`
//! and the user toggles again.

use std::future::Future;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{
    parse_server_events, AgentEvent, ClientMessage, SessionSetup, TransportEnvelope,
    GEMINI_LIVE_URL,
};
use super::SessionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum retry attempts for initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// How long `shutdown()` waits for the writer to flush the close frame
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Outbound channel capacity (messages, not bytes)
const OUTBOUND_CAPACITY: usize = 64;

/// Inbound event channel capacity
const INBOUND_CAPACITY: usize = 256;

/// Messages the session pushes into the agent channel
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// One encoded microphone frame
    Audio(TransportEnvelope),
    /// No more microphone audio follows
    AudioStreamEnd,
    /// Close the channel after flushing what was queued before
    Close,
}

/// Opens agent channels.
///
/// Implemented by [`GeminiLiveTransport`] in production and by scripted
/// fakes in tests.
pub trait AgentTransport: Send {
    fn connect(
        &mut self,
        setup: &SessionSetup,
    ) -> impl Future<Output = Result<AgentLink, SessionError>> + Send;
}

/// An open, bidirectional agent channel.
///
/// Dropping the link aborts its background tasks; `shutdown()` closes it
/// politely first.
pub struct AgentLink {
    label: String,
    outbound: mpsc::Sender<OutboundMessage>,
    inbound: mpsc::Receiver<AgentEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentLink {
    pub fn new(
        label: impl Into<String>,
        outbound: mpsc::Sender<OutboundMessage>,
        inbound: mpsc::Receiver<AgentEvent>,
    ) -> Self {
        Self {
            label: label.into(),
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    /// Tie a background task to the link's lifetime
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Clone of the outbound sender, for the capture bridge
    pub fn sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    /// Next inbound event; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.inbound.recv().await
    }

    /// Signal end of audio, close the channel, and stop background tasks.
    pub async fn shutdown(mut self) {
        log::info!("AgentLink: closing {}", self.label);

        let _ = self.outbound.try_send(OutboundMessage::AudioStreamEnd);
        match timeout(CLOSE_GRACE, self.outbound.send(OutboundMessage::Close)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => log::debug!("AgentLink: writer already gone"),
            Err(_) => log::warn!("AgentLink: outbound queue full, dropping without close frame"),
        }

        // The first task is the writer by convention; give it a moment to
        // flush the close frame before everything is aborted.
        if let Some(writer) = self.tasks.first_mut() {
            if timeout(CLOSE_GRACE, writer).await.is_err() {
                log::warn!("AgentLink: writer did not finish within {:?}", CLOSE_GRACE);
            }
        }
    }
}

impl Drop for AgentLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Production transport: Gemini Live over WebSocket
#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveTransport {
    pub fn new(api_key: impl Into<String>) -> Result<Self, SessionError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(SessionError::MissingApiKey);
        }
        Ok(Self {
            api_key,
            endpoint: GEMINI_LIVE_URL.to_string(),
        })
    }

    /// Override the service endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Single connection attempt (no retries)
    async fn try_connect(&self, setup: &SessionSetup) -> Result<AgentLink, SessionError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let request = url
            .into_client_request()
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to Gemini Live...");

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| SessionError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected, sending setup");

        let (mut write, read) = ws_stream.split();

        let setup_json = serde_json::to_string(&setup.to_message())
            .map_err(|e| SessionError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup_json))
            .await
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let writer = tokio::spawn(write_loop(write, outbound_rx, inbound_tx.clone()));
        let reader = tokio::spawn(read_loop(read, inbound_tx));

        Ok(AgentLink::new(format!("gemini-live/{}", setup.model), outbound_tx, inbound_rx)
            .with_task(writer)
            .with_task(reader))
    }
}

impl AgentTransport for GeminiLiveTransport {
    async fn connect(&mut self, setup: &SessionSetup) -> Result<AgentLink, SessionError> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying WebSocket connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
            }

            match self.try_connect(setup).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SessionError::ConnectionFailed("Max retries exceeded".to_string())
        }))
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    events: mpsc::Sender<AgentEvent>,
) {
    let mut frames_sent: u64 = 0;

    while let Some(msg) = outbound.recv().await {
        let wire = match msg {
            OutboundMessage::Audio(envelope) => ClientMessage::audio(envelope),
            OutboundMessage::AudioStreamEnd => ClientMessage::audio_stream_end(),
            OutboundMessage::Close => {
                if let Err(e) = write.close().await {
                    log::warn!("Error closing WebSocket: {}", e);
                }
                break;
            }
        };

        let json = match serde_json::to_string(&wire) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to serialize outbound message: {}", e);
                continue;
            }
        };

        if let Err(e) = write.send(Message::Text(json)).await {
            log::warn!("WebSocket send failed: {}", e);
            let _ = events.try_send(AgentEvent::Error {
                message: SessionError::SendFailed(e.to_string()).to_string(),
            });
            break;
        }

        frames_sent += 1;
        if frames_sent % 50 == 0 {
            log::debug!("Writer: {} messages sent", frames_sent);
        }
    }

    log::debug!("Writer task exiting after {} messages", frames_sent);
}

async fn read_loop(mut read: SplitStream<WsStream>, events: mpsc::Sender<AgentEvent>) {
    let reason = loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text,
            // Gemini sometimes delivers JSON in binary frames
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    log::warn!("Ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                log::info!("WebSocket closed by server: {:?}", frame);
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
            }
            Some(Ok(_)) => continue, // ping/pong
            Some(Err(e)) => {
                log::warn!("WebSocket error: {}", e);
                let _ = events
                    .send(AgentEvent::Error {
                        message: SessionError::ProtocolError(e.to_string()).to_string(),
                    })
                    .await;
                break Some(e.to_string());
            }
            None => break None,
        };

        let Some(parsed) = parse_server_events(&text) else {
            continue;
        };
        for event in parsed {
            if events.send(event).await.is_err() {
                log::debug!("Event receiver dropped");
                return;
            }
        }
    };

    let _ = events.send(AgentEvent::Closed { reason }).await;
    log::debug!("Reader task exiting");
}

/// Get the agent API key from environment
///
/// `GEMINI_API_KEY` wins; `API_KEY` is accepted as a fallback.
pub fn get_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|k| !k.trim().is_empty())
}
