pub mod audio;
pub mod effects;
pub mod metrics;
pub mod playback;
pub mod roster;
pub mod settings;
pub mod state_machine;
pub mod streaming;

#[cfg(test)]
mod test_support;

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use effects::{EffectRunner, SessionEffectRunner};
use metrics::MetricsCollector;
use roster::{Participant, Roster};
use settings::AgentSettings;
use state_machine::{reduce, status_label, Effect, Event, State};

/// Studio state handed to the UI after every visible change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudioView {
    pub status: String,
    pub agent_active: bool,
    pub participants: Vec<Participant>,
    pub transcript_tail: String,
    pub last_error: Option<String>,
}

/// Anything that can show the studio
pub trait StudioUi: Send {
    fn render(&mut self, view: &StudioView);
}

/// Prints the studio to stdout, one block per change
#[derive(Debug, Default)]
pub struct ConsoleUi {
    last_printed: Option<String>,
}

impl StudioUi for ConsoleUi {
    fn render(&mut self, view: &StudioView) {
        let names: Vec<&str> = view.participants.iter().map(|p| p.name.as_str()).collect();
        let mut block = format!("[{}] on air: {}", view.status, names.join(", "));
        if !view.transcript_tail.is_empty() {
            block.push_str(&format!("\n  agent: ...{}", view.transcript_tail));
        }
        if let Some(error) = &view.last_error {
            block.push_str(&format!("\n  error: {}", error));
        }

        // Transcript updates often repeat the same tail
        if self.last_printed.as_deref() == Some(block.as_str()) {
            return;
        }

        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", block);
        let _ = stdout.flush();
        self.last_printed = Some(block);
    }
}

/// UI-side studio model: the roster and the visible transcript tail.
/// Only the state loop writes it.
pub struct Studio {
    roster: Roster,
    agent_name: String,
    transcript_tail: String,
}

impl Studio {
    pub fn new(host_name: &str, agent_name: &str) -> Self {
        let mut roster = Roster::new();
        roster.add(Participant::host(host_name));
        Self {
            roster,
            agent_name: agent_name.to_string(),
            transcript_tail: String::new(),
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Apply a roster or transcript effect. Returns false for effects
    /// that belong to the effect runner.
    pub fn apply(&mut self, effect: &Effect) -> bool {
        match effect {
            Effect::AddAgentParticipant => {
                self.roster.add(Participant::agent(self.agent_name.as_str()));
            }
            Effect::RemoveAgentParticipant => {
                self.roster.remove_agents();
            }
            Effect::ClearTranscript => self.transcript_tail.clear(),
            Effect::ShowTranscript { tail } => self.transcript_tail = tail.clone(),
            Effect::OpenSession { .. } | Effect::CloseSession { .. } | Effect::EmitUi => {
                return false
            }
        }
        true
    }

    pub fn view(&self, state: &State) -> StudioView {
        let last_error = match state {
            State::Error { message } => Some(message.clone()),
            State::Active { last_error, .. } => last_error.clone(),
            _ => None,
        };

        let agent_active = matches!(state, State::Active { .. });
        StudioView {
            status: status_label(state).to_string(),
            agent_active,
            participants: self.roster.participants().to_vec(),
            // The tail is only shown while the agent is on air
            transcript_tail: if agent_active {
                self.transcript_tail.clone()
            } else {
                String::new()
            },
            last_error,
        }
    }
}

/// Run the main state loop until `Exit`. Returns the final state.
pub async fn run_state_loop<U: StudioUi>(
    mut ui: U,
    studio: &mut Studio,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
) -> State {
    let mut state = State::default();

    // Render initial state
    ui.render(&studio.view(&state));
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested, shutting down state loop");
            break;
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        for eff in effects {
            match eff {
                Effect::EmitUi => ui.render(&studio.view(&state)),
                other => {
                    if !studio.apply(&other) {
                        effect_runner.spawn(other, tx.clone());
                    }
                }
            }
        }
    }

    log::info!("State loop ended");
    state
}

/// Commands typed at the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Toggle,
    Status,
    Quit,
    Help,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "" => None,
            "toggle" | "t" => Some(Self::Toggle),
            "status" | "s" => Some(Self::Status),
            "quit" | "q" | "exit" => Some(Self::Quit),
            _ => Some(Self::Help),
        }
    }
}

const HELP: &str = "commands: toggle (t) brings the agent in or out, status (s), quit (q)";

/// Read console commands from stdin and forward them to the state loop.
async fn read_console_commands(tx: mpsc::Sender<Event>, metrics: Arc<Mutex<MetricsCollector>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::info!("Console: stdin closed");
                break;
            }
            Err(e) => {
                log::error!("Console: failed to read stdin: {}", e);
                break;
            }
        };

        match ConsoleCommand::parse(&line) {
            Some(ConsoleCommand::Toggle) => {
                if let Err(e) = tx.send(Event::Toggle).await {
                    log::error!("Console: failed to send toggle event: {}", e);
                    return;
                }
            }
            Some(ConsoleCommand::Status) => {
                let summary = metrics.lock().await.get_summary();
                match serde_json::to_string_pretty(&summary) {
                    Ok(json) => println!("{}", json),
                    Err(e) => log::warn!("Console: failed to serialize metrics: {}", e),
                }
            }
            Some(ConsoleCommand::Quit) => break,
            Some(ConsoleCommand::Help) => println!("{}", HELP),
            None => {}
        }
    }

    let _ = tx.send(Event::Exit).await;
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Also installs the log -> tracing bridge
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Logging already initialized: {}", e);
    }
}

async fn run_studio(settings: AgentSettings) {
    if streaming::get_api_key().is_none() {
        log::warn!("GEMINI_API_KEY is not set; bringing the agent in will fail");
    }

    let metrics = Arc::new(Mutex::new(MetricsCollector::new()));
    let runner = SessionEffectRunner::new(settings.clone(), metrics.clone());
    let (tx, rx) = mpsc::channel::<Event>(32);

    let mut studio = Studio::new(&settings.host_display_name, &settings.agent_display_name);
    let console = tokio::spawn(read_console_commands(tx.clone(), metrics));
    println!("{}", HELP);

    let effect_runner: Arc<dyn EffectRunner> = runner.clone();
    run_state_loop(ConsoleUi::default(), &mut studio, rx, tx, effect_runner).await;

    console.abort();
    runner.shutdown().await;
}

// ============================================================================
// Application entry point
// ============================================================================

pub fn run() {
    init_logging();

    // tokio-tungstenite's rustls needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = match settings::settings_path() {
        Ok(path) => {
            log::info!("Settings: {:?}", path);
            settings::load_settings(&path)
        }
        Err(e) => {
            log::warn!("Settings: {}, using defaults", e);
            AgentSettings::default()
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return;
        }
    };

    log::info!("Cohost Studio started");
    runtime.block_on(run_studio(settings));

    // A pending stdin read must not hold up exit
    runtime.shutdown_timeout(Duration::from_millis(200));
    log::info!("Cohost Studio stopped");
}
