use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::streaming::{SessionOptions, SessionSetup, GEMINI_LIVE_URL};

const APP_DIR_NAME: &str = "cohost-studio";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Native-audio Live model used when none is configured
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

pub const DEFAULT_VOICE: &str = "Kore";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a professional co-host and producer in a live streaming studio. You are witty, helpful, and keep the energy high. Help the host with technical questions or engage in conversation.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Live model id, with or without the `models/` prefix.
    pub model: String,

    /// Prebuilt voice the agent speaks with.
    pub voice_name: String,

    /// Persona sent at session start. Empty means none.
    pub system_instruction: String,

    /// WebSocket endpoint of the Live API.
    pub endpoint: String,

    /// Roster names.
    pub agent_display_name: String,
    pub host_display_name: String,

    /// Device names as reported by the host audio API. `None` uses the system default.
    pub input_device: Option<String>,
    pub output_device: Option<String>,

    /// Captured frames buffered ahead of the network before new frames are dropped.
    pub frame_queue_capacity: usize,

    /// How long to wait for the agent to acknowledge setup.
    pub setup_timeout_secs: u64,

    /// Characters of transcript shown while the agent is active.
    pub transcript_tail_chars: usize,

    /// How long a closed session may keep playing already-scheduled agent audio.
    pub playback_drain_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            endpoint: GEMINI_LIVE_URL.to_string(),
            agent_display_name: "Gemini AI".to_string(),
            host_display_name: "Host".to_string(),
            input_device: None,
            output_device: None,
            frame_queue_capacity: 32,
            setup_timeout_secs: 15,
            transcript_tail_chars: 150,
            playback_drain_secs: 10,
        }
    }
}

impl AgentSettings {
    pub fn to_session_setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            system_instruction: self.system_instruction.clone(),
            transcribe_output: true,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            setup_timeout: Duration::from_secs(self.setup_timeout_secs.max(1)),
            frame_queue_capacity: self.frame_queue_capacity.max(1),
        }
    }

    pub fn playback_drain(&self) -> Duration {
        Duration::from_secs(self.playback_drain_secs)
    }
}

/// `<config dir>/cohost-studio/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AgentSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AgentSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AgentSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AgentSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AgentSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the real one.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
