//! Studio participant roster
//!
//! The host is present for the whole run. The agent joins when a voice
//! session opens and leaves when it closes.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Roster id of the voice agent
pub const AGENT_PARTICIPANT_ID: &str = "ai-guest";

/// Roster id of the local host
pub const HOST_PARTICIPANT_ID: &str = "host";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub is_host: bool,
    pub is_ai: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub has_privileges: bool,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            id: HOST_PARTICIPANT_ID.to_string(),
            name: name.into(),
            is_host: true,
            is_ai: false,
            audio_enabled: true,
            video_enabled: true,
            has_privileges: true,
            joined_at: Utc::now(),
        }
    }

    /// The voice agent. Audio only, with privileges.
    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            id: AGENT_PARTICIPANT_ID.to_string(),
            name: name.into(),
            is_host: false,
            is_ai: true,
            audio_enabled: true,
            video_enabled: false,
            has_privileges: true,
            joined_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant. Returns false if one with the same id is already present.
    pub fn add(&mut self, participant: Participant) -> bool {
        if self.participants.iter().any(|p| p.id == participant.id) {
            log::debug!("Roster: {} already present", participant.id);
            return false;
        }
        log::info!("Roster: {} joined", participant.name);
        self.participants.push(participant);
        true
    }

    /// Remove every AI participant, returning how many left
    pub fn remove_agents(&mut self) -> usize {
        let before = self.participants.len();
        self.participants.retain(|p| !p.is_ai);
        let removed = before - self.participants.len();
        if removed > 0 {
            log::info!("Roster: {} agent(s) left", removed);
        }
        removed
    }

    pub fn agent_present(&self) -> bool {
        self.participants.iter().any(|p| p.is_ai)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }
}
