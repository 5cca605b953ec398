//! Session supervisor state machine for Cohost Studio
//!
//! This module implements the supervisor using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.
//!
//! ```text
//!            Toggle                 SessionOpened
//!   Idle ───────────▶ Opening ───────────────────▶ Active
//!    ▲                   │                           │ Toggle
//!    │                   │ SessionOpenFailed         ▼
//!    │                   ▼                        Closing
//!    │                 Error ──Toggle──▶ Opening     │
//!    │                                               │
//!    └──────────────── SessionClosed ◀───────────────┘
//! ```

use std::time::Instant;
use uuid::Uuid;

/// Supervisor state.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    Opening {
        session_id: Uuid,
    },
    Active {
        session_id: Uuid,
        opened_at: Instant,
        /// Most recent remote error; the session keeps running
        last_error: Option<String>,
    },
    Closing {
        session_id: Uuid,
    },
    Error {
        message: String,
    },
}

/// Events that can trigger state transitions.
/// Sent by the console front end and by the effect runner.
#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to bring the agent in or send it away
    Toggle,
    /// Application exit requested
    Exit,

    // Session events
    SessionOpened {
        id: Uuid,
    },
    SessionOpenFailed {
        id: Uuid,
        err: String,
    },
    SessionClosed {
        id: Uuid,
        reason: Option<String>,
    },
    SessionError {
        id: Uuid,
        message: String,
    },
    TranscriptUpdated {
        id: Uuid,
        tail: String,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone)]
pub enum Effect {
    OpenSession { id: Uuid },
    CloseSession { id: Uuid },
    AddAgentParticipant,
    RemoveAgentParticipant,
    ClearTranscript,
    ShowTranscript { tail: String },
    /// Signal to render the studio view
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Emit EmitUi after every visible change
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    // Helper: extract current session_id (if any)
    let current_id: Option<Uuid> = match state {
        Opening { session_id } | Active { session_id, .. } | Closing { session_id } => {
            Some(*session_id)
        }
        Idle | Error { .. } => None,
    };
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Toggle
        // -----------------
        (Idle, Toggle) | (Error { .. }, Toggle) => {
            let id = Uuid::new_v4();
            (
                Opening { session_id: id },
                vec![OpenSession { id }, ClearTranscript, EmitUi],
            )
        }
        (Opening { session_id }, Toggle) => {
            log::info!("Toggle ignored: session {} is still opening", session_id);
            (state.clone(), vec![])
        }
        (Closing { session_id }, Toggle) => {
            log::info!("Toggle ignored: session {} is still closing", session_id);
            (state.clone(), vec![])
        }
        (Active { session_id, .. }, Toggle) => (
            Closing {
                session_id: *session_id,
            },
            vec![
                CloseSession { id: *session_id },
                RemoveAgentParticipant,
                EmitUi,
            ],
        ),

        // -----------------
        // Opening
        // -----------------
        (Opening { session_id }, SessionOpened { id }) if *session_id == id => (
            Active {
                session_id: id,
                opened_at: Instant::now(),
                last_error: None,
            },
            vec![AddAgentParticipant, EmitUi],
        ),
        (Opening { session_id }, SessionOpenFailed { id, err }) if *session_id == id => {
            (Error { message: err }, vec![EmitUi])
        }
        (Opening { session_id }, SessionClosed { id, reason }) if *session_id == id => (
            Error {
                message: reason.unwrap_or_else(|| "Session closed while opening".to_string()),
            },
            vec![EmitUi],
        ),

        // -----------------
        // Active
        // -----------------
        (
            Active {
                session_id,
                opened_at,
                ..
            },
            SessionError { id, message },
        ) if *session_id == id => (
            Active {
                session_id: id,
                opened_at: *opened_at,
                last_error: Some(message),
            },
            vec![EmitUi],
        ),
        (Active { session_id, .. }, TranscriptUpdated { id, tail }) if *session_id == id => {
            (state.clone(), vec![ShowTranscript { tail }, EmitUi])
        }
        (Active { session_id, .. }, SessionClosed { id, reason }) if *session_id == id => {
            log::info!(
                "Session {} ended remotely ({})",
                id,
                reason.as_deref().unwrap_or("no reason")
            );
            (Idle, vec![RemoveAgentParticipant, EmitUi])
        }

        // -----------------
        // Closing
        // -----------------
        (Closing { session_id }, SessionClosed { id, .. }) if *session_id == id => {
            (Idle, vec![EmitUi])
        }

        // -----------------
        // Stale events
        // -----------------
        // An orphaned session must not keep the microphone open
        (_, SessionOpened { id }) if is_stale(id) => {
            log::warn!("Closing orphaned session {}", id);
            (state.clone(), vec![CloseSession { id }])
        }

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

/// Short status label for the studio view
pub fn status_label(state: &State) -> &'static str {
    match state {
        State::Idle => "idle",
        State::Opening { .. } => "connecting",
        State::Active { .. } => "live",
        State::Closing { .. } => "disconnecting",
        State::Error { .. } => "error",
    }
}
