use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Client session state machine.
///
/// ```text
/// Idle ──▶ Describing ──▶ Setup ──▶ Playing ──▶ TearingDown ──▶ Closed
///   │           │            │          │                          ▲
///   └───────────┴────────────┴──────────┴──▶ Failed ───────────────┘ (stop)
/// ```
///
/// `TearingDown` is reachable from every live state so that `stop()` can
/// interrupt negotiation. `Closed` may return to `Idle` for a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Describing,
    Setup,
    Playing,
    TearingDown,
    Closed,
    Failed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Describing)
                | (Describing, Setup)
                | (Setup, Playing)
                | (Idle | Describing | Setup | Playing, TearingDown)
                | (Idle | Describing | Setup | Playing | TearingDown, Failed)
                | (TearingDown | Failed | Idle, Closed)
                | (Closed | Failed, Idle)
        )
    }

    /// Whether a session worker may still be running in this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Describing
                | SessionState::Setup
                | SessionState::Playing
                | SessionState::TearingDown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Describing => "describing",
            SessionState::Setup => "setup",
            SessionState::Playing => "playing",
            SessionState::TearingDown => "tearing_down",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session state shared between the facade and the session worker.
///
/// Every change goes through [`transition`](Self::transition), which refuses
/// moves the state machine does not allow.
#[derive(Debug, Clone)]
pub struct SharedState(Arc<Mutex<SessionState>>);

impl SharedState {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SessionState::Idle)))
    }

    pub fn get(&self) -> SessionState {
        *self.0.lock()
    }

    /// Move to `next`. Returns `false` (state unchanged) when the move is not
    /// allowed from the current state.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.0.lock();
        if *state == next {
            return true;
        }
        if !state.can_transition_to(next) {
            tracing::warn!(from = %*state, to = %next, "illegal state transition ignored");
            return false;
        }
        tracing::debug!(old_state = %*state, new_state = %next, "state transition");
        *state = next;
        true
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
