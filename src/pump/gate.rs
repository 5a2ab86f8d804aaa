//! Cooldown gate checked before every message.

use crate::types::PumpState;
use chrono::{DateTime, Utc};

/// What the pump does with the message in hand
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Handle the message
    Open,
    /// Return the message and wait until `resume_at`
    Hold {
        /// End of the cooldown
        resume_at: DateTime<Utc>,
    },
    /// The pump is stopped
    Closed,
}

/// Pump state machine: `Active -> CooldownPending -> CooldownActive -> Active`,
/// with `Stopped` terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CooldownGate {
    state: PumpState,
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self {
            state: PumpState::Active,
        }
    }

    /// Current state
    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Arm a cooldown ending at `resume_at`
    ///
    /// An already armed cooldown is only ever extended.
    pub fn arm(&mut self, resume_at: DateTime<Utc>) {
        self.state = match self.state {
            PumpState::Stopped => PumpState::Stopped,
            PumpState::Active => PumpState::CooldownPending { resume_at },
            PumpState::CooldownPending { resume_at: current } => PumpState::CooldownPending {
                resume_at: current.max(resume_at),
            },
            PumpState::CooldownActive { resume_at: current } => PumpState::CooldownActive {
                resume_at: current.max(resume_at),
            },
        };
    }

    /// Decide on the next message at `now`
    pub fn check(&mut self, now: DateTime<Utc>) -> GateDecision {
        match self.state {
            PumpState::Active => GateDecision::Open,
            PumpState::Stopped => GateDecision::Closed,
            PumpState::CooldownPending { resume_at } | PumpState::CooldownActive { resume_at } => {
                if now < resume_at {
                    self.state = PumpState::CooldownActive { resume_at };
                    GateDecision::Hold { resume_at }
                } else {
                    self.state = PumpState::Active;
                    GateDecision::Open
                }
            }
        }
    }

    /// Leave an elapsed cooldown
    pub fn resume(&mut self) {
        if matches!(self.state, PumpState::CooldownActive { .. }) {
            self.state = PumpState::Active;
        }
    }

    /// Enter the terminal state
    pub fn stop(&mut self) {
        self.state = PumpState::Stopped;
    }
}
