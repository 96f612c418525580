//! Volume availability state machine.
//!
//! ```text
//!   Active ──► Pause ──► Drain
//!     ▲  ◄──────┘         │
//!     │      ────────────►│ (Active ──► Drain)
//!     └───────────────────┘
//! ```
//!
//! `Pause` blocks new placements but leaves running tasks alone. `Drain`
//! blocks new placements and evicts every task using the volume. Reverting
//! to `Active` never restores evicted bindings; those tasks go through a
//! fresh placement cycle.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Administrative lifecycle state of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityState {
    #[default]
    Active,
    Pause,
    Drain,
}

/// Side effects implied by an availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityEffect {
    /// New placements onto the volume are rejected.
    pub blocks_new_placement: bool,
    /// Tasks currently using the volume must be stopped and rescheduled.
    pub evicts: bool,
}

/// Outcome of a validated availability change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Requested state equals the current one.
    NoChange,
    Changed {
        from: AvailabilityState,
        to: AvailabilityState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal availability transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: AvailabilityState,
    pub to: AvailabilityState,
}

impl AvailabilityState {
    pub fn effect(&self) -> AvailabilityEffect {
        match self {
            AvailabilityState::Active => AvailabilityEffect {
                blocks_new_placement: false,
                evicts: false,
            },
            AvailabilityState::Pause => AvailabilityEffect {
                blocks_new_placement: true,
                evicts: false,
            },
            AvailabilityState::Drain => AvailabilityEffect {
                blocks_new_placement: true,
                evicts: true,
            },
        }
    }

    pub fn allows_new_placement(&self) -> bool {
        !self.effect().blocks_new_placement
    }

    /// Validate a move to `next`.
    pub fn check_transition(&self, next: AvailabilityState) -> Result<Transition, IllegalTransition> {
        use AvailabilityState::*;
        if *self == next {
            return Ok(Transition::NoChange);
        }
        match (self, next) {
            (Active, Pause) | (Active, Drain) | (Pause, Drain) | (Pause, Active) | (Drain, Active) => {
                Ok(Transition::Changed { from: *self, to: next })
            }
            (Drain, Pause) => Err(IllegalTransition { from: *self, to: next }),
            // Equal pairs handled above.
            (Active, Active) | (Pause, Pause) | (Drain, Drain) => Ok(Transition::NoChange),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityState::Active => "active",
            AvailabilityState::Pause => "pause",
            AvailabilityState::Drain => "drain",
        }
    }
}

impl fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AvailabilityState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AvailabilityState::Active),
            "pause" => Ok(AvailabilityState::Pause),
            "drain" => Ok(AvailabilityState::Drain),
            other => Err(format!("unknown availability: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AvailabilityState::*;

    #[test]
    fn forward_transitions_are_legal() {
        assert_eq!(
            Active.check_transition(Pause),
            Ok(Transition::Changed { from: Active, to: Pause })
        );
        assert!(Pause.check_transition(Drain).is_ok());
        assert!(Active.check_transition(Drain).is_ok());
    }

    #[test]
    fn reversal_to_active_is_legal() {
        assert!(Pause.check_transition(Active).is_ok());
        assert!(Drain.check_transition(Active).is_ok());
    }

    #[test]
    fn drain_to_pause_is_rejected() {
        let err = Drain.check_transition(Pause).unwrap_err();
        assert_eq!(err.from, Drain);
        assert_eq!(err.to, Pause);
        assert_eq!(err.to_string(), "illegal availability transition: drain -> pause");
    }

    #[test]
    fn same_state_is_no_change() {
        assert_eq!(Drain.check_transition(Drain), Ok(Transition::NoChange));
        assert_eq!(Active.check_transition(Active), Ok(Transition::NoChange));
    }

    #[test]
    fn effects() {
        assert!(Active.allows_new_placement());
        assert!(!Pause.allows_new_placement());
        assert!(!Pause.effect().evicts);
        assert!(Drain.effect().evicts);
        assert!(Drain.effect().blocks_new_placement);
    }

    #[test]
    fn parse_from_str() {
        assert_eq!("pause".parse::<AvailabilityState>(), Ok(Pause));
        assert!("paused".parse::<AvailabilityState>().is_err());
    }
}
