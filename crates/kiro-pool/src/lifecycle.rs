//! Per-account lifecycle phase
//!
//! Pure state machine: `transition(phase, event)` returns the next phase
//! and does no I/O. The service applies it around every refresh-bearing
//! operation and on every load.
//!
//! ```text
//! Unloaded -> Loaded -> Refreshing -> Healthy | NeedsRefreshGrace | Invalid -> Loaded
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountPhase {
    Unloaded,
    Loaded,
    Refreshing,
    Healthy,
    /// Refresh failed but the token is still inside the grace window
    NeedsRefreshGrace,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Account present in a fresh load
    Load,
    RefreshStarted,
    RefreshSucceeded,
    RefreshFailed { within_grace: bool },
    /// Account file gone
    Unload,
}

/// Apply one event. Events that make no sense in a phase leave it unchanged.
pub fn transition(phase: AccountPhase, event: PhaseEvent) -> AccountPhase {
    use AccountPhase::*;

    match (phase, event) {
        (_, PhaseEvent::Unload) => Unloaded,

        // A reload during an in-flight refresh does not end the refresh
        (Refreshing, PhaseEvent::Load) => Refreshing,
        (_, PhaseEvent::Load) => Loaded,

        (Unloaded, PhaseEvent::RefreshStarted) => Unloaded,
        (_, PhaseEvent::RefreshStarted) => Refreshing,

        (Refreshing, PhaseEvent::RefreshSucceeded) => Healthy,
        (Refreshing, PhaseEvent::RefreshFailed { within_grace: true }) => NeedsRefreshGrace,
        (Refreshing, PhaseEvent::RefreshFailed { within_grace: false }) => Invalid,

        (phase, _) => phase,
    }
}

#[cfg(test)]
mod tests {
    use super::AccountPhase::*;
    use super::*;

    #[test]
    fn full_cycle_returns_to_loaded() {
        let mut phase = Unloaded;
        for (event, expected) in [
            (PhaseEvent::Load, Loaded),
            (PhaseEvent::RefreshStarted, Refreshing),
            (PhaseEvent::RefreshSucceeded, Healthy),
            (PhaseEvent::Load, Loaded),
        ] {
            phase = transition(phase, event);
            assert_eq!(phase, expected, "after {event:?}");
        }
    }

    #[test]
    fn refresh_failure_splits_on_grace() {
        assert_eq!(
            transition(Refreshing, PhaseEvent::RefreshFailed { within_grace: true }),
            NeedsRefreshGrace
        );
        assert_eq!(
            transition(Refreshing, PhaseEvent::RefreshFailed { within_grace: false }),
            Invalid
        );
    }

    #[test]
    fn reload_does_not_interrupt_refresh() {
        assert_eq!(transition(Refreshing, PhaseEvent::Load), Refreshing);
    }

    #[test]
    fn outcomes_outside_refreshing_are_ignored() {
        assert_eq!(transition(Loaded, PhaseEvent::RefreshSucceeded), Loaded);
        assert_eq!(
            transition(Healthy, PhaseEvent::RefreshFailed { within_grace: false }),
            Healthy
        );
        assert_eq!(transition(Unloaded, PhaseEvent::RefreshStarted), Unloaded);
    }

    #[test]
    fn unload_from_anywhere() {
        for phase in [Loaded, Refreshing, Healthy, NeedsRefreshGrace, Invalid] {
            assert_eq!(transition(phase, PhaseEvent::Unload), Unloaded);
        }
    }

    #[test]
    fn retry_from_settled_phases() {
        for phase in [Loaded, Healthy, NeedsRefreshGrace, Invalid] {
            assert_eq!(transition(phase, PhaseEvent::RefreshStarted), Refreshing);
        }
    }
}
