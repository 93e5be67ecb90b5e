//! Turn phases of an instance and the events that move between them.

use thiserror::Error;

use crate::dao::models::TurnPhase;

/// Events moving the current turn of an instance between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// Sheets of the turn were inserted.
    SheetsCreated,
    /// No sheet of the turn is waiting to be rendered or dispatched.
    AllDispatched,
    /// The turn deadline passed before quorum.
    DeadlineElapsed,
    /// Quorum reached (or deadline elapsed); choices are applied.
    BeginResolve,
    /// Every sheet of the turn reached a terminal state.
    Resolved,
    /// The next turn starts.
    Reopen,
}

/// Error returned when an event cannot be applied in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from}")]
pub struct InvalidTransition {
    /// The phase the turn was in when the event was received.
    pub from: TurnPhase,
    /// The event that cannot be applied from this phase.
    pub event: TurnEvent,
}

/// Compute the phase reached by applying `event` in `from`.
pub fn next_phase(from: TurnPhase, event: TurnEvent) -> Result<TurnPhase, InvalidTransition> {
    let next = match (from, event) {
        (TurnPhase::Opening, TurnEvent::SheetsCreated) => TurnPhase::Emitting,
        (TurnPhase::Emitting, TurnEvent::AllDispatched) => TurnPhase::Awaiting,
        (TurnPhase::Emitting | TurnPhase::Awaiting, TurnEvent::DeadlineElapsed) => {
            TurnPhase::TimedOut
        }
        (TurnPhase::Awaiting | TurnPhase::TimedOut, TurnEvent::BeginResolve) => {
            TurnPhase::Resolving
        }
        (TurnPhase::Resolving, TurnEvent::Resolved) => TurnPhase::Closed,
        (TurnPhase::Closed, TurnEvent::Reopen) => TurnPhase::Opening,
        (from, event) => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(start: TurnPhase, events: &[TurnEvent]) -> TurnPhase {
        events
            .iter()
            .fold(start, |phase, event| next_phase(phase, *event).unwrap())
    }

    #[test]
    fn happy_path_cycles_back_to_opening() {
        let end = walk(
            TurnPhase::Opening,
            &[
                TurnEvent::SheetsCreated,
                TurnEvent::AllDispatched,
                TurnEvent::BeginResolve,
                TurnEvent::Resolved,
            ],
        );
        assert_eq!(end, TurnPhase::Closed);
        assert_eq!(
            next_phase(end, TurnEvent::Reopen).unwrap(),
            TurnPhase::Opening
        );
    }

    #[test]
    fn deadline_path_goes_through_timed_out() {
        let end = walk(
            TurnPhase::Opening,
            &[
                TurnEvent::SheetsCreated,
                TurnEvent::AllDispatched,
                TurnEvent::DeadlineElapsed,
                TurnEvent::BeginResolve,
            ],
        );
        assert_eq!(end, TurnPhase::Resolving);
    }

    #[test]
    fn resolving_cannot_start_while_emitting() {
        let err = next_phase(TurnPhase::Emitting, TurnEvent::BeginResolve).unwrap_err();
        assert_eq!(err.from, TurnPhase::Emitting);
        assert_eq!(err.event, TurnEvent::BeginResolve);
    }

    #[test]
    fn opening_is_not_reentered_mid_turn() {
        for phase in [
            TurnPhase::Opening,
            TurnPhase::Emitting,
            TurnPhase::Awaiting,
            TurnPhase::TimedOut,
            TurnPhase::Resolving,
        ] {
            assert!(next_phase(phase, TurnEvent::Reopen).is_err());
        }
    }
}
