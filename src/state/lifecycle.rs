//! Allowed turn sheet state changes.
//!
//! States advance along `draft → rendered → dispatched → delivered →
//! received → scanned → resolved`. A scan may arrive before the delivery is
//! confirmed, so `dispatched` and `delivered` also lead straight to
//! `received` or `scanned`. `failed` and `abandoned` are reachable from any
//! non-terminal state.

use crate::dao::models::SheetState;

/// Whether no further transition is possible.
pub fn is_terminal(state: SheetState) -> bool {
    matches!(
        state,
        SheetState::Resolved | SheetState::Failed | SheetState::Abandoned
    )
}

/// Whether the sheet has been handed to at least one channel and waits for
/// its scan.
pub fn awaits_scan(state: SheetState) -> bool {
    matches!(
        state,
        SheetState::Dispatched | SheetState::Delivered | SheetState::Received
    )
}

/// Whether `from → to` is an edge of the sheet lifecycle.
pub fn can_transition(from: SheetState, to: SheetState) -> bool {
    use SheetState::*;

    if is_terminal(from) {
        return false;
    }
    matches!(
        (from, to),
        (_, Failed | Abandoned)
            | (Draft, Rendered)
            | (Rendered, Dispatched)
            | (Dispatched, Delivered)
            | (Dispatched | Delivered, Received)
            | (Dispatched | Delivered | Received, Scanned)
            | (Scanned, Resolved)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_edges_are_allowed() {
        assert!(can_transition(SheetState::Draft, SheetState::Rendered));
        assert!(can_transition(SheetState::Rendered, SheetState::Dispatched));
        assert!(can_transition(SheetState::Dispatched, SheetState::Delivered));
        assert!(can_transition(SheetState::Delivered, SheetState::Received));
        assert!(can_transition(SheetState::Dispatched, SheetState::Scanned));
        assert!(can_transition(SheetState::Received, SheetState::Scanned));
        assert!(can_transition(SheetState::Scanned, SheetState::Resolved));
    }

    #[test]
    fn jumps_backward_and_same_state_moves_are_rejected() {
        assert!(!can_transition(SheetState::Draft, SheetState::Resolved));
        assert!(!can_transition(SheetState::Draft, SheetState::Dispatched));
        assert!(!can_transition(SheetState::Rendered, SheetState::Scanned));
        assert!(!can_transition(SheetState::Delivered, SheetState::Resolved));
        assert!(!can_transition(SheetState::Delivered, SheetState::Dispatched));
        assert!(!can_transition(SheetState::Rendered, SheetState::Rendered));
    }

    #[test]
    fn failure_is_reachable_from_every_open_state_only() {
        for state in SheetState::ALL {
            let expected = !is_terminal(*state);
            assert_eq!(can_transition(*state, SheetState::Failed), expected, "{state}");
            assert_eq!(can_transition(*state, SheetState::Abandoned), expected, "{state}");
        }
    }
}
