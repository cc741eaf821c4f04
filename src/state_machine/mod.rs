//! # Entity State Machines
//!
//! Each domain entity moves along a fixed directed graph. Scanners select
//! entities by state and persistent stages advance them; a commit that would
//! skip or reverse an edge is rejected before any saga is submitted.
//! Re-applying the current state is a loop-back and always allowed.

pub mod states;

use std::fmt::Display;

use crate::error::{PipelineError, Result};

pub use states::{GoodBenefitState, ReviewState, WithdrawState};

pub trait StateGraph: Copy + Eq + Display + Sized + 'static {
    /// Entity name used in transition errors.
    const ENTITY: &'static str;

    fn successors(&self) -> &'static [Self];

    fn can_transition_to(&self, next: Self) -> bool {
        *self == next || self.successors().contains(&next)
    }

    fn ensure_transition(&self, next: Self) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                entity: Self::ENTITY,
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// No outgoing edges.
    fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_withdraw_review_edges() {
        let reviewing = WithdrawState::Reviewing;
        assert!(reviewing.can_transition_to(WithdrawState::Transferring));
        assert!(reviewing.can_transition_to(WithdrawState::Approved));
        assert!(reviewing.can_transition_to(WithdrawState::PreRejected));
        assert!(reviewing.can_transition_to(WithdrawState::Reviewing));
        assert!(!reviewing.can_transition_to(WithdrawState::Successful));
        assert!(!WithdrawState::Transferring.can_transition_to(WithdrawState::Reviewing));
    }

    #[test]
    fn test_ensure_transition_error() {
        let err = WithdrawState::Successful
            .ensure_transition(WithdrawState::Created)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition for withdraw: successful -> created"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_benefit_cycle_loops_back() {
        use GoodBenefitState::*;
        assert!(Wait.can_transition_to(BookKeeping));
        assert!(BookKeeping.can_transition_to(Done));
        assert!(Done.can_transition_to(Wait));
        assert!(Fail.can_transition_to(Wait));
        assert!(!Done.can_transition_to(BookKeeping));
        assert!(!Done.is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        assert!(WithdrawState::Successful.is_terminal());
        assert!(WithdrawState::Rejected.is_terminal());
        assert!(!WithdrawState::Reviewing.is_terminal());
        assert!(ReviewState::Approved.is_terminal());
    }

    #[test]
    fn test_state_strings_round_trip() {
        assert_eq!(
            WithdrawState::from_str("pre_rejected").unwrap(),
            WithdrawState::PreRejected
        );
        assert_eq!(GoodBenefitState::BookKeeping.to_string(), "bookkeeping");
        assert!(matches!(
            GoodBenefitState::from_str("sleeping"),
            Err(PipelineError::InvalidEnum { .. })
        ));
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&WithdrawState::PreSuccessful).unwrap();
        assert_eq!(json, "\"pre_successful\"");
    }
}
