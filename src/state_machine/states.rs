use serde::{Deserialize, Serialize};
use std::fmt;

use super::StateGraph;
use crate::error::PipelineError;

/// Withdrawal lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawState {
    /// Requested by the user
    Created,
    /// Waiting for automatic or manual review
    Reviewing,
    /// Approved by an operator
    Approved,
    /// Rejected by an operator, balance not yet unlocked
    PreRejected,
    Rejected,
    /// On-chain transfer in progress
    Transferring,
    PreSuccessful,
    Successful,
    PreFail,
    Fail,
}

impl StateGraph for WithdrawState {
    const ENTITY: &'static str = "withdraw";

    fn successors(&self) -> &'static [Self] {
        match self {
            Self::Created => &[Self::Reviewing],
            Self::Reviewing => &[Self::Approved, Self::PreRejected, Self::Transferring],
            Self::Approved => &[Self::Transferring],
            Self::PreRejected => &[Self::Rejected],
            Self::Transferring => &[Self::PreSuccessful, Self::PreFail],
            Self::PreSuccessful => &[Self::Successful],
            Self::PreFail => &[Self::Fail],
            Self::Rejected | Self::Successful | Self::Fail => &[],
        }
    }
}

impl fmt::Display for WithdrawState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Reviewing => write!(f, "reviewing"),
            Self::Approved => write!(f, "approved"),
            Self::PreRejected => write!(f, "pre_rejected"),
            Self::Rejected => write!(f, "rejected"),
            Self::Transferring => write!(f, "transferring"),
            Self::PreSuccessful => write!(f, "pre_successful"),
            Self::Successful => write!(f, "successful"),
            Self::PreFail => write!(f, "pre_fail"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for WithdrawState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "reviewing" => Ok(Self::Reviewing),
            "approved" => Ok(Self::Approved),
            "pre_rejected" => Ok(Self::PreRejected),
            "rejected" => Ok(Self::Rejected),
            "transferring" => Ok(Self::Transferring),
            "pre_successful" => Ok(Self::PreSuccessful),
            "successful" => Ok(Self::Successful),
            "pre_fail" => Ok(Self::PreFail),
            "fail" => Ok(Self::Fail),
            _ => Err(PipelineError::InvalidEnum {
                kind: "withdraw state",
                value: s.to_string(),
            }),
        }
    }
}

/// Per-good benefit cycle. `Done` and `Fail` loop back to `Wait` for the next period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoodBenefitState {
    /// Waiting for the next benefit time
    Wait,
    /// Reward transferred, statements not yet written
    BookKeeping,
    Done,
    Fail,
}

impl StateGraph for GoodBenefitState {
    const ENTITY: &'static str = "good benefit";

    fn successors(&self) -> &'static [Self] {
        match self {
            Self::Wait => &[Self::BookKeeping, Self::Fail],
            Self::BookKeeping => &[Self::Done, Self::Fail],
            Self::Done | Self::Fail => &[Self::Wait],
        }
    }
}

impl fmt::Display for GoodBenefitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::BookKeeping => write!(f, "bookkeeping"),
            Self::Done => write!(f, "done"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for GoodBenefitState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(Self::Wait),
            "bookkeeping" => Ok(Self::BookKeeping),
            "done" => Ok(Self::Done),
            "fail" => Ok(Self::Fail),
            _ => Err(PipelineError::InvalidEnum {
                kind: "good benefit state",
                value: s.to_string(),
            }),
        }
    }
}

/// Manual review decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Wait,
    Approved,
    Rejected,
}

impl StateGraph for ReviewState {
    const ENTITY: &'static str = "review";

    fn successors(&self) -> &'static [Self] {
        match self {
            Self::Wait => &[Self::Approved, Self::Rejected],
            Self::Approved | Self::Rejected => &[],
        }
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}
