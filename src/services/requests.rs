//! Saga request bodies.
//!
//! A forward action and its compensator receive the same body, so each body
//! carries what the compensator needs to undo the forward effect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{GoodStatement, LedgerStatement, Review};
use crate::state_machine::{GoodBenefitState, WithdrawState};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateGoodRequest {
    pub id: String,
    pub benefit_state: Option<GoodBenefitState>,
    pub reward_at: Option<u32>,
    pub last_reward_amount: Option<String>,
    pub next_reward_start_amount: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodStatementRequest {
    pub statement: GoodStatement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementsRequest {
    pub statements: Vec<LedgerStatement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrdersBenefitRequest {
    pub last_benefit_at: u32,
    /// Order ID to its previous `last_benefit_at`, restored on compensation.
    pub previous: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub review: Review,
    /// The review as it was before, restored on compensation.
    pub previous: Option<Review>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateWithdrawRequest {
    pub id: String,
    pub state: WithdrawState,
    pub review_id: Option<String>,
}
