//! User withdrawals.

pub mod review;

use crate::services::Withdraw;
use crate::stage::ObjectId;

impl ObjectId for Withdraw {
    fn object_id(&self) -> String {
        self.id.clone()
    }
}
