use crate::errors::BoxError;
use serde::{Deserialize, Serialize};

/// On-chain balance of one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancePair {
    pub confirmed: u64,
    pub pending: u64,
}

impl BalancePair {
    /// An address with any confirmed or pending balance has been used.
    pub const fn is_positive(self) -> bool {
        self.confirmed > 0 || self.pending > 0
    }
}

/// Batched chain-balance lookup. Implementations must return one pair per
/// input address, in input order.
pub trait BalanceGetter {
    fn get_balances(&self, addrs: &[String]) -> Result<Vec<BalancePair>, BoxError>;
}
