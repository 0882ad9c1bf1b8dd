use super::batch::PointsBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Cached balance of one customer. Always re-derivable from the batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletSnapshot {
    pub tenant_id: String,
    pub customer_id: Uuid,
    pub points_balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Wallet balance of customer {0} would exceed the supported maximum")]
    BalanceOverflow(Uuid),
}

impl WalletSnapshot {
    pub fn from_batches(
        tenant_id: &str,
        customer_id: Uuid,
        batches: &[PointsBatch],
        now: DateTime<Utc>,
    ) -> Result<Self, WalletError> {
        let points_balance =
            active_balance(batches).ok_or(WalletError::BalanceOverflow(customer_id))?;
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            customer_id,
            points_balance,
            updated_at: now,
        })
    }
}

/// Sum of `points_remaining` over the active batches, `None` if it does not
/// fit in an `i64`.
pub fn active_balance(batches: &[PointsBatch]) -> Option<i64> {
    batches
        .iter()
        .filter(|b| b.is_active())
        .try_fold(0i64, |total, b| total.checked_add(b.points_remaining))
}

/// Snapshot versus live batch sum, for audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletReconciliation {
    pub customer_id: Uuid,
    pub snapshot_balance: Option<i64>,
    pub batch_balance: i64,
}

impl WalletReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.snapshot_balance.unwrap_or(0) == self.batch_balance
    }

    pub fn drift(&self) -> i64 {
        self.snapshot_balance.unwrap_or(0) - self.batch_balance
    }
}
