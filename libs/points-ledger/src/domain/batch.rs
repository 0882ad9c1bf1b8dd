use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Every batch expires this many days after purchase.
pub const POINTS_EXPIRY_DAYS: i64 = 30;

// --- Status ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Expired,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BatchStatus::Active),
            "expired" => Ok(BatchStatus::Expired),
            other => Err(BatchError::UnknownStatus(other.to_string())),
        }
    }
}

// --- Errors ---

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch points must be positive, got {0}")]
    NonPositivePoints(i64),
    #[error("Unknown batch status: {0}")]
    UnknownStatus(String),
}

// --- Batch ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointsBatch {
    pub id: Uuid,
    pub tenant_id: String,
    pub customer_id: Uuid,
    pub source: String,
    pub external_order_id: Option<String>,
    pub points_total: i64,
    pub points_remaining: i64,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: BatchStatus,
}

impl PointsBatch {
    pub fn purchase(
        tenant_id: &str,
        customer_id: Uuid,
        points: i64,
        source: &str,
        external_order_id: Option<String>,
        purchased_at: DateTime<Utc>,
    ) -> Result<Self, BatchError> {
        if points <= 0 {
            return Err(BatchError::NonPositivePoints(points));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            customer_id,
            source: source.to_string(),
            external_order_id,
            points_total: points,
            points_remaining: points,
            purchased_at,
            expires_at: purchased_at + Duration::days(POINTS_EXPIRY_DAYS),
            status: BatchStatus::Active,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == BatchStatus::Active
    }

    /// Spendable: active with points left.
    pub fn is_available(&self) -> bool {
        self.is_active() && self.points_remaining > 0
    }

    /// Picked up by the expiry sweep at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_available() && self.expires_at <= now
    }

    /// Take up to `amount` points; returns how many were taken.
    pub fn consume(&mut self, amount: i64) -> i64 {
        if !self.is_active() || amount <= 0 {
            return 0;
        }
        let taken = amount.min(self.points_remaining);
        self.points_remaining -= taken;
        taken
    }

    /// Retire the batch; returns the points that were still on it.
    /// An already expired batch yields 0.
    pub fn expire(&mut self) -> i64 {
        if !self.is_active() {
            return 0;
        }
        let forfeited = self.points_remaining;
        self.points_remaining = 0;
        self.status = BatchStatus::Expired;
        forfeited
    }
}

/// FIFO ordering: oldest purchase first, id as tie-breaker.
pub fn sort_fifo(batches: &mut [PointsBatch]) {
    batches.sort_by(|a, b| {
        a.purchased_at
            .cmp(&b.purchased_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// --- FIFO consumption ---

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Consumption {
    pub requested: i64,
    pub consumed: i64,
    /// Ids of the batches that lost points, in consumption order.
    pub touched: Vec<Uuid>,
}

impl Consumption {
    pub fn shortfall(&self) -> i64 {
        self.requested - self.consumed
    }

    pub fn is_clamped(&self) -> bool {
        self.shortfall() > 0
    }

    pub fn first_batch(&self) -> Option<Uuid> {
        self.touched.first().copied()
    }
}

/// Spend `amount` points from `batches`, oldest purchase first.
///
/// Stops once the amount is covered or the batches run out; the caller decides
/// what to do with a shortfall.
pub fn consume_fifo(batches: &mut [PointsBatch], amount: i64) -> Consumption {
    sort_fifo(batches);
    let mut outcome = Consumption {
        requested: amount.max(0),
        ..Default::default()
    };
    let mut remaining = outcome.requested;
    for batch in batches.iter_mut().filter(|b| b.is_available()) {
        if remaining == 0 {
            break;
        }
        let taken = batch.consume(remaining);
        if taken > 0 {
            remaining -= taken;
            outcome.consumed += taken;
            outcome.touched.push(batch.id);
        }
    }
    outcome
}
