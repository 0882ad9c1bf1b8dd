use super::{PointsLedger, recalculate_wallet_snapshot};
use crate::{
    CoreError,
    domain::{
        customer::Customer,
        transaction::{PointsTransaction, TransactionType},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub expired_batches: usize,
    pub expired_points: i64,
    pub affected_customers: usize,
    /// Customers whose unit of work failed; picked up again by the next sweep.
    pub failed_customers: usize,
}

impl PointsLedger {
    /// Expire every batch that is due at the clock's current time.
    pub async fn expire_points(&self) -> Result<ExpiryReport, CoreError> {
        self.expire_points_at(self.clock.now()).await
    }

    /// Expire every active batch with `expires_at <= now` and points left.
    ///
    /// Customers are processed one unit of work at a time, so a sweep that
    /// stops halfway leaves finished customers consistent.
    pub async fn expire_points_at(&self, now: DateTime<Utc>) -> Result<ExpiryReport, CoreError> {
        let customers = self.store.customers_with_due_batches(now).await?;
        let mut report = ExpiryReport::default();
        if customers.is_empty() {
            debug!("No points batches due for expiry at {}", now);
            return Ok(report);
        }

        for customer in &customers {
            let outcome = self
                .with_retry("Expiry sweep", move || self.expire_customer(customer, now))
                .await;
            match outcome {
                Ok((0, _)) => {}
                Ok((batches, points)) => {
                    report.expired_batches += batches;
                    report.expired_points = report.expired_points.saturating_add(points);
                    report.affected_customers += 1;
                }
                Err(e) => {
                    error!(
                        "Failed to expire points for customer {} in tenant {}: {}",
                        customer.id, customer.tenant_id, e
                    );
                    report.failed_customers += 1;
                }
            }
        }

        info!(
            "Expiry sweep at {}: {} batches ({} points) across {} customers, {} failed",
            now,
            report.expired_batches,
            report.expired_points,
            report.affected_customers,
            report.failed_customers
        );
        Ok(report)
    }

    async fn expire_customer(
        &self,
        customer: &Customer,
        now: DateTime<Utc>,
    ) -> Result<(usize, i64), CoreError> {
        let mut uow = self.store.begin(&customer.key()).await?;

        // Re-read under the lock; another sweep may have got here first
        let mut batches = uow.active_batches(customer.id).await?;
        let mut expired = 0;
        let mut forfeited_total = 0;
        for batch in batches.iter_mut().filter(|b| b.is_due(now)) {
            let forfeited = batch.expire();
            uow.update_batch(batch).await?;

            let transaction = PointsTransaction::new(
                &customer.tenant_id,
                customer.id,
                TransactionType::Expiry,
                -forfeited,
                now,
            )
            .with_batch(Some(batch.id));
            uow.append_transaction(&transaction).await?;

            expired += 1;
            forfeited_total += forfeited;
        }

        if expired == 0 {
            return Ok((0, 0));
        }

        recalculate_wallet_snapshot(uow.as_mut(), customer.id, now).await?;
        uow.commit().await?;
        debug!(
            "Expired {} batches ({} points) for customer {}",
            expired, forfeited_total, customer.id
        );
        Ok((expired, forfeited_total))
    }
}
