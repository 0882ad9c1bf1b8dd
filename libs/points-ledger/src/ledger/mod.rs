use crate::{
    Clock, CoreError, LedgerStore, LedgerUnitOfWork,
    adapters::SystemClock,
    domain::{
        batch::PointsBatch,
        customer::{Customer, CustomerProfile, CustomerRef},
        transaction::PointsTransaction,
        wallet::{WalletError, WalletReconciliation, WalletSnapshot, active_balance},
    },
};
use chrono::{DateTime, Utc};
use std::{future::Future, sync::Arc};
use tracing::{debug, warn};
use uuid::Uuid;

pub mod expiry;
pub mod ingest;

/// Attempts per unit of work before a storage conflict is reported.
const MAX_UNIT_OF_WORK_ATTEMPTS: u32 = 3;

/// Entry point of the ledger: ingestion, expiry and wallet reads over one store.
#[derive(Clone)]
pub struct PointsLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Current balance as cached in the wallet snapshot. Unknown customers have 0.
    pub async fn get_wallet_balance(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<i64, CoreError> {
        Ok(self
            .get_wallet_snapshot(tenant_id, customer)
            .await?
            .map(|snapshot| snapshot.points_balance)
            .unwrap_or(0))
    }

    pub async fn get_wallet_snapshot(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<Option<WalletSnapshot>, CoreError> {
        let Some(found) = self.store.find_customer(tenant_id, customer).await? else {
            return Ok(None);
        };
        self.store.wallet_snapshot(tenant_id, found.id).await
    }

    pub async fn customer_batches(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<Vec<PointsBatch>, CoreError> {
        let found = self.require_customer(tenant_id, customer).await?;
        self.store.customer_batches(tenant_id, found.id).await
    }

    pub async fn customer_transactions(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<Vec<PointsTransaction>, CoreError> {
        let found = self.require_customer(tenant_id, customer).await?;
        self.store.customer_transactions(tenant_id, found.id).await
    }

    /// Compare the cached snapshot with the live batch sum.
    ///
    /// Both are read under the customer lock in a unit of work that is never
    /// committed, so a concurrent event cannot land between the two reads.
    pub async fn reconcile_wallet(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<WalletReconciliation, CoreError> {
        let found = self.require_customer(tenant_id, customer).await?;
        let mut uow = self.store.begin(&found.key()).await?;
        let batches = uow.active_batches(found.id).await?;
        let snapshot = uow.wallet_snapshot(found.id).await?;
        drop(uow);

        let reconciliation = WalletReconciliation {
            customer_id: found.id,
            snapshot_balance: snapshot.map(|s| s.points_balance),
            batch_balance: active_balance(&batches)
                .ok_or(WalletError::BalanceOverflow(found.id))?,
        };
        if !reconciliation.is_consistent() {
            warn!(
                "Wallet drift for customer {} in tenant {}: {} points",
                found.id,
                tenant_id,
                reconciliation.drift()
            );
        }
        Ok(reconciliation)
    }

    async fn require_customer(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<Customer, CoreError> {
        self.store
            .find_customer(tenant_id, customer)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Customer {:?} in tenant {}", customer, tenant_id)))
    }

    /// Run a unit of work, retrying storage conflicts.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Err(e) if e.is_retryable() && attempt < MAX_UNIT_OF_WORK_ATTEMPTS => {
                    warn!(
                        "{} hit a storage conflict (attempt {}/{}): {}",
                        operation, attempt, MAX_UNIT_OF_WORK_ATTEMPTS, e
                    );
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

/// Load the unit of work's customer, registering or refreshing it from `profile`.
pub(crate) async fn ensure_customer(
    uow: &mut dyn LedgerUnitOfWork,
    profile: &CustomerProfile,
    now: DateTime<Utc>,
) -> Result<Customer, CoreError> {
    match uow.find_customer().await? {
        Some(mut existing) => {
            if existing.apply_profile(profile, now) {
                uow.update_customer(&existing).await?;
                debug!("Updated profile of customer {}", existing.id);
            }
            Ok(existing)
        }
        None => {
            let customer = Customer::register(&uow.key().tenant_id, profile, now);
            uow.insert_customer(&customer).await?;
            debug!(
                "Registered customer {} for {}",
                customer.id,
                customer.key().lock_name()
            );
            Ok(customer)
        }
    }
}

/// Recompute the customer's snapshot from its active batches, inside the
/// unit of work that changed them.
pub(crate) async fn recalculate_wallet_snapshot(
    uow: &mut dyn LedgerUnitOfWork,
    customer_id: Uuid,
    now: DateTime<Utc>,
) -> Result<WalletSnapshot, CoreError> {
    let batches = uow.active_batches(customer_id).await?;
    let snapshot = WalletSnapshot::from_batches(&uow.key().tenant_id, customer_id, &batches, now)?;
    uow.upsert_wallet_snapshot(&snapshot).await?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryLedgerStore, ManualClock};
    use crate::domain::customer::CustomerKey;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ledger() -> PointsLedger {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        PointsLedger::with_clock(Arc::new(InMemoryLedgerStore::default()), Arc::new(clock))
    }

    #[tokio::test]
    async fn test_unknown_customer_has_zero_balance() {
        let ledger = ledger();
        let balance = ledger
            .get_wallet_balance("store-1", &CustomerRef::External(404))
            .await
            .unwrap();
        assert_eq!(balance, 0);
        assert!(matches!(
            ledger.customer_batches("store-1", &CustomerRef::External(404)).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_customer_registers_then_refreshes() {
        let ledger = ledger();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let key = CustomerKey::new("store-1", 42);
        let mut profile = CustomerProfile {
            external_user_id: 42,
            email: "a@test.com".to_string(),
            ..Default::default()
        };

        let mut uow = ledger.store().begin(&key).await.unwrap();
        let created = ensure_customer(uow.as_mut(), &profile, now).await.unwrap();
        uow.commit().await.unwrap();

        profile.phone = Some("+34600000000".to_string());
        let later = now + chrono::Duration::hours(1);
        let mut uow = ledger.store().begin(&key).await.unwrap();
        let refreshed = ensure_customer(uow.as_mut(), &profile, later).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(refreshed.id, created.id);
        assert_eq!(refreshed.phone.as_deref(), Some("+34600000000"));
        assert_eq!(refreshed.updated_at, later);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let ledger = ledger();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), CoreError> = ledger
            .with_retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::Conflict("serialization failure".into()))
            })
            .await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
        assert_eq!(counter.load(Ordering::SeqCst), MAX_UNIT_OF_WORK_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_other_errors() {
        let ledger = ledger();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), CoreError> = ledger
            .with_retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::Validation("bad".into()))
            })
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
