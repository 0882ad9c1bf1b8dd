use crate::{
    CoreError, LedgerStore, LedgerUnitOfWork,
    domain::{
        batch::{PointsBatch, sort_fifo},
        customer::{Customer, CustomerKey, CustomerRef},
        tenant::{Tenant, TenantRef},
        transaction::PointsTransaction,
        wallet::WalletSnapshot,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    tenants: DashMap<String, Tenant>,
    customers: DashMap<CustomerKey, Customer>,
    batches: DashMap<Uuid, PointsBatch>,
    // (tenant_id, customer_id) -> entries in write order
    transactions: DashMap<(String, Uuid), Vec<PointsTransaction>>,
    // (tenant_id, external_event_id) -> transaction id
    event_ids: DashMap<(String, String), Uuid>,
    snapshots: DashMap<(String, Uuid), WalletSnapshot>,
    locks: DashMap<CustomerKey, Arc<Mutex<()>>>,
    // Held for writing while a commit publishes, so readers never see half of one
    publish: RwLock<()>,
}

/// In-memory implementation of the LedgerStore port for tests and single-process use.
///
/// A unit of work holds the customer's mutex for its whole lifetime and stages
/// its writes; `commit` claims event ids first and only then publishes the rest,
/// all under the table-wide publish guard.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    tables: Arc<Tables>,
}

impl InMemoryLedgerStore {
    fn customer_by_id(&self, tenant_id: &str, customer_id: Uuid) -> Option<Customer> {
        self.tables
            .customers
            .iter()
            .find(|entry| entry.tenant_id == tenant_id && entry.id == customer_id)
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn upsert_tenant(
        &self,
        tenant: &TenantRef,
        now: DateTime<Utc>,
    ) -> Result<Tenant, CoreError> {
        let resolved = match self.tables.tenants.entry(tenant.id.clone()) {
            Entry::Occupied(mut entry) => {
                let merged = tenant.resolve(Some(entry.get()), now);
                entry.insert(merged.clone());
                merged
            }
            Entry::Vacant(entry) => {
                let created = tenant.resolve(None, now);
                entry.insert(created.clone());
                created
            }
        };
        Ok(resolved)
    }

    async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, CoreError> {
        Ok(self
            .tables
            .tenants
            .get(tenant_id)
            .map(|entry| entry.value().clone()))
    }

    async fn event_recorded(
        &self,
        tenant_id: &str,
        external_event_id: &str,
    ) -> Result<bool, CoreError> {
        let _published = self.tables.publish.read().await;
        Ok(self
            .tables
            .event_ids
            .contains_key(&(tenant_id.to_string(), external_event_id.to_string())))
    }

    async fn find_customer(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<Option<Customer>, CoreError> {
        let _published = self.tables.publish.read().await;
        Ok(match customer {
            CustomerRef::External(external_user_id) => self
                .tables
                .customers
                .get(&CustomerKey::new(tenant_id, *external_user_id))
                .map(|entry| entry.value().clone()),
            CustomerRef::Internal(id) => self.customer_by_id(tenant_id, *id),
        })
    }

    async fn wallet_snapshot(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Option<WalletSnapshot>, CoreError> {
        let _published = self.tables.publish.read().await;
        Ok(self
            .tables
            .snapshots
            .get(&(tenant_id.to_string(), customer_id))
            .map(|entry| entry.value().clone()))
    }

    async fn customer_batches(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Vec<PointsBatch>, CoreError> {
        let _published = self.tables.publish.read().await;
        let mut batches: Vec<PointsBatch> = self
            .tables
            .batches
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id && entry.customer_id == customer_id)
            .map(|entry| entry.value().clone())
            .collect();
        sort_fifo(&mut batches);
        Ok(batches)
    }

    async fn customer_transactions(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Vec<PointsTransaction>, CoreError> {
        let _published = self.tables.publish.read().await;
        Ok(self
            .tables
            .transactions
            .get(&(tenant_id.to_string(), customer_id))
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn customers_with_due_batches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Customer>, CoreError> {
        let _published = self.tables.publish.read().await;
        let owners: BTreeSet<(String, Uuid)> = self
            .tables
            .batches
            .iter()
            .filter(|entry| entry.is_due(now))
            .map(|entry| (entry.tenant_id.clone(), entry.customer_id))
            .collect();

        let mut customers: Vec<Customer> = owners
            .into_iter()
            .filter_map(|(tenant_id, customer_id)| self.customer_by_id(&tenant_id, customer_id))
            .collect();
        customers.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(customers)
    }

    async fn begin(&self, key: &CustomerKey) -> Result<Box<dyn LedgerUnitOfWork>, CoreError> {
        let lock = self
            .tables
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        debug!("Acquired in-memory lock for customer {}", key.lock_name());

        Ok(Box::new(InMemoryUnitOfWork {
            tables: Arc::clone(&self.tables),
            key: key.clone(),
            _guard: guard,
            customer: None,
            batches: HashMap::new(),
            transactions: Vec::new(),
            snapshot: None,
        }))
    }
}

struct InMemoryUnitOfWork {
    tables: Arc<Tables>,
    key: CustomerKey,
    _guard: OwnedMutexGuard<()>,
    // Staged writes, published on commit
    customer: Option<Customer>,
    batches: HashMap<Uuid, PointsBatch>,
    transactions: Vec<PointsTransaction>,
    snapshot: Option<WalletSnapshot>,
}

impl InMemoryUnitOfWork {
    fn ensure_tenant(&self, tenant_id: &str) -> Result<(), CoreError> {
        if tenant_id != self.key.tenant_id {
            return Err(CoreError::Internal(format!(
                "Unit of work for tenant {} cannot write rows of tenant {}",
                self.key.tenant_id, tenant_id
            )));
        }
        Ok(())
    }

    fn staged_event(&self, external_event_id: &str) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.external_event_id.as_deref() == Some(external_event_id))
    }
}

#[async_trait]
impl LedgerUnitOfWork for InMemoryUnitOfWork {
    fn key(&self) -> &CustomerKey {
        &self.key
    }

    async fn event_recorded(&mut self, external_event_id: &str) -> Result<bool, CoreError> {
        let slot = (self.key.tenant_id.clone(), external_event_id.to_string());
        Ok(self.tables.event_ids.contains_key(&slot) || self.staged_event(external_event_id))
    }

    async fn find_customer(&mut self) -> Result<Option<Customer>, CoreError> {
        if let Some(staged) = &self.customer {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .tables
            .customers
            .get(&self.key)
            .map(|entry| entry.value().clone()))
    }

    async fn insert_customer(&mut self, customer: &Customer) -> Result<(), CoreError> {
        self.ensure_tenant(&customer.tenant_id)?;
        if self.tables.customers.contains_key(&customer.key()) {
            return Err(CoreError::Conflict(format!(
                "Customer {} already exists",
                customer.key().lock_name()
            )));
        }
        self.customer = Some(customer.clone());
        Ok(())
    }

    async fn update_customer(&mut self, customer: &Customer) -> Result<(), CoreError> {
        self.ensure_tenant(&customer.tenant_id)?;
        self.customer = Some(customer.clone());
        Ok(())
    }

    async fn active_batches(&mut self, customer_id: Uuid) -> Result<Vec<PointsBatch>, CoreError> {
        let mut merged: HashMap<Uuid, PointsBatch> = self
            .tables
            .batches
            .iter()
            .filter(|entry| {
                entry.tenant_id == self.key.tenant_id && entry.customer_id == customer_id
            })
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, batch) in &self.batches {
            if batch.customer_id == customer_id {
                merged.insert(*id, batch.clone());
            }
        }

        let mut active: Vec<PointsBatch> = merged
            .into_values()
            .filter(PointsBatch::is_available)
            .collect();
        sort_fifo(&mut active);
        Ok(active)
    }

    async fn insert_batch(&mut self, batch: &PointsBatch) -> Result<(), CoreError> {
        self.ensure_tenant(&batch.tenant_id)?;
        self.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn update_batch(&mut self, batch: &PointsBatch) -> Result<(), CoreError> {
        self.ensure_tenant(&batch.tenant_id)?;
        if !self.batches.contains_key(&batch.id) && !self.tables.batches.contains_key(&batch.id)
        {
            return Err(CoreError::NotFound(format!("Points batch {}", batch.id)));
        }
        self.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn append_transaction(
        &mut self,
        transaction: &PointsTransaction,
    ) -> Result<(), CoreError> {
        self.ensure_tenant(&transaction.tenant_id)?;
        if let Some(event_id) = &transaction.external_event_id {
            if self.event_recorded(event_id).await? {
                return Err(CoreError::DuplicateEvent(event_id.clone()));
            }
        }
        self.transactions.push(transaction.clone());
        Ok(())
    }

    async fn wallet_snapshot(
        &mut self,
        customer_id: Uuid,
    ) -> Result<Option<WalletSnapshot>, CoreError> {
        if let Some(staged) = self.snapshot.as_ref().filter(|s| s.customer_id == customer_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .tables
            .snapshots
            .get(&(self.key.tenant_id.clone(), customer_id))
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_wallet_snapshot(&mut self, snapshot: &WalletSnapshot) -> Result<(), CoreError> {
        self.ensure_tenant(&snapshot.tenant_id)?;
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        let this = *self;
        let tables = &this.tables;
        let _publishing = tables.publish.write().await;

        // Claim event ids before anything becomes visible
        let mut claimed: Vec<(String, String)> = Vec::new();
        for tx in &this.transactions {
            let Some(event_id) = &tx.external_event_id else {
                continue;
            };
            let slot = (tx.tenant_id.clone(), event_id.clone());
            let inserted = match tables.event_ids.entry(slot.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    entry.insert(tx.id);
                    true
                }
            };
            if !inserted {
                for slot in claimed {
                    tables.event_ids.remove(&slot);
                }
                return Err(CoreError::DuplicateEvent(event_id.clone()));
            }
            claimed.push(slot);
        }

        if let Some(customer) = this.customer {
            tables.customers.insert(customer.key(), customer);
        }
        for (id, batch) in this.batches {
            tables.batches.insert(id, batch);
        }
        for tx in this.transactions {
            tables
                .transactions
                .entry((tx.tenant_id.clone(), tx.customer_id))
                .or_default()
                .push(tx);
        }
        if let Some(snapshot) = this.snapshot {
            tables
                .snapshots
                .insert((snapshot.tenant_id.clone(), snapshot.customer_id), snapshot);
        }
        Ok(())
    }
}
