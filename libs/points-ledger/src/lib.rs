use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::error::Error as StdError;
use uuid::Uuid;

// Declare modules
pub mod adapters;
pub mod domain;
pub mod ledger;

use domain::{
    batch::PointsBatch,
    customer::{Customer, CustomerKey, CustomerRef},
    tenant::{Tenant, TenantRef},
    transaction::PointsTransaction,
    wallet::WalletSnapshot,
};

pub use ledger::{
    PointsLedger, expiry::ExpiryReport, ingest::IngestItemError, ingest::IngestReport,
};

// Common error type for the ledger library
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Event already recorded: {0}")]
    DuplicateEvent(String),
    #[error("Storage conflict: {0}")]
    Conflict(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Infrastructure error: {0}")]
    Infrastructure(#[from] Box<dyn StdError + Send + Sync>),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Transient storage failures that are safe to retry at the unit-of-work boundary.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Conflict(_))
    }
}

// Allows '?' to convert domain errors into CoreError in the ledger and adapters
impl From<domain::event::EventError> for CoreError {
    fn from(err: domain::event::EventError) -> Self {
        CoreError::Validation(err.to_string())
    }
}

impl From<domain::tenant::TenantError> for CoreError {
    fn from(err: domain::tenant::TenantError) -> Self {
        match err {
            domain::tenant::TenantError::InvalidInput(msg) => CoreError::Validation(msg),
        }
    }
}

impl From<domain::batch::BatchError> for CoreError {
    fn from(err: domain::batch::BatchError) -> Self {
        CoreError::Validation(err.to_string())
    }
}

impl From<domain::wallet::WalletError> for CoreError {
    fn from(err: domain::wallet::WalletError) -> Self {
        CoreError::Validation(err.to_string())
    }
}

/// Source of "now" for timestamp normalization and the expiry sweep.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

// Port for the ledger's durable state.
//
// Reads on the store itself are unlocked snapshots meant for display and for
// planning work; every mutation goes through a unit of work from `begin`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the tenant if missing; explicit name/timezone values overwrite stored ones.
    async fn upsert_tenant(&self, tenant: &TenantRef, now: DateTime<Utc>)
    -> Result<Tenant, CoreError>;

    async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, CoreError>;

    /// Whether a transaction with this external event id exists for the tenant.
    async fn event_recorded(
        &self,
        tenant_id: &str,
        external_event_id: &str,
    ) -> Result<bool, CoreError>;

    async fn find_customer(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<Option<Customer>, CoreError>;

    async fn wallet_snapshot(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Option<WalletSnapshot>, CoreError>;

    /// All batches of a customer, oldest purchase first.
    async fn customer_batches(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Vec<PointsBatch>, CoreError>;

    /// The customer's audit trail in the order it was written.
    async fn customer_transactions(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Vec<PointsTransaction>, CoreError>;

    /// Customers owning at least one active batch with points left and `expires_at <= now`.
    async fn customers_with_due_batches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Customer>, CoreError>;

    /// Open an atomic unit of work holding the lock for one customer.
    async fn begin(&self, key: &CustomerKey) -> Result<Box<dyn LedgerUnitOfWork>, CoreError>;
}

// Atomic, customer-scoped unit of work.
//
// Dropping a unit of work without calling `commit` discards every staged write.
#[async_trait]
pub trait LedgerUnitOfWork: Send {
    fn key(&self) -> &CustomerKey;

    async fn event_recorded(&mut self, external_event_id: &str) -> Result<bool, CoreError>;

    async fn find_customer(&mut self) -> Result<Option<Customer>, CoreError>;

    async fn insert_customer(&mut self, customer: &Customer) -> Result<(), CoreError>;

    async fn update_customer(&mut self, customer: &Customer) -> Result<(), CoreError>;

    /// Active batches with points remaining, oldest purchase first.
    async fn active_batches(&mut self, customer_id: Uuid) -> Result<Vec<PointsBatch>, CoreError>;

    async fn insert_batch(&mut self, batch: &PointsBatch) -> Result<(), CoreError>;

    async fn update_batch(&mut self, batch: &PointsBatch) -> Result<(), CoreError>;

    /// Append to the log. A clash on `(tenant_id, external_event_id)` yields `DuplicateEvent`.
    async fn append_transaction(&mut self, transaction: &PointsTransaction)
    -> Result<(), CoreError>;

    /// The snapshot as this unit of work sees it, staged writes included.
    async fn wallet_snapshot(&mut self, customer_id: Uuid)
    -> Result<Option<WalletSnapshot>, CoreError>;

    async fn upsert_wallet_snapshot(&mut self, snapshot: &WalletSnapshot)
    -> Result<(), CoreError>;

    async fn commit(self: Box<Self>) -> Result<(), CoreError>;
}
