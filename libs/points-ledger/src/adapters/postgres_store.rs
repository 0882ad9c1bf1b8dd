use crate::{
    CoreError, LedgerStore, LedgerUnitOfWork,
    domain::{
        batch::{BatchStatus, PointsBatch},
        customer::{Customer, CustomerKey, CustomerRef},
        tenant::{Tenant, TenantRef},
        transaction::{PointsTransaction, TransactionType},
        wallet::WalletSnapshot,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

const CUSTOMER_COLUMNS: &str =
    "id, tenant_id, external_user_id, email, phone, whatsapp, locale, timezone, created_at, updated_at";
const BATCH_COLUMNS: &str = "id, tenant_id, customer_id, source, external_order_id, points_total, points_remaining, purchased_at, expires_at, status";
const TRANSACTION_COLUMNS: &str = "id, tenant_id, customer_id, batch_id, delta, transaction_type, reference_type, reference_id, external_event_id, created_at";

const EVENT_ID_INDEX: &str = "idx_points_transactions_event";

// Row structures matching the DB schema
#[derive(sqlx::FromRow, Debug)]
struct TenantRow {
    id: String,
    name: String,
    timezone: String,
    created_at: DateTime<Utc>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id,
            name: row.name,
            timezone: row.timezone,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct CustomerRow {
    id: Uuid,
    tenant_id: String,
    external_user_id: i64,
    email: String,
    phone: Option<String>,
    whatsapp: Option<String>,
    locale: Option<String>,
    timezone: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            id: row.id,
            tenant_id: row.tenant_id,
            external_user_id: row.external_user_id,
            email: row.email,
            phone: row.phone,
            whatsapp: row.whatsapp,
            locale: row.locale,
            timezone: row.timezone,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug)]
struct BatchRow {
    id: Uuid,
    tenant_id: String,
    customer_id: Uuid,
    source: String,
    external_order_id: Option<String>,
    points_total: i64,
    points_remaining: i64,
    purchased_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    status: String,
}

impl TryFrom<BatchRow> for PointsBatch {
    type Error = CoreError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        let status: BatchStatus = row
            .status
            .parse()
            .map_err(|e: crate::domain::batch::BatchError| {
                CoreError::Deserialization(e.to_string())
            })?;
        Ok(PointsBatch {
            id: row.id,
            tenant_id: row.tenant_id,
            customer_id: row.customer_id,
            source: row.source,
            external_order_id: row.external_order_id,
            points_total: row.points_total,
            points_remaining: row.points_remaining,
            purchased_at: row.purchased_at,
            expires_at: row.expires_at,
            status,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct TransactionRow {
    id: Uuid,
    tenant_id: String,
    customer_id: Uuid,
    batch_id: Option<Uuid>,
    delta: i64,
    transaction_type: String,
    reference_type: Option<String>,
    reference_id: Option<String>,
    external_event_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for PointsTransaction {
    type Error = CoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let transaction_type: TransactionType = row
            .transaction_type
            .parse()
            .map_err(CoreError::Deserialization)?;
        Ok(PointsTransaction {
            id: row.id,
            tenant_id: row.tenant_id,
            customer_id: row.customer_id,
            batch_id: row.batch_id,
            delta: row.delta,
            transaction_type,
            reference_type: row.reference_type,
            reference_id: row.reference_id,
            external_event_id: row.external_event_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct SnapshotRow {
    tenant_id: String,
    customer_id: Uuid,
    points_balance: i64,
    updated_at: DateTime<Utc>,
}

impl From<SnapshotRow> for WalletSnapshot {
    fn from(row: SnapshotRow) -> Self {
        WalletSnapshot {
            tenant_id: row.tenant_id,
            customer_id: row.customer_id,
            points_balance: row.points_balance,
            updated_at: row.updated_at,
        }
    }
}

// Serialization failures and deadlocks are retryable; a clash on the event id
// index is a duplicate delivery.
fn map_db_error(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &err {
        if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
            return CoreError::Conflict(db.message().to_string());
        }
        if db.is_unique_violation() {
            if db.constraint() == Some(EVENT_ID_INDEX) {
                return CoreError::DuplicateEvent(db.message().to_string());
            }
            return CoreError::Conflict(db.message().to_string());
        }
    }
    CoreError::Infrastructure(Box::new(err))
}

fn batches_from_rows(rows: Vec<BatchRow>) -> Result<Vec<PointsBatch>, CoreError> {
    rows.into_iter().map(PointsBatch::try_from).collect()
}

/// PostgreSQL implementation of the LedgerStore port using sqlx.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Infrastructure(Box::new(e)))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn upsert_tenant(
        &self,
        tenant: &TenantRef,
        now: DateTime<Utc>,
    ) -> Result<Tenant, CoreError> {
        let fresh = tenant.resolve(None, now);
        let row: TenantRow = sqlx::query_as(
            "INSERT INTO tenants (id, name, timezone, created_at) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                 name = COALESCE($5, tenants.name),
                 timezone = COALESCE($6, tenants.timezone)
             RETURNING id, name, timezone, created_at",
        )
        .bind(&fresh.id)
        .bind(&fresh.name)
        .bind(&fresh.timezone)
        .bind(fresh.created_at)
        .bind(tenant.name.as_deref())
        .bind(tenant.timezone.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(row.into())
    }

    async fn find_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, CoreError> {
        let row: Option<TenantRow> =
            sqlx::query_as("SELECT id, name, timezone, created_at FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_error)?;
        Ok(row.map(Tenant::from))
    }

    async fn event_recorded(
        &self,
        tenant_id: &str,
        external_event_id: &str,
    ) -> Result<bool, CoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM points_transactions WHERE tenant_id = $1 AND external_event_id = $2)",
        )
        .bind(tenant_id)
        .bind(external_event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)
    }

    async fn find_customer(
        &self,
        tenant_id: &str,
        customer: &CustomerRef,
    ) -> Result<Option<Customer>, CoreError> {
        let row: Option<CustomerRow> = match customer {
            CustomerRef::External(external_user_id) => {
                let query = format!(
                    "SELECT {} FROM customers WHERE tenant_id = $1 AND external_user_id = $2",
                    CUSTOMER_COLUMNS
                );
                sqlx::query_as(&query)
                    .bind(tenant_id)
                    .bind(*external_user_id)
                    .fetch_optional(&self.pool)
                    .await
            }
            CustomerRef::Internal(id) => {
                let query = format!(
                    "SELECT {} FROM customers WHERE tenant_id = $1 AND id = $2",
                    CUSTOMER_COLUMNS
                );
                sqlx::query_as(&query)
                    .bind(tenant_id)
                    .bind(*id)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(map_db_error)?;
        Ok(row.map(Customer::from))
    }

    async fn wallet_snapshot(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Option<WalletSnapshot>, CoreError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT tenant_id, customer_id, points_balance, updated_at
             FROM wallet_snapshots WHERE tenant_id = $1 AND customer_id = $2",
        )
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(row.map(WalletSnapshot::from))
    }

    async fn customer_batches(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Vec<PointsBatch>, CoreError> {
        let query = format!(
            "SELECT {} FROM points_batches WHERE tenant_id = $1 AND customer_id = $2 ORDER BY purchased_at ASC, id ASC",
            BATCH_COLUMNS
        );
        let rows: Vec<BatchRow> = sqlx::query_as(&query)
            .bind(tenant_id)
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        batches_from_rows(rows)
    }

    async fn customer_transactions(
        &self,
        tenant_id: &str,
        customer_id: Uuid,
    ) -> Result<Vec<PointsTransaction>, CoreError> {
        let query = format!(
            "SELECT {} FROM points_transactions WHERE tenant_id = $1 AND customer_id = $2 ORDER BY seq ASC",
            TRANSACTION_COLUMNS
        );
        let rows: Vec<TransactionRow> = sqlx::query_as(&query)
            .bind(tenant_id)
            .bind(customer_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        rows.into_iter().map(PointsTransaction::try_from).collect()
    }

    async fn customers_with_due_batches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Customer>, CoreError> {
        let query = format!(
            "SELECT {} FROM customers c WHERE EXISTS (
                 SELECT 1 FROM points_batches b
                 WHERE b.tenant_id = c.tenant_id AND b.customer_id = c.id
                   AND b.status = 'active' AND b.points_remaining > 0 AND b.expires_at <= $1
             )
             ORDER BY c.tenant_id ASC, c.external_user_id ASC",
            CUSTOMER_COLUMNS
        );
        let rows: Vec<CustomerRow> = sqlx::query_as(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(rows.into_iter().map(Customer::from).collect())
    }

    async fn begin(&self, key: &CustomerKey) -> Result<Box<dyn LedgerUnitOfWork>, CoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        // Released automatically when the transaction ends
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key.lock_name())
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        debug!("Acquired advisory lock for customer {}", key.lock_name());

        Ok(Box::new(PostgresUnitOfWork {
            tx,
            key: key.clone(),
        }))
    }
}

struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
    key: CustomerKey,
}

#[async_trait]
impl LedgerUnitOfWork for PostgresUnitOfWork {
    fn key(&self) -> &CustomerKey {
        &self.key
    }

    async fn event_recorded(&mut self, external_event_id: &str) -> Result<bool, CoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM points_transactions WHERE tenant_id = $1 AND external_event_id = $2)",
        )
        .bind(&self.key.tenant_id)
        .bind(external_event_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_db_error)
    }

    async fn find_customer(&mut self) -> Result<Option<Customer>, CoreError> {
        let query = format!(
            "SELECT {} FROM customers WHERE tenant_id = $1 AND external_user_id = $2",
            CUSTOMER_COLUMNS
        );
        let row: Option<CustomerRow> = sqlx::query_as(&query)
            .bind(&self.key.tenant_id)
            .bind(self.key.external_user_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(row.map(Customer::from))
    }

    async fn insert_customer(&mut self, customer: &Customer) -> Result<(), CoreError> {
        let query = format!(
            "INSERT INTO customers ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            CUSTOMER_COLUMNS
        );
        sqlx::query(&query)
            .bind(customer.id)
            .bind(&customer.tenant_id)
            .bind(customer.external_user_id)
            .bind(&customer.email)
            .bind(customer.phone.as_deref())
            .bind(customer.whatsapp.as_deref())
            .bind(customer.locale.as_deref())
            .bind(customer.timezone.as_deref())
            .bind(customer.created_at)
            .bind(customer.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn update_customer(&mut self, customer: &Customer) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE customers SET email = $3, phone = $4, whatsapp = $5, locale = $6, timezone = $7, updated_at = $8
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(&customer.tenant_id)
        .bind(customer.id)
        .bind(&customer.email)
        .bind(customer.phone.as_deref())
        .bind(customer.whatsapp.as_deref())
        .bind(customer.locale.as_deref())
        .bind(customer.timezone.as_deref())
        .bind(customer.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Customer {}", customer.id)));
        }
        Ok(())
    }

    async fn active_batches(&mut self, customer_id: Uuid) -> Result<Vec<PointsBatch>, CoreError> {
        let query = format!(
            "SELECT {} FROM points_batches
             WHERE tenant_id = $1 AND customer_id = $2 AND status = 'active' AND points_remaining > 0
             ORDER BY purchased_at ASC, id ASC
             FOR UPDATE",
            BATCH_COLUMNS
        );
        let rows: Vec<BatchRow> = sqlx::query_as(&query)
            .bind(&self.key.tenant_id)
            .bind(customer_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        batches_from_rows(rows)
    }

    async fn insert_batch(&mut self, batch: &PointsBatch) -> Result<(), CoreError> {
        let query = format!(
            "INSERT INTO points_batches ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            BATCH_COLUMNS
        );
        sqlx::query(&query)
            .bind(batch.id)
            .bind(&batch.tenant_id)
            .bind(batch.customer_id)
            .bind(&batch.source)
            .bind(batch.external_order_id.as_deref())
            .bind(batch.points_total)
            .bind(batch.points_remaining)
            .bind(batch.purchased_at)
            .bind(batch.expires_at)
            .bind(batch.status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    async fn update_batch(&mut self, batch: &PointsBatch) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE points_batches SET points_remaining = $3, status = $4 WHERE tenant_id = $1 AND id = $2",
        )
        .bind(&batch.tenant_id)
        .bind(batch.id)
        .bind(batch.points_remaining)
        .bind(batch.status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Points batch {}", batch.id)));
        }
        Ok(())
    }

    async fn append_transaction(
        &mut self,
        transaction: &PointsTransaction,
    ) -> Result<(), CoreError> {
        let query = format!(
            "INSERT INTO points_transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            TRANSACTION_COLUMNS
        );
        sqlx::query(&query)
            .bind(transaction.id)
            .bind(&transaction.tenant_id)
            .bind(transaction.customer_id)
            .bind(transaction.batch_id)
            .bind(transaction.delta)
            .bind(transaction.transaction_type.as_str())
            .bind(transaction.reference_type.as_deref())
            .bind(transaction.reference_id.as_deref())
            .bind(transaction.external_event_id.as_deref())
            .bind(transaction.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| match (map_db_error(e), &transaction.external_event_id) {
                (CoreError::DuplicateEvent(_), Some(event_id)) => {
                    CoreError::DuplicateEvent(event_id.clone())
                }
                (other, _) => other,
            })?;
        Ok(())
    }

    async fn wallet_snapshot(
        &mut self,
        customer_id: Uuid,
    ) -> Result<Option<WalletSnapshot>, CoreError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT tenant_id, customer_id, points_balance, updated_at
             FROM wallet_snapshots WHERE tenant_id = $1 AND customer_id = $2",
        )
        .bind(&self.key.tenant_id)
        .bind(customer_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(row.map(WalletSnapshot::from))
    }

    async fn upsert_wallet_snapshot(&mut self, snapshot: &WalletSnapshot) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO wallet_snapshots (tenant_id, customer_id, points_balance, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (tenant_id, customer_id) DO UPDATE SET
                 points_balance = EXCLUDED.points_balance,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&snapshot.tenant_id)
        .bind(snapshot.customer_id)
        .bind(snapshot.points_balance)
        .bind(snapshot.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.commit().await.map_err(map_db_error)
    }
}
