use super::{PointsLedger, ensure_customer, recalculate_wallet_snapshot};
use crate::{
    CoreError, LedgerUnitOfWork,
    domain::{
        batch::{PointsBatch, consume_fifo},
        customer::{Customer, CustomerKey},
        event::{EventError, PointsEffect, PointsEvent, RawEvent, parse_events_payload},
        tenant::TenantRef,
        transaction::{PointsTransaction, TransactionType},
        wallet::{WalletError, active_balance},
    },
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Upper bound on per-event error entries kept in a report.
pub const MAX_REPORTED_ERRORS: usize = 50;

/// Source recorded on batches created by a balance sync.
pub const BALANCE_SYNC_SOURCE: &str = "balance_sync";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub imported: usize,
    pub skipped_existing: usize,
    /// Zero-delta events, neither imported nor skipped.
    pub ignored: usize,
    pub failed: usize,
    pub normalized_timestamps: usize,
    /// Spends that asked for more points than the customer had.
    pub clamped_spends: usize,
    pub errors: Vec<IngestItemError>,
}

impl IngestReport {
    fn record_error(&mut self, index: usize, external_event_id: Option<String>, message: String) {
        self.failed += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(IngestItemError {
                index,
                external_event_id,
                message,
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestItemError {
    /// Position of the event in the submitted batch.
    pub index: usize,
    pub external_event_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Imported { clamped: bool },
    // Recorded by a concurrent delivery after the pre-check
    AlreadyRecorded,
}

impl PointsLedger {
    /// Apply a batch of events for one tenant, in input order.
    ///
    /// Each event commits or rolls back on its own; only a tenant that cannot
    /// be validated or stored fails the whole call.
    pub async fn ingest_points_events(
        &self,
        tenant: &TenantRef,
        events: Vec<RawEvent>,
    ) -> Result<IngestReport, CoreError> {
        self.ingest_items(tenant, events.into_iter().map(Ok).collect())
            .await
    }

    /// Decode a JSON array of events and ingest it. A payload that is not an
    /// array is rejected before anything is written.
    pub async fn ingest_points_payload(
        &self,
        tenant: &TenantRef,
        payload: &[u8],
    ) -> Result<IngestReport, CoreError> {
        let items = parse_events_payload(payload)?;
        self.ingest_items(tenant, items).await
    }

    async fn ingest_items(
        &self,
        tenant: &TenantRef,
        items: Vec<Result<RawEvent, EventError>>,
    ) -> Result<IngestReport, CoreError> {
        tenant.validate()?;
        let tenant = self.store.upsert_tenant(tenant, self.clock.now()).await?;

        let mut report = IngestReport::default();
        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            self.ingest_item(&tenant.id, index, item, &mut report).await;
        }

        info!(
            "Ingested {} events for tenant {}: imported={}, skipped_existing={}, ignored={}, failed={}",
            total, tenant.id, report.imported, report.skipped_existing, report.ignored, report.failed
        );
        Ok(report)
    }

    async fn ingest_item(
        &self,
        tenant_id: &str,
        index: usize,
        item: Result<RawEvent, EventError>,
        report: &mut IngestReport,
    ) {
        let raw = match item {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Rejected event #{} for tenant {}: {}", index, tenant_id, e);
                report.record_error(index, None, e.to_string());
                return;
            }
        };

        let event_id_hint = raw.external_event_id.clone();
        let event = match raw.validate(self.clock.now()) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Ignoring zero-delta event #{} for tenant {}", index, tenant_id);
                report.ignored += 1;
                return;
            }
            Err(e) => {
                warn!("Rejected event #{} for tenant {}: {}", index, tenant_id, e);
                report.record_error(index, event_id_hint, e.to_string());
                return;
            }
        };

        if event.timestamp_normalized {
            warn!(
                "Event #{} for tenant {} has no usable createdAt, using {}",
                index, tenant_id, event.created_at
            );
            report.normalized_timestamps += 1;
        }

        if let Some(event_id) = &event.external_event_id {
            match self.store.event_recorded(tenant_id, event_id).await {
                Ok(true) => {
                    debug!("Event {} already recorded for tenant {}", event_id, tenant_id);
                    report.skipped_existing += 1;
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Idempotency check failed for event {}: {}", event_id, e);
                    report.record_error(index, Some(event_id.clone()), e.to_string());
                    return;
                }
            }
        }

        let event = &event;
        let outcome = self
            .with_retry("Points event", move || self.apply_event(tenant_id, event))
            .await;
        match outcome {
            Ok(EventOutcome::Imported { clamped }) => {
                report.imported += 1;
                if clamped {
                    report.clamped_spends += 1;
                }
            }
            Ok(EventOutcome::AlreadyRecorded) | Err(CoreError::DuplicateEvent(_)) => {
                debug!(
                    "Event {:?} was recorded concurrently for tenant {}",
                    event.external_event_id, tenant_id
                );
                report.skipped_existing += 1;
            }
            Err(e) => {
                error!(
                    "Failed to apply event #{} ({:?}) for tenant {}: {}",
                    index, event.external_event_id, tenant_id, e
                );
                report.record_error(index, event.external_event_id.clone(), e.to_string());
            }
        }
    }

    // One unit of work per event, locked to the event's customer.
    async fn apply_event(
        &self,
        tenant_id: &str,
        event: &PointsEvent,
    ) -> Result<EventOutcome, CoreError> {
        let now = self.clock.now();
        let key = CustomerKey::new(tenant_id, event.profile.external_user_id);
        let mut uow = self.store.begin(&key).await?;

        if let Some(event_id) = &event.external_event_id {
            if uow.event_recorded(event_id).await? {
                return Ok(EventOutcome::AlreadyRecorded);
            }
        }

        let customer = ensure_customer(uow.as_mut(), &event.profile, now).await?;
        let clamped = match event.effect {
            PointsEffect::Purchase { points } => {
                credit(uow.as_mut(), &customer, event, points, &event.source).await?;
                false
            }
            PointsEffect::Spend { points } => {
                debit(uow.as_mut(), &customer, event, points, TransactionType::SpendDownload).await?
            }
            PointsEffect::Charge { points } => {
                debit(uow.as_mut(), &customer, event, points, TransactionType::Charge).await?
            }
            PointsEffect::BalanceSync { balance } => {
                let current = active_balance(&uow.active_batches(customer.id).await?)
                    .ok_or(WalletError::BalanceOverflow(customer.id))?;
                let difference = balance - current;
                if difference > 0 {
                    credit(uow.as_mut(), &customer, event, difference, BALANCE_SYNC_SOURCE).await?;
                } else if difference < 0 {
                    debit(uow.as_mut(), &customer, event, -difference, TransactionType::Charge)
                        .await?;
                } else {
                    debug!(
                        "Balance sync for {} matches current balance {}",
                        key.lock_name(),
                        current
                    );
                }
                false
            }
        };

        let snapshot = recalculate_wallet_snapshot(uow.as_mut(), customer.id, now).await?;
        uow.commit().await?;

        debug!(
            "Applied {:?} for {}; balance now {}",
            event.effect,
            key.lock_name(),
            snapshot.points_balance
        );
        Ok(EventOutcome::Imported { clamped })
    }
}

/// New batch plus its linked purchase entry.
async fn credit(
    uow: &mut dyn LedgerUnitOfWork,
    customer: &Customer,
    event: &PointsEvent,
    points: i64,
    source: &str,
) -> Result<(), CoreError> {
    let batch = PointsBatch::purchase(
        &customer.tenant_id,
        customer.id,
        points,
        source,
        event.order_id.clone(),
        event.created_at,
    )?;
    uow.insert_batch(&batch).await?;

    let transaction = PointsTransaction::new(
        &customer.tenant_id,
        customer.id,
        TransactionType::Purchase,
        points,
        event.created_at,
    )
    .with_batch(Some(batch.id))
    .with_reference(source, event.order_id.clone())
    .with_external_event_id(event.external_event_id.clone());
    uow.append_transaction(&transaction).await
}

/// FIFO consumption plus one debit entry for the points actually taken.
/// Returns whether the request had to be clamped.
async fn debit(
    uow: &mut dyn LedgerUnitOfWork,
    customer: &Customer,
    event: &PointsEvent,
    points: i64,
    transaction_type: TransactionType,
) -> Result<bool, CoreError> {
    let mut batches = uow.active_batches(customer.id).await?;
    let consumption = consume_fifo(&mut batches, points);
    for batch in batches.iter().filter(|b| consumption.touched.contains(&b.id)) {
        uow.update_batch(batch).await?;
    }

    if consumption.is_clamped() {
        warn!(
            "Customer {} requested {} points but only {} were available; applying -{}",
            customer.key().lock_name(),
            consumption.requested,
            consumption.consumed,
            consumption.consumed
        );
    }

    let batch_id = match transaction_type {
        TransactionType::Charge => None,
        _ => consumption.first_batch(),
    };
    let transaction = PointsTransaction::new(
        &customer.tenant_id,
        customer.id,
        transaction_type,
        -consumption.consumed,
        event.created_at,
    )
    .with_batch(batch_id)
    .with_reference(&event.source, event.order_id.clone())
    .with_external_event_id(event.external_event_id.clone());
    uow.append_transaction(&transaction).await?;

    Ok(consumption.is_clamped())
}
