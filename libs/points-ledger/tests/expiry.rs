use chrono::{DateTime, TimeZone, Utc};
use points_ledger::{
    ExpiryReport, PointsLedger,
    adapters::{InMemoryLedgerStore, ManualClock},
    domain::{
        batch::BatchStatus, customer::CustomerRef, event::RawEvent, tenant::TenantRef,
        transaction::TransactionType,
    },
};
use std::sync::Arc;

const TENANT: &str = "coffee-club";

fn at(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, 0, 0, 0).unwrap()
}

fn setup() -> (PointsLedger, ManualClock) {
    let clock = ManualClock::new(at(1, 1));
    let ledger = PointsLedger::with_clock(
        Arc::new(InMemoryLedgerStore::default()),
        Arc::new(clock.clone()),
    );
    (ledger, clock)
}

fn event(id: &str, user: i64, delta: i64, created_at: DateTime<Utc>) -> RawEvent {
    RawEvent {
        external_event_id: Some(id.to_string()),
        wp_user_id: Some(user),
        email: Some(format!("user{user}@shop.test")),
        points_delta: Some(delta),
        event_type: Some(if delta > 0 { "purchase" } else { "spend" }.to_string()),
        created_at: Some(created_at.to_rfc3339()),
        ..Default::default()
    }
}

async fn ingest(ledger: &PointsLedger, tenant: &str, events: Vec<RawEvent>) {
    let report = ledger
        .ingest_points_events(&TenantRef::new(tenant), events)
        .await
        .expect("Ingestion failed");
    assert_eq!(report.failed, 0, "unexpected failures: {:?}", report.errors);
}

async fn balance(ledger: &PointsLedger, tenant: &str, user: i64) -> i64 {
    ledger
        .get_wallet_balance(tenant, &CustomerRef::External(user))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sweep_expires_the_remaining_points() {
    let (ledger, _clock) = setup();
    ingest(
        &ledger,
        TENANT,
        vec![
            event("evt-1", 42, 100, at(1, 1)),
            event("evt-2", 42, -30, at(1, 10)),
        ],
    )
    .await;
    assert_eq!(balance(&ledger, TENANT, 42).await, 70);

    let report = ledger.expire_points_at(at(2, 1)).await.unwrap();
    assert_eq!(
        report,
        ExpiryReport {
            expired_batches: 1,
            expired_points: 70,
            affected_customers: 1,
            failed_customers: 0,
        }
    );
    assert_eq!(balance(&ledger, TENANT, 42).await, 0);

    let batches = ledger
        .customer_batches(TENANT, &CustomerRef::External(42))
        .await
        .unwrap();
    assert_eq!(batches[0].points_remaining, 0);
    assert_eq!(batches[0].status, BatchStatus::Expired);

    let log = ledger
        .customer_transactions(TENANT, &CustomerRef::External(42))
        .await
        .unwrap();
    let expiry = log.last().unwrap();
    assert_eq!(expiry.transaction_type, TransactionType::Expiry);
    assert_eq!(expiry.delta, -70);
    assert_eq!(expiry.batch_id, Some(batches[0].id));
    assert_eq!(expiry.external_event_id, None);
    assert_eq!(expiry.created_at, at(2, 1));
}

#[tokio::test]
async fn test_second_sweep_finds_nothing() {
    let (ledger, _clock) = setup();
    ingest(&ledger, TENANT, vec![event("evt-1", 42, 100, at(1, 1))]).await;

    let first = ledger.expire_points_at(at(2, 1)).await.unwrap();
    assert_eq!(first.expired_batches, 1);
    let second = ledger.expire_points_at(at(2, 1)).await.unwrap();
    assert_eq!(second, ExpiryReport::default());

    let log = ledger
        .customer_transactions(TENANT, &CustomerRef::External(42))
        .await
        .unwrap();
    assert_eq!(log.len(), 2);
}

#[tokio::test]
async fn test_nothing_due_is_not_an_error() {
    let (ledger, _clock) = setup();
    assert_eq!(ledger.expire_points_at(at(2, 1)).await.unwrap(), ExpiryReport::default());

    ingest(&ledger, TENANT, vec![event("evt-1", 42, 100, at(1, 10))]).await;
    let report = ledger.expire_points_at(at(2, 1)).await.unwrap();
    assert_eq!(report.expired_batches, 0);
    assert_eq!(balance(&ledger, TENANT, 42).await, 100);
}

#[tokio::test]
async fn test_batch_expires_exactly_at_its_deadline() {
    let (ledger, _clock) = setup();
    ingest(&ledger, TENANT, vec![event("evt-1", 42, 10, at(1, 1))]).await;

    let early = ledger
        .expire_points_at(at(1, 31) - chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(early.expired_batches, 0);
    let on_time = ledger.expire_points_at(at(1, 31)).await.unwrap();
    assert_eq!(on_time.expired_batches, 1);
}

#[tokio::test]
async fn test_only_due_batches_expire() {
    let (ledger, _clock) = setup();
    ingest(
        &ledger,
        TENANT,
        vec![
            event("evt-old", 42, 100, at(1, 1)),
            event("evt-new", 42, 40, at(1, 20)),
        ],
    )
    .await;

    let report = ledger.expire_points_at(at(2, 1)).await.unwrap();
    assert_eq!(report.expired_batches, 1);
    assert_eq!(report.expired_points, 100);
    assert_eq!(balance(&ledger, TENANT, 42).await, 40);

    // Spends after the sweep only see the surviving batch
    ingest(&ledger, TENANT, vec![event("evt-spend", 42, -25, at(2, 2))]).await;
    let batches = ledger
        .customer_batches(TENANT, &CustomerRef::External(42))
        .await
        .unwrap();
    assert_eq!(batches[0].points_remaining, 0);
    assert_eq!(batches[0].status, BatchStatus::Expired);
    assert_eq!(batches[1].points_remaining, 15);
    assert_eq!(balance(&ledger, TENANT, 42).await, 15);

    let reconciliation = ledger
        .reconcile_wallet(TENANT, &CustomerRef::External(42))
        .await
        .unwrap();
    assert!(reconciliation.is_consistent());
}

#[tokio::test]
async fn test_fully_spent_batches_are_left_alone() {
    let (ledger, _clock) = setup();
    ingest(
        &ledger,
        TENANT,
        vec![
            event("evt-1", 42, 50, at(1, 1)),
            event("evt-2", 42, -50, at(1, 2)),
        ],
    )
    .await;

    let report = ledger.expire_points_at(at(2, 1)).await.unwrap();
    assert_eq!(report.expired_batches, 0);
    let batches = ledger
        .customer_batches(TENANT, &CustomerRef::External(42))
        .await
        .unwrap();
    assert_eq!(batches[0].status, BatchStatus::Active);
}

#[tokio::test]
async fn test_sweep_covers_every_tenant() {
    let (ledger, _clock) = setup();
    ingest(
        &ledger,
        TENANT,
        vec![event("evt-1", 1, 10, at(1, 1)), event("evt-2", 2, 20, at(1, 1))],
    )
    .await;
    ingest(&ledger, "tea-house", vec![event("evt-1", 1, 30, at(1, 1))]).await;

    let report = ledger.expire_points_at(at(2, 1)).await.unwrap();
    assert_eq!(report.expired_batches, 3);
    assert_eq!(report.expired_points, 60);
    assert_eq!(report.affected_customers, 3);
    for (tenant, user) in [(TENANT, 1), (TENANT, 2), ("tea-house", 1)] {
        assert_eq!(balance(&ledger, tenant, user).await, 0);
    }
}

#[tokio::test]
async fn test_expire_points_uses_the_clock() {
    let (ledger, clock) = setup();
    ingest(&ledger, TENANT, vec![event("evt-1", 42, 10, at(1, 1))]).await;

    assert_eq!(ledger.expire_points().await.unwrap().expired_batches, 0);
    clock.set(at(2, 1));
    assert_eq!(ledger.expire_points().await.unwrap().expired_batches, 1);
}
