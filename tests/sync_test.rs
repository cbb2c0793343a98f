mod common;

use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use common::{balance, raw_tx, seed_connection, FakeAccount, FakeProvider};
use finguard_core::adapters::InMemoryStore;
use finguard_core::domain::{AccountType, ConnectionStatus, TransactionStatus};
use finguard_core::ports::ConnectionRepository;
use finguard_core::services::mapper::TransactionMapper;
use finguard_core::services::sync::{SyncError, SyncOptions, SyncService};

fn days_ago(days: i64) -> String {
    (Utc::now() - chrono::Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

fn service(store: &Arc<InMemoryStore>, provider: &Arc<FakeProvider>) -> SyncService {
    SyncService::new(store.clone(), provider.clone(), SyncOptions::default())
}

fn account_with(booked: Vec<finguard_core::provider::types::RawTransaction>) -> FakeAccount {
    FakeAccount {
        booked,
        balances: vec![balance("interimAvailable", "1520.40")],
        ..Default::default()
    }
}

#[tokio::test]
async fn second_sync_without_new_data_is_a_no_op() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    provider.add_account(
        "acc-1",
        FakeAccount {
            pending: vec![raw_tx("p-1", "-12.00", &days_ago(0), "Boulangerie")],
            ..account_with(vec![
                raw_tx("t-1", "2500.00", &days_ago(3), "Client Acme"),
                raw_tx("t-2", "-80.15", &days_ago(2), "EDF"),
            ])
        },
    );
    let sync = service(&store, &provider);

    let first = sync.sync_connection(connection.id).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].new_transactions, 3);
    assert_eq!(first[0].updated_transactions, 0);
    assert!(first[0].errors.is_empty());

    let mut before = store.transactions().await;
    before.sort_by(|a, b| a.external_id.cmp(&b.external_id));

    let second = sync.sync_connection(connection.id).await.unwrap();
    assert_eq!(second[0].new_transactions, 0);
    assert_eq!(second[0].updated_transactions, 0);
    assert!(second[0].is_up_to_date());

    let mut after = store.transactions().await;
    after.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    assert_eq!(before, after);
}

#[tokio::test]
async fn changed_provider_row_counts_as_updated() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    provider.add_account(
        "acc-1",
        account_with(vec![raw_tx("t-1", "-45.00", &days_ago(2), "Garage Martin")]),
    );
    let sync = service(&store, &provider);
    sync.sync_connection(connection.id).await.unwrap();

    provider.update_account("acc-1", |account| {
        account.booked = vec![raw_tx("t-1", "-47.50", &days_ago(2), "Garage Martin")];
    });
    let results = sync.sync_connection(connection.id).await.unwrap();

    assert_eq!(results[0].new_transactions, 0);
    assert_eq!(results[0].updated_transactions, 1);
    let stored = store.transactions().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].amount, BigDecimal::from_str("47.50").unwrap());
}

#[tokio::test]
async fn booked_row_supersedes_pending_row_with_same_id() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    provider.add_account(
        "acc-1",
        FakeAccount {
            pending: vec![raw_tx("t-9", "-19.99", &days_ago(1), "Librairie")],
            ..account_with(vec![])
        },
    );
    let sync = service(&store, &provider);
    let first = sync.sync_connection(connection.id).await.unwrap();
    assert_eq!(first[0].new_transactions, 1);

    provider.update_account("acc-1", |account| {
        account.booked = vec![raw_tx("t-9", "-19.99", &days_ago(1), "Librairie")];
        account.pending.clear();
    });
    let second = sync.sync_connection(connection.id).await.unwrap();

    assert_eq!(second[0].updated_transactions, 1);
    let stored = store.transactions().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, TransactionStatus::Booked);
}

#[tokio::test]
async fn failing_account_is_isolated_from_the_others() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection =
        seed_connection(&store, ConnectionStatus::Linked, &["acc-1", "acc-2", "acc-3"]).await;
    provider.add_account(
        "acc-1",
        account_with(vec![raw_tx("a1", "100.00", &days_ago(5), "Client Durand")]),
    );
    provider.add_account(
        "acc-2",
        FakeAccount {
            fail_transactions: true,
            ..account_with(vec![raw_tx("b1", "100.00", &days_ago(5), "Client")])
        },
    );
    provider.add_account(
        "acc-3",
        account_with(vec![
            raw_tx("c1", "-30.00", &days_ago(4), "Orange"),
            raw_tx("c2", "-31.00", &days_ago(3), "Orange"),
        ]),
    );

    let results = service(&store, &provider)
        .sync_connection(connection.id)
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    let ids: Vec<Uuid> = connection.accounts.iter().map(|a| a.id).collect();
    assert_eq!(results.iter().map(|r| r.account_id).collect::<Vec<_>>(), ids);

    assert_eq!(results[0].new_transactions, 1);
    assert!(results[0].errors.is_empty());

    assert_eq!(results[1].new_transactions, 0);
    assert_eq!(results[1].updated_transactions, 0);
    assert_eq!(results[1].errors.len(), 1);
    assert!(results[1].is_degraded());

    assert_eq!(results[2].new_transactions, 2);
    assert!(results[2].errors.is_empty());

    let reloaded = store.get_connection(connection.id).await.unwrap().unwrap();
    assert!(reloaded.last_synced_at.is_some());
}

#[tokio::test]
async fn bad_rows_are_reported_without_stopping_the_account() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    let mut broken = raw_tx("bad", "-1.00", &days_ago(2), "Inconnu");
    broken.transaction_amount = None;
    provider.add_account(
        "acc-1",
        account_with(vec![
            raw_tx("ok-1", "-10.00", &days_ago(2), "Cantine"),
            broken,
            raw_tx("ok-2", "-11.00", &days_ago(1), "Cantine"),
        ]),
    );

    let results = service(&store, &provider)
        .sync_connection(connection.id)
        .await
        .unwrap();

    assert_eq!(results[0].new_transactions, 2);
    assert_eq!(results[0].errors.len(), 1);
    assert!(results[0].errors[0].contains("bad"));
}

#[tokio::test]
async fn newly_discovered_accounts_are_persisted_and_synced() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    provider.add_account("acc-1", account_with(vec![]));
    provider.add_account(
        "acc-new",
        FakeAccount {
            iban: Some("FR7612345987650123456789014".to_string()),
            currency: Some("EUR".to_string()),
            cash_account_type: Some("SVGS".to_string()),
            ..account_with(vec![raw_tx("n1", "250.00", &days_ago(6), "Virement interne")])
        },
    );

    let results = service(&store, &provider)
        .sync_connection(connection.id)
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    let accounts = store.get_accounts_by_connection(connection.id).await.unwrap();
    let discovered = accounts
        .iter()
        .find(|a| a.external_id == "acc-new")
        .expect("account persisted");
    assert_eq!(discovered.account_type, AccountType::Savings);
    assert_eq!(discovered.iban.as_deref(), Some("FR7612345987650123456789014"));
    assert_eq!(discovered.balance, Some(BigDecimal::from_str("1520.40").unwrap()));

    let synced = results.iter().find(|r| r.account_id == discovered.id).unwrap();
    assert_eq!(synced.new_transactions, 1);

    // Known now: a second pass does not create it again.
    service(&store, &provider)
        .sync_connection(connection.id)
        .await
        .unwrap();
    assert_eq!(store.get_accounts_by_connection(connection.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn requisition_failure_still_syncs_known_accounts() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    provider.add_account(
        "acc-1",
        account_with(vec![raw_tx("t-1", "-5.00", &days_ago(1), "Kiosque")]),
    );
    provider.fail_requisition();

    let results = service(&store, &provider)
        .sync_connection(connection.id)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].new_transactions, 1);
}

#[tokio::test]
async fn balance_prefers_interim_available_and_skips_unknown_types() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection =
        seed_connection(&store, ConnectionStatus::Linked, &["acc-1", "acc-2"]).await;
    provider.add_account(
        "acc-1",
        FakeAccount {
            balances: vec![balance("expected", "50.00"), balance("interimAvailable", "75.00")],
            ..Default::default()
        },
    );
    provider.add_account(
        "acc-2",
        FakeAccount {
            balances: vec![balance("closingBooked", "999.00")],
            ..Default::default()
        },
    );

    let results = service(&store, &provider)
        .sync_connection(connection.id)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.errors.is_empty()));

    let accounts = store.get_accounts_by_connection(connection.id).await.unwrap();
    let first = accounts.iter().find(|a| a.external_id == "acc-1").unwrap();
    let second = accounts.iter().find(|a| a.external_id == "acc-2").unwrap();
    assert_eq!(first.balance, Some(BigDecimal::from_str("75.00").unwrap()));
    assert!(first.balance_updated_at.is_some());
    assert_eq!(second.balance, None);
}

#[tokio::test]
async fn cold_start_uses_lookback_then_resumes_from_last_booking() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    provider.add_account(
        "acc-1",
        account_with(vec![raw_tx("t-1", "-9.90", &days_ago(4), "Spotify")]),
    );
    let sync = service(&store, &provider);

    sync.sync_connection(connection.id).await.unwrap();
    let (from, to) = provider.window_for("acc-1").unwrap();
    let today = Utc::now().date_naive();
    assert_eq!(to, today);
    assert_eq!(from, today - chrono::Duration::days(90));

    sync.sync_connection(connection.id).await.unwrap();
    let (from, _) = provider.window_for("acc-1").unwrap();
    assert_eq!(from, today - chrono::Duration::days(4));
}

#[tokio::test]
async fn missing_or_unlinked_connection_is_fatal() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let sync = service(&store, &provider);

    let missing = sync.sync_connection(Uuid::new_v4()).await;
    assert!(matches!(missing, Err(SyncError::ConnectionNotFound(_))));

    let expired = seed_connection(&store, ConnectionStatus::Expired, &["acc-1"]).await;
    provider.add_account("acc-1", account_with(vec![]));
    let result = sync.sync_connection(expired.id).await;
    assert!(matches!(
        result,
        Err(SyncError::ConnectionNotLinked {
            status: ConnectionStatus::Expired,
            ..
        })
    ));
    assert_eq!(provider.transaction_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn slow_account_times_out_without_failing_the_connection() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection =
        seed_connection(&store, ConnectionStatus::Linked, &["acc-slow", "acc-fast"]).await;
    provider.add_account(
        "acc-slow",
        FakeAccount {
            transactions_delay: Some(Duration::from_secs(5)),
            ..account_with(vec![raw_tx("s1", "-1.00", &days_ago(1), "Lent")])
        },
    );
    provider.add_account(
        "acc-fast",
        account_with(vec![raw_tx("f1", "-2.00", &days_ago(1), "Rapide")]),
    );
    let options = SyncOptions {
        account_timeout: Duration::from_millis(100),
        ..SyncOptions::default()
    };
    let sync = SyncService::new(store.clone(), provider.clone(), options);

    let results = sync.sync_connection(connection.id).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[0].errors[0].contains("sync timed out after"));
    assert_eq!(results[0].new_transactions, 0);
    assert_eq!(results[1].new_transactions, 1);
}

#[tokio::test]
async fn cancellation_returns_completed_results() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection =
        seed_connection(&store, ConnectionStatus::Linked, &["acc-1", "acc-2"]).await;
    provider.add_account(
        "acc-1",
        account_with(vec![raw_tx("a1", "-3.00", &days_ago(1), "Tabac")]),
    );
    provider.add_account(
        "acc-2",
        FakeAccount {
            transactions_delay: Some(Duration::from_secs(10)),
            ..account_with(vec![raw_tx("b1", "-4.00", &days_ago(1), "Presse")])
        },
    );
    let options = SyncOptions {
        concurrency: 1,
        ..SyncOptions::default()
    };
    let sync = SyncService::new(store.clone(), provider.clone(), options);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = cancel_tx.send(true);
    });

    let results = tokio::time::timeout(
        Duration::from_secs(5),
        sync.sync_connection_with_cancel(connection.id, cancel_rx),
    )
    .await
    .expect("cancellation should end the sync early")
    .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].account_id, connection.accounts[0].id);
    assert_eq!(results[0].new_transactions, 1);

    let reloaded = store.get_connection(connection.id).await.unwrap().unwrap();
    assert!(reloaded.last_synced_at.is_some());
}

#[tokio::test]
async fn strict_mapper_rejects_rows_without_provider_ids() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    let mut anonymous = raw_tx("unused", "-6.00", &days_ago(1), "Parking");
    anonymous.transaction_id = None;
    provider.add_account("acc-1", account_with(vec![anonymous]));

    let sync = service(&store, &provider).with_mapper(TransactionMapper::new(true));
    let results = sync.sync_connection(connection.id).await.unwrap();

    assert_eq!(results[0].new_transactions, 0);
    assert_eq!(results[0].errors.len(), 1);
    assert!(store.transactions().await.is_empty());
}

#[tokio::test]
async fn connection_sync_runs_as_a_spawned_task() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1", "acc-2"]).await;
    provider.add_account(
        "acc-1",
        account_with(vec![raw_tx("t-1", "-30.00", &days_ago(1), "Papeterie")]),
    );
    provider.add_account(
        "acc-2",
        account_with(vec![raw_tx("t-2", "120.00", &days_ago(1), "Client Acme")]),
    );
    let sync = Arc::new(service(&store, &provider));

    let handle = tokio::spawn({
        let sync = sync.clone();
        async move { sync.sync_connection(connection.id).await }
    });
    let results = handle.await.unwrap().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.new_transactions == 1));

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        sync.sync_connection_with_cancel(connection.id, cancel_rx).await
    });
    let again = handle.await.unwrap().unwrap();
    assert!(again.iter().all(|r| r.is_up_to_date()));
}

#[tokio::test]
async fn out_of_range_lookback_is_reported_per_account() {
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(FakeProvider::new());
    let connection = seed_connection(&store, ConnectionStatus::Linked, &["acc-1"]).await;
    provider.add_account("acc-1", account_with(vec![]));
    let sync = SyncService::new(
        store.clone(),
        provider.clone(),
        SyncOptions {
            lookback_days: 100_000_000,
            ..SyncOptions::default()
        },
    );

    let results = sync.sync_connection(connection.id).await.unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].is_degraded());
    assert!(results[0].errors[0].contains("out of range"));
    assert_eq!(provider.transaction_calls.load(Ordering::SeqCst), 0);
}
