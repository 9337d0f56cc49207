//! Integration tests for refund association.

mod common;

use chrono::NaiveDate;
use common::{day, feed_txn, stored_txn, test_store, FlakyTransactions};
use std::sync::Arc;
use transaction_sync_service::models::{AssociationReason, Transaction};
use transaction_sync_service::reconciliation::refunds::DEFAULT_WINDOW_DAYS;
use transaction_sync_service::reconciliation::RefundAssociator;

fn associator(test: &common::TestStore) -> RefundAssociator {
    RefundAssociator::new(test.repos.transactions.clone(), DEFAULT_WINDOW_DAYS)
}

#[tokio::test]
async fn test_reversal_links_both_sides() {
    let test = test_store();
    let purchase = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("p-1", "acc-1", 25.0, day(2), "SHOE STORE")).await;
    let refund = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-1", "acc-1", -25.0, day(9), "SHOE STORE REFUND")).await;

    let summary = associator(&test).associate_all().await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.per_user.get("user-1"), Some(&1));

    let purchase = test.store.transaction(&purchase.id).unwrap();
    let refund = test.store.transaction(&refund.id).unwrap();
    assert!(purchase.reversed);
    assert!(!refund.reversed);
    assert_eq!(purchase.associations.len(), 1);
    assert_eq!(purchase.associations[0].transaction_id, refund.id);
    assert_eq!(purchase.associations[0].reason, AssociationReason::Reversal);
    assert_eq!(refund.associations[0].transaction_id, purchase.id);
}

#[tokio::test]
async fn test_association_is_idempotent() {
    let test = test_store();
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("p-1", "acc-1", 25.0, day(2), "SHOE STORE")).await;
    let refund = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-1", "acc-1", -25.0, day(9), "SHOE STORE")).await;

    assert_eq!(associator(&test).associate_all().await.unwrap().total, 1);
    assert_eq!(associator(&test).associate_all().await.unwrap().total, 0);
    assert_eq!(test.store.transaction(&refund.id).unwrap().associations.len(), 1);
}

#[tokio::test]
async fn test_window_is_inclusive_and_bounded() {
    let test = test_store();
    let april = |d: u32| NaiveDate::from_ymd_opt(2024, 4, d).unwrap();

    // Exactly 30 days before the refund: inside the window.
    let edge = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("p-edge", "acc-1", 40.0, april(1), "GYM")).await;
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-edge", "acc-1", -40.0, day(1), "GYM")).await;

    // 31 days before the refund: outside the window.
    stored_txn(&test.repos, "user-2", "card-2", Some("co-1"),
        feed_txn("p-old", "acc-2", 40.0, april(1), "GYM")).await;
    stored_txn(&test.repos, "user-2", "card-2", Some("co-1"),
        feed_txn("r-late", "acc-2", -40.0, day(2), "GYM")).await;

    let summary = associator(&test).associate_all().await.unwrap();
    assert_eq!(summary.total, 1);
    assert!(test.store.transaction(&edge.id).unwrap().reversed);
    assert!(summary.per_user.get("user-2").is_none());
}

#[tokio::test]
async fn test_counterpart_must_share_company_card_and_amount() {
    let test = test_store();
    stored_txn(&test.repos, "user-1", "card-1", Some("co-2"),
        feed_txn("p-other-company", "acc-1", 25.0, day(2), "STORE")).await;
    stored_txn(&test.repos, "user-1", "card-2", Some("co-1"),
        feed_txn("p-other-card", "acc-2", 25.0, day(3), "STORE")).await;
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("p-other-amount", "acc-1", 24.99, day(4), "STORE")).await;
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-1", "acc-1", -25.0, day(9), "STORE")).await;

    let summary = associator(&test).associate_all().await.unwrap();
    assert_eq!(summary.total, 0);
}

#[tokio::test]
async fn test_each_positive_is_reversed_once() {
    let test = test_store();
    let older = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("p-1", "acc-1", 15.0, day(1), "CAFE")).await;
    let newer = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("p-2", "acc-1", 15.0, day(3), "CAFE")).await;
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-1", "acc-1", -15.0, day(5), "CAFE")).await;
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-2", "acc-1", -15.0, day(6), "CAFE")).await;
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-3", "acc-1", -15.0, day(7), "CAFE")).await;

    let summary = associator(&test).associate_all().await.unwrap();
    assert_eq!(summary.total, 2);
    assert!(test.store.transaction(&older.id).unwrap().reversed);
    assert!(test.store.transaction(&newer.id).unwrap().reversed);

    let unlinked = test
        .store
        .transactions_for_user("user-1")
        .into_iter()
        .filter(|t| t.amount_cents < 0 && !t.is_reversal_linked())
        .count();
    assert_eq!(unlinked, 1);
}

#[tokio::test]
async fn test_counterpart_must_share_sector() {
    let test = test_store();
    let purchase = Transaction::from_feed(
        feed_txn("p-1", "acc-1", 25.0, day(2), "STORE"),
        "user-1",
        Some("card-1".to_string()),
        Some("co-1".to_string()),
        Some("sector-groceries".to_string()),
    );
    test.repos.transactions.insert(&purchase).await.unwrap();
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-1", "acc-1", -25.0, day(9), "STORE")).await;

    let summary = associator(&test).associate_all().await.unwrap();
    assert_eq!(summary.total, 0);
    assert!(!test.store.transaction(&purchase.id).unwrap().reversed);
}

#[tokio::test]
async fn test_lookup_failure_skips_only_that_refund() {
    let test = test_store();
    stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("p-1", "acc-1", 15.0, day(1), "CAFE")).await;
    let later_purchase = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("p-2", "acc-1", 15.0, day(2), "CAFE")).await;
    let broken = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-1", "acc-1", -15.0, day(5), "CAFE")).await;
    let healthy = stored_txn(&test.repos, "user-1", "card-1", Some("co-1"),
        feed_txn("r-2", "acc-1", -15.0, day(6), "CAFE")).await;

    let mut transactions = FlakyTransactions::new(test.store.clone());
    transactions.failing_lookups.insert(broken.id.clone());
    let summary = RefundAssociator::new(Arc::new(transactions), DEFAULT_WINDOW_DAYS)
        .associate_all()
        .await
        .unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.per_user.get("user-1"), Some(&1));
    assert!(test.store.transaction(&healthy.id).unwrap().is_reversal_linked());
    assert!(!test.store.transaction(&broken.id).unwrap().is_reversal_linked());
    assert!(!test.store.transaction(&later_purchase.id).unwrap().reversed);
}
