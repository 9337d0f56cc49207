//! End-to-end sync pass tests over the in-memory store.

mod common;

use common::{company, day, enrolled_card, feed_txn, test_store, FakeFeed, FakeNetwork};
use std::sync::Arc;
use std::time::Duration;
use transaction_sync_service::config::{MatchingConfig, PublisherConfig, ScheduleConfig};
use transaction_sync_service::models::{CatalogMerchant, CatalogOffer, CommissionType, OfferType};
use transaction_sync_service::reconciliation::Thresholds;
use transaction_sync_service::workers::SyncWorker;

fn matching(dir: &tempfile::TempDir) -> MatchingConfig {
    MatchingConfig {
        thresholds: Thresholds::default(),
        side_file_dir: dir.path().to_path_buf(),
    }
}

fn publisher() -> PublisherConfig {
    PublisherConfig {
        batch_size: 50,
        batch_interval: Duration::from_millis(1),
        ..PublisherConfig::default()
    }
}

fn seeded_feed() -> FakeFeed {
    FakeFeed::new().with_window(
        "tok-card-1",
        vec![
            feed_txn("t-1", "acc-card-1", 25.0, day(2), "BLUE BOTTLE"),
            feed_txn("t-2", "acc-card-1", -25.0, day(5), "BLUE BOTTLE"),
            feed_txn("t-3", "acc-card-1", 9.5, day(6), "ZZQX UNKNOWN VENDOR"),
        ],
    )
}

fn catalog() -> Vec<CatalogMerchant> {
    vec![CatalogMerchant {
        id: "m-1".to_string(),
        name: "Blue Bottle Coffee".to_string(),
        website_url: "https://bluebottlecoffee.com".to_string(),
        offers: vec![CatalogOffer {
            id: "o-1".to_string(),
            name: "Online".to_string(),
            offer_type: OfferType::Online,
            commission_type: CommissionType::Percent,
            total_commission: 4.0,
        }],
    }]
}

#[tokio::test]
async fn test_run_once_executes_every_stage() {
    let test = test_store();
    let dir = tempfile::tempdir().unwrap();
    test.store.put_card(enrolled_card("card-1", "user-1"));
    test.store
        .put_company(company("co-1", "Blue Bottle", Some("bluebottlecoffee.com")));

    let network = Arc::new(FakeNetwork {
        merchants: catalog(),
        ..Default::default()
    });
    let schedule = ScheduleConfig {
        catalog_sync: true,
        ..ScheduleConfig::default()
    };
    let worker = SyncWorker::new(
        test.repos.clone(),
        Arc::new(seeded_feed()),
        network.clone(),
        &matching(&dir),
        publisher(),
        schedule,
    );

    let summary = worker.run_once("manual").await.unwrap();

    assert_eq!(summary.source, "manual");
    assert_eq!(summary.ingest.fetched, 3);
    assert_eq!(summary.ingest.saved, 3);
    assert_eq!(summary.ingest.new_matches, 2);
    assert_eq!(summary.ingest.unmatched, 1);
    assert_eq!(summary.associations, 1);
    assert_eq!(summary.reward_batches_accepted, 1);
    assert_eq!(summary.reward_batches_failed, 0);

    let linked = test.store.company("co-1").unwrap();
    assert!(linked.has_catalog_link());
    let published = &network.batches()[0];
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].merchant_name, "Blue Bottle Coffee");
    assert_eq!(published[0].amount, 2500);

    let stored = test.store.summaries();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, summary.id);
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let test = test_store();
    let dir = tempfile::tempdir().unwrap();
    test.store.put_card(enrolled_card("card-1", "user-1"));
    test.store.put_company(company("co-1", "Blue Bottle", None));

    let network = Arc::new(FakeNetwork::default());
    let worker = SyncWorker::new(
        test.repos.clone(),
        Arc::new(seeded_feed()),
        network.clone(),
        &matching(&dir),
        publisher(),
        ScheduleConfig::default(),
    );

    worker.run_once("manual").await.unwrap();
    let second = worker.run_once("manual").await.unwrap();

    assert_eq!(second.ingest.saved, 0);
    assert_eq!(second.ingest.skipped_existing, 3);
    assert_eq!(second.associations, 0);
    assert_eq!(second.reward_batches_accepted, 0);
    assert_eq!(network.batches().len(), 1);
    assert_eq!(test.store.transaction_count(), 3);
    assert_eq!(test.store.summaries().len(), 2);
}

#[tokio::test]
async fn test_start_stops_on_shutdown() {
    let test = test_store();
    let dir = tempfile::tempdir().unwrap();
    let worker = SyncWorker::new(
        test.repos.clone(),
        Arc::new(FakeFeed::new()),
        Arc::new(FakeNetwork::default()),
        &matching(&dir),
        publisher(),
        ScheduleConfig {
            interval: Duration::from_secs(3600),
            ..ScheduleConfig::default()
        },
    );
    let token = worker.shutdown_token();
    let handle = tokio::spawn(worker.start());

    // The first tick fires immediately.
    for _ in 0..100 {
        if !test.store.summaries().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(test.store.summaries().len(), 1);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}
