//! Common test utilities for transaction-sync-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use mongodb::bson::DateTime;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};
use transaction_sync_service::models::{
    Card, CardFeedLink, CardStatus, CatalogMerchant, Company, EnrollmentStatus, FeedTransaction,
    RewardEnrollment, RewardStatus, RewardSubRecord, Transaction,
};
use transaction_sync_service::services::{
    FeedError, MemoryStore, Repositories, RewardNetwork, RewardTransactionRecord, TransactionFeed,
    TransactionRepository,
};

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,transaction_sync_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct TestStore {
    pub store: Arc<MemoryStore>,
    pub repos: Repositories,
}

pub fn test_store() -> TestStore {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let repos = Repositories::from_store(store.clone());
    TestStore { store, repos }
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, d).expect("valid test date")
}

pub fn feed_txn(id: &str, account: &str, amount: f64, date: NaiveDate, name: &str) -> FeedTransaction {
    FeedTransaction {
        transaction_id: id.to_string(),
        account_id: account.to_string(),
        amount,
        date,
        name: name.to_string(),
        merchant_name: None,
        pending: false,
        iso_currency_code: Some("USD".to_string()),
        category: Vec::new(),
    }
}

pub fn linked_card(id: &str, user: &str, token: &str, account: &str) -> Card {
    Card {
        id: id.to_string(),
        user_id: user.to_string(),
        name: format!("Card {id}"),
        status: CardStatus::Linked,
        feed: Some(CardFeedLink {
            access_token: token.to_string(),
            account_id: account.to_string(),
        }),
        bin: Some("411111".to_string()),
        last_four: Some("1111".to_string()),
        reward: None,
        last_transaction_sync: None,
        created_at: DateTime::now(),
    }
}

pub fn enrolled_card(id: &str, user: &str) -> Card {
    let mut card = linked_card(id, user, &format!("tok-{id}"), &format!("acc-{id}"));
    card.reward = Some(RewardEnrollment {
        user_id: format!("partner-{user}"),
        status: EnrollmentStatus::Enrolled,
        created_on: DateTime::now(),
    });
    card
}

pub fn company(id: &str, name: &str, url: Option<&str>) -> Company {
    Company {
        id: id.to_string(),
        name: name.to_string(),
        url: url.map(str::to_string),
        hidden: false,
        primary_sector_id: Some(format!("sector-{id}")),
        mcc: None,
        merchant: None,
    }
}

/// Stores a settled transaction directly, bypassing ingestion.
pub async fn stored_txn(
    repos: &Repositories,
    user: &str,
    card: &str,
    company: Option<&str>,
    feed: FeedTransaction,
) -> Transaction {
    let transaction = Transaction::from_feed(
        feed,
        user,
        Some(card.to_string()),
        company.map(str::to_string),
        company.map(|c| format!("sector-{c}")),
    );
    repos
        .transactions
        .insert(&transaction)
        .await
        .expect("Failed to store transaction");
    transaction
}

/// Feed returning canned windows per access token.
#[derive(Default)]
pub struct FakeFeed {
    windows: Mutex<HashMap<String, Result<Vec<FeedTransaction>, String>>>,
}

impl FakeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(self, token: &str, transactions: Vec<FeedTransaction>) -> Self {
        self.windows
            .lock()
            .expect("feed lock")
            .insert(token.to_string(), Ok(transactions));
        self
    }

    pub fn with_error(self, token: &str, code: &str) -> Self {
        self.windows
            .lock()
            .expect("feed lock")
            .insert(token.to_string(), Err(code.to_string()));
        self
    }
}

#[async_trait]
impl TransactionFeed for FakeFeed {
    async fn fetch(
        &self,
        access_token: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<FeedTransaction>, FeedError> {
        match self.windows.lock().expect("feed lock").get(access_token) {
            Some(Ok(transactions)) => Ok(transactions.clone()),
            Some(Err(code)) if code == "ITEM_LOGIN_REQUIRED" => {
                Err(FeedError::CredentialRevoked(code.clone()))
            }
            Some(Err(code)) => Err(FeedError::Unavailable(code.clone())),
            None => Ok(Vec::new()),
        }
    }
}

/// Reward network recording every submitted batch.
#[derive(Default)]
pub struct FakeNetwork {
    pub batches: Mutex<Vec<Vec<RewardTransactionRecord>>>,
    pub merchants: Vec<CatalogMerchant>,
    /// Zero-based submission indexes that fail.
    pub failing: Vec<usize>,
}

impl FakeNetwork {
    pub fn batches(&self) -> Vec<Vec<RewardTransactionRecord>> {
        self.batches.lock().expect("network lock").clone()
    }
}

#[async_trait]
impl RewardNetwork for FakeNetwork {
    async fn submit_batch(&self, records: &[RewardTransactionRecord]) -> Result<(), AppError> {
        let mut batches = self.batches.lock().expect("network lock");
        let index = batches.len();
        batches.push(records.to_vec());
        if self.failing.contains(&index) {
            return Err(AppError::BadGateway("batch rejected".to_string()));
        }
        Ok(())
    }

    async fn fetch_merchants(&self) -> Result<Vec<CatalogMerchant>, AppError> {
        Ok(self.merchants.clone())
    }
}

/// Transaction store that fails selected operations for selected
/// transaction ids and delegates everything else to the memory store.
pub struct FlakyTransactions {
    pub inner: Arc<MemoryStore>,
    /// Negative transaction ids whose counterpart lookup fails.
    pub failing_lookups: HashSet<String>,
    /// Transaction ids whose reward sub-record cannot be stored.
    pub failing_reward_records: HashSet<String>,
}

impl FlakyTransactions {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_lookups: HashSet::new(),
            failing_reward_records: HashSet::new(),
        }
    }

    fn unavailable() -> AppError {
        AppError::DatabaseError(anyhow::anyhow!("connection reset"))
    }
}

#[async_trait]
impl TransactionRepository for FlakyTransactions {
    async fn existing_external_ids(&self, external_ids: &[String]) -> Result<HashSet<String>, AppError> {
        self.inner.existing_external_ids(external_ids).await
    }

    async fn fingerprint_candidates(
        &self,
        user_id: &str,
        amounts: &[i64],
        dates: &[DateTime],
    ) -> Result<Vec<Transaction>, AppError> {
        self.inner.fingerprint_candidates(user_id, amounts, dates).await
    }

    async fn insert(&self, transaction: &Transaction) -> Result<(), AppError> {
        self.inner.insert(transaction).await
    }

    async fn get(&self, id: &str) -> Result<Option<Transaction>, AppError> {
        self.inner.get(id).await
    }

    async fn users_with_negative_transactions(&self) -> Result<Vec<String>, AppError> {
        self.inner.users_with_negative_transactions().await
    }

    async fn unassociated_negatives(&self, user_id: &str) -> Result<Vec<Transaction>, AppError> {
        self.inner.unassociated_negatives(user_id).await
    }

    async fn find_reversal_candidate(
        &self,
        negative: &Transaction,
        window_start: DateTime,
    ) -> Result<Option<Transaction>, AppError> {
        if self.failing_lookups.contains(&negative.id) {
            return Err(Self::unavailable());
        }
        self.inner.find_reversal_candidate(negative, window_start).await
    }

    async fn link_reversal(&self, negative_id: &str, positive_id: &str) -> Result<bool, AppError> {
        self.inner.link_reversal(negative_id, positive_id).await
    }

    async fn reward_candidates(&self, card_id: &str) -> Result<Vec<Transaction>, AppError> {
        self.inner.reward_candidates(card_id).await
    }

    async fn ensure_reward_record(
        &self,
        transaction_id: &str,
        record: &RewardSubRecord,
    ) -> Result<RewardSubRecord, AppError> {
        if self.failing_reward_records.contains(transaction_id) {
            return Err(Self::unavailable());
        }
        self.inner.ensure_reward_record(transaction_id, record).await
    }

    async fn set_reward_status(
        &self,
        transaction_ids: &[String],
        status: RewardStatus,
        error: Option<String>,
    ) -> Result<(), AppError> {
        self.inner.set_reward_status(transaction_ids, status, error).await
    }
}
