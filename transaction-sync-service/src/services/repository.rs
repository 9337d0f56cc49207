//! Storage seams. Every pipeline component receives these traits instead
//! of reaching for a concrete store.

use crate::models::{
    Card, CatalogLink, CategorySectorMapping, Company, MatchCacheEntry, RewardStatus, RewardSubRecord,
    SyncRunSummary, Transaction,
};
use async_trait::async_trait;
use mongodb::bson::DateTime;
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Subset of `external_ids` already stored.
    async fn existing_external_ids(&self, external_ids: &[String]) -> Result<HashSet<String>, AppError>;

    /// A user's transactions sharing an amount or a date with the candidates.
    async fn fingerprint_candidates(
        &self,
        user_id: &str,
        amounts: &[i64],
        dates: &[DateTime],
    ) -> Result<Vec<Transaction>, AppError>;

    /// Fails with `AppError::Conflict` when the external id already exists.
    async fn insert(&self, transaction: &Transaction) -> Result<(), AppError>;

    async fn get(&self, id: &str) -> Result<Option<Transaction>, AppError>;

    async fn users_with_negative_transactions(&self) -> Result<Vec<String>, AppError>;

    /// Negative transactions of a user without a reversal association,
    /// oldest first.
    async fn unassociated_negatives(&self, user_id: &str) -> Result<Vec<Transaction>, AppError>;

    /// Oldest positive, non-reversed counterpart of `negative` dated within
    /// `[window_start, negative.date]` with the same company, card and sector.
    async fn find_reversal_candidate(
        &self,
        negative: &Transaction,
        window_start: DateTime,
    ) -> Result<Option<Transaction>, AppError>;

    /// Links both records with a reversal association and flags the positive
    /// one as reversed. Returns false when the positive was reversed
    /// concurrently.
    async fn link_reversal(&self, negative_id: &str, positive_id: &str) -> Result<bool, AppError>;

    /// Settled, non-negative, company-resolved transactions of a card not yet
    /// accepted by the reward network, oldest first.
    async fn reward_candidates(&self, card_id: &str) -> Result<Vec<Transaction>, AppError>;

    /// Stores `record` when the transaction has no reward sub-record yet and
    /// returns whichever record is stored afterwards.
    async fn ensure_reward_record(
        &self,
        transaction_id: &str,
        record: &RewardSubRecord,
    ) -> Result<RewardSubRecord, AppError>;

    async fn set_reward_status(
        &self,
        transaction_ids: &[String],
        status: RewardStatus,
        error: Option<String>,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait CardRepository: Send + Sync {
    /// Linked cards carrying a feed credential.
    async fn linked_feed_cards(&self) -> Result<Vec<Card>, AppError>;

    async fn reward_eligible_cards(&self) -> Result<Vec<Card>, AppError>;

    async fn touch_last_sync(&self, card_ids: &[String], at: DateTime) -> Result<(), AppError>;

    async fn mark_unlinked(&self, card_ids: &[String]) -> Result<(), AppError>;
}

#[async_trait]
pub trait MatchCacheRepository: Send + Sync {
    async fn all_entries(&self) -> Result<Vec<MatchCacheEntry>, AppError>;

    /// Inserts or refreshes the entry keyed by (kind, field, value).
    async fn upsert(&self, entry: &MatchCacheEntry) -> Result<(), AppError>;
}

#[async_trait]
pub trait CompanyRepository: Send + Sync {
    async fn all_companies(&self) -> Result<Vec<Company>, AppError>;

    async fn companies_by_ids(&self, ids: &[String]) -> Result<Vec<Company>, AppError>;

    async fn category_mappings(&self) -> Result<Vec<CategorySectorMapping>, AppError>;

    async fn link_catalog_merchant(&self, company_id: &str, link: &CatalogLink) -> Result<(), AppError>;
}

#[async_trait]
pub trait SummaryRepository: Send + Sync {
    async fn save_summary(&self, summary: &SyncRunSummary) -> Result<(), AppError>;
}

/// Bundle of repositories handed to the pipeline components.
#[derive(Clone)]
pub struct Repositories {
    pub transactions: Arc<dyn TransactionRepository>,
    pub cards: Arc<dyn CardRepository>,
    pub match_cache: Arc<dyn MatchCacheRepository>,
    pub companies: Arc<dyn CompanyRepository>,
    pub summaries: Arc<dyn SummaryRepository>,
}

impl Repositories {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TransactionRepository
            + CardRepository
            + MatchCacheRepository
            + CompanyRepository
            + SummaryRepository
            + 'static,
    {
        Self {
            transactions: store.clone(),
            cards: store.clone(),
            match_cache: store.clone(),
            companies: store.clone(),
            summaries: store,
        }
    }
}
