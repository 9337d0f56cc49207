//! In-process store backed by `dashmap`, with the same uniqueness rules as
//! the MongoDB store. Used for the `memory` backend and in tests.

use crate::models::{
    AssociationReason, Card, CardStatus, CatalogLink, CategorySectorMapping, Company, CompanyMerchant,
    MatchCacheEntry, MatchField, MatchKind, RewardStatus, RewardSubRecord, SyncRunSummary, Transaction,
    TransactionAssociation,
};
use crate::services::repository::{
    CardRepository, CompanyRepository, MatchCacheRepository, SummaryRepository, TransactionRepository,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mongodb::bson::DateTime;
use service_core::error::AppError;
use std::collections::HashSet;

#[derive(Default)]
pub struct MemoryStore {
    transactions: DashMap<String, Transaction>,
    external_ids: DashMap<String, String>,
    cards: DashMap<String, Card>,
    match_cache: DashMap<(MatchKind, MatchField, String), MatchCacheEntry>,
    companies: DashMap<String, Company>,
    category_mappings: DashMap<String, CategorySectorMapping>,
    summaries: DashMap<String, SyncRunSummary>,
}

fn sorted_oldest_first(mut transactions: Vec<Transaction>) -> Vec<Transaction> {
    transactions.sort_by(|a, b| a.date.cmp(&b.date).then(a.created_at.cmp(&b.created_at)));
    transactions
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Seeding =====

    pub fn put_card(&self, card: Card) {
        self.cards.insert(card.id.clone(), card);
    }

    pub fn put_company(&self, company: Company) {
        self.companies.insert(company.id.clone(), company);
    }

    pub fn put_category_mapping(&self, mapping: CategorySectorMapping) {
        self.category_mappings
            .insert(mapping.category_path.clone(), mapping);
    }

    pub fn put_cache_entry(&self, entry: MatchCacheEntry) {
        self.match_cache
            .insert((entry.kind, entry.field, entry.value.clone()), entry);
    }

    // ===== Inspection =====

    pub fn card(&self, id: &str) -> Option<Card> {
        self.cards.get(id).map(|c| c.clone())
    }

    pub fn transaction(&self, id: &str) -> Option<Transaction> {
        self.transactions.get(id).map(|t| t.clone())
    }

    pub fn transactions_for_user(&self, user_id: &str) -> Vec<Transaction> {
        sorted_oldest_first(
            self.transactions
                .iter()
                .filter(|t| t.user_id == user_id)
                .map(|t| t.clone())
                .collect(),
        )
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn cache_entries(&self, kind: MatchKind) -> Vec<MatchCacheEntry> {
        self.match_cache
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.clone())
            .collect()
    }

    pub fn company(&self, id: &str) -> Option<Company> {
        self.companies.get(id).map(|c| c.clone())
    }

    pub fn summaries(&self) -> Vec<SyncRunSummary> {
        self.summaries.iter().map(|s| s.clone()).collect()
    }
}

#[async_trait]
impl TransactionRepository for MemoryStore {
    async fn existing_external_ids(&self, external_ids: &[String]) -> Result<HashSet<String>, AppError> {
        Ok(external_ids
            .iter()
            .filter(|id| self.external_ids.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn fingerprint_candidates(
        &self,
        user_id: &str,
        amounts: &[i64],
        dates: &[DateTime],
    ) -> Result<Vec<Transaction>, AppError> {
        Ok(self
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .filter(|t| amounts.contains(&t.amount_cents) || dates.contains(&t.date))
            .map(|t| t.clone())
            .collect())
    }

    async fn insert(&self, transaction: &Transaction) -> Result<(), AppError> {
        match self.external_ids.entry(transaction.external_id.clone()) {
            Entry::Occupied(_) => Err(AppError::Conflict(anyhow::anyhow!(
                "transaction with external id {} already exists",
                transaction.external_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(transaction.id.clone());
                self.transactions
                    .insert(transaction.id.clone(), transaction.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Transaction>, AppError> {
        Ok(self.transaction(id))
    }

    async fn users_with_negative_transactions(&self) -> Result<Vec<String>, AppError> {
        let mut users: Vec<String> = self
            .transactions
            .iter()
            .filter(|t| t.amount_cents < 0)
            .map(|t| t.user_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        users.sort();
        Ok(users)
    }

    async fn unassociated_negatives(&self, user_id: &str) -> Result<Vec<Transaction>, AppError> {
        Ok(sorted_oldest_first(
            self.transactions
                .iter()
                .filter(|t| t.user_id == user_id && t.amount_cents < 0 && !t.is_reversal_linked())
                .map(|t| t.clone())
                .collect(),
        ))
    }

    async fn find_reversal_candidate(
        &self,
        negative: &Transaction,
        window_start: DateTime,
    ) -> Result<Option<Transaction>, AppError> {
        let candidates: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| {
                t.user_id == negative.user_id
                    && t.amount_cents == negative.amount_cents.abs()
                    && t.date >= window_start
                    && t.date <= negative.date
                    && !t.reversed
                    && t.company_id == negative.company_id
                    && t.card_id == negative.card_id
                    && t.sector_id == negative.sector_id
            })
            .map(|t| t.clone())
            .collect();
        Ok(sorted_oldest_first(candidates).into_iter().next())
    }

    async fn link_reversal(&self, negative_id: &str, positive_id: &str) -> Result<bool, AppError> {
        {
            let mut positive = self.transactions.get_mut(positive_id).ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("transaction {} not found", positive_id))
            })?;
            if positive.reversed {
                return Ok(false);
            }
            positive.reversed = true;
            positive.associations.push(TransactionAssociation {
                transaction_id: negative_id.to_string(),
                reason: AssociationReason::Reversal,
            });
            positive.updated_at = DateTime::now();
        }

        let mut negative = self.transactions.get_mut(negative_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("transaction {} not found", negative_id))
        })?;
        negative.associations.push(TransactionAssociation {
            transaction_id: positive_id.to_string(),
            reason: AssociationReason::Reversal,
        });
        negative.updated_at = DateTime::now();
        Ok(true)
    }

    async fn reward_candidates(&self, card_id: &str) -> Result<Vec<Transaction>, AppError> {
        Ok(sorted_oldest_first(
            self.transactions
                .iter()
                .filter(|t| {
                    t.card_id.as_deref() == Some(card_id)
                        && !t.pending
                        && t.amount_cents >= 0
                        && t.company_id.is_some()
                        && !t.reward_accepted()
                })
                .map(|t| t.clone())
                .collect(),
        ))
    }

    async fn ensure_reward_record(
        &self,
        transaction_id: &str,
        record: &RewardSubRecord,
    ) -> Result<RewardSubRecord, AppError> {
        let mut transaction = self.transactions.get_mut(transaction_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("transaction {} not found", transaction_id))
        })?;
        Ok(transaction.reward.get_or_insert_with(|| record.clone()).clone())
    }

    async fn set_reward_status(
        &self,
        transaction_ids: &[String],
        status: RewardStatus,
        error: Option<String>,
    ) -> Result<(), AppError> {
        for id in transaction_ids {
            if let Some(mut transaction) = self.transactions.get_mut(id) {
                if let Some(reward) = transaction.reward.as_mut() {
                    reward.status = status;
                    reward.error = error.clone();
                    reward.updated_at = DateTime::now();
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CardRepository for MemoryStore {
    async fn linked_feed_cards(&self) -> Result<Vec<Card>, AppError> {
        let mut cards: Vec<Card> = self
            .cards
            .iter()
            .filter(|c| c.status == CardStatus::Linked && c.feed.is_some())
            .map(|c| c.clone())
            .collect();
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(cards)
    }

    async fn reward_eligible_cards(&self) -> Result<Vec<Card>, AppError> {
        let mut cards: Vec<Card> = self
            .cards
            .iter()
            .filter(|c| c.is_reward_eligible())
            .map(|c| c.clone())
            .collect();
        cards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(cards)
    }

    async fn touch_last_sync(&self, card_ids: &[String], at: DateTime) -> Result<(), AppError> {
        for id in card_ids {
            if let Some(mut card) = self.cards.get_mut(id) {
                card.last_transaction_sync = Some(at);
            }
        }
        Ok(())
    }

    async fn mark_unlinked(&self, card_ids: &[String]) -> Result<(), AppError> {
        for id in card_ids {
            if let Some(mut card) = self.cards.get_mut(id) {
                card.status = CardStatus::Unlinked;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MatchCacheRepository for MemoryStore {
    async fn all_entries(&self) -> Result<Vec<MatchCacheEntry>, AppError> {
        Ok(self.match_cache.iter().map(|e| e.clone()).collect())
    }

    async fn upsert(&self, entry: &MatchCacheEntry) -> Result<(), AppError> {
        match self
            .match_cache
            .entry((entry.kind, entry.field, entry.value.clone()))
        {
            Entry::Occupied(mut existing) => {
                let stored = existing.get_mut();
                stored.company_id = entry.company_id.clone();
                stored.original_value = entry.original_value.clone();
                stored.last_modified = DateTime::now();
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CompanyRepository for MemoryStore {
    async fn all_companies(&self) -> Result<Vec<Company>, AppError> {
        let mut companies: Vec<Company> = self.companies.iter().map(|c| c.clone()).collect();
        companies.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(companies)
    }

    async fn companies_by_ids(&self, ids: &[String]) -> Result<Vec<Company>, AppError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.companies.get(id).map(|c| c.clone()))
            .collect())
    }

    async fn category_mappings(&self) -> Result<Vec<CategorySectorMapping>, AppError> {
        Ok(self.category_mappings.iter().map(|m| m.clone()).collect())
    }

    async fn link_catalog_merchant(&self, company_id: &str, link: &CatalogLink) -> Result<(), AppError> {
        let mut company = self.companies.get_mut(company_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("company {} not found", company_id))
        })?;
        let name = company.name.clone();
        company
            .merchant
            .get_or_insert_with(|| CompanyMerchant { name, catalog: None })
            .catalog = Some(link.clone());
        Ok(())
    }
}

#[async_trait]
impl SummaryRepository for MemoryStore {
    async fn save_summary(&self, summary: &SyncRunSummary) -> Result<(), AppError> {
        self.summaries.insert(summary.id.clone(), summary.clone());
        Ok(())
    }
}
