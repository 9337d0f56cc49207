//! MongoDB implementation of the repository traits.

use crate::models::{
    AssociationReason, Card, CardStatus, CatalogLink, CategorySectorMapping, Company, CompanyMerchant,
    EnrollmentStatus, MatchCacheEntry, MatchKind, RewardStatus, RewardSubRecord, SyncRunSummary,
    Transaction, TransactionAssociation,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{
    CardRepository, CompanyRepository, MatchCacheRepository, SummaryRepository, TransactionRepository,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, DateTime, Document};
use mongodb::options::{FindOneOptions, FindOptions, IndexOptions, UpdateOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use service_core::error::AppError;
use std::collections::HashSet;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    transactions: Collection<Transaction>,
    cards: Collection<Card>,
    confirmed_matches: Collection<MatchCacheEntry>,
    false_positives: Collection<MatchCacheEntry>,
    manual_matches: Collection<MatchCacheEntry>,
    companies: Collection<Company>,
    category_mappings: Collection<CategorySectorMapping>,
    summaries: Collection<SyncRunSummary>,
}

fn oldest_first() -> Document {
    doc! { "date": 1, "created_at": 1 }
}

impl MongoStore {
    #[instrument(skip(uri))]
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        info!("Connecting to MongoDB");
        let client = Client::with_uri_str(uri).await?;
        let store = Self::new(&client.database(database));
        store.health_check().await?;
        info!("MongoDB connection established");
        Ok(store)
    }

    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            transactions: db.collection("transactions"),
            cards: db.collection("cards"),
            confirmed_matches: db.collection("transaction_matched_company_names"),
            false_positives: db.collection("transaction_false_positives"),
            manual_matches: db.collection("transaction_manual_matches"),
            companies: db.collection("companies"),
            category_mappings: db.collection("category_sector_mappings"),
            summaries: db.collection("sync_run_summaries"),
        }
    }

    fn cache_collection(&self, kind: MatchKind) -> &Collection<MatchCacheEntry> {
        match kind {
            MatchKind::ManualOverride => &self.manual_matches,
            MatchKind::FalsePositive => &self.false_positives,
            MatchKind::Confirmed => &self.confirmed_matches,
        }
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        timer.observe_duration();
        Ok(())
    }

    /// Initialize indexes backing the uniqueness rules and hot queries.
    pub async fn init_indexes(&self) -> Result<(), AppError> {
        let external_id_index = IndexModel::builder()
            .keys(doc! { "external_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("transaction_external_id_idx".to_string())
                    .unique(true)
                    .build(),
            )
            .build();

        let fingerprint_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "date": 1, "amount_cents": 1 })
            .options(
                IndexOptions::builder()
                    .name("transaction_fingerprint_idx".to_string())
                    .build(),
            )
            .build();

        let reward_index = IndexModel::builder()
            .keys(doc! { "card_id": 1, "pending": 1, "reward.status": 1 })
            .options(
                IndexOptions::builder()
                    .name("transaction_reward_idx".to_string())
                    .build(),
            )
            .build();

        self.transactions
            .create_indexes([external_id_index, fingerprint_index, reward_index], None)
            .await?;

        let access_token_index = IndexModel::builder()
            .keys(doc! { "feed.access_token": 1, "status": 1 })
            .options(
                IndexOptions::builder()
                    .name("card_access_token_idx".to_string())
                    .build(),
            )
            .build();
        self.cards.create_indexes([access_token_index], None).await?;

        for kind in MatchKind::PRECEDENCE {
            let key_index = IndexModel::builder()
                .keys(doc! { "field": 1, "value": 1 })
                .options(
                    IndexOptions::builder()
                        .name(format!("{}_key_idx", kind.as_str()))
                        .unique(true)
                        .build(),
                )
                .build();
            self.cache_collection(kind)
                .create_indexes([key_index], None)
                .await?;
        }

        info!("Transaction sync indexes initialized");
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for MongoStore {
    #[instrument(skip(self, external_ids), fields(count = external_ids.len()))]
    async fn existing_external_ids(&self, external_ids: &[String]) -> Result<HashSet<String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["existing_external_ids"])
            .start_timer();

        let options = FindOptions::builder()
            .projection(doc! { "external_id": 1 })
            .build();
        let cursor = self
            .transactions
            .clone_with_type::<Document>()
            .find(doc! { "external_id": { "$in": external_ids.to_vec() } }, Some(options))
            .await?;
        let docs: Vec<Document> = cursor.try_collect().await?;

        timer.observe_duration();
        Ok(docs
            .iter()
            .filter_map(|d| d.get_str("external_id").ok().map(str::to_string))
            .collect())
    }

    #[instrument(skip(self, amounts, dates))]
    async fn fingerprint_candidates(
        &self,
        user_id: &str,
        amounts: &[i64],
        dates: &[DateTime],
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fingerprint_candidates"])
            .start_timer();

        let filter = doc! {
            "user_id": user_id,
            "$or": [
                { "amount_cents": { "$in": amounts.to_vec() } },
                { "date": { "$in": dates.to_vec() } },
            ]
        };
        let cursor = self.transactions.find(filter, None).await?;
        let transactions: Vec<Transaction> = cursor.try_collect().await?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self, transaction), fields(external_id = %transaction.external_id))]
    async fn insert(&self, transaction: &Transaction) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();
        self.transactions.insert_one(transaction, None).await?;
        timer.observe_duration();
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Transaction>, AppError> {
        Ok(self.transactions.find_one(doc! { "_id": id }, None).await?)
    }

    #[instrument(skip(self))]
    async fn users_with_negative_transactions(&self) -> Result<Vec<String>, AppError> {
        let values = self
            .transactions
            .distinct("user_id", doc! { "amount_cents": { "$lt": 0 } }, None)
            .await?;
        Ok(values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    #[instrument(skip(self))]
    async fn unassociated_negatives(&self, user_id: &str) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unassociated_negatives"])
            .start_timer();

        let filter = doc! {
            "user_id": user_id,
            "amount_cents": { "$lt": 0 },
            "associations.reason": { "$ne": to_bson(&AssociationReason::Reversal)? },
        };
        let options = FindOptions::builder().sort(oldest_first()).build();
        let cursor = self.transactions.find(filter, Some(options)).await?;
        let transactions: Vec<Transaction> = cursor.try_collect().await?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self, negative), fields(negative_id = %negative.id))]
    async fn find_reversal_candidate(
        &self,
        negative: &Transaction,
        window_start: DateTime,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_reversal_candidate"])
            .start_timer();

        let filter = doc! {
            "user_id": &negative.user_id,
            "amount_cents": negative.amount_cents.abs(),
            "date": { "$gte": window_start, "$lte": negative.date },
            "reversed": { "$ne": true },
            "company_id": negative.company_id.clone(),
            "card_id": negative.card_id.clone(),
            "sector_id": negative.sector_id.clone(),
        };
        let options = FindOneOptions::builder().sort(oldest_first()).build();
        let candidate = self.transactions.find_one(filter, Some(options)).await?;

        timer.observe_duration();
        Ok(candidate)
    }

    #[instrument(skip(self))]
    async fn link_reversal(&self, negative_id: &str, positive_id: &str) -> Result<bool, AppError> {
        let now = DateTime::now();
        let to_negative = to_bson(&TransactionAssociation {
            transaction_id: negative_id.to_string(),
            reason: AssociationReason::Reversal,
        })?;
        let positive = self
            .transactions
            .update_one(
                doc! { "_id": positive_id, "reversed": { "$ne": true } },
                doc! {
                    "$set": { "reversed": true, "updated_at": now },
                    "$push": { "associations": to_negative },
                },
                None,
            )
            .await?;
        if positive.matched_count == 0 {
            return Ok(false);
        }

        let to_positive = to_bson(&TransactionAssociation {
            transaction_id: positive_id.to_string(),
            reason: AssociationReason::Reversal,
        })?;
        self.transactions
            .update_one(
                doc! { "_id": negative_id },
                doc! {
                    "$set": { "updated_at": now },
                    "$push": { "associations": to_positive },
                },
                None,
            )
            .await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn reward_candidates(&self, card_id: &str) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reward_candidates"])
            .start_timer();

        let filter = doc! {
            "card_id": card_id,
            "pending": false,
            "amount_cents": { "$gte": 0 },
            "company_id": { "$ne": null },
            "reward.status": { "$ne": to_bson(&RewardStatus::Accepted)? },
        };
        let options = FindOptions::builder().sort(oldest_first()).build();
        let cursor = self.transactions.find(filter, Some(options)).await?;
        let transactions: Vec<Transaction> = cursor.try_collect().await?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self, record))]
    async fn ensure_reward_record(
        &self,
        transaction_id: &str,
        record: &RewardSubRecord,
    ) -> Result<RewardSubRecord, AppError> {
        self.transactions
            .update_one(
                doc! { "_id": transaction_id, "reward": null },
                doc! { "$set": { "reward": to_bson(record)? } },
                None,
            )
            .await?;

        self.transactions
            .find_one(doc! { "_id": transaction_id }, None)
            .await?
            .and_then(|t| t.reward)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "transaction {} has no reward record",
                    transaction_id
                ))
            })
    }

    #[instrument(skip(self, transaction_ids), fields(count = transaction_ids.len()))]
    async fn set_reward_status(
        &self,
        transaction_ids: &[String],
        status: RewardStatus,
        error: Option<String>,
    ) -> Result<(), AppError> {
        self.transactions
            .update_many(
                doc! { "_id": { "$in": transaction_ids.to_vec() }, "reward": { "$ne": null } },
                doc! {
                    "$set": {
                        "reward.status": to_bson(&status)?,
                        "reward.error": error,
                        "reward.updated_at": DateTime::now(),
                    }
                },
                None,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CardRepository for MongoStore {
    async fn linked_feed_cards(&self) -> Result<Vec<Card>, AppError> {
        let filter = doc! {
            "status": to_bson(&CardStatus::Linked)?,
            "feed": { "$ne": null },
        };
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1, "_id": 1 })
            .build();
        let cursor = self.cards.find(filter, Some(options)).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn reward_eligible_cards(&self) -> Result<Vec<Card>, AppError> {
        let filter = doc! {
            "status": to_bson(&CardStatus::Linked)?,
            "reward.status": to_bson(&EnrollmentStatus::Enrolled)?,
        };
        let cursor = self.cards.find(filter, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn touch_last_sync(&self, card_ids: &[String], at: DateTime) -> Result<(), AppError> {
        self.cards
            .update_many(
                doc! { "_id": { "$in": card_ids.to_vec() } },
                doc! { "$set": { "last_transaction_sync": at } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn mark_unlinked(&self, card_ids: &[String]) -> Result<(), AppError> {
        self.cards
            .update_many(
                doc! { "_id": { "$in": card_ids.to_vec() } },
                doc! { "$set": { "status": to_bson(&CardStatus::Unlinked)? } },
                None,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MatchCacheRepository for MongoStore {
    async fn all_entries(&self) -> Result<Vec<MatchCacheEntry>, AppError> {
        let mut entries = Vec::new();
        for kind in MatchKind::PRECEDENCE {
            let cursor = self.cache_collection(kind).find(doc! {}, None).await?;
            let mut batch: Vec<MatchCacheEntry> = cursor.try_collect().await?;
            entries.append(&mut batch);
        }
        Ok(entries)
    }

    #[instrument(skip(self, entry), fields(kind = entry.kind.as_str(), value = %entry.value))]
    async fn upsert(&self, entry: &MatchCacheEntry) -> Result<(), AppError> {
        let options = UpdateOptions::builder().upsert(true).build();
        self.cache_collection(entry.kind)
            .update_one(
                doc! { "field": to_bson(&entry.field)?, "value": &entry.value },
                doc! {
                    "$set": {
                        "original_value": &entry.original_value,
                        "company_id": entry.company_id.clone(),
                        "last_modified": entry.last_modified,
                    },
                    "$setOnInsert": {
                        "_id": &entry.id,
                        "kind": to_bson(&entry.kind)?,
                        "created_on": entry.created_on,
                    },
                },
                Some(options),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CompanyRepository for MongoStore {
    async fn all_companies(&self) -> Result<Vec<Company>, AppError> {
        let cursor = self.companies.find(doc! {}, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn companies_by_ids(&self, ids: &[String]) -> Result<Vec<Company>, AppError> {
        let cursor = self
            .companies
            .find(doc! { "_id": { "$in": ids.to_vec() } }, None)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn category_mappings(&self) -> Result<Vec<CategorySectorMapping>, AppError> {
        let cursor = self.category_mappings.find(doc! {}, None).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn link_catalog_merchant(&self, company_id: &str, link: &CatalogLink) -> Result<(), AppError> {
        let company = self
            .companies
            .find_one(doc! { "_id": company_id }, None)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("company {} not found", company_id)))?;

        let mut merchant = company.merchant.unwrap_or(CompanyMerchant {
            name: company.name,
            catalog: None,
        });
        merchant.catalog = Some(link.clone());

        self.companies
            .update_one(
                doc! { "_id": company_id },
                doc! { "$set": { "merchant": to_bson(&merchant)? } },
                None,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SummaryRepository for MongoStore {
    async fn save_summary(&self, summary: &SyncRunSummary) -> Result<(), AppError> {
        self.summaries.insert_one(summary, None).await?;
        Ok(())
    }
}
