//! Reward network publishing.
//!
//! Eligible transactions are grouped per card and submitted in fixed-size
//! batches. Each card's stream is paced by its own token bucket; different
//! cards proceed independently. Cancellation is honoured between batches.

use crate::config::PublisherConfig;
use crate::models::{Card, Company, RewardStatus, RewardSubRecord, Transaction};
use crate::services::metrics::{record_error, record_reward_batch};
use crate::services::repository::Repositories;
use crate::services::reward_network::{RewardNetwork, RewardTransactionRecord, SETTLED};
use chrono::SecondsFormat;
use futures::stream::{self, StreamExt};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const DEFAULT_CURRENCY: &str = "USD";
const BIN_LENGTH: usize = 6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishSummary {
    pub cards: u64,
    pub batches_accepted: u64,
    pub batches_failed: u64,
    pub transactions_accepted: u64,
    pub transactions_failed: u64,
    pub errors: u64,
    pub cancelled: bool,
}

impl PublishSummary {
    pub fn merge(&mut self, other: &PublishSummary) {
        self.cards += other.cards;
        self.batches_accepted += other.batches_accepted;
        self.batches_failed += other.batches_failed;
        self.transactions_accepted += other.transactions_accepted;
        self.transactions_failed += other.transactions_failed;
        self.errors += other.errors;
        self.cancelled |= other.cancelled;
    }
}

/// Builds the network record for a transaction whose reward sub-record
/// carries the stable external id.
pub fn reward_record(
    transaction: &Transaction,
    external_id: &str,
    card: &Card,
    company: &Company,
) -> Option<RewardTransactionRecord> {
    let enrollment = card.reward.as_ref()?;
    let date = transaction
        .date
        .to_chrono()
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let merchant_name = company.reward_merchant_name().to_string();

    Some(RewardTransactionRecord {
        transaction_id: external_id.to_string(),
        referring_partner_user_id: enrollment.user_id.clone(),
        amount: transaction.amount_cents,
        status: SETTLED.to_string(),
        currency: transaction
            .feed
            .iso_currency_code
            .clone()
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        description: merchant_name.clone(),
        merchant_name,
        mcc: company.mcc.map(|mcc| mcc.to_string()),
        settled_date: Some(date.clone()),
        authorization_date: Some(date),
        card_bin: card
            .bin
            .as_ref()
            .map(|bin| bin.chars().take(BIN_LENGTH).collect()),
        card_last_four: card.last_four.clone(),
    })
}

pub struct RewardPublisher {
    repos: Repositories,
    network: Arc<dyn RewardNetwork>,
    config: PublisherConfig,
}

impl RewardPublisher {
    pub fn new(repos: Repositories, network: Arc<dyn RewardNetwork>, config: PublisherConfig) -> Self {
        Self {
            repos,
            network,
            config,
        }
    }

    /// Publishes every reward-eligible card, cards concurrently.
    #[instrument(skip(self, cancel))]
    pub async fn publish_all(&self, cancel: &CancellationToken) -> Result<PublishSummary, AppError> {
        let cards = self.repos.cards.reward_eligible_cards().await?;

        let summaries: Vec<PublishSummary> = stream::iter(cards)
            .map(|card| async move { self.publish_card(&card, cancel).await })
            .buffer_unordered(self.config.max_concurrent_cards.max(1))
            .collect()
            .await;

        let mut summary = PublishSummary::default();
        for card_summary in &summaries {
            summary.merge(card_summary);
        }

        info!(
            cards = summary.cards,
            batches_accepted = summary.batches_accepted,
            batches_failed = summary.batches_failed,
            cancelled = summary.cancelled,
            "Reward publishing complete"
        );
        Ok(summary)
    }

    /// Publishes one card's eligible transactions. Failures are counted in
    /// the summary.
    #[instrument(skip(self, card, cancel), fields(card_id = %card.id))]
    pub async fn publish_card(&self, card: &Card, cancel: &CancellationToken) -> PublishSummary {
        let mut summary = PublishSummary::default();
        if !card.is_reward_eligible() {
            return summary;
        }
        summary.cards = 1;

        if let Err(e) = self.run_card(card, cancel, &mut summary).await {
            summary.errors += 1;
            record_error("publish_card");
            warn!(error = %e, card_id = %card.id, "Reward publishing failed for card");
        }
        summary
    }

    async fn run_card(
        &self,
        card: &Card,
        cancel: &CancellationToken,
        summary: &mut PublishSummary,
    ) -> Result<(), AppError> {
        let candidates = self.repos.transactions.reward_candidates(&card.id).await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let mut company_ids: Vec<String> = candidates
            .iter()
            .filter_map(|t| t.company_id.clone())
            .collect();
        company_ids.sort();
        company_ids.dedup();
        let companies: HashMap<String, Company> = self
            .repos
            .companies
            .companies_by_ids(&company_ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let limiter = Quota::with_period(self.config.batch_interval).map(RateLimiter::direct);
        let batch_size = self.config.batch_size.max(1);

        for batch in candidates.chunks(batch_size) {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if let Some(limiter) = &limiter {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    _ = limiter.until_ready() => {}
                }
            }

            self.submit_batch(card, batch, &companies, summary).await;
        }

        Ok(())
    }

    /// Stamps external ids on a batch and submits it. Store and network
    /// failures are recorded on the batch; the caller moves on either way.
    async fn submit_batch(
        &self,
        card: &Card,
        batch: &[Transaction],
        companies: &HashMap<String, Company>,
        summary: &mut PublishSummary,
    ) {
        let (ids, records) = match self.prepare_batch(card, batch, companies).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, card_id = %card.id, "Failed to queue reward batch");
                summary.errors += 1;
                summary.batches_failed += 1;
                summary.transactions_failed += batch.len() as u64;
                record_reward_batch("failed");
                let ids: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
                self.record_outcome(&ids, RewardStatus::Failed, Some(e.to_string()), summary)
                    .await;
                return;
            }
        };

        if records.is_empty() {
            return;
        }

        match self.network.submit_batch(&records).await {
            Ok(()) => {
                summary.batches_accepted += 1;
                summary.transactions_accepted += ids.len() as u64;
                record_reward_batch("accepted");
                self.record_outcome(&ids, RewardStatus::Accepted, None, summary)
                    .await;
            }
            Err(e) => {
                let external_ids: Vec<&str> = records.iter().map(|r| r.transaction_id.as_str()).collect();
                error!(
                    error = %e,
                    card_id = %card.id,
                    external_ids = ?external_ids,
                    "Reward batch failed"
                );
                summary.batches_failed += 1;
                summary.transactions_failed += ids.len() as u64;
                record_reward_batch("failed");
                self.record_outcome(&ids, RewardStatus::Failed, Some(e.to_string()), summary)
                    .await;
            }
        }
    }

    async fn prepare_batch(
        &self,
        card: &Card,
        batch: &[Transaction],
        companies: &HashMap<String, Company>,
    ) -> Result<(Vec<String>, Vec<RewardTransactionRecord>), AppError> {
        let mut ids = Vec::with_capacity(batch.len());
        let mut records = Vec::with_capacity(batch.len());

        for transaction in batch {
            let Some(company) = transaction
                .company_id
                .as_deref()
                .and_then(|id| companies.get(id))
            else {
                continue;
            };
            let stored = self
                .repos
                .transactions
                .ensure_reward_record(&transaction.id, &RewardSubRecord::queued())
                .await?;
            if let Some(record) = reward_record(transaction, &stored.external_id, card, company) {
                ids.push(transaction.id.clone());
                records.push(record);
            }
        }

        Ok((ids, records))
    }

    async fn record_outcome(
        &self,
        ids: &[String],
        status: RewardStatus,
        reason: Option<String>,
        summary: &mut PublishSummary,
    ) {
        if let Err(e) = self
            .repos
            .transactions
            .set_reward_status(ids, status, reason)
            .await
        {
            summary.errors += 1;
            record_error("set_reward_status");
            warn!(error = %e, status = status.as_str(), "Failed to record reward batch outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CardFeedLink, CardStatus, CatalogLink, CompanyMerchant, EnrollmentStatus, FeedTransaction,
        RewardEnrollment,
    };
    use chrono::NaiveDate;
    use mongodb::bson::DateTime;

    fn card() -> Card {
        Card {
            id: "card-1".to_string(),
            user_id: "user-1".to_string(),
            name: "Visa".to_string(),
            status: CardStatus::Linked,
            feed: Some(CardFeedLink {
                access_token: "tok".to_string(),
                account_id: "acc".to_string(),
            }),
            bin: Some("41111122".to_string()),
            last_four: Some("1111".to_string()),
            reward: Some(RewardEnrollment {
                user_id: "partner-user-1".to_string(),
                status: EnrollmentStatus::Enrolled,
                created_on: DateTime::now(),
            }),
            last_transaction_sync: None,
            created_at: DateTime::now(),
        }
    }

    fn company() -> Company {
        Company {
            id: "co-1".to_string(),
            name: "Coffee Shop Inc".to_string(),
            url: None,
            hidden: false,
            primary_sector_id: None,
            mcc: Some(5814),
            merchant: Some(CompanyMerchant {
                name: "Coffee Shop".to_string(),
                catalog: Some(CatalogLink {
                    merchant_id: "m-1".to_string(),
                    name: "Coffee Shop Online".to_string(),
                    max_rate: 5.0,
                }),
            }),
        }
    }

    fn transaction() -> Transaction {
        let feed = FeedTransaction {
            transaction_id: "feed-1".to_string(),
            account_id: "acc".to_string(),
            amount: 12.5,
            date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            name: "COFFEE SHOP".to_string(),
            merchant_name: None,
            pending: false,
            iso_currency_code: None,
            category: Vec::new(),
        };
        Transaction::from_feed(feed, "user-1", Some("card-1".to_string()), Some("co-1".to_string()), None)
    }

    #[test]
    fn record_carries_network_fields() {
        let record = reward_record(&transaction(), "ext-1", &card(), &company()).unwrap();
        assert_eq!(record.transaction_id, "ext-1");
        assert_eq!(record.referring_partner_user_id, "partner-user-1");
        assert_eq!(record.amount, 1250);
        assert_eq!(record.status, "SETTLED");
        assert_eq!(record.currency, "USD");
        assert_eq!(record.merchant_name, "Coffee Shop Online");
        assert_eq!(record.description, "Coffee Shop Online");
        assert_eq!(record.mcc.as_deref(), Some("5814"));
        assert_eq!(record.settled_date.as_deref(), Some("2024-06-03T00:00:00Z"));
        assert_eq!(record.card_bin.as_deref(), Some("411111"));
        assert_eq!(record.card_last_four.as_deref(), Some("1111"));
    }

    #[test]
    fn unenrolled_card_yields_no_record() {
        let mut card = card();
        card.reward = None;
        assert!(reward_record(&transaction(), "ext-1", &card, &company()).is_none());
    }

    #[test]
    fn merchant_name_falls_back_to_company() {
        let mut company = company();
        company.merchant = None;
        let record = reward_record(&transaction(), "ext-1", &card(), &company).unwrap();
        assert_eq!(record.merchant_name, "Coffee Shop Inc");
    }
}
