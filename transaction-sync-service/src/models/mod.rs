//! Domain models for transaction-sync-service.

use chrono::{NaiveDate, NaiveTime};
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Midnight UTC of a feed calendar day.
pub fn utc_day(date: NaiveDate) -> DateTime {
    DateTime::from_chrono(date.and_time(NaiveTime::MIN).and_utc())
}

/// Feed amounts are currency units; stored amounts are integer cents.
pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

// ===== Feed Records =====

/// One raw transaction as delivered by the bank-data feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedTransaction {
    pub transaction_id: String,
    pub account_id: String,
    /// Positive for debits, negative for credits and refunds.
    pub amount: f64,
    pub date: NaiveDate,
    pub name: String,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub iso_currency_code: Option<String>,
    #[serde(default)]
    pub category: Vec<String>,
}

impl FeedTransaction {
    pub fn field(&self, field: MatchField) -> Option<&str> {
        match field {
            MatchField::Name => Some(self.name.as_str()),
            MatchField::MerchantName => self.merchant_name.as_deref(),
        }
    }

    /// Category path used to look up a sector mapping, e.g. `Food-and-Drink-Restaurants`.
    pub fn category_path(&self) -> Option<String> {
        let parts: Vec<String> = self
            .category
            .iter()
            .map(|c| c.trim().split(' ').collect::<Vec<_>>().join("-"))
            .filter(|c| !c.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("-"))
        }
    }
}

// ===== Transactions =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssociationReason {
    Reversal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionAssociation {
    pub transaction_id: String,
    pub reason: AssociationReason,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RewardStatus {
    /// External id assigned, not yet acknowledged by the network.
    Queued,
    Accepted,
    Failed,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardStatus::Queued => "queued",
            RewardStatus::Accepted => "accepted",
            RewardStatus::Failed => "failed",
        }
    }
}

/// Reward-network view of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardSubRecord {
    pub external_id: String,
    pub status: RewardStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime,
}

impl RewardSubRecord {
    pub fn queued() -> Self {
        Self {
            external_id: Uuid::new_v4().to_string(),
            status: RewardStatus::Queued,
            error: None,
            updated_at: DateTime::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub card_id: Option<String>,
    pub company_id: Option<String>,
    pub sector_id: Option<String>,
    pub amount_cents: i64,
    pub date: DateTime,
    pub pending: bool,
    #[serde(default)]
    pub reversed: bool,
    /// Feed transaction id, unique across all stored transactions.
    pub external_id: String,
    pub feed: FeedTransaction,
    #[serde(default)]
    pub associations: Vec<TransactionAssociation>,
    #[serde(default)]
    pub reward: Option<RewardSubRecord>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Transaction {
    pub fn from_feed(
        feed: FeedTransaction,
        user_id: &str,
        card_id: Option<String>,
        company_id: Option<String>,
        sector_id: Option<String>,
    ) -> Self {
        let now = DateTime::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            card_id,
            company_id,
            sector_id,
            amount_cents: to_cents(feed.amount),
            date: utc_day(feed.date),
            pending: feed.pending,
            reversed: false,
            external_id: feed.transaction_id.clone(),
            feed,
            associations: Vec::new(),
            reward: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn display_name(&self) -> &str {
        &self.feed.name
    }

    pub fn merchant_name(&self) -> Option<&str> {
        self.feed.merchant_name.as_deref()
    }

    pub fn is_reversal_linked(&self) -> bool {
        self.associations
            .iter()
            .any(|a| a.reason == AssociationReason::Reversal)
    }

    pub fn reward_accepted(&self) -> bool {
        matches!(&self.reward, Some(r) if r.status == RewardStatus::Accepted)
    }
}

// ===== Cards =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Linked,
    Unlinked,
    Removed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Enrolled,
    Unenrolled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardEnrollment {
    /// Cardholder reference id known to the reward network.
    pub user_id: String,
    pub status: EnrollmentStatus,
    pub created_on: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CardFeedLink {
    pub access_token: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Card {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: CardStatus,
    #[serde(default)]
    pub feed: Option<CardFeedLink>,
    #[serde(default)]
    pub bin: Option<String>,
    #[serde(default)]
    pub last_four: Option<String>,
    #[serde(default)]
    pub reward: Option<RewardEnrollment>,
    #[serde(default)]
    pub last_transaction_sync: Option<DateTime>,
    pub created_at: DateTime,
}

impl Card {
    /// Only linked, enrolled cards may source reward submissions.
    pub fn is_reward_eligible(&self) -> bool {
        self.status == CardStatus::Linked
            && matches!(&self.reward, Some(r) if r.status == EnrollmentStatus::Enrolled)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.feed.as_ref().map(|f| f.account_id.as_str())
    }
}

/// Linked cards sharing one feed credential.
#[derive(Debug, Clone)]
pub struct CardGroup {
    pub access_token: String,
    pub user_id: String,
    pub cards: Vec<Card>,
}

impl CardGroup {
    /// Groups linked cards by feed credential, preserving first-seen order.
    pub fn from_cards(cards: Vec<Card>) -> Vec<CardGroup> {
        let mut groups: Vec<CardGroup> = Vec::new();
        for card in cards {
            if card.status != CardStatus::Linked {
                continue;
            }
            let Some(token) = card.feed.as_ref().map(|f| f.access_token.clone()) else {
                continue;
            };
            match groups.iter_mut().find(|g| g.access_token == token) {
                Some(group) => group.cards.push(card),
                None => groups.push(CardGroup {
                    access_token: token,
                    user_id: card.user_id.clone(),
                    cards: vec![card],
                }),
            }
        }
        groups
    }

    pub fn default_card(&self) -> Option<&Card> {
        self.cards.first()
    }

    /// Card owning a feed account, falling back to the group default.
    pub fn card_for_account(&self, account_id: &str) -> Option<&Card> {
        self.cards
            .iter()
            .find(|c| c.account_id() == Some(account_id))
            .or_else(|| self.default_card())
    }

    pub fn card_ids(&self) -> Vec<String> {
        self.cards.iter().map(|c| c.id.clone()).collect()
    }
}

// ===== Match Cache =====

/// Transaction field a cache entry was keyed on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Name,
    MerchantName,
}

impl MatchField {
    pub const ALL: [MatchField; 2] = [MatchField::Name, MatchField::MerchantName];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchField::Name => "name",
            MatchField::MerchantName => "merchant_name",
        }
    }
}

/// Cache variant, listed in lookup precedence order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    ManualOverride,
    FalsePositive,
    Confirmed,
}

impl MatchKind {
    pub const PRECEDENCE: [MatchKind; 3] = [
        MatchKind::ManualOverride,
        MatchKind::FalsePositive,
        MatchKind::Confirmed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::ManualOverride => "manual_override",
            MatchKind::FalsePositive => "false_positive",
            MatchKind::Confirmed => "confirmed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchCacheEntry {
    #[serde(rename = "_id")]
    pub id: String,
    pub kind: MatchKind,
    pub field: MatchField,
    /// Normalized lookup value.
    pub value: String,
    pub original_value: String,
    /// Always `None` for false positives.
    pub company_id: Option<String>,
    pub created_on: DateTime,
    pub last_modified: DateTime,
}

impl MatchCacheEntry {
    fn new(kind: MatchKind, field: MatchField, value: String, original: &str, company_id: Option<String>) -> Self {
        let now = DateTime::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            field,
            value,
            original_value: original.to_string(),
            company_id,
            created_on: now,
            last_modified: now,
        }
    }

    pub fn manual_override(field: MatchField, value: String, original: &str, company_id: &str) -> Self {
        Self::new(MatchKind::ManualOverride, field, value, original, Some(company_id.to_string()))
    }

    pub fn false_positive(field: MatchField, value: String, original: &str) -> Self {
        Self::new(MatchKind::FalsePositive, field, value, original, None)
    }

    pub fn confirmed(field: MatchField, value: String, original: &str, company_id: &str) -> Self {
        Self::new(MatchKind::Confirmed, field, value, original, Some(company_id.to_string()))
    }
}

// ===== Companies & Sectors =====

/// Link from an internal merchant to an external catalog merchant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogLink {
    pub merchant_id: String,
    pub name: String,
    /// Highest online percentage commission.
    pub max_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanyMerchant {
    pub name: String,
    #[serde(default)]
    pub catalog: Option<CatalogLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Company {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub primary_sector_id: Option<String>,
    #[serde(default)]
    pub mcc: Option<i32>,
    #[serde(default)]
    pub merchant: Option<CompanyMerchant>,
}

impl Company {
    /// Name reported to the reward network for this company.
    pub fn reward_merchant_name(&self) -> &str {
        match &self.merchant {
            Some(m) => m.catalog.as_ref().map(|c| c.name.as_str()).unwrap_or(&m.name),
            None => &self.name,
        }
    }

    pub fn has_catalog_link(&self) -> bool {
        matches!(&self.merchant, Some(m) if m.catalog.is_some())
    }
}

/// Sector assigned to a feed category path when no company sector applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorySectorMapping {
    #[serde(rename = "_id")]
    pub category_path: String,
    pub sector_id: String,
}

// ===== External Catalog =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferType {
    Instore,
    Online,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommissionType {
    Percent,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogOffer {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub offer_type: OfferType,
    pub commission_type: CommissionType,
    pub total_commission: f64,
}

/// Merchant advertised by the reward network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogMerchant {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "websiteURL")]
    pub website_url: String,
    #[serde(default)]
    pub offers: Vec<CatalogOffer>,
}

impl CatalogMerchant {
    pub fn domain(&self) -> String {
        crate::reconciliation::normalize::canonical_domain(&self.website_url)
    }

    pub fn max_rate(&self) -> f64 {
        self.offers
            .iter()
            .filter(|o| o.offer_type == OfferType::Online && o.commission_type == CommissionType::Percent)
            .fold(0.0, |acc, o| if o.total_commission > acc { o.total_commission } else { acc })
    }
}

// ===== Run Summaries =====

/// Counters for one ingestion run, merged across card groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestSummary {
    pub total_cards: u64,
    pub total_groups: u64,
    pub fetched: u64,
    pub skipped_pending: u64,
    pub skipped_existing: u64,
    pub false_positives: u64,
    pub manual_overrides: u64,
    pub cache_hits: u64,
    pub new_matches: u64,
    pub unmatched: u64,
    pub skipped_duplicates: u64,
    pub saved: u64,
    pub errors: u64,
    pub failed_groups: u64,
    /// Occurrences of unmatched normalized names, for review.
    #[serde(default)]
    pub unmatched_names: BTreeMap<String, u64>,
}

impl IngestSummary {
    pub fn merge(&mut self, other: &IngestSummary) {
        self.total_cards += other.total_cards;
        self.total_groups += other.total_groups;
        self.fetched += other.fetched;
        self.skipped_pending += other.skipped_pending;
        self.skipped_existing += other.skipped_existing;
        self.false_positives += other.false_positives;
        self.manual_overrides += other.manual_overrides;
        self.cache_hits += other.cache_hits;
        self.new_matches += other.new_matches;
        self.unmatched += other.unmatched;
        self.skipped_duplicates += other.skipped_duplicates;
        self.saved += other.saved;
        self.errors += other.errors;
        self.failed_groups += other.failed_groups;
        for (name, count) in &other.unmatched_names {
            *self.unmatched_names.entry(name.clone()).or_insert(0) += count;
        }
    }
}

/// Persisted record of one scheduled sync pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRunSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub source: String,
    pub ingest: IngestSummary,
    pub associations: u64,
    pub reward_batches_accepted: u64,
    pub reward_batches_failed: u64,
    pub started_at: DateTime,
    pub finished_at: DateTime,
}

// ===== Webhooks =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RewardEventUser {
    pub referring_partner_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardEventCard {
    pub bin: String,
    pub last4: String,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RewardEventTransaction {
    pub issuer_transaction_id: String,
    pub transaction_amount_in_cents: i64,
    pub status: String,
    #[serde(default)]
    pub transaction_time_stamp: Option<String>,
}

/// Earned-reward callback body, only constructed from a verified payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EarnedRewardEvent {
    #[serde(default)]
    pub issuer: Option<String>,
    pub user: RewardEventUser,
    pub reward: serde_json::Value,
    #[serde(default)]
    pub card: Option<RewardEventCard>,
    #[serde(default)]
    pub transaction: Option<RewardEventTransaction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str, token: &str, account: &str, status: CardStatus) -> Card {
        Card {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            name: format!("card {id}"),
            status,
            feed: Some(CardFeedLink {
                access_token: token.to_string(),
                account_id: account.to_string(),
            }),
            bin: None,
            last_four: None,
            reward: None,
            last_transaction_sync: None,
            created_at: DateTime::now(),
        }
    }

    #[test]
    fn category_path_joins_trimmed_parts() {
        let feed = FeedTransaction {
            transaction_id: "t".to_string(),
            account_id: "a".to_string(),
            amount: 1.0,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            name: "n".to_string(),
            merchant_name: None,
            pending: false,
            iso_currency_code: None,
            category: vec!["Food and Drink ".to_string(), " ".to_string(), "Restaurants".to_string()],
        };
        assert_eq!(feed.category_path().as_deref(), Some("Food-and-Drink-Restaurants"));
    }

    #[test]
    fn cents_conversion_rounds() {
        assert_eq!(to_cents(12.34), 1234);
        assert_eq!(to_cents(-0.1), -10);
        assert_eq!(to_cents(19.999), 2000);
    }

    #[test]
    fn groups_linked_cards_by_credential() {
        let groups = CardGroup::from_cards(vec![
            card("c1", "tok-a", "acc-1", CardStatus::Linked),
            card("c2", "tok-b", "acc-2", CardStatus::Linked),
            card("c3", "tok-a", "acc-3", CardStatus::Linked),
            card("c4", "tok-a", "acc-4", CardStatus::Unlinked),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].card_ids(), vec!["c1", "c3"]);
        assert_eq!(groups[0].card_for_account("acc-3").map(|c| c.id.as_str()), Some("c3"));
        assert_eq!(groups[0].card_for_account("unknown").map(|c| c.id.as_str()), Some("c1"));
    }

    #[test]
    fn max_rate_uses_online_percent_offers_only() {
        let offer = |offer_type, commission_type, total| CatalogOffer {
            id: "o".to_string(),
            name: "offer".to_string(),
            offer_type,
            commission_type,
            total_commission: total,
        };
        let merchant = CatalogMerchant {
            id: "m1".to_string(),
            name: "Shop".to_string(),
            website_url: "https://shop.com".to_string(),
            offers: vec![
                offer(OfferType::Online, CommissionType::Percent, 4.5),
                offer(OfferType::Online, CommissionType::Flat, 10.0),
                offer(OfferType::Instore, CommissionType::Percent, 8.0),
                offer(OfferType::Online, CommissionType::Percent, 6.0),
            ],
        };
        assert_eq!(merchant.max_rate(), 6.0);
        assert_eq!(merchant.domain(), "shop.com");
    }
}
