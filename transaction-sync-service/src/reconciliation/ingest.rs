//! Feed ingestion: fetch, filter, resolve merchants, deduplicate, persist.

use crate::models::{CardGroup, Company, FeedTransaction, IngestSummary, MatchKind, Transaction};
use crate::reconciliation::fingerprint::filter_duplicates;
use crate::reconciliation::fuzzy::{FuzzyMatcher, SearchIndex, SideFileWriter, Thresholds};
use crate::reconciliation::match_cache::{MatchCache, Resolution};
use crate::reconciliation::normalize::clean_name;
use crate::services::feed::{FeedError, TransactionFeed};
use crate::services::metrics::{record_error, record_ingested, record_match_resolution};
use crate::services::repository::Repositories;
use chrono::{Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use mongodb::bson::DateTime;
use service_core::error::AppError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Inclusive feed date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SyncWindow {
    pub fn ending_today(lookback_days: i64) -> Self {
        let end = Utc::now().date_naive();
        Self {
            start: end - Duration::days(lookback_days),
            end,
        }
    }
}

/// Companies, the company search index and the category-to-sector table,
/// loaded once per run and shared by every card group.
pub struct ReferenceData {
    companies: HashMap<String, Company>,
    sectors: HashMap<String, String>,
    matcher: FuzzyMatcher,
}

impl ReferenceData {
    #[instrument(skip(repos))]
    pub async fn load(repos: &Repositories, thresholds: Thresholds) -> Result<Self, AppError> {
        let companies = repos.companies.all_companies().await?;
        let sectors = repos
            .companies
            .category_mappings()
            .await?
            .into_iter()
            .map(|m| (m.category_path, m.sector_id))
            .collect();
        let matcher = FuzzyMatcher::new(SearchIndex::from_companies(&companies), thresholds);

        Ok(Self {
            companies: companies.into_iter().map(|c| (c.id.clone(), c)).collect(),
            sectors,
            matcher,
        })
    }

    fn sector_for(&self, company_id: Option<&str>, feed: &FeedTransaction) -> Option<String> {
        company_id
            .and_then(|id| self.companies.get(id))
            .and_then(|c| c.primary_sector_id.clone())
            .or_else(|| {
                feed.category_path()
                    .and_then(|path| self.sectors.get(&path).cloned())
            })
    }
}

/// Per-record merchant outcome before persistence.
struct Resolved {
    feed: FeedTransaction,
    company_id: Option<String>,
}

pub struct Ingestor {
    repos: Repositories,
    feed: Arc<dyn TransactionFeed>,
    thresholds: Thresholds,
    side_files: SideFileWriter,
}

impl Ingestor {
    pub fn new(
        repos: Repositories,
        feed: Arc<dyn TransactionFeed>,
        thresholds: Thresholds,
        side_files: SideFileWriter,
    ) -> Self {
        Self {
            repos,
            feed,
            thresholds,
            side_files,
        }
    }

    /// Ingests every linked card group. Groups of one user run in order;
    /// distinct users run concurrently, at most `max_concurrent` at a time.
    #[instrument(skip(self))]
    pub async fn ingest_all(
        &self,
        window: SyncWindow,
        max_concurrent: usize,
    ) -> Result<IngestSummary, AppError> {
        let cards = self.repos.cards.linked_feed_cards().await?;
        let total_cards = cards.len() as u64;
        let groups = CardGroup::from_cards(cards);
        let reference = ReferenceData::load(&self.repos, self.thresholds).await?;

        let mut by_user: Vec<(String, Vec<CardGroup>)> = Vec::new();
        for group in groups {
            match by_user.iter_mut().find(|(user, _)| *user == group.user_id) {
                Some((_, groups)) => groups.push(group),
                None => by_user.push((group.user_id.clone(), vec![group])),
            }
        }

        let reference = &reference;
        let summaries: Vec<IngestSummary> = stream::iter(by_user)
            .map(|(_, groups)| async move {
                let mut summary = IngestSummary::default();
                for group in &groups {
                    summary.merge(&self.ingest_group(group, window, reference).await);
                }
                summary
            })
            .buffer_unordered(max_concurrent.max(1))
            .collect()
            .await;

        let mut summary = IngestSummary {
            total_cards,
            ..IngestSummary::default()
        };
        for group_summary in &summaries {
            summary.merge(group_summary);
        }

        info!(
            total_cards = summary.total_cards,
            total_groups = summary.total_groups,
            fetched = summary.fetched,
            saved = summary.saved,
            skipped_duplicates = summary.skipped_duplicates,
            failed_groups = summary.failed_groups,
            "Ingestion run complete"
        );
        Ok(summary)
    }

    /// One card group's pass. Failures are counted in the returned summary
    /// and never propagate to other groups.
    #[instrument(skip(self, group, reference), fields(user_id = %group.user_id, cards = group.cards.len()))]
    pub async fn ingest_group(
        &self,
        group: &CardGroup,
        window: SyncWindow,
        reference: &ReferenceData,
    ) -> IngestSummary {
        let mut summary = IngestSummary {
            total_groups: 1,
            ..IngestSummary::default()
        };

        if let Err(e) = self.run_group(group, window, reference, &mut summary).await {
            summary.errors += 1;
            summary.failed_groups += 1;
            record_error("ingest_group");
            warn!(error = %e, user_id = %group.user_id, "Card group pass failed");
        }

        summary
    }

    async fn run_group(
        &self,
        group: &CardGroup,
        window: SyncWindow,
        reference: &ReferenceData,
        summary: &mut IngestSummary,
    ) -> Result<(), AppError> {
        let fetched = match self
            .feed
            .fetch(&group.access_token, window.start, window.end)
            .await
        {
            Ok(fetched) => fetched,
            Err(FeedError::CredentialRevoked(code)) => {
                warn!(code = %code, "Feed credential revoked, unlinking cards");
                self.repos.cards.mark_unlinked(&group.card_ids()).await?;
                return Err(FeedError::CredentialRevoked(code).into());
            }
            Err(e) => return Err(e.into()),
        };
        summary.fetched = fetched.len() as u64;

        let settled = self.drop_pending(fetched, summary);
        let fresh = self.drop_existing(settled, summary).await?;
        let resolved = self.resolve_merchants(group, fresh, reference, summary).await?;
        let candidates = self.build_transactions(group, resolved, reference, summary);
        self.persist(group, candidates, summary).await?;

        self.repos
            .cards
            .touch_last_sync(&group.card_ids(), DateTime::now())
            .await?;
        Ok(())
    }

    fn drop_pending(&self, fetched: Vec<FeedTransaction>, summary: &mut IngestSummary) -> Vec<FeedTransaction> {
        let (pending, settled): (Vec<_>, Vec<_>) = fetched.into_iter().partition(|t| t.pending);
        summary.skipped_pending = pending.len() as u64;
        record_ingested("pending", summary.skipped_pending);
        settled
    }

    async fn drop_existing(
        &self,
        settled: Vec<FeedTransaction>,
        summary: &mut IngestSummary,
    ) -> Result<Vec<FeedTransaction>, AppError> {
        let ids: Vec<String> = settled.iter().map(|t| t.transaction_id.clone()).collect();
        let existing = self.repos.transactions.existing_external_ids(&ids).await?;

        let mut seen = HashSet::new();
        let fresh: Vec<FeedTransaction> = settled
            .into_iter()
            .filter(|t| !existing.contains(&t.transaction_id) && seen.insert(t.transaction_id.clone()))
            .collect();

        summary.skipped_existing = ids.len() as u64 - fresh.len() as u64;
        record_ingested("existing", summary.skipped_existing);
        Ok(fresh)
    }

    async fn resolve_merchants(
        &self,
        group: &CardGroup,
        fresh: Vec<FeedTransaction>,
        reference: &ReferenceData,
        summary: &mut IngestSummary,
    ) -> Result<Vec<Resolved>, AppError> {
        let mut cache = MatchCache::snapshot(self.repos.match_cache.as_ref()).await?;
        let mut resolved = Vec::with_capacity(fresh.len());
        let mut unresolved = Vec::new();

        for feed in fresh {
            match cache.resolve(&feed) {
                Resolution::Company { company_id, kind, .. } => {
                    if kind == MatchKind::ManualOverride {
                        summary.manual_overrides += 1;
                        record_match_resolution("manual_override");
                    } else {
                        summary.cache_hits += 1;
                        record_match_resolution("cache");
                    }
                    resolved.push(Resolved {
                        feed,
                        company_id: Some(company_id),
                    });
                }
                Resolution::FalsePositive { .. } => {
                    summary.false_positives += 1;
                    record_match_resolution("false_positive");
                    resolved.push(Resolved {
                        feed,
                        company_id: None,
                    });
                }
                Resolution::Unresolved => unresolved.push(feed),
            }
        }

        if unresolved.is_empty() {
            return Ok(resolved);
        }

        let run = reference.matcher.match_transactions(&unresolved);
        let prefix = format!(
            "transactions_{}",
            group.default_card().map(|c| c.id.as_str()).unwrap_or("unknown")
        );
        if let Err(e) = run.write_side_files(&self.side_files, &prefix).await {
            warn!(error = %e, prefix = %prefix, "Failed to write match side files");
        }

        let mut recorded = BTreeSet::new();
        for (record, accepted) in run.accepted() {
            if recorded.insert((accepted.field, accepted.value.clone())) {
                // The match still applies to this batch when the write-back fails.
                match cache
                    .record_confirmed(
                        self.repos.match_cache.as_ref(),
                        accepted.field,
                        &accepted.original_value,
                        &accepted.company_id,
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => {
                        tracing::debug!(value = %accepted.value, "Confirmed match already cached");
                    }
                    Err(e) => {
                        summary.errors += 1;
                        record_error("record_confirmed");
                        warn!(error = %e, value = %accepted.value, "Failed to cache confirmed match");
                    }
                }
            }
            tracing::debug!(
                external_id = %record.external_id,
                company_id = %accepted.company_id,
                score = accepted.score,
                "Fuzzy match accepted"
            );
        }

        for feed in unresolved {
            let company_id = run
                .accepted_for(&feed.transaction_id)
                .map(|a| a.company_id.clone());
            if company_id.is_some() {
                summary.new_matches += 1;
                record_match_resolution("fuzzy");
            } else {
                summary.unmatched += 1;
                record_match_resolution("unmatched");
                let name = clean_name(&feed.name);
                if !name.is_empty() {
                    *summary.unmatched_names.entry(name).or_insert(0) += 1;
                }
            }
            resolved.push(Resolved { feed, company_id });
        }

        Ok(resolved)
    }

    fn build_transactions(
        &self,
        group: &CardGroup,
        resolved: Vec<Resolved>,
        reference: &ReferenceData,
        summary: &mut IngestSummary,
    ) -> Vec<Transaction> {
        resolved
            .into_iter()
            .filter_map(|Resolved { feed, company_id }| {
                let Some(card) = group.card_for_account(&feed.account_id) else {
                    summary.errors += 1;
                    record_error("unmapped_account");
                    warn!(external_id = %feed.transaction_id, "No card for feed account");
                    return None;
                };
                let sector_id = reference.sector_for(company_id.as_deref(), &feed);
                Some(Transaction::from_feed(
                    feed,
                    &group.user_id,
                    Some(card.id.clone()),
                    company_id,
                    sector_id,
                ))
            })
            .collect()
    }

    async fn persist(
        &self,
        group: &CardGroup,
        candidates: Vec<Transaction>,
        summary: &mut IngestSummary,
    ) -> Result<(), AppError> {
        if candidates.is_empty() {
            return Ok(());
        }

        let amounts: Vec<i64> = candidates
            .iter()
            .map(|t| t.amount_cents)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut dates: Vec<DateTime> = candidates.iter().map(|t| t.date).collect();
        dates.sort();
        dates.dedup();

        let existing = self
            .repos
            .transactions
            .fingerprint_candidates(&group.user_id, &amounts, &dates)
            .await?;
        let (survivors, duplicates) = filter_duplicates(candidates, &existing);
        summary.skipped_duplicates += duplicates.len() as u64;

        for transaction in &survivors {
            match self.repos.transactions.insert(transaction).await {
                Ok(()) => summary.saved += 1,
                Err(e) if e.is_conflict() => summary.skipped_duplicates += 1,
                Err(e) => {
                    summary.errors += 1;
                    record_error("insert_transaction");
                    warn!(error = %e, external_id = %transaction.external_id, "Failed to save transaction");
                }
            }
        }

        record_ingested("duplicate", summary.skipped_duplicates);
        record_ingested("saved", summary.saved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_spans_lookback() {
        let window = SyncWindow::ending_today(30);
        assert_eq!(window.end - window.start, Duration::days(30));
    }
}
