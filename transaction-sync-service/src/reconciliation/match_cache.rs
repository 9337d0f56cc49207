//! Exact-value merchant resolution ahead of fuzzy matching.
//!
//! Manual overrides, false positives and confirmed fuzzy matches share one
//! entry type keyed by (kind, field, normalised value).

use crate::models::{FeedTransaction, MatchCacheEntry, MatchField, MatchKind};
use crate::reconciliation::normalize::clean_name;
use crate::services::repository::MatchCacheRepository;
use service_core::error::AppError;
use std::collections::HashMap;
use tracing::instrument;

/// Outcome of a cache lookup for one feed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Company {
        company_id: String,
        kind: MatchKind,
        field: MatchField,
    },
    FalsePositive {
        field: MatchField,
    },
    Unresolved,
}

type CacheKey = (MatchKind, MatchField, String);

/// Point-in-time view of the three cache variants, scanned in precedence
/// order: manual override, false positive, confirmed.
#[derive(Debug, Default, Clone)]
pub struct MatchCache {
    entries: HashMap<CacheKey, MatchCacheEntry>,
}

impl MatchCache {
    pub fn from_entries(entries: impl IntoIterator<Item = MatchCacheEntry>) -> Self {
        let mut cache = Self::default();
        for entry in entries {
            cache.insert(entry);
        }
        cache
    }

    #[instrument(skip(repo))]
    pub async fn snapshot(repo: &dyn MatchCacheRepository) -> Result<Self, AppError> {
        let entries = repo.all_entries().await?;
        tracing::debug!(entries = entries.len(), "Match cache snapshot loaded");
        Ok(Self::from_entries(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, entry: MatchCacheEntry) {
        // A false positive never carries a company.
        if entry.kind == MatchKind::FalsePositive && entry.company_id.is_some() {
            tracing::warn!(value = %entry.value, "Ignoring false positive entry with company");
            return;
        }
        if entry.kind != MatchKind::FalsePositive && entry.company_id.is_none() {
            tracing::warn!(value = %entry.value, kind = entry.kind.as_str(), "Ignoring cache entry without company");
            return;
        }
        self.entries
            .insert((entry.kind, entry.field, entry.value.clone()), entry);
    }

    pub fn get(&self, kind: MatchKind, field: MatchField, value: &str) -> Option<&MatchCacheEntry> {
        self.entries.get(&(kind, field, value.to_string()))
    }

    pub fn resolve(&self, feed: &FeedTransaction) -> Resolution {
        let keys: Vec<(MatchField, String)> = MatchField::ALL
            .iter()
            .filter_map(|field| {
                let value = clean_name(feed.field(*field)?);
                (!value.is_empty()).then_some((*field, value))
            })
            .collect();

        for kind in MatchKind::PRECEDENCE {
            for (field, value) in &keys {
                let Some(entry) = self.get(kind, *field, value) else {
                    continue;
                };
                return match (&entry.company_id, kind) {
                    (_, MatchKind::FalsePositive) => Resolution::FalsePositive { field: *field },
                    (Some(company_id), _) => Resolution::Company {
                        company_id: company_id.clone(),
                        kind,
                        field: *field,
                    },
                    (None, _) => continue,
                };
            }
        }

        Resolution::Unresolved
    }

    /// Promotes a fuzzy match into the confirmed variant, in the snapshot
    /// and in the backing store.
    #[instrument(skip(self, repo))]
    pub async fn record_confirmed(
        &mut self,
        repo: &dyn MatchCacheRepository,
        field: MatchField,
        original_value: &str,
        company_id: &str,
    ) -> Result<MatchCacheEntry, AppError> {
        let entry =
            MatchCacheEntry::confirmed(field, clean_name(original_value), original_value, company_id);
        repo.upsert(&entry).await?;
        self.insert(entry.clone());
        Ok(entry)
    }
}
