//! Approximate name and domain matching.
//!
//! Scores are normalized edit distances: 0 is an exact match of the cleaned
//! strings and 1 shares nothing. Lower is better. Each query produces two
//! top-3 lists (a primary and a secondary key) and the list with the lower
//! top score wins, the primary list on ties. A winner is accepted only when
//! its score is strictly below the threshold in force.

use crate::models::{CatalogMerchant, Company, FeedTransaction, MatchField};
use crate::reconciliation::normalize::{canonical_domain, clean_name};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const TOP_RESULTS: usize = 3;

/// Score thresholds. Restrictive applies when a false positive would be
/// written into the permanent company graph.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub default: f64,
    pub restrictive: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            default: 0.1,
            restrictive: 0.02,
        }
    }
}

// ===== Scoring =====

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized edit distance in `0.0..=1.0`.
pub fn distance(a: &str, b: &str) -> f64 {
    if a == b {
        return 0.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 0.0;
    }
    levenshtein(&a, &b) as f64 / max_len as f64
}

// ===== Search Index =====

#[derive(Debug, Clone)]
pub struct SearchCandidate {
    pub id: String,
    pub label: String,
    pub name_key: String,
    pub domain_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub score: f64,
}

/// Which candidate keys a query is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKeys {
    Name,
    NameAndDomain,
}

#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    candidates: Vec<SearchCandidate>,
}

impl SearchIndex {
    /// Visible companies keyed by cleaned name and canonical domain.
    pub fn from_companies(companies: &[Company]) -> Self {
        let candidates = companies
            .iter()
            .filter(|c| !c.hidden)
            .filter_map(|c| {
                let name_key = clean_name(&c.name);
                (!name_key.is_empty()).then(|| SearchCandidate {
                    id: c.id.clone(),
                    label: c.name.clone(),
                    name_key,
                    domain_key: c.url.as_deref().map(canonical_domain),
                })
            })
            .collect();
        Self { candidates }
    }

    pub fn from_catalog(merchants: &[CatalogMerchant]) -> Self {
        let candidates = merchants
            .iter()
            .map(|m| SearchCandidate {
                id: m.id.clone(),
                label: m.name.clone(),
                name_key: clean_name(&m.name),
                domain_key: Some(m.domain()).filter(|d| !d.is_empty()),
            })
            .collect();
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn score(candidate: &SearchCandidate, query: &str, keys: SearchKeys) -> f64 {
        let by_name = distance(query, &candidate.name_key);
        match (keys, &candidate.domain_key) {
            (SearchKeys::NameAndDomain, Some(domain)) => by_name.min(distance(query, domain)),
            _ => by_name,
        }
    }

    /// Best candidates for a query, ascending by score, at most three.
    pub fn search(&self, query: &str, keys: SearchKeys) -> Vec<ScoredCandidate> {
        if query.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f64)> = self
            .candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (i, Self::score(c, query, keys)))
            .filter(|(_, score)| *score < 1.0)
            .collect();

        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        scored
            .into_iter()
            .take(TOP_RESULTS)
            .map(|(i, score)| {
                let c = &self.candidates[i];
                ScoredCandidate {
                    id: c.id.clone(),
                    label: c.label.clone(),
                    domain: c.domain_key.clone(),
                    score,
                }
            })
            .collect()
    }
}

// ===== Selection =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListSide {
    Primary,
    Secondary,
}

/// Picks the list with the lower top score (primary on ties) and accepts it
/// only when that score is strictly below `threshold`.
pub fn select_match<'a>(
    primary: &'a [ScoredCandidate],
    secondary: &'a [ScoredCandidate],
    threshold: f64,
) -> Option<(ListSide, &'a ScoredCandidate)> {
    let best = match (primary.first(), secondary.first()) {
        (Some(p), Some(s)) if s.score < p.score => (ListSide::Secondary, s),
        (Some(p), _) => (ListSide::Primary, p),
        (None, Some(s)) => (ListSide::Secondary, s),
        (None, None) => return None,
    };

    (best.1.score < threshold).then_some(best)
}

// ===== Transaction Matching =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedMatch {
    pub field: MatchField,
    pub value: String,
    pub original_value: String,
    pub company_id: String,
    pub score: f64,
}

/// Full search result for one transaction, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMatchRecord {
    pub external_id: String,
    pub name: String,
    pub merchant_name: Option<String>,
    pub top_name_matches: Vec<ScoredCandidate>,
    pub top_merchant_matches: Vec<ScoredCandidate>,
    pub accepted: Option<AcceptedMatch>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionMatchRun {
    pub records: Vec<TransactionMatchRecord>,
}

impl TransactionMatchRun {
    pub fn accepted(&self) -> impl Iterator<Item = (&TransactionMatchRecord, &AcceptedMatch)> {
        self.records
            .iter()
            .filter_map(|r| r.accepted.as_ref().map(|a| (r, a)))
    }

    pub fn accepted_for(&self, external_id: &str) -> Option<&AcceptedMatch> {
        self.records
            .iter()
            .find(|r| r.external_id == external_id)
            .and_then(|r| r.accepted.as_ref())
    }

    pub async fn write_side_files(&self, writer: &SideFileWriter, prefix: &str) -> Result<(), AppError> {
        let confirmed: Vec<&AcceptedMatch> = self.accepted().map(|(_, a)| a).collect();
        writer.write(&format!("{prefix}_fuzzy_matches.json"), &self.records).await?;
        writer.write(&format!("{prefix}_matches_confirmed.json"), &confirmed).await?;
        Ok(())
    }
}

pub struct FuzzyMatcher {
    index: SearchIndex,
    thresholds: Thresholds,
}

impl FuzzyMatcher {
    pub fn new(index: SearchIndex, thresholds: Thresholds) -> Self {
        Self { index, thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Matches feed transactions against company names with the default
    /// threshold. Display name is the primary list, merchant name the
    /// secondary.
    pub fn match_transactions(&self, transactions: &[FeedTransaction]) -> TransactionMatchRun {
        self.match_transactions_with(transactions, self.thresholds.default)
    }

    pub fn match_transactions_with(&self, transactions: &[FeedTransaction], threshold: f64) -> TransactionMatchRun {
        let mut memo: HashMap<String, Vec<ScoredCandidate>> = HashMap::new();
        let mut lookup = |query: &str| -> Vec<ScoredCandidate> {
            memo.entry(query.to_string())
                .or_insert_with(|| self.index.search(query, SearchKeys::Name))
                .clone()
        };

        let records = transactions
            .iter()
            .map(|t| {
                let name = clean_name(&t.name);
                let merchant = t.merchant_name.as_deref().map(clean_name);

                let top_name_matches = lookup(name.as_str());
                let top_merchant_matches = merchant.as_deref().map(&mut lookup).unwrap_or_default();

                let accepted = select_match(&top_name_matches, &top_merchant_matches, threshold).map(
                    |(side, candidate)| match side {
                        ListSide::Primary => AcceptedMatch {
                            field: MatchField::Name,
                            value: name.clone(),
                            original_value: t.name.clone(),
                            company_id: candidate.id.clone(),
                            score: candidate.score,
                        },
                        ListSide::Secondary => AcceptedMatch {
                            field: MatchField::MerchantName,
                            value: merchant.clone().unwrap_or_default(),
                            original_value: t.merchant_name.clone().unwrap_or_default(),
                            company_id: candidate.id.clone(),
                            score: candidate.score,
                        },
                    },
                );

                TransactionMatchRecord {
                    external_id: t.transaction_id.clone(),
                    name: t.name.clone(),
                    merchant_name: t.merchant_name.clone(),
                    top_name_matches,
                    top_merchant_matches,
                    accepted,
                }
            })
            .collect();

        TransactionMatchRun { records }
    }
}

// ===== Catalog Matching =====

/// Candidate catalog merchants for one internal company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogMatchRecord {
    pub company_id: String,
    pub company_name: String,
    pub url: Option<String>,
    pub top_domain_matches: Vec<ScoredCandidate>,
    pub top_name_matches: Vec<ScoredCandidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedCatalogMatch {
    pub company_id: String,
    pub company_name: String,
    pub url: Option<String>,
    pub merchant_id: String,
    pub candidate_name: String,
    pub candidate_domain: Option<String>,
    pub matched_on: ListSide,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchError {
    pub company_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogMatchRun {
    pub matches: Vec<CatalogMatchRecord>,
    pub errors: Vec<MatchError>,
}

impl CatalogMatchRun {
    /// Narrows the candidate records down to accepted matches.
    pub fn narrow(&self, threshold: f64) -> Vec<ConfirmedCatalogMatch> {
        self.matches
            .iter()
            .filter_map(|m| {
                let (side, candidate) =
                    select_match(&m.top_domain_matches, &m.top_name_matches, threshold)?;
                Some(ConfirmedCatalogMatch {
                    company_id: m.company_id.clone(),
                    company_name: m.company_name.clone(),
                    url: m.url.clone(),
                    merchant_id: candidate.id.clone(),
                    candidate_name: candidate.label.clone(),
                    candidate_domain: candidate.domain.clone(),
                    matched_on: side,
                    score: candidate.score,
                })
            })
            .collect()
    }

    pub async fn write_side_files(
        &self,
        writer: &SideFileWriter,
        confirmed: &[ConfirmedCatalogMatch],
    ) -> Result<(), AppError> {
        writer.write("catalog_fuzzy_matches.json", &self.matches).await?;
        writer.write("catalog_matches_confirmed.json", &confirmed).await?;
        if !self.errors.is_empty() {
            writer.write("catalog_matches_errors.json", &self.errors).await?;
        }
        Ok(())
    }
}

/// Searches every visible, not yet linked company against the catalog:
/// canonical domain is the primary query, company name the secondary.
pub fn match_catalog(companies: &[Company], catalog: &[CatalogMerchant]) -> CatalogMatchRun {
    let index = SearchIndex::from_catalog(catalog);
    let mut run = CatalogMatchRun::default();

    for company in companies.iter().filter(|c| !c.hidden && !c.has_catalog_link()) {
        let domain = company.url.as_deref().map(canonical_domain).unwrap_or_default();
        let name = clean_name(&company.name);

        if domain.is_empty() && name.is_empty() {
            run.errors.push(MatchError {
                company_id: company.id.clone(),
                message: "company has neither a url nor a usable name".to_string(),
            });
            continue;
        }

        let top_domain_matches = index.search(&domain, SearchKeys::NameAndDomain);
        let top_name_matches = index.search(&name, SearchKeys::NameAndDomain);
        if top_domain_matches.is_empty() && top_name_matches.is_empty() {
            continue;
        }

        run.matches.push(CatalogMatchRecord {
            company_id: company.id.clone(),
            company_name: company.name.clone(),
            url: company.url.clone(),
            top_domain_matches,
            top_name_matches,
        });
    }

    run
}

// ===== Side Files =====

/// Writes pretty-printed JSON audit files for a matching run.
#[derive(Debug, Clone)]
pub struct SideFileWriter {
    dir: PathBuf,
}

impl SideFileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write<T: Serialize + ?Sized>(&self, file_name: &str, value: &T) -> Result<PathBuf, AppError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file_name);
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&path, body).await?;
        tracing::debug!(path = %path.display(), "Side file written");
        Ok(path)
    }
}
