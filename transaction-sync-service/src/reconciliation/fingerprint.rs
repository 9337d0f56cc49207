//! Duplicate detection for incoming transactions.
//!
//! Two records share a fingerprint when amount, date and company are equal
//! and either the display name or the merchant name matches. The card is
//! not part of the fingerprint.

use crate::models::Transaction;

/// Display names equal, or merchant names equal. Two absent merchant
/// names are equal.
fn names_match(a: &Transaction, b: &Transaction) -> bool {
    a.display_name() == b.display_name() || a.merchant_name() == b.merchant_name()
}

/// Symmetric duplicate check between two transactions.
pub fn same_fingerprint(a: &Transaction, b: &Transaction) -> bool {
    a.amount_cents == b.amount_cents
        && a.date == b.date
        && a.company_id == b.company_id
        && names_match(a, b)
}

pub fn is_duplicate(candidate: &Transaction, existing: &[Transaction]) -> bool {
    existing.iter().any(|e| same_fingerprint(candidate, e))
}

/// Splits candidates into survivors and duplicates. A candidate matching
/// an earlier survivor of the same batch is also a duplicate.
pub fn filter_duplicates(
    candidates: Vec<Transaction>,
    existing: &[Transaction],
) -> (Vec<Transaction>, Vec<Transaction>) {
    let mut survivors: Vec<Transaction> = Vec::with_capacity(candidates.len());
    let mut duplicates = Vec::new();

    for candidate in candidates {
        if is_duplicate(&candidate, existing) || is_duplicate(&candidate, &survivors) {
            duplicates.push(candidate);
        } else {
            survivors.push(candidate);
        }
    }

    (survivors, duplicates)
}
