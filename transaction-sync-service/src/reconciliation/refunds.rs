//! Refund and reversal association.
//!
//! Each unassociated negative transaction looks back over a window ending
//! on its own date for the oldest positive transaction with the same
//! absolute amount, company, card and sector that is not reversed yet.

use crate::services::metrics::{record_error, record_refund_association};
use crate::models::Transaction;
use crate::services::repository::TransactionRepository;
use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const DEFAULT_WINDOW_DAYS: i64 = 30;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssociationSummary {
    pub per_user: BTreeMap<String, u64>,
    pub total: u64,
    pub errors: u64,
}

/// Per-user outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserAssociation {
    pub linked: u64,
    pub errors: u64,
}

pub struct RefundAssociator {
    transactions: Arc<dyn TransactionRepository>,
    window_days: i64,
}

impl RefundAssociator {
    pub fn new(transactions: Arc<dyn TransactionRepository>, window_days: i64) -> Self {
        Self {
            transactions,
            window_days,
        }
    }

    fn window_start(&self, end: DateTime) -> DateTime {
        DateTime::from_millis(end.timestamp_millis() - self.window_days * DAY_MILLIS)
    }

    /// Links reversal pairs for one user. A storage failure on one
    /// negative is counted and the sweep moves on to the next.
    #[instrument(skip(self))]
    pub async fn associate_user(&self, user_id: &str) -> Result<UserAssociation, AppError> {
        let negatives = self.transactions.unassociated_negatives(user_id).await?;
        let mut outcome = UserAssociation::default();

        for negative in &negatives {
            match self.associate_negative(negative).await {
                Ok(true) => {
                    outcome.linked += 1;
                    record_refund_association("linked");
                }
                Ok(false) => {}
                Err(e) => {
                    outcome.errors += 1;
                    record_error("associate_negative");
                    warn!(error = %e, negative_id = %negative.id, "Refund association failed for transaction");
                }
            }
        }

        Ok(outcome)
    }

    async fn associate_negative(&self, negative: &Transaction) -> Result<bool, AppError> {
        let start = self.window_start(negative.date);
        let Some(positive) = self
            .transactions
            .find_reversal_candidate(negative, start)
            .await?
        else {
            record_refund_association("unresolved");
            return Ok(false);
        };

        let linked = self
            .transactions
            .link_reversal(&negative.id, &positive.id)
            .await?;
        if linked {
            tracing::debug!(negative_id = %negative.id, positive_id = %positive.id, "Reversal linked");
        } else {
            record_refund_association("raced");
        }
        Ok(linked)
    }

    /// Sweeps every user holding negative transactions. A failing user is
    /// counted and skipped.
    #[instrument(skip(self))]
    pub async fn associate_all(&self) -> Result<AssociationSummary, AppError> {
        let users = self.transactions.users_with_negative_transactions().await?;
        let mut summary = AssociationSummary::default();

        for user_id in users {
            match self.associate_user(&user_id).await {
                Ok(outcome) => {
                    summary.total += outcome.linked;
                    summary.errors += outcome.errors;
                    if outcome.linked > 0 {
                        summary.per_user.insert(user_id, outcome.linked);
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    record_error("associate_user");
                    warn!(error = %e, user_id = %user_id, "Refund association failed for user");
                }
            }
        }

        info!(
            total = summary.total,
            users = summary.per_user.len(),
            errors = summary.errors,
            "Refund association complete"
        );
        Ok(summary)
    }
}
