//! Reconciliation pipeline: deduplication, merchant resolution, refund
//! association, reward publishing and callback verification.

pub mod catalog;
pub mod fingerprint;
pub mod fuzzy;
pub mod ingest;
pub mod match_cache;
pub mod normalize;
pub mod refunds;
pub mod rewards;
pub mod webhook;

pub use catalog::{CatalogSync, CatalogSyncSummary};
pub use fuzzy::{FuzzyMatcher, SideFileWriter, Thresholds};
pub use ingest::{Ingestor, SyncWindow};
pub use match_cache::{MatchCache, Resolution};
pub use refunds::{AssociationSummary, RefundAssociator, UserAssociation};
pub use rewards::{PublishSummary, RewardPublisher};
pub use webhook::{SignatureEncoding, WebhookEnvironment, WebhookError, WebhookVerifier};
