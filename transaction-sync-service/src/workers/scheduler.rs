//! Periodic sync passes: catalog link, ingestion, refund association and
//! reward publishing, stopped through a cancellation token.

use crate::config::{MatchingConfig, PublisherConfig, ScheduleConfig};
use crate::models::SyncRunSummary;
use crate::reconciliation::{
    CatalogSync, Ingestor, RefundAssociator, RewardPublisher, SideFileWriter, SyncWindow,
};
use crate::services::metrics::record_error;
use crate::services::{Repositories, RewardNetwork, TransactionFeed};
use mongodb::bson::DateTime;
use service_core::error::AppError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runs full sync passes on a fixed interval until cancelled.
pub struct SyncWorker {
    repos: Repositories,
    ingestor: Ingestor,
    associator: RefundAssociator,
    publisher: RewardPublisher,
    catalog: Option<CatalogSync>,
    schedule: ScheduleConfig,
    shutdown_token: CancellationToken,
}

impl SyncWorker {
    pub fn new(
        repos: Repositories,
        feed: Arc<dyn TransactionFeed>,
        network: Arc<dyn RewardNetwork>,
        matching: &MatchingConfig,
        publisher: PublisherConfig,
        schedule: ScheduleConfig,
    ) -> Self {
        let side_files = SideFileWriter::new(matching.side_file_dir.clone());
        let catalog = schedule.catalog_sync.then(|| {
            CatalogSync::new(
                repos.companies.clone(),
                network.clone(),
                matching.thresholds,
                side_files.clone(),
            )
        });

        Self {
            ingestor: Ingestor::new(repos.clone(), feed, matching.thresholds, side_files),
            associator: RefundAssociator::new(
                repos.transactions.clone(),
                schedule.association_window_days,
            ),
            publisher: RewardPublisher::new(repos.clone(), network, publisher),
            catalog,
            repos,
            schedule,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// One complete pass: catalog sync (when enabled), ingestion, refund
    /// association, reward publishing. The summary is persisted at the end.
    pub async fn run_once(&self, source: &str) -> Result<SyncRunSummary, AppError> {
        let started_at = DateTime::now();
        tracing::info!(source, "Starting sync pass");

        if let Some(catalog) = &self.catalog {
            if let Err(e) = catalog.run().await {
                record_error("catalog_sync");
                tracing::warn!(error = %e, "Catalog sync failed, continuing with ingestion");
            }
        }

        let window = SyncWindow::ending_today(self.schedule.lookback_days);
        let ingest = self
            .ingestor
            .ingest_all(window, self.schedule.max_concurrent_groups)
            .await?;

        let associations = match self.associator.associate_all().await {
            Ok(summary) => summary.total,
            Err(e) => {
                record_error("associate_refunds");
                tracing::warn!(error = %e, "Refund association failed");
                0
            }
        };

        let published = self.publisher.publish_all(&self.shutdown_token).await?;

        let summary = SyncRunSummary {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            ingest,
            associations,
            reward_batches_accepted: published.batches_accepted,
            reward_batches_failed: published.batches_failed,
            started_at,
            finished_at: DateTime::now(),
        };
        self.repos.summaries.save_summary(&summary).await?;

        tracing::info!(
            source,
            saved = summary.ingest.saved,
            associations = summary.associations,
            reward_batches_accepted = summary.reward_batches_accepted,
            reward_batches_failed = summary.reward_batches_failed,
            "Sync pass complete"
        );
        Ok(summary)
    }

    /// Ticks immediately, then every `schedule.interval`, until the
    /// shutdown token fires.
    pub async fn start(self) {
        let mut ticker = tokio::time::interval(self.schedule.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Sync worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once("scheduled").await {
                        record_error("sync_pass");
                        tracing::error!(error = %e, "Sync pass failed");
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        tracing::info!("Initiating sync worker shutdown");
        self.shutdown_token.cancel();
    }
}
