//! Application startup and lifecycle management.

use crate::config::{StoreBackend, SyncConfig};
use crate::services::{
    HttpFeedClient, MemoryStore, MongoStore, Repositories, RewardNetworkClient,
};
use crate::workers::SyncWorker;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Application {
    worker: SyncWorker,
    run_once: bool,
}

/// Builds the repositories for the configured backend.
pub async fn build_repositories(config: &SyncConfig) -> Result<Repositories, AppError> {
    match config.store.backend {
        StoreBackend::Mongo => {
            let store =
                MongoStore::connect(config.store.uri.expose_secret(), &config.store.database).await?;
            store.init_indexes().await?;
            Ok(Repositories::from_store(Arc::new(store)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, data is lost on shutdown");
            Ok(Repositories::from_store(Arc::new(MemoryStore::new())))
        }
    }
}

impl Application {
    pub async fn build(config: SyncConfig) -> Result<Self, AppError> {
        let repos = build_repositories(&config).await?;

        let feed = Arc::new(HttpFeedClient::new(config.feed.clone()));
        let network = RewardNetworkClient::new(config.reward_network.clone());
        if !network.is_configured() {
            tracing::warn!("Reward network not configured, reward batches will fail");
        }

        let worker = SyncWorker::new(
            repos,
            feed,
            Arc::new(network),
            &config.matching,
            config.publisher.clone(),
            config.schedule.clone(),
        );

        Ok(Self {
            worker,
            run_once: config.schedule.run_once,
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.worker.shutdown_token()
    }

    pub async fn run_until_stopped(self) -> Result<(), AppError> {
        if self.run_once {
            self.worker.run_once("manual").await?;
            return Ok(());
        }

        self.worker.start().await;
        Ok(())
    }
}
