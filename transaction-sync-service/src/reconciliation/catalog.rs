//! Links internal companies to reward-network catalog merchants.

use crate::models::{CatalogLink, CatalogMerchant};
use crate::reconciliation::fuzzy::{match_catalog, SideFileWriter, Thresholds};
use crate::services::metrics::record_error;
use crate::services::repository::CompanyRepository;
use crate::services::reward_network::RewardNetwork;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSyncSummary {
    pub catalog_merchants: u64,
    pub candidates: u64,
    pub linked: u64,
    pub errors: u64,
}

pub struct CatalogSync {
    companies: Arc<dyn CompanyRepository>,
    network: Arc<dyn RewardNetwork>,
    thresholds: Thresholds,
    side_files: SideFileWriter,
}

impl CatalogSync {
    pub fn new(
        companies: Arc<dyn CompanyRepository>,
        network: Arc<dyn RewardNetwork>,
        thresholds: Thresholds,
        side_files: SideFileWriter,
    ) -> Self {
        Self {
            companies,
            network,
            thresholds,
            side_files,
        }
    }

    /// Fetches the catalog, matches it with the restrictive threshold and
    /// links every accepted company.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<CatalogSyncSummary, AppError> {
        let catalog = self.network.fetch_merchants().await?;
        let companies = self.companies.all_companies().await?;

        let run = match_catalog(&companies, &catalog);
        let confirmed = run.narrow(self.thresholds.restrictive);
        if let Err(e) = run.write_side_files(&self.side_files, &confirmed).await {
            warn!(error = %e, "Failed to write catalog side files");
        }

        let merchants: HashMap<&str, &CatalogMerchant> =
            catalog.iter().map(|m| (m.id.as_str(), m)).collect();
        let mut summary = CatalogSyncSummary {
            catalog_merchants: catalog.len() as u64,
            candidates: run.matches.len() as u64,
            errors: run.errors.len() as u64,
            ..CatalogSyncSummary::default()
        };

        for accepted in &confirmed {
            let Some(merchant) = merchants.get(accepted.merchant_id.as_str()) else {
                continue;
            };
            let link = CatalogLink {
                merchant_id: merchant.id.clone(),
                name: merchant.name.clone(),
                max_rate: merchant.max_rate(),
            };
            match self
                .companies
                .link_catalog_merchant(&accepted.company_id, &link)
                .await
            {
                Ok(()) => summary.linked += 1,
                Err(e) => {
                    summary.errors += 1;
                    record_error("link_catalog_merchant");
                    warn!(error = %e, company_id = %accepted.company_id, "Failed to link catalog merchant");
                }
            }
        }

        info!(
            catalog_merchants = summary.catalog_merchants,
            candidates = summary.candidates,
            linked = summary.linked,
            "Catalog sync complete"
        );
        Ok(summary)
    }
}
