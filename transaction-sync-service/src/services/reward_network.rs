//! Card-linked reward network client.

use crate::models::CatalogMerchant;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use tracing::instrument;

/// Network-side transaction status for a settled purchase.
pub const SETTLED: &str = "SETTLED";

/// One transaction as submitted to the reward network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RewardTransactionRecord {
    /// Stable idempotency key, reused on resubmission.
    pub transaction_id: String,
    pub referring_partner_user_id: String,
    /// Cents.
    pub amount: i64,
    pub status: String,
    pub currency: String,
    pub description: String,
    pub merchant_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_date: Option<String>,
    #[serde(rename = "cardBIN", skip_serializing_if = "Option::is_none")]
    pub card_bin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_last_four: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueueTransactionsRequest<'a> {
    transactions: &'a [RewardTransactionRecord],
}

#[derive(Debug, Deserialize)]
struct MerchantsPage {
    #[serde(default)]
    merchants: Vec<CatalogMerchant>,
    #[serde(default)]
    total_pages: Option<u32>,
}

#[async_trait]
pub trait RewardNetwork: Send + Sync {
    /// Submits at most one batch; any non-success response is an error.
    async fn submit_batch(&self, records: &[RewardTransactionRecord]) -> Result<(), AppError>;

    /// Full merchant catalog advertised by the network.
    async fn fetch_merchants(&self) -> Result<Vec<CatalogMerchant>, AppError>;
}

#[derive(Debug, Clone)]
pub struct RewardNetworkConfig {
    pub base_url: String,
    pub api_key: Secret<String>,
}

#[derive(Clone)]
pub struct RewardNetworkClient {
    client: Client,
    config: RewardNetworkConfig,
}

impl RewardNetworkClient {
    pub fn new(config: RewardNetworkConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.base_url.is_empty() && !self.config.api_key.expose_secret().is_empty()
    }

    fn ensure_configured(&self) -> Result<(), AppError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(AppError::ConfigError(anyhow::anyhow!(
                "reward network credentials not configured"
            )))
        }
    }
}

#[async_trait]
impl RewardNetwork for RewardNetworkClient {
    #[instrument(skip(self, records), fields(batch_size = records.len()))]
    async fn submit_batch(&self, records: &[RewardTransactionRecord]) -> Result<(), AppError> {
        self.ensure_configured()?;

        let url = format!("{}/transactions/incoming/", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.config.api_key.expose_secret())
            .json(&QueueTransactionsRequest { transactions: records })
            .send()
            .await
            .map_err(|e| AppError::BadGateway(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(status = %status, "Reward batch accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "Reward batch rejected");
        Err(AppError::BadGateway(format!(
            "reward network rejected batch: {status} {body}"
        )))
    }

    #[instrument(skip(self))]
    async fn fetch_merchants(&self) -> Result<Vec<CatalogMerchant>, AppError> {
        self.ensure_configured()?;

        let url = format!("{}/rewards/merchant/", self.config.base_url);
        let mut merchants = Vec::new();
        let mut page = 1u32;

        loop {
            let response = self
                .client
                .get(&url)
                .header("Authorization", self.config.api_key.expose_secret())
                .query(&[("page", page)])
                .send()
                .await
                .map_err(|e| AppError::BadGateway(e.to_string()))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| AppError::BadGateway(e.to_string()))?;
            if !status.is_success() {
                return Err(AppError::BadGateway(format!(
                    "failed to fetch reward merchants: {status} {body}"
                )));
            }

            let parsed: MerchantsPage = serde_json::from_str(&body)?;
            let last_page = parsed.total_pages.unwrap_or(1);
            let empty = parsed.merchants.is_empty();
            merchants.extend(parsed.merchants);

            if empty || page >= last_page {
                break;
            }
            page += 1;
        }

        tracing::info!(count = merchants.len(), "Reward merchant catalog fetched");
        Ok(merchants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record() -> RewardTransactionRecord {
        RewardTransactionRecord {
            transaction_id: "ext-1".to_string(),
            referring_partner_user_id: "user-1".to_string(),
            amount: 1250,
            status: SETTLED.to_string(),
            currency: "USD".to_string(),
            description: "Coffee Shop".to_string(),
            merchant_name: "Coffee Shop".to_string(),
            mcc: None,
            settled_date: Some("2024-06-03T00:00:00Z".to_string()),
            authorization_date: Some("2024-06-03T00:00:00Z".to_string()),
            card_bin: Some("411111".to_string()),
            card_last_four: Some("1111".to_string()),
        }
    }

    fn client(server: &MockServer) -> RewardNetworkClient {
        RewardNetworkClient::new(RewardNetworkConfig {
            base_url: server.uri(),
            api_key: Secret::new("key".to_string()),
        })
    }

    #[test]
    fn record_serializes_network_field_names() {
        let value = serde_json::to_value(record()).unwrap();
        assert_eq!(value["transactionId"], "ext-1");
        assert_eq!(value["referringPartnerUserId"], "user-1");
        assert_eq!(value["cardBIN"], "411111");
        assert_eq!(value["cardLastFour"], "1111");
        assert!(value.get("mcc").is_none());
    }

    #[test]
    fn unconfigured_client_is_detected() {
        let client = RewardNetworkClient::new(RewardNetworkConfig {
            base_url: String::new(),
            api_key: Secret::new(String::new()),
        });
        assert!(!client.is_configured());
    }

    #[tokio::test]
    async fn submit_batch_posts_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transactions/incoming/"))
            .and(header("Authorization", "key"))
            .and(body_partial_json(json!({ "transactions": [{ "transactionId": "ext-1" }] })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).submit_batch(&[record()]).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_batch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad record"))
            .mount(&server)
            .await;

        let err = client(&server).submit_batch(&[record()]).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn fetch_merchants_follows_pages() {
        let server = MockServer::start().await;
        let merchant = |id: &str| {
            json!({ "_id": id, "name": format!("Merchant {id}"), "websiteURL": "https://m.com", "offers": [] })
        };
        Mock::given(method("GET"))
            .and(path("/rewards/merchant/"))
            .and(wiremock::matchers::query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "merchants": [merchant("m1")],
                "total_pages": 2
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rewards/merchant/"))
            .and(wiremock::matchers::query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "merchants": [merchant("m2")],
                "total_pages": 2
            })))
            .mount(&server)
            .await;

        let merchants = client(&server).fetch_merchants().await.unwrap();
        let ids: Vec<&str> = merchants.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }
}
