//! Bank-data feed client.
//!
//! Pulls a materialized window of transactions for one access credential,
//! following the feed's offset pagination.

use crate::models::FeedTransaction;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use thiserror::Error;
use tracing::instrument;

/// Page size requested from the feed.
pub const PAGE_SIZE: u32 = 500;

/// Feed error codes meaning the credential must be re-linked.
const REVOKED_CODES: [&str; 2] = ["INVALID_ACCESS_TOKEN", "ITEM_LOGIN_REQUIRED"];

#[derive(Debug, Error)]
pub enum FeedError {
    /// The credential is no longer accepted; its cards must be unlinked.
    #[error("Feed credential revoked: {0}")]
    CredentialRevoked(String),

    #[error("Feed unavailable: {0}")]
    Unavailable(String),
}

impl From<FeedError> for AppError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::CredentialRevoked(code) => AppError::Unauthorized(anyhow::anyhow!(code)),
            FeedError::Unavailable(message) => AppError::BadGateway(message),
        }
    }
}

#[async_trait]
pub trait TransactionFeed: Send + Sync {
    async fn fetch(
        &self,
        access_token: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<FeedTransaction>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub client_id: String,
    pub secret: Secret<String>,
}

#[derive(Debug, Serialize)]
struct PageOptions {
    count: u32,
    offset: u32,
}

#[derive(Debug, Serialize)]
struct TransactionsRequest<'a> {
    client_id: &'a str,
    secret: &'a str,
    access_token: &'a str,
    start_date: String,
    end_date: String,
    options: PageOptions,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    transactions: Vec<FeedTransaction>,
    total_transactions: u32,
}

#[derive(Debug, Deserialize)]
struct FeedErrorBody {
    error_code: String,
    #[serde(default)]
    error_message: Option<String>,
}

/// HTTP feed client.
#[derive(Clone)]
pub struct HttpFeedClient {
    client: Client,
    config: FeedConfig,
}

impl HttpFeedClient {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn fetch_page(
        &self,
        access_token: &str,
        start: NaiveDate,
        end: NaiveDate,
        offset: u32,
    ) -> Result<TransactionsResponse, FeedError> {
        let request = TransactionsRequest {
            client_id: &self.config.client_id,
            secret: self.config.secret.expose_secret(),
            access_token,
            start_date: start.format("%Y-%m-%d").to_string(),
            end_date: end.format("%Y-%m-%d").to_string(),
            options: PageOptions {
                count: PAGE_SIZE,
                offset,
            },
        };

        let url = format!("{}/transactions/get", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| FeedError::Unavailable(format!("malformed feed response: {e}")));
        }

        match serde_json::from_str::<FeedErrorBody>(&body) {
            Ok(error) if REVOKED_CODES.contains(&error.error_code.as_str()) => {
                Err(FeedError::CredentialRevoked(error.error_code))
            }
            Ok(error) => Err(FeedError::Unavailable(format!(
                "{} ({}): {}",
                error.error_code,
                status,
                error.error_message.unwrap_or_default()
            ))),
            Err(_) => Err(FeedError::Unavailable(format!("{status}: {body}"))),
        }
    }
}

#[async_trait]
impl TransactionFeed for HttpFeedClient {
    #[instrument(skip(self, access_token))]
    async fn fetch(
        &self,
        access_token: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<FeedTransaction>, FeedError> {
        let first = self.fetch_page(access_token, start, end, 0).await?;
        let total = first.total_transactions as usize;
        let mut transactions = first.transactions;

        while transactions.len() < total {
            let page = self
                .fetch_page(access_token, start, end, transactions.len() as u32)
                .await?;
            if page.transactions.is_empty() {
                break;
            }
            transactions.extend(page.transactions);
        }

        tracing::debug!(count = transactions.len(), total, "Feed window fetched");
        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpFeedClient {
        HttpFeedClient::new(FeedConfig {
            base_url: server.uri(),
            client_id: "client".to_string(),
            secret: Secret::new("secret".to_string()),
        })
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[tokio::test]
    async fn revoked_credential_is_reported_separately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transactions/get"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error_code": "ITEM_LOGIN_REQUIRED",
                "error_message": "login required"
            })))
            .mount(&server)
            .await;

        let result = client(&server).fetch("token", day(1), day(30)).await;
        assert!(matches!(result, Err(FeedError::CredentialRevoked(code)) if code == "ITEM_LOGIN_REQUIRED"));
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let result = client(&server).fetch("token", day(1), day(30)).await;
        assert!(matches!(result, Err(FeedError::Unavailable(_))));
    }

    #[tokio::test]
    async fn single_page_window_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transactions/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total_transactions": 1,
                "transactions": [{
                    "transaction_id": "t-1",
                    "account_id": "acc-1",
                    "amount": 12.5,
                    "date": "2024-06-03",
                    "name": "COFFEE SHOP 123",
                    "merchant_name": "Coffee Shop",
                    "pending": false,
                    "category": ["Food and Drink", "Coffee Shop"]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transactions = client(&server).fetch("token", day(1), day(30)).await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].merchant_name.as_deref(), Some("Coffee Shop"));
        assert_eq!(transactions[0].date, day(3));
    }
}
