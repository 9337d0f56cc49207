//! Configuration module for transaction-sync-service.

use crate::reconciliation::fuzzy::Thresholds;
use crate::reconciliation::webhook::SignatureEncoding;
use crate::services::{FeedConfig, RewardNetworkConfig};
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreConfig,
    pub feed: FeedConfig,
    pub reward_network: RewardNetworkConfig,
    pub webhook: WebhookConfig,
    pub publisher: PublisherConfig,
    pub matching: MatchingConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Mongo,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StoreBackend::Mongo),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub uri: Secret<String>,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub issuer_secret: Option<Secret<String>>,
    pub aggregator_secret: Option<Secret<String>>,
    pub encoding: SignatureEncoding,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
    /// Card streams published at the same time.
    pub max_concurrent_cards: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_interval: Duration::from_millis(1000),
            max_concurrent_cards: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub thresholds: Thresholds,
    pub side_file_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub lookback_days: i64,
    pub association_window_days: i64,
    pub max_concurrent_groups: usize,
    pub catalog_sync: bool,
    pub run_once: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 60 * 60),
            lookback_days: 30,
            association_window_days: 30,
            max_concurrent_groups: 4,
            catalog_sync: false,
            run_once: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = common.is_production();

        let backend: StoreBackend = get_env("STORE_BACKEND", Some("mongo"), false)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let mongo_uri = match backend {
            StoreBackend::Mongo => get_env("MONGODB_URI", Some("mongodb://localhost:27017"), is_prod)?,
            StoreBackend::Memory => String::new(),
        };

        let encoding: SignatureEncoding = get_env("WEBHOOK_SIGNATURE_ENCODING", Some("base64"), false)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let defaults = Thresholds::default();
        let publisher = PublisherConfig::default();
        let schedule = ScheduleConfig::default();

        Ok(Self {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "transaction-sync-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| common.log_level.clone()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            store: StoreConfig {
                backend,
                uri: Secret::new(mongo_uri),
                database: get_env("MONGODB_DATABASE", Some("transaction_sync_db"), false)?,
            },
            feed: FeedConfig {
                base_url: get_env("FEED_BASE_URL", Some("https://sandbox.plaid.com"), is_prod)?,
                client_id: get_env("FEED_CLIENT_ID", Some(""), is_prod)?,
                secret: Secret::new(get_env("FEED_SECRET", Some(""), is_prod)?),
            },
            reward_network: RewardNetworkConfig {
                base_url: get_env("REWARD_NETWORK_URL", Some(""), is_prod)?,
                api_key: Secret::new(get_env("REWARD_NETWORK_API_KEY", Some(""), is_prod)?),
            },
            webhook: WebhookConfig {
                issuer_secret: env::var("WEBHOOK_ISSUER_SECRET").ok().map(Secret::new),
                aggregator_secret: env::var("WEBHOOK_AGGREGATOR_SECRET").ok().map(Secret::new),
                encoding,
            },
            publisher: PublisherConfig {
                batch_size: parse_env("REWARD_BATCH_SIZE", publisher.batch_size)?,
                batch_interval: Duration::from_millis(parse_env(
                    "REWARD_BATCH_INTERVAL_MS",
                    publisher.batch_interval.as_millis() as u64,
                )?),
                max_concurrent_cards: parse_env(
                    "REWARD_MAX_CONCURRENT_CARDS",
                    publisher.max_concurrent_cards,
                )?,
            },
            matching: MatchingConfig {
                thresholds: Thresholds {
                    default: parse_env("MATCH_THRESHOLD_DEFAULT", defaults.default)?,
                    restrictive: parse_env("MATCH_THRESHOLD_RESTRICTIVE", defaults.restrictive)?,
                },
                side_file_dir: PathBuf::from(get_env("SIDE_FILE_DIR", Some("match-reports"), false)?),
            },
            schedule: ScheduleConfig {
                interval: Duration::from_secs(parse_env(
                    "SYNC_INTERVAL_SECS",
                    schedule.interval.as_secs(),
                )?),
                lookback_days: parse_env("SYNC_LOOKBACK_DAYS", schedule.lookback_days)?,
                association_window_days: parse_env(
                    "ASSOCIATION_WINDOW_DAYS",
                    schedule.association_window_days,
                )?,
                max_concurrent_groups: parse_env(
                    "SYNC_MAX_CONCURRENT_GROUPS",
                    schedule.max_concurrent_groups,
                )?,
                catalog_sync: parse_env("CATALOG_SYNC_ENABLED", schedule.catalog_sync)?,
                run_once: parse_env("SYNC_RUN_ONCE", schedule.run_once)?,
            },
            common,
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e))),
        Err(_) => Ok(default),
    }
}
