//! Inbound reward-network callback verification.
//!
//! The signature is an HMAC-SHA256 over the exact raw body, keyed with the
//! secret of the environment that sent it. Every failure surfaces as the
//! same opaque error.

use crate::config::WebhookConfig;
use crate::models::EarnedRewardEvent;
use crate::services::metrics::record_webhook_verification;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::utils::{constant_time_eq, hmac_sha256};
use std::str::FromStr;
use thiserror::Error;

const HEX_PREFIX: &str = "sha256=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("Invalid signature")]
    InvalidSignature,

    /// The signature was valid but the body is not an earned-reward event.
    #[error("Invalid payload")]
    InvalidPayload,
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidSignature => AppError::InvalidSignature,
            WebhookError::InvalidPayload => {
                AppError::BadRequest(anyhow::anyhow!("invalid webhook payload"))
            }
        }
    }
}

/// Wire encoding of the signature header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureEncoding {
    #[default]
    Base64,
    /// Hex digits, optionally prefixed with `sha256=`.
    Hex,
}

impl FromStr for SignatureEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "base64" => Ok(SignatureEncoding::Base64),
            "hex" => Ok(SignatureEncoding::Hex),
            _ => Err(format!("Invalid signature encoding: {}", s)),
        }
    }
}

impl SignatureEncoding {
    fn decode(&self, header: &str) -> Option<Vec<u8>> {
        let header = header.trim();
        match self {
            SignatureEncoding::Base64 => STANDARD.decode(header).ok(),
            SignatureEncoding::Hex => {
                let digits = header.strip_prefix(HEX_PREFIX).unwrap_or(header);
                hex::decode(digits).ok()
            }
        }
    }

    pub fn encode(&self, digest: &[u8]) -> String {
        match self {
            SignatureEncoding::Base64 => STANDARD.encode(digest),
            SignatureEncoding::Hex => hex::encode(digest),
        }
    }
}

/// Which side of the network signed the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEnvironment {
    Issuer,
    Aggregator,
}

impl WebhookEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEnvironment::Issuer => "issuer",
            WebhookEnvironment::Aggregator => "aggregator",
        }
    }
}

#[derive(Clone)]
pub struct WebhookVerifier {
    issuer_secret: Option<Secret<String>>,
    aggregator_secret: Option<Secret<String>>,
    encoding: SignatureEncoding,
}

impl WebhookVerifier {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            issuer_secret: config.issuer_secret.clone(),
            aggregator_secret: config.aggregator_secret.clone(),
            encoding: config.encoding,
        }
    }

    fn secret(&self, environment: WebhookEnvironment) -> Option<&str> {
        let secret = match environment {
            WebhookEnvironment::Issuer => self.issuer_secret.as_ref(),
            WebhookEnvironment::Aggregator => self.aggregator_secret.as_ref(),
        };
        secret
            .map(|s| s.expose_secret().as_str())
            .filter(|s| !s.is_empty())
    }

    fn check(
        &self,
        environment: WebhookEnvironment,
        body: &[u8],
        signature: Option<&str>,
    ) -> Option<()> {
        let secret = self.secret(environment)?;
        let provided = self.encoding.decode(signature?)?;
        let expected = hmac_sha256(secret.as_bytes(), body).ok()?;
        constant_time_eq(&expected, &provided).then_some(())
    }

    /// Verifies `signature` against the raw `body`.
    pub fn verify(
        &self,
        environment: WebhookEnvironment,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<(), WebhookError> {
        match self.check(environment, body, signature) {
            Some(()) => {
                record_webhook_verification(environment.as_str(), "valid");
                Ok(())
            }
            None => {
                record_webhook_verification(environment.as_str(), "invalid");
                tracing::warn!(environment = environment.as_str(), "Webhook signature rejected");
                Err(WebhookError::InvalidSignature)
            }
        }
    }

    /// Verifies the body and only then parses it.
    pub fn verify_earned_reward(
        &self,
        environment: WebhookEnvironment,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<EarnedRewardEvent, WebhookError> {
        self.verify(environment, body, signature)?;
        serde_json::from_slice(body).map_err(|e| {
            tracing::warn!(error = %e, "Verified webhook body is not an earned reward event");
            WebhookError::InvalidPayload
        })
    }
}
