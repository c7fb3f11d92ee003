//! Forwarding of mutations to the active processor
//!
//! A follower sends the already-normalized command verbatim to the leader and
//! relays the leader's answer. Transaction ids are fixed before forwarding, so
//! a timed-out request can be retried without double charging.

use crate::types::{BulkResponse, CommandEnvelope, ErrorBody};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Path of the apply endpoint on every instance
pub const APPLY_PATH: &str = "/api/accounting/apply";

/// Transport towards the active processor
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Execute `envelope` on the instance at `address`
    async fn forward(&self, address: &str, envelope: &CommandEnvelope) -> Result<Vec<bool>>;
}

/// JSON-over-HTTP forwarder
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    /// Create forwarder with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address.trim_end_matches('/'), APPLY_PATH)
        } else {
            format!("http://{}{}", address, APPLY_PATH)
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, address: &str, envelope: &CommandEnvelope) -> Result<Vec<bool>> {
        let url = Self::url(address);
        tracing::debug!(%url, command = envelope.command.name(), "Forwarding command");

        let response = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(%url, error = %e, "Failed to reach active processor");
                Error::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => Error::from_kind(&body.error.kind, body.error.message),
                Err(_) if status.is_server_error() => Error::LeaderUnreachable(format!(
                    "Active processor answered {}: {}",
                    status, text
                )),
                Err(_) => Error::Forwarding(format!("Active processor answered {}: {}", status, text)),
            });
        }

        let body = response
            .json::<BulkResponse>()
            .await
            .map_err(|e| Error::Forwarding(format!("Failed to parse response: {}", e)))?;

        if body.responses.len() != envelope.command.len() {
            return Err(Error::Forwarding(format!(
                "Expected {} outcomes, got {}",
                envelope.command.len(),
                body.responses.len()
            )));
        }
        Ok(body.responses)
    }
}
