//! Dispatch boundary toward the remote persistence collaborator.

use std::env;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use progress_core::model::ProgressMutation;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

/// Outcome classification for one dispatch attempt.
///
/// Retryable failures go back through the queue's backoff; terminal
/// failures move the entry straight to the failed bucket.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("dispatch timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("server rejected mutation: {0}")]
    Rejected(String),
}

impl DispatchError {
    /// Whether the queue should retry after this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::Rejected(_))
    }
}

/// Server acknowledgement for an accepted mutation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchAck {
    /// Canonical timestamp assigned by the server, when it returns one.
    pub canonical_updated_at: Option<DateTime<Utc>>,
}

/// Transport capability the sync queue dispatches through.
#[async_trait]
pub trait ProgressTransport: Send + Sync {
    /// Dispatch one mutation and await the server's verdict.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Rejected` for terminal validation failures
    /// and `Timeout`/`Network` for retryable ones.
    async fn dispatch(&self, mutation: &ProgressMutation) -> Result<DispatchAck, DispatchError>;
}

/// HTTP transport posting mutations as JSON to a REST endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Build from `PROGRESS_SYNC_ENDPOINT`, if set and non-empty.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let endpoint = env::var("PROGRESS_SYNC_ENDPOINT").ok()?;
        if endpoint.trim().is_empty() {
            return None;
        }
        Some(Self::new(endpoint))
    }
}

#[async_trait]
impl ProgressTransport for HttpTransport {
    async fn dispatch(&self, mutation: &ProgressMutation) -> Result<DispatchAck, DispatchError> {
        let url = format!("{}/progress", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(url)
            .json(mutation)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout
                } else {
                    DispatchError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            // An empty or non-JSON body is a plain acknowledgement.
            let ack = response.json::<DispatchAck>().await.unwrap_or_default();
            return Ok(ack);
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected(format!("{status}: {body}")));
        }

        Err(DispatchError::Network(format!("http {status}")))
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
