//! Remote upsert endpoint.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use url::Url;

use crate::config::RemoteConfig;
use crate::store::EntityKind;

/// Why a single push did not go through. Every variant leaves the record
/// dirty for the next pass.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
  #[error("network error: {0}")]
  Network(String),

  #[error("remote rejected record with status {0}")]
  Rejected(u16),

  #[error("malformed response: {0}")]
  Malformed(String),

  #[error("{0} records are not synced")]
  Unsupported(EntityKind),
}

/// Endpoint accepting idempotent upserts keyed by primary identity.
#[async_trait]
pub trait SyncRemote: Send + Sync + 'static {
  async fn upsert(
    &self,
    kind: EntityKind,
    key: &str,
    payload: &serde_json::Value,
  ) -> Result<(), RemoteError>;
}

/// JSON-over-HTTP remote
pub struct HttpRemote {
  client: reqwest::Client,
  wells_url: Url,
  duplicates_url: Url,
  health_url: Url,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote url '{}': {}", config.url, e))?;
    let join = |path: &str| {
      base
        .join(path)
        .map_err(|e| eyre!("Invalid remote endpoint '{}': {}", path, e))
    };

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      wells_url: join(&config.wells_endpoint)?,
      duplicates_url: join(&config.duplicates_endpoint)?,
      health_url: join(&config.health_endpoint)?,
    })
  }

  /// Whether the remote answers at all. Any HTTP status counts as reachable.
  pub async fn health_check(&self) -> bool {
    match self.client.get(self.health_url.clone()).send().await {
      Ok(_) => true,
      Err(e) => {
        tracing::trace!(error = %e, "remote unreachable");
        false
      }
    }
  }
}

#[async_trait]
impl SyncRemote for HttpRemote {
  async fn upsert(
    &self,
    kind: EntityKind,
    key: &str,
    payload: &serde_json::Value,
  ) -> Result<(), RemoteError> {
    let url = match kind {
      EntityKind::Well => &self.wells_url,
      EntityKind::Duplicate => &self.duplicates_url,
      other => return Err(RemoteError::Unsupported(other)),
    };

    let response = self
      .client
      .post(url.clone())
      .json(payload)
      .send()
      .await
      .map_err(|e| {
        if e.is_decode() || e.is_body() {
          RemoteError::Malformed(e.to_string())
        } else {
          RemoteError::Network(e.to_string())
        }
      })?;

    let status = response.status();
    if !status.is_success() {
      return Err(RemoteError::Rejected(status.as_u16()));
    }

    tracing::debug!(%kind, %key, status = status.as_u16(), "remote accepted record");
    Ok(())
  }
}
