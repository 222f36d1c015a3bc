//! Core traits and types for the caching system.

use async_trait::async_trait;
use std::time::Duration;

use super::request::{Request, Response};

/// Performs the actual network fetch for requests the layer intercepts.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  /// Any HTTP status is a successful fetch; only transport failures are errors.
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out")]
  Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("cache storage error: {0}")]
  Storage(String),

  #[error("failed to precache {url}: {reason}")]
  Install { url: String, reason: String },
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    CacheError::Storage(e.to_string())
  }
}

/// A response together with where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: CacheSource,
}

impl Served {
  pub fn network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  pub fn cache(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
    }
  }

  pub fn fallback(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Fallback,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the network
  Network,
  /// A cache generation
  Cache,
  /// Synthesized offline page or placeholder
  Fallback,
}

/// reqwest-backed fetcher with a bounded timeout per request
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> reqwest::Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let map_err = |e: reqwest::Error| {
      if e.is_timeout() {
        FetchError::Timeout
      } else {
        FetchError::Network(e.to_string())
      }
    };

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(map_err)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(map_err)?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
