//! Local HTTP proxy in front of the application origin.
//!
//! Every request is offered to the cache layer first. Requests it does not
//! intercept are forwarded to the origin untouched.

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::cache::{self, CacheLayer, CacheStorage, Destination, Fetcher};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that describe a single connection and must not be forwarded
const HOP_HEADERS: &[&str] = &[
  "host",
  "connection",
  "keep-alive",
  "transfer-encoding",
  "content-length",
  "upgrade",
];

pub struct ProxyState<S: CacheStorage, F: Fetcher> {
  cache: CacheLayer<S, F>,
  origin: Url,
  client: reqwest::Client,
}

impl<S: CacheStorage, F: Fetcher> ProxyState<S, F> {
  pub fn new(cache: CacheLayer<S, F>, origin: &str, timeout: Duration) -> Result<Self> {
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    if origin.host().is_none() {
      return Err(eyre!("Origin '{}' has no host", origin));
    }
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self {
      cache,
      origin,
      client,
    })
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for ProxyState<S, F> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      origin: self.origin.clone(),
      client: self.client.clone(),
    }
  }
}

pub fn router<S: CacheStorage, F: Fetcher>(state: ProxyState<S, F>) -> Router {
  Router::new()
    .fallback(intercept::<S, F>)
    .with_state(state)
}

/// Serve on `listen` until `shutdown` resolves.
pub async fn serve<S, F>(
  listen: &str,
  state: ProxyState<S, F>,
  shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()>
where
  S: CacheStorage,
  F: Fetcher,
{
  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind proxy to {}: {}", listen, e))?;
  tracing::info!(address = %listen, origin = %state.origin, "proxy listening");

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| eyre!("Proxy server error: {}", e))
}

async fn intercept<S: CacheStorage, F: Fetcher>(
  State(state): State<ProxyState<S, F>>,
  request: axum::extract::Request,
) -> axum::response::Response {
  let (parts, body) = request.into_parts();
  let url = target_url(&state.origin, &parts.uri);

  let mut cache_request = cache::Request::new(parts.method.clone(), url.clone());
  if let Some(destination) = parts
    .headers
    .get("sec-fetch-dest")
    .and_then(|v| v.to_str().ok())
    .and_then(Destination::from_fetch_dest)
  {
    cache_request = cache_request.with_destination(destination);
  }

  if let Some(served) = state.cache.handle(&cache_request).await {
    return into_response(served.response);
  }

  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
  };
  forward(&state.client, parts.method, url, &parts.headers, body).await
}

/// Resolve a request against the origin. Only the path and query are taken
/// from the request, so `//host/...` paths stay on the origin.
fn target_url(origin: &Url, uri: &Uri) -> Url {
  let mut url = origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());
  url
}

async fn forward(
  client: &reqwest::Client,
  method: Method,
  url: Url,
  headers: &HeaderMap,
  body: Bytes,
) -> axum::response::Response {
  let mut outgoing = HeaderMap::new();
  for (name, value) in headers {
    if !HOP_HEADERS.contains(&name.as_str()) {
      outgoing.append(name.clone(), value.clone());
    }
  }

  let response = match client
    .request(method, url.clone())
    .headers(outgoing)
    .body(body)
    .send()
    .await
  {
    Ok(response) => response,
    Err(e) => {
      tracing::debug!(%url, error = %e, "origin unreachable");
      return (StatusCode::BAD_GATEWAY, "origin unreachable").into_response();
    }
  };

  let status = response.status();
  let mut headers = HeaderMap::new();
  for (name, value) in response.headers() {
    if !HOP_HEADERS.contains(&name.as_str()) {
      headers.append(name.clone(), value.clone());
    }
  }
  match response.bytes().await {
    Ok(body) => (status, headers, body).into_response(),
    Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
  }
}

fn into_response(response: cache::Response) -> axum::response::Response {
  let mut builder = axum::response::Response::builder().status(response.status);
  for (name, value) in &response.headers {
    if !HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
      builder = builder.header(name.as_str(), value.as_str());
    }
  }
  builder
    .body(Body::from(response.body))
    .unwrap_or_else(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())
}
