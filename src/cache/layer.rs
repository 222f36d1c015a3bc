//! Cache layer that routes intercepted requests through a caching strategy.

use std::sync::Arc;
use url::Url;

use super::request::{Destination, Request, Response, RoutingRules, Strategy};
use super::storage::CacheStorage;
use super::traits::{CacheError, Fetcher, Served};

/// Name of the unversioned generation holding runtime fetches
pub const RUNTIME_CACHE: &str = "runtime";

/// The set of generation names the current version expects to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generations {
  version: String,
  precache: String,
}

impl Generations {
  pub fn new(version: &str) -> Self {
    Self {
      version: version.to_string(),
      precache: format!("precache-{}", version),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn precache(&self) -> &str {
    &self.precache
  }

  pub fn runtime(&self) -> &str {
    RUNTIME_CACHE
  }

  pub fn expected(&self) -> [&str; 2] {
    [self.precache(), self.runtime()]
  }
}

/// Cache layer that manages generations and serves intercepted requests.
///
/// Storage is synchronous (SQLite), so every storage call is moved onto the
/// blocking pool.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  rules: Arc<RoutingRules>,
  generations: Generations,
}

impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  pub fn new(storage: S, fetcher: F, rules: RoutingRules, generations: Generations) -> Self {
    Self {
      storage: Arc::new(storage),
      fetcher: Arc::new(fetcher),
      rules: Arc::new(rules),
      generations,
    }
  }

  pub fn generations(&self) -> &Generations {
    &self.generations
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    self.rules.classify(request)
  }

  async fn blocking<T, Op>(&self, op: Op) -> Result<T, CacheError>
  where
    T: Send + 'static,
    Op: FnOnce(&S) -> Result<T, CacheError> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || op(&storage))
      .await
      .map_err(|e| CacheError::Storage(format!("cache task failed: {}", e)))?
  }

  /// Fetch every shell URL into the precache generation.
  ///
  /// Nothing is written until every fetch succeeded. A failed write removes
  /// the partially filled generation.
  pub async fn install(&self, urls: &[Url]) -> Result<usize, CacheError> {
    let fetches = urls.iter().map(|url| {
      let request = Request::get(url.clone());
      async move {
        let response = self.fetcher.fetch(&request).await.map_err(|e| CacheError::Install {
          url: request.url.to_string(),
          reason: e.to_string(),
        })?;
        if !response.is_ok() {
          return Err(CacheError::Install {
            url: request.url.to_string(),
            reason: format!("status {}", response.status),
          });
        }
        Ok((request, response))
      }
    });

    let fetched = match futures::future::try_join_all(fetches).await {
      Ok(fetched) => fetched,
      Err(e) => {
        self.discard_precache().await;
        return Err(e);
      }
    };

    let name = self.generations.precache.clone();
    let count = fetched.len();
    let written = self
      .blocking(move |storage| {
        storage.open(&name)?;
        for (request, response) in &fetched {
          storage.put(&name, &request.cache_key(), request.url.as_str(), response)?;
        }
        Ok(())
      })
      .await;

    if let Err(e) = written {
      self.discard_precache().await;
      return Err(e);
    }

    tracing::info!(generation = %self.generations.precache, count, "precache installed");
    Ok(count)
  }

  async fn discard_precache(&self) {
    let name = self.generations.precache.clone();
    if let Err(e) = self.blocking(move |storage| storage.delete(&name)).await {
      tracing::warn!(error = %e, "failed to discard partial precache");
    }
  }

  /// Delete every generation the current version does not expect.
  pub async fn activate(&self) -> Result<Vec<String>, CacheError> {
    let generations = self.generations.clone();
    let deleted = self
      .blocking(move |storage| {
        let mut deleted = Vec::new();
        for name in storage.keys()? {
          if !generations.expected().contains(&name.as_str()) {
            storage.delete(&name)?;
            deleted.push(name);
          }
        }
        Ok(deleted)
      })
      .await?;

    for name in &deleted {
      tracing::info!(generation = %name, "evicted cache generation");
    }
    Ok(deleted)
  }

  /// Serve a request. `None` means the request is not intercepted.
  pub async fn handle(&self, request: &Request) -> Option<Served> {
    let served = match self.classify(request) {
      Strategy::PassThrough => return None,
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    };
    tracing::debug!(url = %request.url, source = ?served.source, status = served.response.status, "served");
    Some(served)
  }

  async fn network_first(&self, request: &Request) -> Served {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_runtime(request, &response).await;
        Served::network(response)
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "network failed, trying runtime cache");
        let name = self.generations.runtime().to_string();
        let key = request.cache_key();
        match self.read(move |storage| storage.get(&name, &key)).await {
          Some(cached) => Served::cache(cached),
          None => Served::fallback(Response::offline()),
        }
      }
    }
  }

  async fn cache_first(&self, request: &Request) -> Served {
    if let Some(cached) = self.lookup(request).await {
      return Served::cache(cached);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_runtime(request, &response).await;
        Served::network(response)
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "fetch failed with nothing cached");
        if request.destination == Destination::Image {
          Served::fallback(Response::image_placeholder())
        } else {
          Served::fallback(Response::offline())
        }
      }
    }
  }

  async fn stale_while_revalidate(&self, request: &Request) -> Served {
    if let Some(cached) = self.lookup(request).await {
      let layer = self.clone();
      let request = request.clone();
      tokio::spawn(async move {
        match layer.fetcher.fetch(&request).await {
          Ok(response) => layer.store_runtime(&request, &response).await,
          Err(e) => tracing::debug!(url = %request.url, error = %e, "background refresh failed"),
        }
      });
      return Served::cache(cached);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_runtime(request, &response).await;
        Served::network(response)
      }
      Err(_) => Served::fallback(Response::offline()),
    }
  }

  async fn lookup(&self, request: &Request) -> Option<Response> {
    let key = request.cache_key();
    self.read(move |storage| storage.lookup(&key)).await
  }

  /// Storage read where a failure degrades to a miss.
  async fn read<Op>(&self, op: Op) -> Option<Response>
  where
    Op: FnOnce(&S) -> Result<Option<Response>, CacheError> + Send + 'static,
  {
    match self.blocking(op).await {
      Ok(found) => found,
      Err(e) => {
        tracing::warn!(error = %e, "cache read failed");
        None
      }
    }
  }

  /// Keep a copy of a successful response in the runtime generation.
  async fn store_runtime(&self, request: &Request, response: &Response) {
    if !response.is_ok() {
      return;
    }
    let copy = response.clone();
    let key = request.cache_key();
    let url = request.url.to_string();
    let name = self.generations.runtime().to_string();
    if let Err(e) = self
      .blocking(move |storage| storage.put(&name, &key, &url, &copy))
      .await
    {
      tracing::warn!(url = %request.url, error = %e, "failed to cache response");
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      rules: Arc::clone(&self.rules),
      generations: self.generations.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::traits::{CacheSource, FetchError};
  use async_trait::async_trait;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Serves canned bodies by path; unknown paths fail like a dropped connection.
  #[derive(Default)]
  struct FakeFetcher {
    routes: Mutex<HashMap<String, Response>>,
    calls: AtomicUsize,
  }

  impl FakeFetcher {
    fn serve(&self, path: &str, response: Response) {
      self.routes.lock().unwrap().insert(path.to_string(), response);
    }

    fn go_offline(&self) {
      self.routes.lock().unwrap().clear();
    }
  }

  #[async_trait]
  impl Fetcher for Arc<FakeFetcher> {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self
        .routes
        .lock()
        .unwrap()
        .get(request.url.path())
        .cloned()
        .ok_or_else(|| FetchError::Network("connection refused".to_string()))
    }
  }

  fn layer(version: &str) -> (CacheLayer<SqliteStorage, Arc<FakeFetcher>>, Arc<FakeFetcher>) {
    let fetcher = Arc::new(FakeFetcher::default());
    let layer = CacheLayer::new(
      SqliteStorage::open_in_memory().unwrap(),
      Arc::clone(&fetcher),
      RoutingRules::default(),
      Generations::new(version),
    );
    (layer, fetcher)
  }

  fn get(path: &str) -> Request {
    Request::get(Url::parse("https://app.test").unwrap().join(path).unwrap())
  }

  fn html(body: &str) -> Response {
    Response::new(200, "text/html", body)
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let (layer, fetcher) = layer("v1");
    fetcher.serve("/js/app.js", Response::new(200, "text/javascript", "one"));

    let first = layer.handle(&get("/js/app.js")).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    fetcher.serve("/js/app.js", Response::new(200, "text/javascript", "two"));
    let second = layer.handle(&get("/js/app.js")).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.body, b"one");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_image_failure_gets_placeholder() {
    let (layer, _fetcher) = layer("v1");

    let image = layer.handle(&get("/icons/icon-192.png")).await.unwrap();
    assert_eq!(image.source, CacheSource::Fallback);
    assert_eq!(image.response.header("content-type"), Some("image/svg+xml"));

    let style = layer.handle(&get("/styles/main.css")).await.unwrap();
    assert_eq!(style.response.status, 503);
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_runtime_copy() {
    let (layer, fetcher) = layer("v1");
    fetcher.serve("/api/wells", Response::new(200, "application/json", "[1]"));

    let online = layer.handle(&get("/api/wells")).await.unwrap();
    assert_eq!(online.source, CacheSource::Network);

    fetcher.go_offline();
    let offline = layer.handle(&get("/api/wells")).await.unwrap();
    assert_eq!(offline.source, CacheSource::Cache);
    assert_eq!(offline.response.body, b"[1]");

    let never_seen = layer.handle(&get("/api/duplicates")).await.unwrap();
    assert_eq!(never_seen.source, CacheSource::Fallback);
    assert_eq!(never_seen.response.status, 503);
  }

  #[tokio::test]
  async fn test_error_responses_are_not_cached() {
    let (layer, fetcher) = layer("v1");
    fetcher.serve("/api/wells", Response::new(500, "text/plain", "boom"));

    let served = layer.handle(&get("/api/wells")).await.unwrap();
    assert_eq!(served.response.status, 500);

    fetcher.go_offline();
    let offline = layer.handle(&get("/api/wells")).await.unwrap();
    assert_eq!(offline.source, CacheSource::Fallback);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_refreshes_in_background() {
    let (layer, fetcher) = layer("v1");
    fetcher.serve("/", html("old"));
    layer.handle(&get("/")).await.unwrap();

    fetcher.serve("/", html("new"));
    let stale = layer.handle(&get("/")).await.unwrap();
    assert_eq!(stale.source, CacheSource::Cache);
    assert_eq!(stale.response.body, b"old");

    // Wait for the background refresh to land
    for _ in 0..100 {
      if layer.lookup(&get("/")).await.map(|r| r.body) == Some(b"new".to_vec()) {
        return;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("runtime generation was not refreshed");
  }

  #[tokio::test]
  async fn test_navigation_is_never_denied() {
    let (layer, _fetcher) = layer("v1");
    let served = layer.handle(&get("/wells/ABC")).await.unwrap();
    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.response.status, 503);
  }

  #[tokio::test]
  async fn test_pass_through_is_not_intercepted() {
    let (layer, fetcher) = layer("v1");
    let post = Request::new(
      reqwest::Method::POST,
      Url::parse("https://app.test/api/samples").unwrap(),
    );
    assert!(layer.handle(&post).await.is_none());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let (layer, fetcher) = layer("v1");
    fetcher.serve("/", html("shell"));
    let base = Url::parse("https://app.test").unwrap();
    let urls = vec![base.join("/").unwrap(), base.join("/missing.css").unwrap()];

    let err = layer.install(&urls).await.unwrap_err();
    assert!(matches!(err, CacheError::Install { .. }));
    let storage = Arc::clone(&layer.storage);
    assert!(storage.keys().unwrap().is_empty());

    fetcher.serve("/missing.css", Response::new(200, "text/css", "body{}"));
    assert_eq!(layer.install(&urls).await.unwrap(), 2);
    assert_eq!(storage.keys().unwrap(), vec!["precache-v1"]);
  }

  #[tokio::test]
  async fn test_activate_evicts_old_versions_only() {
    let (old, fetcher) = layer("v1");
    fetcher.serve("/", html("shell"));
    let urls = vec![Url::parse("https://app.test/").unwrap()];
    old.install(&urls).await.unwrap();
    fetcher.serve("/api/wells", Response::new(200, "application/json", "[]"));
    old.handle(&get("/api/wells")).await.unwrap();

    let new = CacheLayer {
      generations: Generations::new("v2"),
      ..old.clone()
    };
    new.install(&urls).await.unwrap();

    let deleted = new.activate().await.unwrap();
    assert_eq!(deleted, vec!["precache-v1"]);
    let mut remaining = new.storage.keys().unwrap();
    remaining.sort();
    assert_eq!(remaining, vec!["precache-v2", "runtime"]);

    // Runtime entries cached under v1 still serve under v2
    fetcher.go_offline();
    let served = new.handle(&get("/api/wells")).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"[]");

    assert!(new.activate().await.unwrap().is_empty());
  }
}
