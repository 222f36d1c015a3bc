//! Background worker.
//!
//! Owns the cache lifecycle and drives sync. It outlives any console session
//! and talks to consoles only through channels: a broadcast of
//! [`ClientMessage`] out and an mpsc of [`WorkerMessage`] in.

mod connectivity;
mod messages;

use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, Fetcher};
use crate::config::WorkerConfig;
use crate::sync::{PassOutcome, SyncEngine, SyncRemote};

pub use connectivity::{ConnectivityMonitor, Probe, Transition};
pub use messages::{ClientMessage, WorkerMessage};

const CONTROL_CAPACITY: usize = 16;
const BROADCAST_CAPACITY: usize = 64;

/// Console side of a running worker.
pub struct WorkerHandle {
  control: mpsc::Sender<WorkerMessage>,
  task: JoinHandle<()>,
}

impl WorkerHandle {
  pub fn control(&self) -> mpsc::Sender<WorkerMessage> {
    self.control.clone()
  }

  /// Ask the worker to stop and wait for it. In-flight sync passes are not
  /// cancelled; they finish on their own tasks.
  pub async fn shutdown(self) {
    if self.control.send(WorkerMessage::Shutdown).await.is_err() {
      tracing::debug!("worker already stopped");
    }
    if let Err(e) = self.task.await {
      tracing::error!(error = %e, "worker task failed");
    }
  }
}

pub struct Worker<R, S, F>
where
  R: SyncRemote + Probe,
  S: CacheStorage,
  F: Fetcher,
{
  sync: SyncEngine<R>,
  cache: CacheLayer<S, F>,
  precache: Vec<Url>,
  skip_waiting: bool,
  probe_interval: Duration,
  sync_interval: Option<Duration>,
  connectivity: ConnectivityMonitor,
  /// Installed but not yet activated
  waiting: bool,
  events: broadcast::Sender<ClientMessage>,
}

impl<R, S, F> Worker<R, S, F>
where
  R: SyncRemote + Probe,
  S: CacheStorage,
  F: Fetcher,
{
  pub fn new(
    sync: SyncEngine<R>,
    cache: CacheLayer<S, F>,
    precache: Vec<Url>,
    config: &WorkerConfig,
  ) -> Self {
    let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
    Self {
      sync,
      cache,
      precache,
      skip_waiting: config.skip_waiting,
      probe_interval: Duration::from_secs(config.probe_interval_secs.max(1)),
      sync_interval: (config.sync_interval_secs > 0)
        .then(|| Duration::from_secs(config.sync_interval_secs)),
      connectivity: ConnectivityMonitor::default(),
      waiting: false,
      events,
    }
  }

  /// Subscribe before spawning to see the install outcome.
  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.events.subscribe()
  }

  /// Start the worker on its own task.
  pub fn spawn(self) -> WorkerHandle {
    let (control, rx) = mpsc::channel(CONTROL_CAPACITY);
    let task = tokio::spawn(self.run(rx));
    WorkerHandle { control, task }
  }

  async fn run(mut self, mut control: mpsc::Receiver<WorkerMessage>) {
    self.install().await;

    let mut probe = interval(self.probe_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut periodic = self.sync_interval.map(|period| {
      let mut timer = interval(period);
      timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
      timer
    });

    loop {
      tokio::select! {
        msg = control.recv() => match msg {
          Some(WorkerMessage::SkipWaiting) => self.skip_waiting().await,
          Some(WorkerMessage::SyncNow) => self.spawn_sync("requested"),
          Some(WorkerMessage::Shutdown) | None => break,
        },
        _ = probe.tick() => {
          let reachable = self.sync.remote().is_reachable().await;
          if self.connectivity.observe(reachable) == Transition::CameOnline {
            self.spawn_sync("reconnected");
          }
        }
        _ = tick(&mut periodic) => {
          if self.connectivity.is_online() {
            self.spawn_sync("periodic");
          }
        }
      }
    }

    tracing::info!("worker stopped");
  }

  /// Fill the precache generation, then activate or wait.
  async fn install(&mut self) {
    let version = self.cache.generations().version().to_string();
    match self.cache.install(&self.precache).await {
      Ok(count) => tracing::info!(%version, count, "cache version installed"),
      Err(e) => {
        // The previous generations stay in service
        tracing::error!(%version, error = %e, "cache install failed");
        return;
      }
    }

    if self.skip_waiting {
      self.activate().await;
    } else {
      self.waiting = true;
      self.broadcast(ClientMessage::Waiting { version });
    }
  }

  async fn skip_waiting(&mut self) {
    if self.waiting {
      self.activate().await;
    } else {
      tracing::debug!("no installed version is waiting");
    }
  }

  async fn activate(&mut self) {
    match self.cache.activate().await {
      Ok(deleted) => {
        self.waiting = false;
        let version = self.cache.generations().version().to_string();
        tracing::info!(%version, evicted = deleted.len(), "cache version activated");
        self.broadcast(ClientMessage::Activated { version });
      }
      Err(e) => tracing::error!(error = %e, "cache activation failed"),
    }
  }

  /// Sync runs off the control loop; the engine skips overlapping passes.
  fn spawn_sync(&self, reason: &'static str) {
    tracing::debug!(reason, "sync triggered");
    let sync = self.sync.clone();
    let events = self.events.clone();
    tokio::spawn(async move {
      for outcome in sync.sync_all().await {
        match outcome {
          Ok(PassOutcome::Completed(report)) => {
            let _ = events.send(ClientMessage::SyncComplete {
              kind: report.kind,
              attempted: report.attempted,
            });
          }
          Ok(PassOutcome::Skipped(_)) => {}
          Err(e) => tracing::error!(error = %e, "sync pass failed"),
        }
      }
    });
  }

  fn broadcast(&self, message: ClientMessage) {
    // No subscribers is fine; the console may not be attached
    let _ = self.events.send(message);
  }
}

async fn tick(timer: &mut Option<Interval>) {
  match timer {
    Some(timer) => {
      timer.tick().await;
    }
    None => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Generations, HttpFetcher, RoutingRules, SqliteStorage};
  use crate::store::{EntityKind, EntityStore, WellImport};
  use crate::sync::RemoteError;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Arc;

  #[derive(Default, Clone)]
  struct FakeRemote {
    reachable: Arc<AtomicBool>,
    pushes: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl SyncRemote for FakeRemote {
    async fn upsert(&self, _: EntityKind, _: &str, _: &serde_json::Value) -> Result<(), RemoteError> {
      if !self.reachable.load(Ordering::SeqCst) {
        return Err(RemoteError::Network("offline".into()));
      }
      self.pushes.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  #[async_trait]
  impl Probe for FakeRemote {
    async fn is_reachable(&self) -> bool {
      self.reachable.load(Ordering::SeqCst)
    }
  }

  async fn worker(
    remote: FakeRemote,
    skip_waiting: bool,
  ) -> (Worker<FakeRemote, SqliteStorage, HttpFetcher>, EntityStore) {
    let store = EntityStore::open_in_memory().unwrap();
    let rows: Vec<WellImport> = ["A", "B"]
      .iter()
      .map(|id| serde_json::from_value(json!({"well_id": id, "x": 0, "y": 0, "z": 0})).unwrap())
      .collect();
    store.add_wells(rows).await.unwrap();

    let cache = CacheLayer::new(
      SqliteStorage::open_in_memory().unwrap(),
      HttpFetcher::new(Duration::from_secs(1)).unwrap(),
      RoutingRules::default(),
      Generations::new("v1"),
    );
    let config = WorkerConfig {
      skip_waiting,
      ..Default::default()
    };
    let mut worker = Worker::new(SyncEngine::new(store.clone(), remote), cache, Vec::new(), &config);
    worker.probe_interval = Duration::from_millis(20);
    (worker, store)
  }

  async fn next(rx: &mut broadcast::Receiver<ClientMessage>) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
      .await
      .expect("worker went quiet")
      .unwrap()
  }

  #[tokio::test]
  async fn test_activates_immediately_with_skip_waiting() {
    let (worker, _store) = worker(FakeRemote::default(), true).await;
    let mut rx = worker.subscribe();
    let handle = worker.spawn();

    assert_eq!(
      next(&mut rx).await,
      ClientMessage::Activated {
        version: "v1".into()
      }
    );
    handle.shutdown().await;
  }

  #[tokio::test]
  async fn test_waiting_version_activates_on_request() {
    let (worker, _store) = worker(FakeRemote::default(), false).await;
    let mut rx = worker.subscribe();
    let handle = worker.spawn();

    assert_eq!(
      next(&mut rx).await,
      ClientMessage::Waiting {
        version: "v1".into()
      }
    );
    handle.control().send(WorkerMessage::SkipWaiting).await.unwrap();
    assert_eq!(
      next(&mut rx).await,
      ClientMessage::Activated {
        version: "v1".into()
      }
    );
    handle.shutdown().await;
  }

  #[tokio::test]
  async fn test_reconnect_triggers_sync() {
    let remote = FakeRemote::default();
    let (worker, store) = worker(remote.clone(), true).await;
    let mut rx = worker.subscribe();
    let handle = worker.spawn();
    assert!(matches!(next(&mut rx).await, ClientMessage::Activated { .. }));

    // Offline for a few probes: nothing is pushed
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(remote.pushes.load(Ordering::SeqCst), 0);

    remote.reachable.store(true, Ordering::SeqCst);
    let mut completed = Vec::new();
    while completed.len() < 2 {
      if let ClientMessage::SyncComplete { kind, attempted } = next(&mut rx).await {
        completed.push((kind, attempted));
      }
    }
    completed.sort_by_key(|(kind, _)| kind.as_str());
    assert_eq!(
      completed,
      vec![(EntityKind::Duplicate, 0), (EntityKind::Well, 2)]
    );
    assert_eq!(remote.pushes.load(Ordering::SeqCst), 2);
    assert_eq!(store.well_counts().await.unwrap().dirty, 0);

    handle.shutdown().await;
  }

  #[tokio::test]
  async fn test_sync_now_while_offline_reports_attempts() {
    let (worker, store) = worker(FakeRemote::default(), true).await;
    let mut rx = worker.subscribe();
    let handle = worker.spawn();
    assert!(matches!(next(&mut rx).await, ClientMessage::Activated { .. }));

    handle.control().send(WorkerMessage::SyncNow).await.unwrap();
    let mut wells = None;
    while wells.is_none() {
      if let ClientMessage::SyncComplete {
        kind: EntityKind::Well,
        attempted,
      } = next(&mut rx).await
      {
        wells = Some(attempted);
      }
    }
    assert_eq!(wells, Some(2));
    assert_eq!(store.well_counts().await.unwrap().dirty, 2);

    handle.shutdown().await;
  }
}
