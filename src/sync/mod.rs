//! Reconciliation of dirty local records with the remote.
//!
//! A pass scans one kind's dirty index, pushes each record once in order and
//! clears the flag only after the remote accepted it. Failed pushes stay
//! dirty for the next pass. Each kind has a re-entrancy guard: a trigger that
//! arrives while a pass for that kind runs is skipped, not queued.

mod remote;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::StoreError;
use crate::store::{Duplicate, EntityKind, EntityStore, Record, Well};

pub use remote::{HttpRemote, RemoteError, SyncRemote};

/// Fields that only make sense on this device
const LOCAL_FIELDS: &[&str] = &["dirty", "revision"];

/// Result of one completed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub kind: EntityKind,
  /// Dirty records found at the start of the pass
  pub attempted: usize,
  /// Accepted by the remote
  pub pushed: usize,
  /// Left dirty for a later pass
  pub failed: usize,
}

impl SyncReport {
  fn new(kind: EntityKind, attempted: usize) -> Self {
    Self {
      kind,
      attempted,
      pushed: 0,
      failed: 0,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
  Completed(SyncReport),
  /// A pass for this kind was already running
  Skipped(EntityKind),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  /// The dirty scan or a flag update could not reach the store
  #[error("{kind} sync pass aborted: {source}")]
  Store {
    kind: EntityKind,
    #[source]
    source: StoreError,
  },

  #[error("{0} records are not synced")]
  NotSyncable(EntityKind),
}

/// Holds a kind's running flag for the lifetime of a pass.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct SyncEngine<R: SyncRemote> {
  store: EntityStore,
  remote: Arc<R>,
  wells_running: Arc<AtomicBool>,
  duplicates_running: Arc<AtomicBool>,
}

impl<R: SyncRemote> SyncEngine<R> {
  pub fn new(store: EntityStore, remote: R) -> Self {
    Self {
      store,
      remote: Arc::new(remote),
      wells_running: Arc::new(AtomicBool::new(false)),
      duplicates_running: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }

  /// Run one pass for `kind`.
  pub async fn run_pass(&self, kind: EntityKind) -> Result<PassOutcome, SyncError> {
    match kind {
      EntityKind::Well => self.reconcile::<Well>(&self.wells_running).await,
      EntityKind::Duplicate => self.reconcile::<Duplicate>(&self.duplicates_running).await,
      other => Err(SyncError::NotSyncable(other)),
    }
  }

  /// Wells and duplicates concurrently; each kind stays sequential.
  pub async fn sync_all(&self) -> Vec<Result<PassOutcome, SyncError>> {
    let (wells, duplicates) = futures::future::join(
      self.run_pass(EntityKind::Well),
      self.run_pass(EntityKind::Duplicate),
    )
    .await;
    vec![wells, duplicates]
  }

  async fn reconcile<T: Record>(&self, running: &AtomicBool) -> Result<PassOutcome, SyncError> {
    let Some(_guard) = PassGuard::acquire(running) else {
      tracing::debug!(kind = %T::KIND, "sync pass already running, skipping");
      return Ok(PassOutcome::Skipped(T::KIND));
    };

    let abort = |source| SyncError::Store {
      kind: T::KIND,
      source,
    };

    let dirty = self.store.dirty::<T>().await.map_err(abort)?;
    let mut report = SyncReport::new(T::KIND, dirty.len());
    tracing::info!(kind = %T::KIND, count = dirty.len(), "starting sync pass");

    for record in &dirty {
      let key = record.key();
      let payload = match remote_payload(record) {
        Ok(payload) => payload,
        Err(e) => {
          tracing::warn!(kind = %T::KIND, %key, error = %e, "could not encode record");
          report.failed += 1;
          continue;
        }
      };

      if let Err(e) = self.remote.upsert(T::KIND, key, &payload).await {
        tracing::warn!(kind = %T::KIND, %key, error = %e, "push failed, record stays dirty");
        report.failed += 1;
        continue;
      }

      report.pushed += 1;
      match self.store.mark_clean_at::<T>(key, record.revision()).await {
        Ok(true) => tracing::debug!(kind = %T::KIND, %key, "synced"),
        Ok(false) => {
          tracing::debug!(kind = %T::KIND, %key, "changed during push, stays dirty")
        }
        Err(StoreError::NotFound { .. }) => {
          tracing::debug!(kind = %T::KIND, %key, "removed during push")
        }
        Err(e) => return Err(abort(e)),
      }
    }

    tracing::info!(
      kind = %T::KIND,
      attempted = report.attempted,
      pushed = report.pushed,
      failed = report.failed,
      "sync pass finished"
    );
    Ok(PassOutcome::Completed(report))
  }
}

impl<R: SyncRemote> Clone for SyncEngine<R> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      remote: Arc::clone(&self.remote),
      wells_running: Arc::clone(&self.wells_running),
      duplicates_running: Arc::clone(&self.duplicates_running),
    }
  }
}

fn remote_payload<T: Record>(record: &T) -> serde_json::Result<serde_json::Value> {
  let mut payload = serde_json::to_value(record)?;
  if let serde_json::Value::Object(map) = &mut payload {
    for field in LOCAL_FIELDS {
      map.remove(*field);
    }
  }
  Ok(payload)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{Provenance, SamplingStatus, WellImport, WriteMode};
  use async_trait::async_trait;
  use serde_json::json;
  use std::collections::{HashMap, HashSet};
  use std::sync::Mutex;
  use tokio::sync::Notify;

  /// Remote that upserts into a map and can be told to fail given keys.
  #[derive(Default, Clone)]
  struct FakeRemote {
    records: Arc<Mutex<HashMap<(EntityKind, String), serde_json::Value>>>,
    calls: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
  }

  impl FakeRemote {
    fn fail(&self, key: &str) {
      self.failing.lock().unwrap().insert(key.to_string());
    }

    fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }

    fn stored(&self) -> usize {
      self.records.lock().unwrap().len()
    }
  }

  #[async_trait]
  impl SyncRemote for FakeRemote {
    async fn upsert(
      &self,
      kind: EntityKind,
      key: &str,
      payload: &serde_json::Value,
    ) -> Result<(), RemoteError> {
      self.calls.lock().unwrap().push(key.to_string());
      if self.failing.lock().unwrap().contains(key) {
        return Err(RemoteError::Network("connection refused".into()));
      }
      self
        .records
        .lock()
        .unwrap()
        .insert((kind, key.to_string()), payload.clone());
      Ok(())
    }
  }

  /// Blocks inside the first push until released.
  struct GatedRemote {
    entered: Arc<Notify>,
    release: Arc<Notify>,
  }

  #[async_trait]
  impl SyncRemote for GatedRemote {
    async fn upsert(&self, _: EntityKind, _: &str, _: &serde_json::Value) -> Result<(), RemoteError> {
      self.entered.notify_one();
      self.release.notified().await;
      Ok(())
    }
  }

  async fn store_with_wells(ids: &[&str]) -> EntityStore {
    let store = EntityStore::open_in_memory().unwrap();
    let rows: Vec<WellImport> = ids
      .iter()
      .map(|id| serde_json::from_value(json!({"well_id": id, "x": 1, "y": 2, "z": 3})).unwrap())
      .collect();
    store.add_wells(rows).await.unwrap();
    store
  }

  fn completed(outcome: Result<PassOutcome, SyncError>) -> SyncReport {
    match outcome.unwrap() {
      PassOutcome::Completed(report) => report,
      PassOutcome::Skipped(kind) => panic!("{} pass was skipped", kind),
    }
  }

  #[tokio::test]
  async fn test_failed_record_stays_dirty_and_is_retried_alone() {
    let store = store_with_wells(&["A", "B"]).await;
    let remote = FakeRemote::default();
    remote.fail("B");
    let engine = SyncEngine::new(store.clone(), remote.clone());

    let report = completed(engine.run_pass(EntityKind::Well).await);
    assert_eq!((report.attempted, report.pushed, report.failed), (2, 1, 1));
    assert!(!store.get::<Well>("A").await.unwrap().dirty);
    assert!(store.get::<Well>("B").await.unwrap().dirty);

    remote.failing.lock().unwrap().clear();
    let report = completed(engine.run_pass(EntityKind::Well).await);
    assert_eq!(report.attempted, 1);
    assert_eq!(remote.calls(), vec!["A", "B", "B"]);
    assert!(store.dirty::<Well>().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_repush_is_idempotent() {
    let store = store_with_wells(&["A"]).await;
    let remote = FakeRemote::default();
    let engine = SyncEngine::new(store.clone(), remote.clone());

    completed(engine.run_pass(EntityKind::Well).await);
    // Same record dirtied again without a real change, e.g. after a crash
    let well = store.get::<Well>("A").await.unwrap();
    store.put(well, WriteMode::Upsert, Provenance::Local).await.unwrap();
    completed(engine.run_pass(EntityKind::Well).await);

    assert_eq!(remote.calls().len(), 2);
    assert_eq!(remote.stored(), 1);
    assert!(!store.get::<Well>("A").await.unwrap().dirty);
  }

  #[tokio::test]
  async fn test_payload_omits_local_bookkeeping() {
    let store = store_with_wells(&["A"]).await;
    store.update_status("A", SamplingStatus::Sampled, "op").await.unwrap();
    let remote = FakeRemote::default();
    let engine = SyncEngine::new(store, remote.clone());

    completed(engine.run_pass(EntityKind::Well).await);

    let records = remote.records.lock().unwrap();
    let payload = &records[&(EntityKind::Well, "A".to_string())];
    assert_eq!(payload["well_id"], "A");
    assert_eq!(payload["sampling_status"], "sampled");
    assert!(payload.get("dirty").is_none());
    assert!(payload.get("revision").is_none());
  }

  #[tokio::test]
  async fn test_concurrent_trigger_is_skipped() {
    let store = store_with_wells(&["A"]).await;
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let engine = SyncEngine::new(
      store,
      GatedRemote {
        entered: entered.clone(),
        release: release.clone(),
      },
    );

    let first = {
      let engine = engine.clone();
      tokio::spawn(async move { engine.run_pass(EntityKind::Well).await })
    };
    entered.notified().await;

    let second = engine.run_pass(EntityKind::Well).await.unwrap();
    assert_eq!(second, PassOutcome::Skipped(EntityKind::Well));

    // Other kinds are not blocked by a running wells pass
    let duplicates = completed(engine.run_pass(EntityKind::Duplicate).await);
    assert_eq!(duplicates.attempted, 0);

    release.notify_one();
    let report = completed(first.await.unwrap());
    assert_eq!(report.pushed, 1);

    // Guard released after the pass
    assert!(matches!(
      engine.run_pass(EntityKind::Well).await.unwrap(),
      PassOutcome::Completed(_)
    ));
  }

  #[tokio::test]
  async fn test_sync_all_covers_both_kinds() {
    let store = store_with_wells(&["A"]).await;
    store
      .put(
        crate::store::Duplicate::new("A", 1, "1:1"),
        WriteMode::Insert,
        Provenance::Local,
      )
      .await
      .unwrap();
    let remote = FakeRemote::default();
    let engine = SyncEngine::new(store.clone(), remote.clone());

    let results = engine.sync_all().await;
    let attempted: usize = results.into_iter().map(|r| completed(r).attempted).sum();
    assert_eq!(attempted, 2);
    assert_eq!(remote.stored(), 2);
    assert!(store.dirty::<Duplicate>().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unavailable_store_aborts_pass() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wells.db");
    let store = EntityStore::open(&path).unwrap();
    rusqlite::Connection::open(&path)
      .unwrap()
      .execute_batch("DROP TABLE wells;")
      .unwrap();

    let engine = SyncEngine::new(store, FakeRemote::default());
    let err = engine.run_pass(EntityKind::Well).await.unwrap_err();
    assert!(matches!(err, SyncError::Store { kind: EntityKind::Well, .. }));

    // The guard does not stay held after an aborted pass
    assert!(matches!(
      engine.run_pass(EntityKind::Well).await,
      Err(SyncError::Store { .. })
    ));
  }

  #[tokio::test]
  async fn test_logs_are_not_syncable() {
    let engine = SyncEngine::new(EntityStore::open_in_memory().unwrap(), FakeRemote::default());
    assert!(matches!(
      engine.run_pass(EntityKind::LogEntry).await,
      Err(SyncError::NotSyncable(EntityKind::LogEntry))
    ));
  }
}
