//! Durable local entity store.
//!
//! One SQLite connection per execution context, shared by clones of the
//! handle. Every call runs on tokio's blocking pool and is one transaction;
//! the dirty flag is derived from the caller's [`Provenance`] on every
//! mutating call.

mod duplicates;
mod record;
mod types;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::error::{is_constraint_violation, StoreError};

pub use duplicates::{generate_duplicates, DuplicateRatio};
pub use record::{Provenance, Record, WriteMode};
pub use types::{
  AnalysisStatus, Duplicate, EntityKind, ImportSummary, LogEntry, SamplingStatus, Snapshot, Well,
  WellImport,
};

use record::{from_millis, millis, stamp};

/// Logs included in an export.
const EXPORT_LOG_LIMIT: usize = 1000;

/// Aggregate well counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WellCounts {
  pub total: u64,
  pub sampled: u64,
  pub dirty: u64,
}

/// Handle to the entity tables.
#[derive(Clone)]
pub struct EntityStore {
  conn: Arc<Mutex<Connection>>,
}

impl EntityStore {
  pub fn new(db: Database) -> Self {
    Self {
      conn: Arc::new(Mutex::new(db.into_connection())),
    }
  }

  /// Open (creating if needed) the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    Ok(Self::new(Database::open(path)?))
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Ok(Self::new(Database::open_in_memory()?))
  }

  /// Run `f` against the connection on the blocking pool.
  async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn
        .lock()
        .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))?;
      f(&mut *conn)
    })
    .await
    .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
  }

  // ===== Generic record operations =====

  /// Write a record. The stored dirty flag and revision follow `provenance`.
  pub async fn put<T: Record>(
    &self,
    record: T,
    mode: WriteMode,
    provenance: Provenance,
  ) -> Result<T, StoreError> {
    self
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = put_record(&tx, record, mode, provenance)?;
        tx.commit()?;
        Ok(record)
      })
      .await
  }

  pub async fn get<T: Record>(&self, key: &str) -> Result<T, StoreError> {
    let key = key.to_string();
    self.call(move |conn| get_record::<T>(conn, &key)).await
  }

  pub async fn get_all<T: Record>(&self) -> Result<Vec<T>, StoreError> {
    self
      .call(|conn| {
        let sql = format!("SELECT * FROM {} ORDER BY {}", T::TABLE, T::KEY_COLUMN);
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
          .query_map([], |row| T::from_row(row))?
          .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
      })
      .await
  }

  /// Records whose indexed column equals `value`.
  pub async fn get_by_index<T: Record>(
    &self,
    index: &str,
    value: impl Into<Value>,
  ) -> Result<Vec<T>, StoreError> {
    let column = T::index_column(index).ok_or_else(|| StoreError::UnknownIndex {
      kind: T::KIND,
      index: index.to_string(),
    })?;
    let value = value.into();

    self
      .call(move |conn| {
        let sql = format!(
          "SELECT * FROM {} WHERE {} = ?1 ORDER BY {}",
          T::TABLE,
          column,
          T::KEY_COLUMN
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
          .query_map(params![value], |row| T::from_row(row))?
          .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
      })
      .await
  }

  /// Records with local changes the remote has not confirmed.
  pub async fn dirty<T: Record>(&self) -> Result<Vec<T>, StoreError> {
    self.get_by_index::<T>("dirty", true).await
  }

  /// Clear the dirty flag without touching other fields.
  pub async fn mark_clean<T: Record>(&self, key: &str) -> Result<(), StoreError> {
    let key = key.to_string();
    self
      .call(move |conn| {
        let sql = format!("UPDATE {} SET dirty = 0 WHERE {} = ?1", T::TABLE, T::KEY_COLUMN);
        match conn.execute(&sql, params![key])? {
          0 => Err(StoreError::not_found(T::KIND, key)),
          _ => Ok(()),
        }
      })
      .await
  }

  /// Clear the dirty flag only if the record is still at `revision`.
  ///
  /// Returns `false` when a newer local write landed after the pushed
  /// snapshot was taken; that write stays dirty.
  pub async fn mark_clean_at<T: Record>(&self, key: &str, revision: i64) -> Result<bool, StoreError> {
    let key = key.to_string();
    self
      .call(move |conn| {
        let sql = format!(
          "UPDATE {} SET dirty = 0 WHERE {} = ?1 AND revision = ?2",
          T::TABLE,
          T::KEY_COLUMN
        );
        if conn.execute(&sql, params![key, revision])? > 0 {
          return Ok(true);
        }
        // Distinguish "changed since" from "gone"
        get_record::<T>(conn, &key).map(|_| false)
      })
      .await
  }

  /// Remove a record. Returns whether it existed.
  pub async fn delete<T: Record>(&self, key: &str) -> Result<bool, StoreError> {
    let key = key.to_string();
    self
      .call(move |conn| {
        let sql = format!("DELETE FROM {} WHERE {} = ?1", T::TABLE, T::KEY_COLUMN);
        Ok(conn.execute(&sql, params![key])? > 0)
      })
      .await
  }

  /// Empty every table.
  pub async fn clear_all(&self) -> Result<(), StoreError> {
    self
      .call(|conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        clear_tables(&tx)?;
        tx.commit()?;
        tracing::info!("cleared all local data");
        Ok(())
      })
      .await
  }

  // ===== Wells =====

  /// Import wells record by record. Invalid rows and existing ids are
  /// skipped; the summary reports how many were actually persisted.
  pub async fn add_wells(&self, rows: Vec<WellImport>) -> Result<ImportSummary, StoreError> {
    self
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut summary = ImportSummary {
          attempted: rows.len(),
          ..Default::default()
        };

        for row in &rows {
          let mut well = match row.validate().and_then(|well| well.validate().map(|()| well)) {
            Ok(well) => well,
            Err(reason) => {
              tracing::warn!(%reason, "skipping invalid well record");
              summary.invalid += 1;
              continue;
            }
          };

          stamp(&mut well, Provenance::Local, None);
          match well.write(&tx, WriteMode::Insert) {
            Ok(()) => summary.added += 1,
            Err(e) if is_constraint_violation(&e) => {
              tracing::warn!(well_id = %well.well_id, "well already exists, skipping");
              summary.conflicts += 1;
            }
            Err(e) => return Err(e.into()),
          }
        }

        tx.commit()?;
        tracing::info!(added = summary.added, attempted = summary.attempted, "imported wells");
        Ok(summary)
      })
      .await
  }

  /// Set a well's sampling status in one read-modify-write transaction.
  pub async fn update_status(
    &self,
    well_id: &str,
    status: SamplingStatus,
    operator: &str,
  ) -> Result<Well, StoreError> {
    let well_id = well_id.to_string();
    let operator = operator.to_string();
    self
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut well = get_record::<Well>(&tx, &well_id)?;
        well.apply_status(status, &operator, Utc::now());
        let revision = well.revision;
        stamp(&mut well, Provenance::Local, Some(revision));
        well.write(&tx, WriteMode::Upsert)?;
        tx.commit()?;
        tracing::info!(%well_id, status = status.as_str(), "updated well status");
        Ok(well)
      })
      .await
  }

  /// Wells whose id or name contains `query`, ignoring case.
  pub async fn search_wells(&self, query: &str) -> Result<Vec<Well>, StoreError> {
    let needle = query.to_lowercase();
    let wells = self.get_all::<Well>().await?;
    Ok(
      wells
        .into_iter()
        .filter(|w| {
          w.well_id.to_lowercase().contains(&needle) || w.well_name.to_lowercase().contains(&needle)
        })
        .collect(),
    )
  }

  pub async fn well_counts(&self) -> Result<WellCounts, StoreError> {
    self
      .call(|conn| {
        let (total, sampled, dirty): (i64, Option<i64>, Option<i64>) = conn.query_row(
          "SELECT COUNT(*),
                  SUM(CASE WHEN sampling_status = 'sampled' THEN 1 ELSE 0 END),
                  SUM(dirty)
           FROM wells",
          [],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(WellCounts {
          total: total as u64,
          sampled: sampled.unwrap_or(0) as u64,
          dirty: dirty.unwrap_or(0) as u64,
        })
      })
      .await
  }

  // ===== Duplicates =====

  pub async fn set_analysis_status(
    &self,
    duplicate_id: &str,
    status: AnalysisStatus,
  ) -> Result<Duplicate, StoreError> {
    let duplicate_id = duplicate_id.to_string();
    self
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut duplicate = get_record::<Duplicate>(&tx, &duplicate_id)?;
        duplicate.analysis_status = status;
        let revision = duplicate.revision;
        stamp(&mut duplicate, Provenance::Local, Some(revision));
        duplicate.write(&tx, WriteMode::Upsert)?;
        tx.commit()?;
        Ok(duplicate)
      })
      .await
  }

  // ===== Logs =====

  pub async fn add_log(
    &self,
    well_id: &str,
    well_name: &str,
    operator: &str,
    action: &str,
  ) -> Result<LogEntry, StoreError> {
    let mut entry = LogEntry {
      id: 0,
      well_id: well_id.to_string(),
      well_name: well_name.to_string(),
      operator: operator.to_string(),
      action: action.to_string(),
      timestamp: Utc::now(),
    };
    self
      .call(move |conn| {
        entry.id = insert_log(conn, &entry)?;
        Ok(entry)
      })
      .await
  }

  /// Most recent log entries first.
  pub async fn logs(&self, limit: Option<usize>) -> Result<Vec<LogEntry>, StoreError> {
    self.call(move |conn| read_logs(conn, limit)).await
  }

  // ===== Settings =====

  pub async fn setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
    let key = key.to_string();
    self
      .call(move |conn| {
        let raw: Option<String> = conn
          .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
          )
          .optional()?;
        raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
      })
      .await
  }

  pub async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
    let key = key.to_string();
    let raw = serde_json::to_string(value)?;
    self
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
          params![key, raw],
        )?;
        Ok(())
      })
      .await
  }

  // ===== Export / restore =====

  pub async fn export_snapshot(&self) -> Result<Snapshot, StoreError> {
    let wells = self.get_all::<Well>().await?;
    let duplicates = self.get_all::<Duplicate>().await?;
    let logs = self.logs(Some(EXPORT_LOG_LIMIT)).await?;
    Ok(Snapshot {
      version: 1,
      exported_at: Utc::now(),
      wells,
      duplicates,
      logs,
    })
  }

  /// Replace all local data with a snapshot. Restored wells and duplicates
  /// are local writes and will be pushed on the next sync.
  pub async fn import_snapshot(&self, snapshot: Snapshot) -> Result<ImportSummary, StoreError> {
    self
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        clear_tables(&tx)?;

        let attempted = snapshot.wells.len() + snapshot.duplicates.len();
        let mut summary = ImportSummary {
          attempted,
          ..Default::default()
        };
        for well in snapshot.wells {
          restore_one(&tx, well, &mut summary)?;
        }
        for duplicate in snapshot.duplicates {
          restore_one(&tx, duplicate, &mut summary)?;
        }
        for entry in &snapshot.logs {
          insert_log(&tx, entry)?;
        }

        tx.commit()?;
        tracing::info!(restored = summary.added, "restored snapshot");
        Ok(summary)
      })
      .await
  }
}

fn get_record<T: Record>(conn: &Connection, key: &str) -> Result<T, StoreError> {
  let sql = format!("SELECT * FROM {} WHERE {} = ?1", T::TABLE, T::KEY_COLUMN);
  conn
    .query_row(&sql, params![key], |row| T::from_row(row))
    .optional()?
    .ok_or_else(|| StoreError::not_found(T::KIND, key))
}

fn put_record<T: Record>(
  conn: &Connection,
  mut record: T,
  mode: WriteMode,
  provenance: Provenance,
) -> Result<T, StoreError> {
  record.validate().map_err(StoreError::Validation)?;

  let sql = format!("SELECT revision FROM {} WHERE {} = ?1", T::TABLE, T::KEY_COLUMN);
  let stored: Option<i64> = conn
    .query_row(&sql, params![record.key()], |row| row.get(0))
    .optional()?;

  if stored.is_some() && mode == WriteMode::Insert {
    return Err(StoreError::Constraint {
      kind: T::KIND,
      key: record.key().to_string(),
    });
  }

  stamp(&mut record, provenance, stored);
  record.write(conn, mode)?;
  Ok(record)
}

fn restore_one<T: Record>(
  conn: &Connection,
  record: T,
  summary: &mut ImportSummary,
) -> Result<(), StoreError> {
  match put_record(conn, record, WriteMode::Insert, Provenance::Local) {
    Ok(_) => summary.added += 1,
    Err(StoreError::Constraint { key, .. }) => {
      tracing::warn!(%key, kind = %T::KIND, "duplicate key in snapshot, skipping");
      summary.conflicts += 1;
    }
    Err(StoreError::Validation(reason)) => {
      tracing::warn!(%reason, kind = %T::KIND, "invalid record in snapshot, skipping");
      summary.invalid += 1;
    }
    Err(e) => return Err(e),
  }
  Ok(())
}

fn clear_tables(conn: &Connection) -> Result<(), StoreError> {
  conn.execute_batch(
    "DELETE FROM wells;
     DELETE FROM duplicates;
     DELETE FROM logs;
     DELETE FROM settings;",
  )?;
  Ok(())
}

fn insert_log(conn: &Connection, entry: &LogEntry) -> Result<i64, StoreError> {
  conn.execute(
    "INSERT INTO logs (well_id, well_name, operator, action, timestamp)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    params![
      entry.well_id,
      entry.well_name,
      entry.operator,
      entry.action,
      millis(entry.timestamp),
    ],
  )?;
  Ok(conn.last_insert_rowid())
}

fn read_logs(conn: &Connection, limit: Option<usize>) -> Result<Vec<LogEntry>, StoreError> {
  // SQLite treats a negative LIMIT as unbounded
  let limit = limit.map(|l| l as i64).unwrap_or(-1);
  let mut stmt = conn.prepare(
    "SELECT id, well_id, well_name, operator, action, timestamp FROM logs
     ORDER BY timestamp DESC, id DESC LIMIT ?1",
  )?;
  let entries = stmt
    .query_map(params![limit], |row| {
      Ok(LogEntry {
        id: row.get(0)?,
        well_id: row.get(1)?,
        well_name: row.get(2)?,
        operator: row.get(3)?,
        action: row.get(4)?,
        timestamp: from_millis(row.get(5)?),
      })
    })?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(entries)
}
