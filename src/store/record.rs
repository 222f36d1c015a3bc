//! Row mapping for the syncable entity tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{de::DeserializeOwned, Serialize};

use super::types::{Duplicate, EntityKind, SamplingStatus, Well};

/// Strict insert or insert-or-replace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
  Insert,
  Upsert,
}

/// Who the written state comes from. The store derives the dirty flag from
/// this; callers never set it themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
  /// Captured on this device, must be pushed
  Local,
  /// Mirrors state the remote already holds
  Remote,
}

/// Trait for entities stored in their own keyed, dirty-tracked table.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  const KIND: EntityKind;
  const TABLE: &'static str;
  const KEY_COLUMN: &'static str;

  /// Primary identity
  fn key(&self) -> &str;

  fn revision(&self) -> i64;

  fn set_sync_state(&mut self, dirty: bool, revision: i64);

  /// Column backing a named secondary index
  fn index_column(index: &str) -> Option<&'static str>;

  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

  /// Field invariants checked before every store write.
  fn validate(&self) -> Result<(), String> {
    if self.key().trim().is_empty() {
      return Err(format!("{} without an id", Self::KIND));
    }
    Ok(())
  }

  /// Write the whole record. `Insert` fails on an existing key.
  fn write(&self, conn: &Connection, mode: WriteMode) -> rusqlite::Result<()>;
}

/// Apply the dirty-flag transition for a write of the given provenance.
pub(crate) fn stamp<T: Record>(record: &mut T, provenance: Provenance, stored_revision: Option<i64>) {
  let base = stored_revision.unwrap_or(0).max(record.revision());
  match provenance {
    Provenance::Local => record.set_sync_state(true, base + 1),
    Provenance::Remote => record.set_sync_state(false, base),
  }
}

fn insert_verb(mode: WriteMode) -> &'static str {
  match mode {
    WriteMode::Insert => "INSERT",
    WriteMode::Upsert => "INSERT OR REPLACE",
  }
}

pub(crate) fn millis(dt: DateTime<Utc>) -> i64 {
  dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl Record for Well {
  const KIND: EntityKind = EntityKind::Well;
  const TABLE: &'static str = "wells";
  const KEY_COLUMN: &'static str = "well_id";

  fn key(&self) -> &str {
    &self.well_id
  }

  fn revision(&self) -> i64 {
    self.revision
  }

  fn set_sync_state(&mut self, dirty: bool, revision: i64) {
    self.dirty = dirty;
    self.revision = revision;
  }

  fn validate(&self) -> Result<(), String> {
    if self.well_id.trim().is_empty() {
      return Err("well without an id".to_string());
    }
    // Also rejects NaN
    if !(self.total_depth >= 0.0) {
      return Err(format!("well {}: negative total_depth", self.well_id));
    }
    let stamped = (self.sampled_at.is_some(), self.sampled_by.is_some());
    match (self.sampling_status, stamped) {
      (SamplingStatus::Sampled, (true, true)) | (SamplingStatus::NotSampled, (false, false)) => Ok(()),
      (SamplingStatus::Sampled, _) => Err(format!(
        "well {}: sampled without sampled_at and sampled_by",
        self.well_id
      )),
      (SamplingStatus::NotSampled, _) => Err(format!(
        "well {}: not sampled but carries sampled_at or sampled_by",
        self.well_id
      )),
    }
  }

  fn index_column(index: &str) -> Option<&'static str> {
    match index {
      "status" => Some("sampling_status"),
      "dirty" => Some("dirty"),
      "name" => Some("well_name"),
      _ => None,
    }
  }

  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      well_id: row.get("well_id")?,
      well_name: row.get("well_name")?,
      x_coord: row.get("x_coord")?,
      y_coord: row.get("y_coord")?,
      z_coord: row.get("z_coord")?,
      total_depth: row.get("total_depth")?,
      sampling_status: row.get("sampling_status")?,
      sampled_at: row.get::<_, Option<i64>>("sampled_at")?.map(from_millis),
      sampled_by: row.get("sampled_by")?,
      dirty: row.get("dirty")?,
      revision: row.get("revision")?,
      created_at: from_millis(row.get("created_at")?),
    })
  }

  fn write(&self, conn: &Connection, mode: WriteMode) -> rusqlite::Result<()> {
    let sql = format!(
      "{} INTO wells (well_id, well_name, x_coord, y_coord, z_coord, total_depth,
         sampling_status, sampled_at, sampled_by, dirty, revision, created_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
      insert_verb(mode)
    );
    conn.execute(
      &sql,
      params![
        self.well_id,
        self.well_name,
        self.x_coord,
        self.y_coord,
        self.z_coord,
        self.total_depth,
        self.sampling_status,
        self.sampled_at.map(millis),
        self.sampled_by,
        self.dirty,
        self.revision,
        millis(self.created_at),
      ],
    )?;
    Ok(())
  }
}

impl Record for Duplicate {
  const KIND: EntityKind = EntityKind::Duplicate;
  const TABLE: &'static str = "duplicates";
  const KEY_COLUMN: &'static str = "duplicate_id";

  fn key(&self) -> &str {
    &self.duplicate_id
  }

  fn revision(&self) -> i64 {
    self.revision
  }

  fn set_sync_state(&mut self, dirty: bool, revision: i64) {
    self.dirty = dirty;
    self.revision = revision;
  }

  fn index_column(index: &str) -> Option<&'static str> {
    match index {
      "original" => Some("original_sample_id"),
      "dirty" => Some("dirty"),
      _ => None,
    }
  }

  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      duplicate_id: row.get("duplicate_id")?,
      original_sample_id: row.get("original_sample_id")?,
      duplicate_ratio: row.get("duplicate_ratio")?,
      analysis_status: row.get("analysis_status")?,
      dirty: row.get("dirty")?,
      revision: row.get("revision")?,
      created_at: from_millis(row.get("created_at")?),
    })
  }

  fn write(&self, conn: &Connection, mode: WriteMode) -> rusqlite::Result<()> {
    let sql = format!(
      "{} INTO duplicates (duplicate_id, original_sample_id, duplicate_ratio,
         analysis_status, dirty, revision, created_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      insert_verb(mode)
    );
    conn.execute(
      &sql,
      params![
        self.duplicate_id,
        self.original_sample_id,
        self.duplicate_ratio,
        self.analysis_status,
        self.dirty,
        self.revision,
        millis(self.created_at),
      ],
    )?;
    Ok(())
  }
}
