//! Error taxonomy for the entity store.
//!
//! Per-record errors (`NotFound`, `Constraint`, `Validation`) are local to the
//! call that produced them; batch operations count them instead of aborting.
//! `Unavailable` aborts whatever operation hit it.

use crate::store::EntityKind;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// Requested entity is absent
  #[error("{kind} '{key}' not found")]
  NotFound { kind: EntityKind, key: String },

  /// Strict insert hit an existing primary key
  #[error("{kind} '{key}' already exists")]
  Constraint { kind: EntityKind, key: String },

  /// Malformed record (missing identity, coordinates, bad ratio...)
  #[error("invalid record: {0}")]
  Validation(String),

  /// Index name not defined for the entity kind
  #[error("no index '{index}' on {kind}")]
  UnknownIndex { kind: EntityKind, index: String },

  /// The database could not be opened or a transaction failed
  #[error("store unavailable: {0}")]
  Unavailable(String),

  #[error("failed to (de)serialize value: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Unavailable(e.to_string())
  }
}

impl StoreError {
  pub fn not_found(kind: EntityKind, key: impl Into<String>) -> Self {
    StoreError::NotFound {
      kind,
      key: key.into(),
    }
  }
}

/// Whether a rusqlite error is a primary key / unique violation.
pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
  matches!(
    e,
    rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
  )
}
