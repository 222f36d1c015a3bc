pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StoreError;

/// How long a connection waits for the other context's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper for the entity tables
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at the given path
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Unavailable(format!("failed to create database directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::Unavailable(format!(
        "failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    conn.busy_timeout(BUSY_TIMEOUT)?;
    // Readers in one context must not block the writer in the other.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    let db = Self { conn };
    db.run_migrations()?;

    tracing::debug!(path = %path.display(), "opened entity database");
    Ok(db)
  }

  /// Open a private in-memory database
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, StoreError> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf, StoreError> {
    Ok(data_dir()?.join("wells.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<(), StoreError> {
    self
      .conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| StoreError::Unavailable(format!("failed to run migrations: {}", e)))?;
    Ok(())
  }

  /// Hand the connection over to its owner
  pub fn into_connection(self) -> Connection {
    self.conn
  }
}

/// Application data directory (`$XDG_DATA_HOME/wellsync`).
pub fn data_dir() -> Result<PathBuf, StoreError> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| StoreError::Unavailable("could not determine data directory".into()))?;

  Ok(data_dir.join("wellsync"))
}
