//! Cache storage trait and SQLite implementation.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

use super::request::Response;
use super::traits::CacheError;

/// Trait for cache storage backends.
///
/// Responses live in named generations. Generations are created on first use
/// and only ever removed as a whole.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the generation if it does not exist yet.
  fn open(&self, name: &str) -> Result<(), CacheError>;

  /// Find a response in any generation, oldest generation first.
  fn lookup(&self, key: &str) -> Result<Option<Response>, CacheError>;

  /// Find a response in one generation.
  fn get(&self, name: &str, key: &str) -> Result<Option<Response>, CacheError>;

  /// Store a response, replacing an earlier one under the same key.
  fn put(&self, name: &str, key: &str, url: &str, response: &Response) -> Result<(), CacheError>;

  /// Names of all generations in creation order.
  fn keys(&self) -> Result<Vec<String>, CacheError>;

  /// Drop a generation and everything in it. Returns whether it existed.
  fn delete(&self, name: &str) -> Result<bool, CacheError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at `path`.
  pub fn open(path: &Path) -> Result<Self, CacheError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::Storage(format!("failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Storage(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self, CacheError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, CacheError> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<(), CacheError> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CacheError::Storage(format!("failed to run cache migrations: {}", e)))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CacheError> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::Storage(format!("lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Buffered responses (headers as a JSON array of pairs)
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key)
);
"#;

fn decode_entry(status: u16, headers: String, body: Vec<u8>) -> Result<Response, CacheError> {
  let headers = serde_json::from_str(&headers)
    .map_err(|e| CacheError::Storage(format!("failed to decode cached headers: {}", e)))?;
  Ok(Response {
    status,
    headers,
    body,
  })
}

type EntryRow = (u16, String, Vec<u8>);

fn entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<(), CacheError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?1)",
      params![name],
    )?;
    Ok(())
  }

  fn lookup(&self, key: &str) -> Result<Option<Response>, CacheError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT e.status, e.headers, e.body FROM cache_entries e
         INNER JOIN cache_generations g ON g.name = e.generation
         WHERE e.request_key = ?1
         ORDER BY g.id
         LIMIT 1",
        params![key],
        entry_row,
      )
      .optional()?;

    row
      .map(|(status, headers, body)| decode_entry(status, headers, body))
      .transpose()
  }

  fn get(&self, name: &str, key: &str) -> Result<Option<Response>, CacheError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE generation = ?1 AND request_key = ?2",
        params![name, key],
        entry_row,
      )
      .optional()?;

    row
      .map(|(status, headers, body)| decode_entry(status, headers, body))
      .transpose()
  }

  fn put(&self, name: &str, key: &str, url: &str, response: &Response) -> Result<(), CacheError> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| CacheError::Storage(format!("failed to encode headers: {}", e)))?;

    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?1)",
      params![name],
    )?;
    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (generation, request_key, url, status, headers, body, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
      params![name, key, url, response.status, headers, response.body],
    )?;
    tx.commit()?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, CacheError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_generations ORDER BY id")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool, CacheError> {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute("DELETE FROM cache_entries WHERE generation = ?1", params![name])?;
    let removed = tx.execute("DELETE FROM cache_generations WHERE name = ?1", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lookup_prefers_oldest_generation() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("precache-v1").unwrap();
    storage
      .put("runtime", "k", "/a", &Response::new(200, "text/plain", "runtime"))
      .unwrap();
    storage
      .put("precache-v1", "k", "/a", &Response::new(200, "text/plain", "shell"))
      .unwrap();

    let found = storage.lookup("k").unwrap().unwrap();
    assert_eq!(found.body, b"shell");
    assert_eq!(found.header("content-type"), Some("text/plain"));
    assert!(storage.lookup("missing").unwrap().is_none());
  }

  #[test]
  fn test_delete_removes_generation_and_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("old", "k", "/a", &Response::new(200, "text/plain", "x"))
      .unwrap();
    storage.open("runtime").unwrap();

    assert!(storage.delete("old").unwrap());
    assert!(!storage.delete("old").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["runtime"]);
    assert!(storage.lookup("k").unwrap().is_none());
  }
}
