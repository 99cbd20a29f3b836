//! SQLite-backed generation store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{Generation, GenerationStore, StoredEntry, StoredResponse};
use crate::error::StoreError;
use crate::fetch::request::RequestKey;

/// Durable generation store over a single SQLite database.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at the default location.
  pub fn open_default() -> Result<Self, StoreError> {
    Self::open(Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| StoreError::CreateDir {
        path: parent.display().to_string(),
        source: e,
      })?;
    }

    let conn = Connection::open(path).map_err(|e| StoreError::Open {
      path: path.display().to_string(),
      source: e,
    })?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Default database path under the platform data directory.
  fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StoreError::NoDataDir)?;

    Ok(data_dir.join("outpost").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<(), StoreError> {
    let conn = self.lock()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(StoreError::Migration)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

/// Schema for the generation tables.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per cached response, keyed by the request's storage hash.
-- Method and URL are kept alongside for inspection.
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_generation ON entries(generation);
"#;

impl GenerationStore for SqliteStore {
  fn open(&self, name: &str) -> Result<Generation, StoreError> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![name],
    )?;

    Ok(Generation::new(name))
  }

  fn put(
    &self,
    generation: &Generation,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> Result<(), StoreError> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)?;

    conn.execute(
      "INSERT OR REPLACE INTO entries (generation, key_hash, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation.name(),
        key.storage_hash(),
        key.method(),
        key.url().as_str(),
        response.status,
        headers,
        response.body.to_vec(),
      ],
    )?;

    Ok(())
  }

  fn get(
    &self,
    generation: &Generation,
    key: &RequestKey,
  ) -> Result<Option<StoredEntry>, StoreError> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE generation = ? AND key_hash = ?",
        params![generation.name(), key.storage_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers_json, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)?;
        Ok(Some(StoredEntry {
          response: StoredResponse::new(status, headers, body),
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete_generation(&self, name: &str) -> Result<(), StoreError> {
    let mut conn = self.lock()?;

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])?;
    tx.execute("DELETE FROM generations WHERE name = ?", params![name])?;
    tx.commit()?;

    Ok(())
  }

  fn list_generation_names(&self) -> Result<BTreeSet<String>, StoreError> {
    let conn = self.lock()?;

    let mut stmt = conn.prepare("SELECT name FROM generations ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(names)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| StoreError::Timestamp(format!("{s}: {e}")))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("cache.db")).unwrap();
    (dir, store)
  }

  fn key(url: &str) -> RequestKey {
    RequestKey::new("GET", Url::parse(url).unwrap())
  }

  fn response(body: &str) -> StoredResponse {
    StoredResponse::new(
      200,
      vec![("content-type".into(), "text/html".into())],
      body.to_owned(),
    )
  }

  #[test]
  fn open_is_idempotent_and_preserves_contents() {
    let (_dir, store) = store();

    let generation = store.open("app-cache-v1").unwrap();
    let key = key("https://example.com/index.html");
    store.put(&generation, &key, &response("hello")).unwrap();

    let reopened = store.open("app-cache-v1").unwrap();
    let entry = store.get(&reopened, &key).unwrap().unwrap();
    assert_eq!(entry.response.body.as_ref(), b"hello");
    assert_eq!(entry.response.status, 200);
  }

  #[test]
  fn put_overwrites_existing_entry() {
    let (_dir, store) = store();

    let generation = store.open("app-cache-v1").unwrap();
    let key = key("https://example.com/style.css");
    store.put(&generation, &key, &response("old")).unwrap();
    store.put(&generation, &key, &response("new")).unwrap();

    let entry = store.get(&generation, &key).unwrap().unwrap();
    assert_eq!(entry.response.body.as_ref(), b"new");
  }

  #[test]
  fn missing_key_is_none() {
    let (_dir, store) = store();

    let generation = store.open("app-cache-v1").unwrap();
    assert!(store
      .get(&generation, &key("https://example.com/missing"))
      .unwrap()
      .is_none());
  }

  #[test]
  fn generations_are_isolated() {
    let (_dir, store) = store();

    let v1 = store.open("app-cache-v1").unwrap();
    let v2 = store.open("app-cache-v2").unwrap();
    let key = key("https://example.com/");
    store.put(&v1, &key, &response("v1 body")).unwrap();

    assert!(store.get(&v2, &key).unwrap().is_none());
  }

  #[test]
  fn delete_generation_is_idempotent() {
    let (_dir, store) = store();

    let generation = store.open("app-cache-v1").unwrap();
    let key = key("https://example.com/");
    store.put(&generation, &key, &response("body")).unwrap();

    store.delete_generation("app-cache-v1").unwrap();
    assert!(store.get(&generation, &key).unwrap().is_none());

    // Deleting a name that no longer exists is not an error.
    store.delete_generation("app-cache-v1").unwrap();
    store.delete_generation("never-existed").unwrap();
  }

  #[test]
  fn list_names_reflects_open_and_delete() {
    let (_dir, store) = store();

    store.open("app-cache-v1").unwrap();
    store.open("app-cache-v2").unwrap();

    let names = store.list_generation_names().unwrap();
    assert_eq!(
      names.into_iter().collect::<Vec<_>>(),
      vec!["app-cache-v1", "app-cache-v2"]
    );

    store.delete_generation("app-cache-v1").unwrap();
    let names = store.list_generation_names().unwrap();
    assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["app-cache-v2"]);
  }

  #[test]
  fn stored_at_is_stamped_on_write() {
    let (_dir, store) = store();

    let generation = store.open("app-cache-v1").unwrap();
    let key = key("https://example.com/");
    store.put(&generation, &key, &response("body")).unwrap();

    let entry = store.get(&generation, &key).unwrap().unwrap();
    let age = Utc::now() - entry.stored_at;
    assert!(age.num_minutes() < 5, "stored_at should be recent: {age}");
  }
}
