//! Durable, named cache generations.
//!
//! A generation is a named key→response mapping, one per deployed
//! version. The lifecycle controller creates and deletes generations;
//! the fetch strategies read and write the current one. Implementations
//! give per-key atomicity only — callers must not assume cross-key
//! transactions.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::error::StoreError;
use crate::fetch::request::RequestKey;
use crate::fetch::response::{Body, FetchedResponse};

/// Handle to a named generation.
///
/// Carries no storage state of its own; it exists so callers hold an
/// opened generation rather than a raw name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  name: String,
}

impl Generation {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// A response payload as the store keeps it: status, headers, opaque
/// body bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl StoredResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  /// Rebuild a live response from the stored payload.
  pub fn into_response(self) -> FetchedResponse {
    FetchedResponse::new(self.status, self.headers, Body::new(self.body))
  }
}

/// A stored response together with its insertion time.
///
/// The timestamp is stamped by the store at write time; staleness
/// reasoning is left to callers.
#[derive(Debug, Clone)]
pub struct StoredEntry {
  pub response: StoredResponse,
  pub stored_at: DateTime<Utc>,
}

/// Storage contract for cache generations.
pub trait GenerationStore: Send + Sync {
  /// Open a generation, creating an empty one if the name is new.
  /// Idempotent.
  fn open(&self, name: &str) -> Result<Generation, StoreError>;

  /// Insert or overwrite the entry for `key`.
  fn put(
    &self,
    generation: &Generation,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> Result<(), StoreError>;

  /// Look up `key`. Absence is an expected branch, not an error.
  fn get(
    &self,
    generation: &Generation,
    key: &RequestKey,
  ) -> Result<Option<StoredEntry>, StoreError>;

  /// Delete a generation and all its entries. Idempotent: deleting a
  /// name that does not exist succeeds.
  fn delete_generation(&self, name: &str) -> Result<(), StoreError>;

  /// Names of all generations currently present.
  fn list_generation_names(&self) -> Result<BTreeSet<String>, StoreError>;
}
