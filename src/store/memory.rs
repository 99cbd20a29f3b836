//! In-memory generation store.
//!
//! Same contract as the SQLite store, backed by a `HashMap`. Used by
//! tests and by embedders that want the cache semantics without a
//! database file.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use super::{Generation, GenerationStore, StoredEntry, StoredResponse};
use crate::error::StoreError;
use crate::fetch::request::RequestKey;

#[derive(Default)]
pub struct MemoryStore {
  generations: Mutex<HashMap<String, HashMap<String, StoredEntry>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl GenerationStore for MemoryStore {
  fn open(&self, name: &str) -> Result<Generation, StoreError> {
    let mut generations = self
      .generations
      .lock()
      .map_err(|_| StoreError::LockPoisoned)?;
    generations.entry(name.to_owned()).or_default();

    Ok(Generation::new(name))
  }

  fn put(
    &self,
    generation: &Generation,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> Result<(), StoreError> {
    let mut generations = self
      .generations
      .lock()
      .map_err(|_| StoreError::LockPoisoned)?;

    generations
      .entry(generation.name().to_owned())
      .or_default()
      .insert(
        key.storage_hash(),
        StoredEntry {
          response: response.clone(),
          stored_at: Utc::now(),
        },
      );

    Ok(())
  }

  fn get(
    &self,
    generation: &Generation,
    key: &RequestKey,
  ) -> Result<Option<StoredEntry>, StoreError> {
    let generations = self
      .generations
      .lock()
      .map_err(|_| StoreError::LockPoisoned)?;

    Ok(
      generations
        .get(generation.name())
        .and_then(|entries| entries.get(&key.storage_hash()))
        .cloned(),
    )
  }

  fn delete_generation(&self, name: &str) -> Result<(), StoreError> {
    let mut generations = self
      .generations
      .lock()
      .map_err(|_| StoreError::LockPoisoned)?;
    generations.remove(name);

    Ok(())
  }

  fn list_generation_names(&self) -> Result<BTreeSet<String>, StoreError> {
    let generations = self
      .generations
      .lock()
      .map_err(|_| StoreError::LockPoisoned)?;

    Ok(generations.keys().cloned().collect())
  }
}
