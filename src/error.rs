//! Error types for the cache core.
//!
//! Each subsystem has its own enum; cache misses are `Option::None`
//! everywhere, never an error. Double consumption of a response body has
//! no variant here because the `Body` type makes it unrepresentable.

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Errors from the durable generation store.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to create cache directory {path}: {source}")]
  CreateDir {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to open cache store at {path}: {source}")]
  Open {
    path: String,
    #[source]
    source: rusqlite::Error,
  },

  #[error("cache store migration failed: {0}")]
  Migration(#[source] rusqlite::Error),

  #[error("cache store query failed: {0}")]
  Query(#[from] rusqlite::Error),

  #[error("stored headers could not be decoded: {0}")]
  HeaderDecode(#[from] serde_json::Error),

  #[error("stored timestamp could not be parsed: {0}")]
  Timestamp(String),

  #[error("could not determine a data directory for the cache store")]
  NoDataDir,

  #[error("store lock poisoned")]
  LockPoisoned,
}

/// Transient network-level failures: timeouts, DNS, refused connections,
/// being offline. Strategies catch these and take their fallback branch.
#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("network unavailable: {0}")]
  Unavailable(String),

  #[error("request could not be built: {0}")]
  BadRequest(String),
}

impl From<reqwest::Error> for NetworkError {
  fn from(err: reqwest::Error) -> Self {
    NetworkError::Unavailable(err.to_string())
  }
}

/// Errors surfaced by the fetch router.
///
/// Navigations only ever fail with `Unreachable` (offline with nothing
/// seeded); sub-resource misses surface the network's own failure as
/// their result.
#[derive(Debug, Error)]
pub enum RouteError {
  #[error("offline and nothing cached for {key}, fallback document not seeded")]
  Unreachable { key: String },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Network(#[from] NetworkError),
}

/// Errors from the install/activate state machine.
#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error("seed fetch failed for {url}: {source}")]
  SeedFetchFailed {
    url: String,
    #[source]
    source: NetworkError,
  },

  #[error("seed response for {url} had status {status}")]
  SeedRejected { url: String, status: u16 },

  #[error("invalid lifecycle transition: {operation} requires {expected}, state is {actual}")]
  InvalidState {
    operation: &'static str,
    expected: &'static str,
    actual: LifecycleState,
  },

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors from the deferred mutation queue. A failed delivery is not an
/// error: the drain reports it and leaves the item queued.
#[derive(Debug, Error)]
pub enum QueueError {
  #[error("failed to create queue directory {path}: {source}")]
  CreateDir {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to open mutation queue at {path}: {source}")]
  Open {
    path: String,
    #[source]
    source: rusqlite::Error,
  },

  #[error("mutation queue migration failed: {0}")]
  Migration(#[source] rusqlite::Error),

  #[error("mutation queue query failed: {0}")]
  Query(#[from] rusqlite::Error),

  #[error("queued headers could not be decoded: {0}")]
  HeaderDecode(#[from] serde_json::Error),

  #[error("queued mutation {id} has an invalid URL: {url}")]
  InvalidUrl { id: i64, url: String },

  #[error("could not determine a data directory for the mutation queue")]
  NoDataDir,

  #[error("queue lock poisoned")]
  LockPoisoned,
}
