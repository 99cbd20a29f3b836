//! Fetch routing: classify a request, run it through the right strategy.
//!
//! Navigations go network-first so documents stay fresh while online and
//! degrade to the cached copy (or the seeded fallback document) when the
//! network fails. Sub-resources go cache-first: a hit never touches the
//! network, and generation bumps are the only invalidation.

pub mod network;
pub mod request;
pub mod response;

pub use network::{HttpFetcher, NetworkFetch};
pub use request::{Destination, Request, RequestKey, RequestKind};
pub use response::{Body, FetchedResponse};

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RouteError;
use crate::store::{Generation, GenerationStore};

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Served from the current generation
  Cache,
  /// Offline navigation served the seeded fallback document
  Fallback,
}

/// A response together with the branch that produced it.
#[derive(Debug)]
pub struct RoutedResponse {
  pub response: FetchedResponse,
  pub source: ResponseSource,
}

/// Routes every intercepted request through a consistency strategy
/// against the current generation.
pub struct FetchRouter<S: GenerationStore, N: NetworkFetch> {
  store: Arc<S>,
  network: Arc<N>,
  generation: Generation,
  fallback: RequestKey,
}

impl<S, N> FetchRouter<S, N>
where
  S: GenerationStore + 'static,
  N: NetworkFetch,
{
  /// `fallback` is the seeded document served to offline navigations
  /// with no cached match (conventionally the application root).
  pub fn new(store: Arc<S>, network: Arc<N>, generation: Generation, fallback: RequestKey) -> Self {
    Self {
      store,
      network,
      generation,
      fallback,
    }
  }

  /// The generation this router reads and writes.
  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  /// Handle one intercepted request.
  pub async fn handle(&self, request: Request) -> Result<RoutedResponse, RouteError> {
    match request.kind() {
      RequestKind::Navigation => self.network_first(request).await,
      RequestKind::Subresource => self.cache_first(request).await,
    }
  }

  /// Network-first with cache fallback, for navigations.
  ///
  /// A successful fetch is forked: one half is persisted from a detached
  /// task so the caller-visible response is never blocked on — or failed
  /// by — the write. On network failure the cached copy is served, then
  /// the fallback document.
  async fn network_first(&self, request: Request) -> Result<RoutedResponse, RouteError> {
    let key = request.key();

    match self.network.fetch(&request).await {
      Ok(live) => {
        if live.is_success() {
          let (to_store, to_return) = live.fork();
          self.persist_detached(key, to_store);
          Ok(RoutedResponse {
            response: to_return,
            source: ResponseSource::Network,
          })
        } else {
          // Error pages are returned but never cached; they would
          // overwrite a usable offline copy.
          Ok(RoutedResponse {
            response: live,
            source: ResponseSource::Network,
          })
        }
      }
      Err(err) => {
        debug!(key = %key, error = %err, "network failed, serving from cache");

        if let Some(entry) = self.store.get(&self.generation, &key)? {
          return Ok(RoutedResponse {
            response: entry.response.into_response(),
            source: ResponseSource::Cache,
          });
        }

        match self.store.get(&self.generation, &self.fallback)? {
          Some(entry) => Ok(RoutedResponse {
            response: entry.response.into_response(),
            source: ResponseSource::Fallback,
          }),
          None => Err(RouteError::Unreachable {
            key: key.to_string(),
          }),
        }
      }
    }
  }

  /// Cache-first, for sub-resources.
  ///
  /// A hit returns the stored bytes with no network round trip and no
  /// freshness check. A miss fetches and returns the live result without
  /// persisting it: population happens at install-time seeding and via
  /// the navigation strategy's opportunistic writes.
  async fn cache_first(&self, request: Request) -> Result<RoutedResponse, RouteError> {
    let key = request.key();

    if let Some(entry) = self.store.get(&self.generation, &key)? {
      return Ok(RoutedResponse {
        response: entry.response.into_response(),
        source: ResponseSource::Cache,
      });
    }

    let live = self.network.fetch(&request).await?;
    Ok(RoutedResponse {
      response: live,
      source: ResponseSource::Network,
    })
  }

  /// Persist a response copy without blocking or failing the caller.
  fn persist_detached(&self, key: RequestKey, response: FetchedResponse) {
    let store = Arc::clone(&self.store);
    let generation = self.generation.clone();

    tokio::spawn(async move {
      let stored = response.into_stored();
      if let Err(err) = store.put(&generation, &key, &stored) {
        warn!(key = %key, error = %err, "failed to persist navigation response");
      }
    });
  }
}
