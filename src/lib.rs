//! Offline-first response cache and fetch-routing layer.
//!
//! Sits between a client application and the network. Every intercepted
//! request routes through a consistency strategy picked by its kind —
//! navigations network-first with an offline fallback, sub-resources
//! cache-first — against a versioned, named cache generation. Install
//! seeds the generation from a manifest all-or-nothing; activation
//! prunes every stale generation and claims the open client sessions.
//! Mutations that failed while offline queue durably and replay in
//! order once connectivity returns.

pub mod config;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod queue;
pub mod store;

pub use config::{Config, SeedManifest};
pub use fetch::{
  Destination, FetchRouter, HttpFetcher, NetworkFetch, Request, RequestKey, ResponseSource,
  RoutedResponse,
};
pub use lifecycle::{Activation, ClientRegistry, LifecycleController, LifecycleState};
pub use queue::{DrainReport, MutationQueue, NewMutation, CONNECTIVITY_TAG};
pub use store::{Generation, GenerationStore, MemoryStore, SqliteStore, StoredResponse};
