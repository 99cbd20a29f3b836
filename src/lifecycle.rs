//! Install/activate lifecycle for cache generations.
//!
//! One controller exists per deployed version. Installing seeds the
//! version's generation from the manifest; activating prunes every other
//! generation and claims the open client sessions. The state machine is
//! an explicit value so tests can drive transitions without a real
//! network stack.

use futures::future::try_join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SeedManifest;
use crate::error::LifecycleError;
use crate::fetch::network::NetworkFetch;
use crate::fetch::request::{Request, RequestKey};
use crate::store::{GenerationStore, StoredResponse};

/// Controller states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Seeding has not completed; install may be (re)tried
  Installing,
  /// Seeded and waiting to activate
  Installed,
  /// Prune-and-claim sweep in progress
  Activating,
  /// Serving traffic against the current generation
  Activated,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LifecycleState::Installing => "installing",
      LifecycleState::Installed => "installed",
      LifecycleState::Activating => "activating",
      LifecycleState::Activated => "activated",
    };
    write!(f, "{s}")
  }
}

/// Identifier for an open client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// Open client sessions and the generation version controlling each.
///
/// Sessions outlive any single controller: a new version's controller
/// claims sessions that an old version was serving.
#[derive(Debug, Default)]
pub struct ClientRegistry {
  next_id: u64,
  clients: HashMap<ClientId, Option<String>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a session not yet controlled by any version.
  pub fn register(&mut self) -> ClientId {
    self.insert(None)
  }

  /// Register a session already controlled by `version` — one that was
  /// open before the current controller existed.
  pub fn register_controlled(&mut self, version: &str) -> ClientId {
    self.insert(Some(version.to_owned()))
  }

  fn insert(&mut self, controller: Option<String>) -> ClientId {
    let id = ClientId(self.next_id);
    self.next_id += 1;
    self.clients.insert(id, controller);
    id
  }

  /// The session closed.
  pub fn release(&mut self, id: ClientId) {
    self.clients.remove(&id);
  }

  pub fn controller_of(&self, id: ClientId) -> Option<&str> {
    self.clients.get(&id).and_then(|v| v.as_deref())
  }

  /// Number of sessions controlled by a version other than `version`.
  pub fn controlled_elsewhere(&self, version: &str) -> usize {
    self
      .clients
      .values()
      .filter(|controller| matches!(controller, Some(v) if v != version))
      .count()
  }

  /// Retarget every open session to `version`, reload-free.
  fn claim_all(&mut self, version: &str) {
    for controller in self.clients.values_mut() {
      *controller = Some(version.to_owned());
    }
  }

  pub fn len(&self) -> usize {
    self.clients.len()
  }

  pub fn is_empty(&self) -> bool {
    self.clients.is_empty()
  }
}

/// Outcome of an activation attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Activation {
  /// Clients controlled by an older version are still open and
  /// skip-waiting is not set; try again later.
  Waiting,
  /// Prune and claim completed; `pruned` lists the generations removed.
  Activated { pruned: Vec<String> },
}

/// Drives one deployed version through install and activation.
///
/// The controller exclusively owns generation creation and deletion;
/// the fetch strategies only ever touch the generation it hands out.
pub struct LifecycleController<S: GenerationStore, N: NetworkFetch> {
  store: Arc<S>,
  network: Arc<N>,
  version: String,
  state: LifecycleState,
  skip_waiting: bool,
}

impl<S: GenerationStore, N: NetworkFetch> LifecycleController<S, N> {
  pub fn new(store: Arc<S>, network: Arc<N>, version: impl Into<String>) -> Self {
    Self {
      store,
      network,
      version: version.into(),
      state: LifecycleState::Installing,
      skip_waiting: false,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Request fast activation: skip the wait for old-version clients.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  /// Seed the current version's generation from the manifest.
  ///
  /// All-or-nothing: every entry is fetched before anything is written,
  /// so one failed fetch leaves no partially populated generation and
  /// the whole batch can simply be retried. A partially seeded cache is
  /// worse than an unseeded one — offline fallback depends on
  /// completeness.
  pub async fn install(&mut self, manifest: &SeedManifest) -> Result<(), LifecycleError> {
    if self.state != LifecycleState::Installing {
      return Err(LifecycleError::InvalidState {
        operation: "install",
        expected: "installing",
        actual: self.state,
      });
    }

    let network = Arc::clone(&self.network);
    let fetches = manifest.entries().iter().map(|key| {
      let network = Arc::clone(&network);
      async move {
        let request = Request::new(key.method(), key.url().clone());
        let response =
          network
            .fetch(&request)
            .await
            .map_err(|source| LifecycleError::SeedFetchFailed {
              url: key.url().to_string(),
              source,
            })?;

        if !response.is_success() {
          return Err(LifecycleError::SeedRejected {
            url: key.url().to_string(),
            status: response.status,
          });
        }

        Ok((key, response.into_stored()))
      }
    });
    let staged: Vec<(&RequestKey, StoredResponse)> = try_join_all(fetches).await?;

    let generation = self.store.open(&self.version)?;
    for (key, response) in &staged {
      if let Err(err) = self.store.put(&generation, key, response) {
        // Never leave a half-seeded generation behind.
        if let Err(cleanup) = self.store.delete_generation(&self.version) {
          warn!(version = %self.version, error = %cleanup, "failed to remove partially seeded generation");
        }
        return Err(err.into());
      }
    }

    info!(version = %self.version, entries = staged.len(), "generation seeded");
    self.state = LifecycleState::Installed;
    Ok(())
  }

  /// True when activation would proceed rather than wait.
  pub fn ready_to_activate(&self, clients: &ClientRegistry) -> bool {
    self.skip_waiting || clients.controlled_elsewhere(&self.version) == 0
  }

  /// Prune stale generations, then claim the open clients.
  ///
  /// Both phases complete before this returns `Activated`. A failed
  /// generation delete is logged and skipped; it never blocks the rest
  /// of the sweep. Old requests in flight may still read a stale
  /// generation while the sweep runs — deletion only affects future
  /// lookups, never already-returned responses.
  pub async fn activate(
    &mut self,
    clients: &mut ClientRegistry,
  ) -> Result<Activation, LifecycleError> {
    if self.state != LifecycleState::Installed {
      return Err(LifecycleError::InvalidState {
        operation: "activate",
        expected: "installed",
        actual: self.state,
      });
    }

    if !self.ready_to_activate(clients) {
      return Ok(Activation::Waiting);
    }

    let names = self.store.list_generation_names()?;
    self.state = LifecycleState::Activating;

    let mut pruned = Vec::new();
    for name in names {
      if name == self.version {
        continue;
      }
      match self.store.delete_generation(&name) {
        Ok(()) => {
          info!(generation = %name, "deleted stale generation");
          pruned.push(name);
        }
        Err(err) => {
          warn!(generation = %name, error = %err, "failed to delete stale generation");
        }
      }
    }

    clients.claim_all(&self.version);
    self.state = LifecycleState::Activated;

    Ok(Activation::Activated { pruned })
  }
}
