//! Durable FIFO queue of deferred mutations.
//!
//! Non-idempotent requests that failed while offline wait here until a
//! connectivity-restored signal triggers a drain. Delivery is strictly
//! ordered: a failure keeps the item at the front and halts the cycle,
//! so the server never observes effects out of order.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::QueueError;
use crate::fetch::network::NetworkFetch;
use crate::fetch::request::Request;

/// Tag carried by the external connectivity-restored signal.
pub const CONNECTIVITY_TAG: &str = "connectivity-restored";

/// A mutation to queue for later delivery.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl NewMutation {
  pub fn new(method: &str, url: Url, body: impl Into<Bytes>) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_owned(), value.to_owned()));
    self
  }
}

/// A queued mutation as persisted.
#[derive(Debug, Clone)]
pub struct QueuedMutation {
  pub id: i64,
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  /// Failed delivery attempts so far; callers decide when enough is
  /// enough and abandon.
  pub attempts: u32,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedMutation {
  fn to_request(&self) -> Result<Request, QueueError> {
    let url = Url::parse(&self.url).map_err(|_| QueueError::InvalidUrl {
      id: self.id,
      url: self.url.clone(),
    })?;

    let mut request = Request::new(&self.method, url).with_body(self.body.clone());
    for (name, value) in &self.headers {
      request = request.with_header(name, value);
    }

    Ok(request)
  }
}

/// Result of one drain cycle.
#[derive(Debug, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: usize,
  /// Id of the mutation whose delivery failed, halting the cycle.
  pub halted_on: Option<i64>,
  pub remaining: usize,
}

/// Durable mutation queue, independent of the cache generations.
pub struct MutationQueue {
  conn: Mutex<Connection>,
  drain_guard: tokio::sync::Mutex<()>,
}

/// Schema for the queue table.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl MutationQueue {
  /// Open or create the queue at the default location.
  pub fn open_default() -> Result<Self, QueueError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(QueueError::NoDataDir)?;

    Self::open(data_dir.join("outpost").join("queue.db"))
  }

  /// Open or create the queue at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| QueueError::CreateDir {
        path: parent.display().to_string(),
        source: e,
      })?;
    }

    let conn = Connection::open(path).map_err(|e| QueueError::Open {
      path: path.display().to_string(),
      source: e,
    })?;

    let queue = Self {
      conn: Mutex::new(conn),
      drain_guard: tokio::sync::Mutex::new(()),
    };
    queue.run_migrations()?;
    queue.recover_in_flight()?;

    Ok(queue)
  }

  fn run_migrations(&self) -> Result<(), QueueError> {
    let conn = self.lock()?;
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(QueueError::Migration)
  }

  /// Rows left in-flight by a crashed process go back to pending.
  fn recover_in_flight(&self) -> Result<(), QueueError> {
    let conn = self.lock()?;
    let recovered = conn.execute(
      "UPDATE mutations SET state = 'pending' WHERE state = 'in_flight'",
      [],
    )?;
    if recovered > 0 {
      warn!(recovered, "recovered in-flight mutations from a previous run");
    }

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
    self.conn.lock().map_err(|_| QueueError::LockPoisoned)
  }

  /// Append a mutation to the durable FIFO. Returns its id.
  pub fn enqueue(&self, mutation: &NewMutation) -> Result<i64, QueueError> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&mutation.headers)?;

    conn.execute(
      "INSERT INTO mutations (method, url, headers, body) VALUES (?, ?, ?, ?)",
      params![
        mutation.method,
        mutation.url.as_str(),
        headers,
        mutation.body.to_vec(),
      ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(id, method = %mutation.method, url = %mutation.url, "mutation queued");

    Ok(id)
  }

  /// Everything still awaiting delivery, in FIFO order.
  pub fn pending(&self) -> Result<Vec<QueuedMutation>, QueueError> {
    let conn = self.lock()?;

    let mut stmt = conn.prepare(
      "SELECT id, method, url, headers, body, attempts, enqueued_at
       FROM mutations ORDER BY id",
    )?;
    let rows = stmt
      .query_map([], row_to_parts)?
      .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(parts_to_mutation).collect()
  }

  pub fn len(&self) -> Result<usize, QueueError> {
    let conn = self.lock()?;
    let count: usize = conn.query_row("SELECT COUNT(*) FROM mutations", [], |row| row.get(0))?;

    Ok(count)
  }

  pub fn is_empty(&self) -> Result<bool, QueueError> {
    Ok(self.len()? == 0)
  }

  /// Remove a mutation without delivering it. Returns whether it existed.
  pub fn abandon(&self, id: i64) -> Result<bool, QueueError> {
    let conn = self.lock()?;
    let removed = conn.execute("DELETE FROM mutations WHERE id = ?", params![id])?;
    if removed > 0 {
      info!(id, "mutation abandoned");
    }

    Ok(removed > 0)
  }

  /// Deliver pending mutations in FIFO order.
  ///
  /// Each item is marked in-flight before the network call and removed
  /// only after delivery succeeds, so re-triggering a drain concurrently
  /// cannot deliver an item twice (an async mutex also serializes whole
  /// cycles). A failed delivery releases the item back to the front of
  /// the queue and halts the cycle.
  pub async fn drain<N: NetworkFetch>(&self, network: &N) -> Result<DrainReport, QueueError> {
    let _guard = self.drain_guard.lock().await;
    let mut delivered = 0;

    loop {
      let Some(mutation) = self.claim_next()? else {
        break;
      };

      let request = match mutation.to_request() {
        Ok(request) => request,
        Err(err) => {
          // An undeliverable row would wedge the queue forever.
          warn!(id = mutation.id, error = %err, "dropping malformed queued mutation");
          self.remove(mutation.id)?;
          continue;
        }
      };

      match network.fetch(&request).await {
        Ok(response) if response.status < 500 => {
          self.remove(mutation.id)?;
          delivered += 1;
          debug!(id = mutation.id, "queued mutation delivered");
        }
        Ok(response) => {
          self.release(mutation.id)?;
          info!(
            id = mutation.id,
            status = response.status,
            "delivery rejected by server, mutation stays queued"
          );
          return Ok(DrainReport {
            delivered,
            halted_on: Some(mutation.id),
            remaining: self.len()?,
          });
        }
        Err(err) => {
          self.release(mutation.id)?;
          info!(id = mutation.id, error = %err, "delivery failed, mutation stays queued");
          return Ok(DrainReport {
            delivered,
            halted_on: Some(mutation.id),
            remaining: self.len()?,
          });
        }
      }
    }

    Ok(DrainReport {
      delivered,
      halted_on: None,
      remaining: self.len()?,
    })
  }

  /// Drain when the signal tag matches [`CONNECTIVITY_TAG`].
  pub async fn on_signal<N: NetworkFetch>(
    &self,
    tag: &str,
    network: &N,
  ) -> Result<Option<DrainReport>, QueueError> {
    if tag != CONNECTIVITY_TAG {
      debug!(tag, "ignoring unknown sync signal");
      return Ok(None);
    }

    self.drain(network).await.map(Some)
  }

  /// Take the oldest pending mutation and mark it in-flight.
  fn claim_next(&self) -> Result<Option<QueuedMutation>, QueueError> {
    let conn = self.lock()?;

    let parts = conn
      .query_row(
        "SELECT id, method, url, headers, body, attempts, enqueued_at
         FROM mutations WHERE state = 'pending' ORDER BY id LIMIT 1",
        [],
        row_to_parts,
      )
      .optional()?;

    let Some(parts) = parts else {
      return Ok(None);
    };
    conn.execute(
      "UPDATE mutations SET state = 'in_flight' WHERE id = ?",
      params![parts.0],
    )?;

    parts_to_mutation(parts).map(Some)
  }

  fn remove(&self, id: i64) -> Result<(), QueueError> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM mutations WHERE id = ?", params![id])?;

    Ok(())
  }

  /// Put a claimed mutation back at the front, counting the failure.
  fn release(&self, id: i64) -> Result<(), QueueError> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE mutations SET state = 'pending', attempts = attempts + 1 WHERE id = ?",
      params![id],
    )?;

    Ok(())
  }
}

type MutationParts = (i64, String, String, String, Vec<u8>, u32, String);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<MutationParts> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn parts_to_mutation(parts: MutationParts) -> Result<QueuedMutation, QueueError> {
  let (id, method, url, headers_json, body, attempts, enqueued_at) = parts;
  let headers: Vec<(String, String)> = serde_json::from_str(&headers_json)?;

  Ok(QueuedMutation {
    id,
    method,
    url,
    headers,
    body: Bytes::from(body),
    attempts,
    enqueued_at: parse_datetime(&enqueued_at),
  })
}

/// Parse a datetime string from SQLite format, epoch on mismatch.
fn parse_datetime(s: &str) -> DateTime<Utc> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::NetworkError;
  use crate::fetch::response::{Body, FetchedResponse};
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  /// Accepts every delivery except URLs whose path contains `fail_on`.
  struct FlakyNetwork {
    fail_on: Option<&'static str>,
    calls: AtomicU32,
  }

  impl FlakyNetwork {
    fn reliable() -> Self {
      Self {
        fail_on: None,
        calls: AtomicU32::new(0),
      }
    }

    fn failing_on(marker: &'static str) -> Self {
      Self {
        fail_on: Some(marker),
        calls: AtomicU32::new(0),
      }
    }

    fn calls(&self) -> u32 {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl NetworkFetch for FlakyNetwork {
    async fn fetch(&self, request: &Request) -> Result<FetchedResponse, NetworkError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      // Give concurrent drains a chance to overlap.
      tokio::time::sleep(Duration::from_millis(2)).await;

      if let Some(marker) = self.fail_on {
        if request.url.path().contains(marker) {
          return Err(NetworkError::Unavailable("still offline".into()));
        }
      }
      Ok(FetchedResponse::new(204, Vec::new(), Body::empty()))
    }
  }

  fn queue() -> (tempfile::TempDir, MutationQueue) {
    let dir = tempfile::tempdir().unwrap();
    let queue = MutationQueue::open(dir.path().join("queue.db")).unwrap();
    (dir, queue)
  }

  fn mutation(path: &str) -> NewMutation {
    let url = Url::parse(&format!("https://example.com{path}")).unwrap();
    NewMutation::new("POST", url, format!("payload for {path}"))
      .with_header("content-type", "application/json")
  }

  #[tokio::test]
  async fn drain_delivers_in_fifo_order() {
    let (_dir, queue) = queue();
    queue.enqueue(&mutation("/api/contact/a")).unwrap();
    queue.enqueue(&mutation("/api/contact/b")).unwrap();

    let network = FlakyNetwork::reliable();
    let report = queue.drain(&network).await.unwrap();

    assert_eq!(
      report,
      DrainReport {
        delivered: 2,
        halted_on: None,
        remaining: 0
      }
    );
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn a_failed_delivery_halts_the_cycle_and_keeps_order() {
    let (_dir, queue) = queue();
    queue.enqueue(&mutation("/api/contact/a")).unwrap();
    let b = queue.enqueue(&mutation("/api/contact/b")).unwrap();
    queue.enqueue(&mutation("/api/contact/c")).unwrap();

    let network = FlakyNetwork::failing_on("/b");
    let report = queue.drain(&network).await.unwrap();

    // A delivered, B retried later, C untouched.
    assert_eq!(
      report,
      DrainReport {
        delivered: 1,
        halted_on: Some(b),
        remaining: 2
      }
    );

    let pending = queue.pending().unwrap();
    let paths: Vec<&str> = pending
      .iter()
      .map(|m| m.url.rsplit('/').next().unwrap())
      .collect();
    assert_eq!(paths, vec!["b", "c"]);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[1].attempts, 0);

    // C was never attempted: only A and B hit the network.
    assert_eq!(network.calls(), 2);
  }

  #[tokio::test]
  async fn a_later_drain_picks_up_where_the_failure_left_off() {
    let (_dir, queue) = queue();
    queue.enqueue(&mutation("/api/contact/a")).unwrap();
    queue.enqueue(&mutation("/api/contact/b")).unwrap();

    let outage = FlakyNetwork::failing_on("/b");
    queue.drain(&outage).await.unwrap();

    let restored = FlakyNetwork::reliable();
    let report = queue.drain(&restored).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn server_rejections_are_delivered_not_retried() {
    struct RejectingNetwork;

    #[async_trait]
    impl NetworkFetch for RejectingNetwork {
      async fn fetch(&self, _request: &Request) -> Result<FetchedResponse, NetworkError> {
        Ok(FetchedResponse::new(422, Vec::new(), Body::empty()))
      }
    }

    let (_dir, queue) = queue();
    queue.enqueue(&mutation("/api/contact/a")).unwrap();

    let report = queue.drain(&RejectingNetwork).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn abandoned_mutations_are_removed_without_delivery() {
    let (_dir, queue) = queue();
    let id = queue.enqueue(&mutation("/api/contact/a")).unwrap();

    assert!(queue.abandon(id).unwrap());
    assert!(!queue.abandon(id).unwrap());

    let network = FlakyNetwork::reliable();
    let report = queue.drain(&network).await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn concurrent_drains_deliver_each_mutation_once() {
    let (_dir, queue) = queue();
    for path in ["/api/a", "/api/b", "/api/c"] {
      queue.enqueue(&mutation(path)).unwrap();
    }

    let network = FlakyNetwork::reliable();
    let (first, second) = tokio::join!(queue.drain(&network), queue.drain(&network));

    let total = first.unwrap().delivered + second.unwrap().delivered;
    assert_eq!(total, 3);
    assert_eq!(network.calls(), 3);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn unknown_signal_tags_do_not_drain() {
    let (_dir, queue) = queue();
    queue.enqueue(&mutation("/api/contact/a")).unwrap();

    let network = FlakyNetwork::reliable();
    assert!(queue
      .on_signal("some-other-sync", &network)
      .await
      .unwrap()
      .is_none());
    assert_eq!(network.calls(), 0);

    let report = queue
      .on_signal(CONNECTIVITY_TAG, &network)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(report.delivered, 1);
  }

  #[tokio::test]
  async fn in_flight_rows_recover_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
      let queue = MutationQueue::open(&path).unwrap();
      queue.enqueue(&mutation("/api/contact/a")).unwrap();
    }

    // Simulate a crash mid-delivery: the row is stuck in-flight.
    {
      let conn = Connection::open(&path).unwrap();
      conn
        .execute("UPDATE mutations SET state = 'in_flight'", [])
        .unwrap();
    }

    let queue = MutationQueue::open(&path).unwrap();
    let network = FlakyNetwork::reliable();
    let report = queue.drain(&network).await.unwrap();
    assert_eq!(report.delivered, 1);
  }

  #[tokio::test]
  async fn queued_payloads_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    {
      let queue = MutationQueue::open(&path).unwrap();
      queue.enqueue(&mutation("/api/contact/a")).unwrap();
    }

    let queue = MutationQueue::open(&path).unwrap();
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].method, "POST");
    assert_eq!(pending[0].body.as_ref(), b"payload for /api/contact/a");
    assert_eq!(
      pending[0].headers,
      vec![("content-type".to_owned(), "application/json".to_owned())]
    );
  }
}
