//! Request model, strategy classification, and normalized cache keys.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// What a request is for, mirroring the destination of the originating
/// load. Classification keys off this, never URL patterns — allow-lists
/// of paths are brittle across deploys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  /// Top-level document load
  Document,
  Script,
  Style,
  Font,
  Image,
  Media,
  Worker,
  /// Anything the caller could not classify
  Unknown,
}

/// Which consistency strategy a request gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  /// Document-level load: network-first with offline fallback
  Navigation,
  /// Everything else: cache-first for latency and offline availability
  Subresource,
}

/// An outbound request as seen by the interception layer.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Bytes>,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
      headers: Vec::new(),
      body: None,
      destination: Destination::Unknown,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_owned(), value.to_owned()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Classify into exactly one strategy bucket.
  ///
  /// Unclassifiable requests land in the sub-resource bucket:
  /// cache-first favors availability.
  pub fn kind(&self) -> RequestKind {
    match self.destination {
      Destination::Document => RequestKind::Navigation,
      _ => RequestKind::Subresource,
    }
  }

  /// Normalized cache identity of this request.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, self.url.clone())
  }
}

/// Normalized identity of a request: upper-cased method + absolute URL
/// with the fragment stripped, plus any vary-relevant header pairs.
/// Two requests with the same key are cache-equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: Url,
  vary: Vec<(String, String)>,
}

impl RequestKey {
  pub fn new(method: &str, mut url: Url) -> Self {
    url.set_fragment(None);
    Self {
      method: method.to_uppercase(),
      url,
      vary: Vec::new(),
    }
  }

  /// Fold a vary-relevant header into the identity. Pairs are kept
  /// sorted so insertion order cannot change the hash.
  pub fn with_vary_header(mut self, name: &str, value: &str) -> Self {
    self.vary.push((name.to_lowercase(), value.to_owned()));
    self.vary.sort();
    self
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Stable, fixed-length key for storage.
  pub fn storage_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    for (name, value) in &self.vary {
      hasher.update(b"\n");
      hasher.update(name.as_bytes());
      hasher.update(b":");
      hasher.update(value.as_bytes());
    }

    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}
