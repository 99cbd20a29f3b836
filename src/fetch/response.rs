//! Response values and the single-read body discipline.

use bytes::Bytes;

use crate::store::StoredResponse;

/// A response payload that can be read exactly once.
///
/// Reading consumes the value and there is no `Clone`. A response that
/// must feed two consumers — persisted into the cache and returned to
/// the caller — has to be split with [`Body::fork`] before either side
/// reads, so a double read fails to compile instead of corrupting a
/// half-drained stream at runtime.
#[derive(Debug)]
pub struct Body(Bytes);

impl Body {
  pub fn new(bytes: impl Into<Bytes>) -> Self {
    Self(bytes.into())
  }

  pub fn empty() -> Self {
    Self(Bytes::new())
  }

  /// Consume the body and yield its bytes.
  pub fn read(self) -> Bytes {
    self.0
  }

  /// Split into two independently readable bodies.
  pub fn fork(self) -> (Body, Body) {
    (Body(self.0.clone()), Body(self.0))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// A live response coming back from the network (or rebuilt from the
/// store), body not yet consumed.
#[derive(Debug)]
pub struct FetchedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  body: Body,
}

impl FetchedResponse {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: Body) -> Self {
    Self {
      status,
      headers,
      body,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_len(&self) -> usize {
    self.body.len()
  }

  /// Split into two responses with independently readable bodies.
  pub fn fork(self) -> (FetchedResponse, FetchedResponse) {
    let (left, right) = self.body.fork();
    (
      FetchedResponse::new(self.status, self.headers.clone(), left),
      FetchedResponse::new(self.status, self.headers, right),
    )
  }

  /// Consume the response and yield its body bytes.
  pub fn into_body(self) -> Bytes {
    self.body.read()
  }

  /// Consume the response into its storable form.
  pub fn into_stored(self) -> StoredResponse {
    StoredResponse::new(self.status, self.headers, self.body.read())
  }
}
