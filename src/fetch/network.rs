//! Network access seam.

use async_trait::async_trait;
use std::time::Duration;

use super::request::Request;
use super::response::{Body, FetchedResponse};
use crate::error::NetworkError;

/// The live network as the strategies see it.
///
/// Production wires in [`HttpFetcher`]; tests substitute stubs and
/// count calls.
#[async_trait]
pub trait NetworkFetch: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<FetchedResponse, NetworkError>;
}

/// reqwest-backed fetcher.
///
/// Timeouts belong to the underlying client and surface as ordinary
/// [`NetworkError::Unavailable`] failures.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| NetworkError::BadRequest(e.to_string()))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl NetworkFetch for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<FetchedResponse, NetworkError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|_| NetworkError::BadRequest(format!("invalid method {}", request.method)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();
    let body = response.bytes().await?;

    Ok(FetchedResponse::new(status, headers, Body::new(body)))
  }
}
