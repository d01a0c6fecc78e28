//! Network access for the router and the install step.

use std::future::Future;

use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use thiserror::Error;

use crate::http::{Request, Response};

/// The network could not produce a response at all.
///
/// HTTP error statuses are not failures; they arrive as a [`Response`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("network request to {url} failed: {reason}")]
pub struct FetchError {
  pub url: String,
  pub reason: String,
}

impl FetchError {
  pub fn new(url: impl Into<String>, reason: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      reason: reason.into(),
    }
  }
}

/// Anything that can turn a request into a response over the network.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

/// Fetcher backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("haven/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }
    let url = request.url.to_string();

    async move {
      let response = builder
        .send()
        .await
        .map_err(|e| FetchError::new(&url, e.to_string()))?;

      let status = response.status().as_u16();
      let headers = snapshot_headers(response.headers());
      let body = response
        .bytes()
        .await
        .map_err(|e| FetchError::new(&url, format!("failed to read body: {}", e)))?;

      Ok(Response {
        status,
        headers,
        body: body.to_vec(),
      })
    }
  }
}

/// Copy every header, including values that are not valid UTF-8.
fn snapshot_headers(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .map(|(name, value)| {
      (
        name.as_str().to_string(),
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
      )
    })
    .collect()
}


#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;

  #[test]
  fn test_snapshot_keeps_non_utf8_headers() {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/html"));
    headers.insert(
      "content-disposition",
      HeaderValue::from_bytes(b"attachment; filename=caf\xe9.txt").unwrap(),
    );
    headers.append("set-cookie", HeaderValue::from_static("a=1"));
    headers.append("set-cookie", HeaderValue::from_static("b=2"));

    let snapshot = snapshot_headers(&headers);
    assert_eq!(snapshot.len(), 4);
    assert!(snapshot.contains(&("content-type".to_string(), "text/html".to_string())));
    assert!(snapshot.contains(&(
      "content-disposition".to_string(),
      "attachment; filename=caf\u{fffd}.txt".to_string()
    )));
    assert_eq!(
      snapshot.iter().filter(|(name, _)| name == "set-cookie").count(),
      2
    );
  }
}
