//! Request and response snapshots that flow through the router and the cache.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// How the request was initiated by the host application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  #[default]
  Other,
}

/// What kind of resource the request is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  #[default]
  Other,
}

/// An outbound request issued by the host application.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET request.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::Other,
      destination: Destination::Other,
      headers: Vec::new(),
      body: None,
    }
  }

  /// A top-level page load.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      destination: Destination::Document,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Normalized cache key, or `None` if the request can never be cached.
  ///
  /// Only GET requests are cacheable. The fragment never reaches the server,
  /// so it is not part of the key.
  pub fn cache_key(&self) -> Option<RequestKey> {
    if self.method != Method::GET {
      return None;
    }
    let mut url = self.url.clone();
    url.set_fragment(None);
    Some(RequestKey(format!("{} {}", self.method, url)))
  }
}

/// Normalized request identity used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

/// Immutable snapshot of a response: status, headers and the full body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether this response may be written to a cache generation.
  ///
  /// Partial content is never cached because the snapshot would be incomplete.
  pub fn is_cacheable(&self) -> bool {
    self.is_ok() && self.status != 206
  }

  /// Last-resort response when neither network nor cache can answer.
  pub fn offline_stub() -> Self {
    Self::new(503, "Service Unavailable: offline and no cached copy is available")
      .with_header("content-type", "text/plain; charset=utf-8")
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_ignores_fragment() {
    let a = Request::get(url("https://app.test/page#top"));
    let b = Request::get(url("https://app.test/page"));
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_cache_key_keeps_query() {
    let a = Request::get(url("https://app.test/api/items?page=1"));
    let b = Request::get(url("https://app.test/api/items?page=2"));
    assert_ne!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_non_get_has_no_cache_key() {
    let post = Request::get(url("https://app.test/api/items")).with_method(Method::POST);
    assert!(post.cache_key().is_none());
  }

  #[test]
  fn test_cacheable_statuses() {
    assert!(Response::new(200, "").is_cacheable());
    assert!(Response::new(204, "").is_cacheable());
    assert!(!Response::new(206, "").is_cacheable());
    assert!(!Response::new(404, "").is_cacheable());
    assert!(!Response::new(500, "").is_cacheable());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "").with_header("Content-Type", "text/html");
    assert_eq!(response.header("content-type"), Some("text/html"));
  }
}
