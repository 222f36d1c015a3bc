//! Resource requests, responses and request classification.

use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// What kind of resource a request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
  Other,
}

impl Destination {
  /// Guess from the path's file extension.
  pub fn from_path(path: &str) -> Self {
    let ext = extension(path).unwrap_or_default();
    match ext.as_str() {
      "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" => Destination::Image,
      "js" | "mjs" => Destination::Script,
      "css" => Destination::Style,
      "woff" | "woff2" | "ttf" | "otf" => Destination::Font,
      "" | "html" | "htm" => Destination::Document,
      _ => Destination::Other,
    }
  }

  /// Parse a `Sec-Fetch-Dest` header value.
  pub fn from_fetch_dest(value: &str) -> Option<Self> {
    match value {
      "document" | "iframe" => Some(Destination::Document),
      "image" => Some(Destination::Image),
      "script" | "worker" => Some(Destination::Script),
      "style" => Some(Destination::Style),
      "font" => Some(Destination::Font),
      "empty" => None,
      _ => Some(Destination::Other),
    }
  }
}

fn extension(path: &str) -> Option<String> {
  let file = path.rsplit('/').next()?;
  let (_, ext) = file.rsplit_once('.')?;
  Some(ext.to_ascii_lowercase())
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    let destination = Destination::from_path(url.path());
    Self {
      method,
      url,
      destination,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  /// Stable, fixed-length key for the cache tables.
  pub fn cache_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A fully buffered response. Cloning it is how a copy goes into the cache
/// while the original is handed to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200"><rect fill="#eee" width="200" height="200"/></svg>"##;

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>Offline</title>
  <style>
    body { font-family: sans-serif; text-align: center; padding: 50px; background: #f5f5f5; }
    h1 { color: #333; }
    p { color: #666; }
  </style>
</head>
<body>
  <h1>No connection</h1>
  <p>The application is working offline.</p>
  <p>Samples you record are kept on this device and sent once the connection is back.</p>
</body>
</html>"#;

impl Response {
  pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: vec![("content-type".to_string(), content_type.to_string())],
      body: body.into(),
    }
  }

  /// 2xx
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Synthesized page for requests that neither network nor cache can serve.
  pub fn offline() -> Self {
    Self::new(503, "text/html; charset=utf-8", OFFLINE_PAGE)
  }

  /// Grey square standing in for an image that could not be fetched.
  pub fn image_placeholder() -> Self {
    Self::new(200, "image/svg+xml", PLACEHOLDER_SVG)
  }
}

/// How a request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Not intercepted
  PassThrough,
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
}

/// Request classification rules, evaluated in order, first match wins.
#[derive(Debug, Clone)]
pub struct RoutingRules {
  pub api_prefix: String,
  pub excluded_paths: Vec<String>,
  pub static_extensions: Vec<String>,
}

impl Default for RoutingRules {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      excluded_paths: vec!["/api/internal".to_string()],
      static_extensions: [
        "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2",
        "ttf",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

impl RoutingRules {
  pub fn classify(&self, request: &Request) -> Strategy {
    let path = request.url.path();

    if request.method != Method::GET
      || !matches!(request.url.scheme(), "http" | "https")
      || self.excluded_paths.iter().any(|p| path.contains(p.as_str()))
    {
      return Strategy::PassThrough;
    }

    if path.starts_with(&self.api_prefix) {
      return Strategy::NetworkFirst;
    }

    if let Some(ext) = extension(path) {
      if self.static_extensions.iter().any(|e| *e == ext) {
        return Strategy::CacheFirst;
      }
    }

    Strategy::StaleWhileRevalidate
  }
}
