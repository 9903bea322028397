//! HTTP plumbing shared by the protocol client and the test context
//!
//! Requests and responses are plain owned values so that they can be logged
//! as decorations and replayed by scripted transports in tests.

mod reqwest_transport;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::common::Result;

pub use reqwest_transport::ReqwestTransport;

/// HTTP methods used by the export workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Header names are stored lower-cased
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Reject invalid TLS certificates
    pub verify_tls: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            verify_tls: true,
        }
    }

    /// Set a header, replacing any previous value
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A received response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// URL the request was sent to
    pub url: String,
    pub status: u16,
    /// Reason phrase, possibly empty
    pub status_text: String,
    /// Header names are stored lower-cased
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the content type announces JSON (including `fhir+json`)
    pub fn is_json(&self) -> bool {
        let content_type = self.content_type().to_ascii_lowercase();
        content_type.contains("json")
    }

    /// Parse the body as JSON, if it is JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        if self.body.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }
}

/// Pluggable transport used by the protocol client
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and return the full response
    ///
    /// Non-2xx statuses are responses, not errors; only transport failures
    /// (DNS, connection, TLS, body read) are reported as `Err`.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}
