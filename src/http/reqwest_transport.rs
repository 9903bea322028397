//! Transport implementation using reqwest

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::common::{Error, Result};

use super::{HttpRequest, HttpResponse, HttpTransport, Method};

/// HTTP transport backed by reqwest
///
/// Keeps one client that verifies certificates and one that does not, so
/// that the TLS policy can be chosen per request.
pub struct ReqwestTransport {
    strict: reqwest::Client,
    lenient: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with gzip support and no redirect following
    /// beyond reqwest's defaults
    pub fn new() -> Result<Self> {
        let strict = Self::builder()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        let lenient = Self::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { strict, lenient })
    }

    fn builder() -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(concat!("bulk-data-tester/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
    }

    fn to_reqwest_method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let client = if request.verify_tls {
            &self.strict
        } else {
            &self.lenient
        };

        let url = reqwest::Url::parse(&request.url).map_err(|e| Error::invalid_url(&request.url, e))?;
        let mut builder = client.request(Self::to_reqwest_method(request.method), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::debug!("HTTP {} {}", request.method, request.url);

        let response = builder
            .send()
            .await
            .map_err(|e| Error::transport(&request.url, e))?;

        let status = response.status();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::transport(&request.url, e))?;

        tracing::debug!("HTTP {} {} -> {}", request.method, request.url, status.as_u16());

        Ok(HttpResponse {
            url: request.url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}
