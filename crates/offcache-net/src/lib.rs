//! # Offcache Net
//!
//! Request/response model and network fetch for the offcache agent.
//!
//! ## Design Goals
//!
//! 1. **Fetch contract**: resolve on any completed HTTP exchange (including
//!    non-2xx), reject only on connectivity failure
//! 2. **Response classification**: basic (same-origin) vs cors vs opaque,
//!    so caching policy can exclude what it must not store
//! 3. **Pluggable transport**: the [`Fetch`] trait is the seam between the
//!    agent and the real network

use std::future::Future;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

pub mod origin;

pub use origin::Origin;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Transport-level failure: DNS, connect, TLS, or an interrupted body.
    /// A completed exchange with a non-2xx status is NOT this error.
    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    #[error("Client setup failed: {0}")]
    Client(String),
}

/// Where the response to a request will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// A full document navigation.
    Document,
    Script,
    Style,
    Image,
    Font,
    #[default]
    Other,
}

impl Destination {
    /// Check if this is a document navigation.
    pub fn is_document(&self) -> bool {
        matches!(self, Destination::Document)
    }
}

/// An outgoing request as seen by the interception path.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub destination: Destination,
}

impl Request {
    /// Create a GET request for a subresource.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            destination: Destination::Other,
        }
    }

    /// Create a GET request for a document navigation.
    pub fn document(url: Url) -> Self {
        Self {
            destination: Destination::Document,
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// The key under which this request is cached.
    pub fn cache_key(&self) -> &str {
        self.url.as_str()
    }
}

/// Classification of a response relative to the requesting page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Same-origin response, fully visible.
    Basic,
    /// Cross-origin response obtained with CORS, visible.
    Cors,
    /// Cross-origin response whose status and body are inaccessible.
    Opaque,
}

/// A completed HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub kind: ResponseKind,
    pub body: Bytes,
}

impl Response {
    /// Check if the exchange was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get content-type from headers.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Get body as text.
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }
}

/// Network fetch collaborator.
///
/// Resolves for any completed HTTP exchange, whatever the status; rejects
/// only when no exchange completed at all (connectivity failure). That
/// distinction is what the offline-fallback path keys on.
pub trait Fetch: Send + Sync {
    fn fetch(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

impl<T: Fetch + ?Sized> Fetch for std::sync::Arc<T> {
    fn fetch(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Response, FetchError>> + Send {
        (**self).fetch(request)
    }
}

/// Production fetcher backed by reqwest.
///
/// Classifies responses against the configured page origin: same-origin
/// exchanges yield [`ResponseKind::Basic`], everything else
/// [`ResponseKind::Cors`]. No request timeout is set; a hung exchange
/// blocks only its own caller.
pub struct HttpFetcher {
    client: reqwest::Client,
    origin: Origin,
}

impl HttpFetcher {
    /// Create a fetcher for a page served from `page_origin`.
    pub fn new(page_origin: &Url) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent("offcache/0.1")
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            origin: Origin::from_url(page_origin),
        })
    }

    fn classify(&self, url: &Url) -> ResponseKind {
        if self.origin.matches_url(url) {
            ResponseKind::Basic
        } else {
            ResponseKind::Cors
        }
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| FetchError::Connectivity(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Connectivity(e.to_string()))?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        let kind = self.classify(&url);

        Ok(Response {
            url,
            status,
            headers,
            kind,
            body,
        })
    }
}
