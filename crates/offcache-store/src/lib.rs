//! # Offcache Store
//!
//! Cache generations and origin-wide cache storage for the offcache agent.
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (origin-wide)
//!     │
//!     └── Cache ("app-v4.0.0", one generation)
//!             └── url -> CacheEntry (stored response)
//! ```
//!
//! All handles are cheap clones over shared state: concurrent reads are
//! safe, concurrent writes to the same key are last-write-wins.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use offcache_net::{Fetch, FetchError, Request, Response, ResponseKind};

// ==================== Errors ====================

/// Errors from cache-storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Opaque responses are never stored.
    #[error("Opaque response cannot be stored")]
    OpaqueResponse,

    /// Only GET request/response pairs are stored.
    #[error("Unsupported method for caching: {0}")]
    UnsupportedMethod(String),

    /// A combined fetch-and-store saw a non-2xx status.
    #[error("Fetch-and-store got status {0}")]
    BadStatus(u16),

    #[error("Network error: {0}")]
    Network(#[from] FetchError),
}

// ==================== Cache Entry ====================

/// A stored request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (the cache key).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response classification at store time.
    pub kind: ResponseKind,

    /// Response body.
    pub body: Vec<u8>,

    /// Stored-at timestamp (ms since epoch).
    pub stored_at: u64,
}

impl CacheEntry {
    /// Build an entry from a request/response pair.
    pub fn from_pair(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: request.cache_key().to_string(),
            method: request.method.as_str().to_string(),
            status: response.status.as_u16(),
            headers,
            kind: response.kind,
            body: response.body.to_vec(),
            stored_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Rebuild the stored response. `None` if the entry no longer parses
    /// (treated as a cache miss by callers).
    pub fn to_response(&self) -> Option<Response> {
        let url = Url::parse(&self.url).ok()?;
        let status = StatusCode::from_u16(self.status).ok()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }

        Some(Response {
            url,
            status,
            headers,
            kind: self.kind,
            body: self.body.clone().into(),
        })
    }
}

// ==================== Cache ====================

/// One named cache generation.
///
/// Clones share the same underlying entries.
#[derive(Debug, Clone)]
pub struct Cache {
    name: String,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl Cache {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Generation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request against this generation.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        self.match_url(request.cache_key()).await
    }

    /// Match a raw URL key against this generation.
    pub async fn match_url(&self, url: &str) -> Option<Response> {
        let entries = self.entries.read().await;
        entries.get(url).and_then(CacheEntry::to_response)
    }

    /// Store a request/response pair.
    ///
    /// Refuses opaque responses and non-GET requests; those must never end
    /// up in storage.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<(), StoreError> {
        if response.kind == ResponseKind::Opaque {
            return Err(StoreError::OpaqueResponse);
        }
        if request.method != Method::GET {
            return Err(StoreError::UnsupportedMethod(
                request.method.as_str().to_string(),
            ));
        }

        let entry = CacheEntry::from_pair(request, response);
        trace!(cache = %self.name, url = %entry.url, status = entry.status, "Storing entry");

        let mut entries = self.entries.write().await;
        entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Fetch a URL and store the result (the combined add operation).
    ///
    /// A completed exchange with a non-2xx status fails the operation
    /// without storing anything.
    pub async fn add<F: Fetch>(&self, url: Url, net: &F) -> Result<(), StoreError> {
        let request = Request::get(url);
        let response = net.fetch(&request).await?;

        if !response.ok() {
            return Err(StoreError::BadStatus(response.status.as_u16()));
        }

        self.put(&request, &response).await
    }

    /// Delete an entry by URL key.
    pub async fn delete(&self, url: &str) -> bool {
        self.entries.write().await.remove(url).is_some()
    }

    /// All stored URL keys.
    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Check if the generation holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Origin-wide cache storage: named generations.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
}

impl CacheStorage {
    /// Create empty cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a generation, creating it if absent.
    pub async fn open(&self, name: &str) -> Cache {
        let mut caches = self.caches.write().await;
        caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .clone()
    }

    /// Check if a generation exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a generation. Resolves `false` when it was already gone.
    ///
    /// The in-memory backend never fails here; the `Result` is the
    /// collaborator contract — a platform-backed storage may reject.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    /// Names of all generations.
    pub async fn keys(&self) -> Vec<String> {
        self.caches.read().await.keys().cloned().collect()
    }

    /// Match a request across all generations (generation-agnostic lookup).
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        self.match_url(request.cache_key()).await
    }

    /// Match a raw URL key across all generations.
    pub async fn match_url(&self, url: &str) -> Option<Response> {
        let caches = self.caches.read().await;
        for cache in caches.values() {
            if let Some(response) = cache.match_url(url).await {
                return Some(response);
            }
        }
        None
    }
}
