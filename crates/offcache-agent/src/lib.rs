//! # Offcache Agent
//!
//! Offline cache agent for single-page applications: cache-first request
//! interception with network fallback and opportunistic refill, plus
//! versioned cache-generation lifecycle management.
//!
//! ## Lifecycle
//!
//! ```text
//! host environment
//!     │  install    ── precache manifest into the current generation,
//!     │                then signal SkipWaiting
//!     │  activate   ── delete every stale generation,
//!     │                then signal ClientsClaimed
//!     └─ intercept  ── scope filter → cache lookup → network + refill
//!                      → offline fallback (shell page or 503)
//! ```
//!
//! The agent is constructed from explicit [`AgentConfig`] (no global
//! state), is generic over the [`Fetch`] network collaborator, and emits
//! host signals over an event channel.

use bytes::Bytes;
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use url::Url;

use offcache_common::{OffcacheError, Result};
use offcache_net::{Fetch, FetchError, Origin, Request, Response, ResponseKind};
use offcache_store::{Cache, CacheStorage, StoreError};

// ==================== Configuration ====================

/// Scope filter policy for the request interceptor.
///
/// The two variants are mutually exclusive by construction: a deployment
/// picks one, and they are never combined (combining them would change
/// which resources get refilled into cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScopePolicy {
    /// Intercept same-origin requests plus the configured external
    /// precache URLs; pass everything else through.
    AllowList,
    /// Pass through requests whose URL contains any of these third-party
    /// host substrings; intercept everything else.
    DenyHosts { hosts: Vec<String> },
}

impl Default for ScopePolicy {
    fn default() -> Self {
        Self::AllowList
    }
}

/// Agent configuration, supplied by the surrounding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Versioned cache generation name, e.g. `"app-v4.0.0"`. Bumped by the
    /// release process, never computed here.
    pub cache_name: String,

    /// Page origin, e.g. `"https://app.example"`.
    pub origin: String,

    /// Local paths to precache at install, resolved against the origin.
    #[serde(default)]
    pub precache: Vec<String>,

    /// External absolute URLs to precache at install. Under
    /// [`ScopePolicy::AllowList`] these are also the interception
    /// allow-list.
    #[serde(default)]
    pub external_precache: Vec<String>,

    /// Shell page served to offline document navigations.
    #[serde(default = "default_shell_path")]
    pub shell_path: String,

    /// Scope filter policy.
    #[serde(default)]
    pub scope: ScopePolicy,
}

fn default_shell_path() -> String {
    "/index.html".to_string()
}

impl AgentConfig {
    /// Create a config with empty manifest lists and default policy.
    pub fn new(cache_name: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            origin: origin.into(),
            precache: Vec::new(),
            external_precache: Vec::new(),
            shell_path: default_shell_path(),
            scope: ScopePolicy::default(),
        }
    }

    /// Parse a config from the JSON the surrounding application ships.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| OffcacheError::config_with_source("malformed agent config", e))
    }
}

// ==================== Events ====================

/// Host signals emitted by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// Install finished; supersede any waiting lifecycle instance
    /// immediately instead of waiting for it to finish.
    SkipWaiting,
    /// Activation finished; take control of all currently open pages, not
    /// only pages opened later.
    ClientsClaimed,
}

// ==================== Lifecycle Results ====================

/// Outcome of an install: per-entry failures are swallowed, counted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallReport {
    /// Manifest entries fetched and stored.
    pub stored: usize,
    /// Manifest entries that failed individually (logged, not fatal).
    pub failed: usize,
}

/// Outcome of one interception.
///
/// There is no error arm: the page never observes a failure from this
/// path. Worst case it receives a 503 placeholder or a stale shell page.
#[derive(Debug)]
pub enum InterceptOutcome {
    /// Out of scope; the request goes to the default network path
    /// untouched.
    PassThrough,
    /// The agent supplies this response.
    Respond(Response),
}

impl InterceptOutcome {
    /// The substituted response, if any.
    pub fn into_response(self) -> Option<Response> {
        match self {
            InterceptOutcome::PassThrough => None,
            InterceptOutcome::Respond(response) => Some(response),
        }
    }
}

// ==================== Lifecycle Interface ====================

/// The three inbound lifecycle signals, as an explicit interface.
///
/// The host must await each returned future before considering the
/// transition complete; the futures are the "async work pending" signal.
pub trait Lifecycle: Send + Sync {
    /// Populate the current generation from the precache manifest.
    fn on_install(&self) -> impl Future<Output = Result<InstallReport>> + Send;

    /// Delete every generation other than the current one.
    fn on_activate(&self) -> impl Future<Output = Result<()>> + Send;

    /// Decide one intercepted request.
    fn on_intercept(
        &self,
        request: &Request,
    ) -> impl Future<Output = InterceptOutcome> + Send;
}

// ==================== Offline Agent ====================

/// The offline cache agent.
///
/// Owns one named cache generation at a time and reacts to the three
/// lifecycle signals via [`Lifecycle`].
pub struct OfflineAgent<F: Fetch> {
    config: AgentConfig,
    origin: Url,
    origin_id: Origin,
    shell_url: Url,
    external: Vec<Url>,
    storage: CacheStorage,
    net: F,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
}

impl<F: Fetch> OfflineAgent<F> {
    /// Build an agent from validated configuration.
    ///
    /// Returns the agent and the receiving end of its host-signal channel.
    pub fn new(
        config: AgentConfig,
        storage: CacheStorage,
        net: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        if config.cache_name.is_empty() {
            return Err(OffcacheError::config("cache_name must not be empty"));
        }

        let origin = Url::parse(&config.origin)
            .map_err(|e| OffcacheError::config_with_source("invalid origin URL", e))?;

        let origin_id = Origin::from_url(&origin);
        if origin_id.is_opaque() {
            return Err(OffcacheError::config(format!(
                "origin must not be opaque: {}",
                config.origin
            )));
        }

        let shell_url = origin.join(&config.shell_path).map_err(|e| {
            OffcacheError::config_with_source(
                format!("invalid shell path {}", config.shell_path),
                e,
            )
        })?;

        let external = config
            .external_precache
            .iter()
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    OffcacheError::config_with_source(
                        format!("invalid external precache URL {raw}"),
                        e,
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                config,
                origin,
                origin_id,
                shell_url,
                external,
                storage,
                net,
                event_tx,
            },
            event_rx,
        ))
    }

    /// The agent configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Scope filter: is this request ours to handle?
    fn in_scope(&self, url: &Url) -> bool {
        match &self.config.scope {
            ScopePolicy::AllowList => {
                self.origin_id.matches_url(url) || self.external.iter().any(|u| u == url)
            }
            ScopePolicy::DenyHosts { hosts } => {
                !hosts.iter().any(|host| url.as_str().contains(host.as_str()))
            }
        }
    }

    /// Offline fallback: shell page for document navigations when cached,
    /// a synthesized 503 otherwise.
    async fn offline_fallback(&self, request: &Request) -> InterceptOutcome {
        if request.destination.is_document() {
            if let Some(shell) = self.storage.match_url(self.shell_url.as_str()).await {
                debug!(url = %request.url, "Serving cached shell page");
                return InterceptOutcome::Respond(shell);
            }
        }
        InterceptOutcome::Respond(offline_response(&request.url))
    }
}

/// Fetch an allow-listed external URL directly and store it.
///
/// External URLs are cross-origin, so they cannot go through the relative
/// add path; a completed exchange with a non-OK status fails this entry.
async fn precache_external<F: Fetch>(
    cache: &Cache,
    net: &F,
    url: Url,
) -> std::result::Result<(), StoreError> {
    let request = Request::get(url);
    let response = net.fetch(&request).await?;

    if !response.ok() {
        return Err(StoreError::BadStatus(response.status.as_u16()));
    }

    cache.put(&request, &response).await
}

/// Synthesized minimal response for offline failures with no cached
/// substitute.
fn offline_response(url: &Url) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );

    Response {
        url: url.clone(),
        status: StatusCode::SERVICE_UNAVAILABLE,
        headers,
        kind: ResponseKind::Basic,
        body: Bytes::from_static(b"Offline: resource unavailable"),
    }
}

impl<F: Fetch> Lifecycle for OfflineAgent<F> {
    async fn on_install(&self) -> Result<InstallReport> {
        let cache = self.storage.open(&self.config.cache_name).await;
        info!(
            cache = %self.config.cache_name,
            local = self.config.precache.len(),
            external = self.external.len(),
            "Installing cache generation"
        );

        // Every entry is attempted independently: one bad asset must not
        // abort installation of the rest.
        let mut ops: Vec<BoxFuture<'_, (String, std::result::Result<(), StoreError>)>> =
            Vec::new();

        for path in &self.config.precache {
            let entry = path.clone();
            match self.origin.join(path) {
                Ok(url) => {
                    let cache = &cache;
                    let net = &self.net;
                    ops.push(async move { (entry, cache.add(url, net).await) }.boxed());
                }
                Err(e) => ops.push(
                    async move {
                        (
                            entry,
                            Err(StoreError::Network(FetchError::InvalidUrl(e.to_string()))),
                        )
                    }
                    .boxed(),
                ),
            }
        }

        for url in &self.external {
            let entry = url.to_string();
            let url = url.clone();
            let cache = &cache;
            let net = &self.net;
            ops.push(async move { (entry, precache_external(cache, net, url).await) }.boxed());
        }

        let mut stored = 0usize;
        let mut failed = 0usize;
        for (entry, result) in join_all(ops).await {
            match result {
                Ok(()) => stored += 1,
                Err(error) => {
                    warn!(entry = %entry, error = %error, "Precache entry failed");
                    failed += 1;
                }
            }
        }

        info!(stored, failed, "Install complete, superseding waiting instances");
        let _ = self.event_tx.send(AgentEvent::SkipWaiting);

        Ok(InstallReport { stored, failed })
    }

    async fn on_activate(&self) -> Result<()> {
        let current = self.config.cache_name.as_str();
        let stale: Vec<String> = self
            .storage
            .keys()
            .await
            .into_iter()
            .filter(|name| name != current)
            .collect();

        // A storage-level deletion failure is fatal to this activation
        // attempt; `false` (already gone) is not.
        let deletions = stale.into_iter().map(|name| {
            let storage = self.storage.clone();
            async move {
                let removed = storage.delete(&name).await.map_err(|e| {
                    OffcacheError::storage_with_source(
                        format!("deleting stale generation {name} failed"),
                        e,
                    )
                })?;
                if removed {
                    info!(cache = %name, "Removed stale cache generation");
                }
                Ok::<_, OffcacheError>(())
            }
        });
        try_join_all(deletions).await?;

        let _ = self.event_tx.send(AgentEvent::ClientsClaimed);
        info!(cache = %current, "Activation complete, controlling all pages");
        Ok(())
    }

    async fn on_intercept(&self, request: &Request) -> InterceptOutcome {
        if !self.in_scope(&request.url) {
            trace!(url = %request.url, "Out of scope, passing through");
            return InterceptOutcome::PassThrough;
        }

        // Cache lookup is generation-agnostic.
        if let Some(response) = self.storage.match_request(request).await {
            debug!(url = %request.url, "Cache hit");
            return InterceptOutcome::Respond(response);
        }

        match self.net.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK && response.kind == ResponseKind::Basic {
                    let storage = self.storage.clone();
                    let cache_name = self.config.cache_name.clone();
                    let request = request.clone();
                    let clone = response.clone();
                    // Fire-and-forget refill: the caller gets the response
                    // before (or concurrently with) the store completing.
                    tokio::spawn(async move {
                        let cache = storage.open(&cache_name).await;
                        if let Err(error) = cache.put(&request, &clone).await {
                            debug!(url = %request.url, error = %error, "Refill store failed");
                        }
                    });
                }
                InterceptOutcome::Respond(response)
            }
            Err(error) => {
                debug!(url = %request.url, error = %error, "Fetch failed, using offline fallback");
                self.offline_fallback(request).await
            }
        }
    }
}
