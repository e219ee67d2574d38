//! End-to-end agent behavior against a scripted network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::time::{sleep, Duration};
use url::Url;

use offcache_agent::{
    AgentConfig, AgentEvent, InterceptOutcome, Lifecycle, OfflineAgent, ScopePolicy,
};
use offcache_net::{Destination, Fetch, FetchError, Request, Response, ResponseKind};
use offcache_store::CacheStorage;

const ORIGIN: &str = "https://app.example";
const SHELL_BODY: &str = "<html>shell</html>";

/// Scripted network: routes by exact URL, switchable offline, records
/// every fetch it sees.
#[derive(Default)]
struct MockFetch {
    routes: Mutex<HashMap<String, (u16, ResponseKind, &'static str)>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockFetch {
    fn route(&self, url: &str, status: u16, kind: ResponseKind, body: &'static str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, kind, body));
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetch for MockFetch {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.calls.lock().unwrap().push(request.url.to_string());

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Connectivity("simulated offline".to_string()));
        }

        let scripted = self
            .routes
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .copied();

        match scripted {
            Some((status, kind, body)) => Ok(Response {
                url: request.url.clone(),
                status: StatusCode::from_u16(status).unwrap(),
                headers: HeaderMap::new(),
                kind,
                body: Bytes::from_static(body.as_bytes()),
            }),
            None => Ok(Response {
                url: request.url.clone(),
                status: StatusCode::NOT_FOUND,
                headers: HeaderMap::new(),
                kind: ResponseKind::Basic,
                body: Bytes::new(),
            }),
        }
    }
}

fn u(url: &str) -> Url {
    Url::parse(url).unwrap()
}

fn shell_config() -> AgentConfig {
    let mut config = AgentConfig::new("app-v2.0.0", ORIGIN);
    config.precache = vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
    ];
    config
}

fn seed_shell_routes(net: &MockFetch) {
    net.route("https://app.example/", 200, ResponseKind::Basic, SHELL_BODY);
    net.route(
        "https://app.example/index.html",
        200,
        ResponseKind::Basic,
        SHELL_BODY,
    );
    net.route(
        "https://app.example/manifest.json",
        200,
        ResponseKind::Basic,
        "{}",
    );
}

type TestAgent = OfflineAgent<Arc<MockFetch>>;

fn build(
    config: AgentConfig,
    storage: &CacheStorage,
    net: &Arc<MockFetch>,
) -> (TestAgent, tokio::sync::mpsc::UnboundedReceiver<AgentEvent>) {
    OfflineAgent::new(config, storage.clone(), net.clone()).unwrap()
}

// ==================== Install ====================

#[tokio::test]
async fn test_install_failure_does_not_abort_other_entries() {
    let net = Arc::new(MockFetch::default());
    seed_shell_routes(&net);
    net.route(
        "https://cdn.example/logo.png",
        200,
        ResponseKind::Cors,
        "png-bytes",
    );
    // No route for /missing.js: the mock answers 404, failing that entry.

    let mut config = shell_config();
    config.precache.push("/missing.js".to_string());
    config
        .external_precache
        .push("https://cdn.example/logo.png".to_string());

    let storage = CacheStorage::new();
    let (agent, mut events) = build(config, &storage, &net);

    let report = agent.on_install().await.unwrap();
    assert_eq!(report.stored, 4);
    assert_eq!(report.failed, 1);

    let cache = storage.open("app-v2.0.0").await;
    assert!(cache
        .match_url("https://app.example/index.html")
        .await
        .is_some());
    assert!(cache
        .match_url("https://cdn.example/logo.png")
        .await
        .is_some());
    assert!(cache
        .match_url("https://app.example/missing.js")
        .await
        .is_none());

    // Install signals readiness to supersede waiting instances.
    assert_eq!(events.try_recv().unwrap(), AgentEvent::SkipWaiting);
}

#[tokio::test]
async fn test_install_external_entry_fails_on_http_error() {
    let net = Arc::new(MockFetch::default());
    net.route(
        "https://cdn.example/gone.png",
        404,
        ResponseKind::Cors,
        "",
    );

    let mut config = AgentConfig::new("app-v2.0.0", ORIGIN);
    config
        .external_precache
        .push("https://cdn.example/gone.png".to_string());

    let storage = CacheStorage::new();
    let (agent, _events) = build(config, &storage, &net);

    let report = agent.on_install().await.unwrap();
    assert_eq!(report.stored, 0);
    assert_eq!(report.failed, 1);
    assert!(storage
        .match_url("https://cdn.example/gone.png")
        .await
        .is_none());
}

// ==================== Activate ====================

#[tokio::test]
async fn test_activate_removes_stale_generations() {
    let storage = CacheStorage::new();
    storage.open("app-v1.0.0").await;
    storage.open("app-v1.5.0").await;
    storage.open("app-v2.0.0").await;

    let net = Arc::new(MockFetch::default());
    let (agent, mut events) = build(AgentConfig::new("app-v2.0.0", ORIGIN), &storage, &net);

    agent.on_activate().await.unwrap();

    assert_eq!(storage.keys().await, vec!["app-v2.0.0".to_string()]);
    assert_eq!(events.try_recv().unwrap(), AgentEvent::ClientsClaimed);
}

#[tokio::test]
async fn test_activate_with_unchanged_version_keeps_current_generation() {
    let net = Arc::new(MockFetch::default());
    seed_shell_routes(&net);

    let storage = CacheStorage::new();
    let (agent, _events) = build(shell_config(), &storage, &net);

    agent.on_install().await.unwrap();
    agent.on_activate().await.unwrap();

    // A repeated install/activate cycle with the same version string must
    // leave the still-current generation in place.
    agent.on_install().await.unwrap();
    agent.on_activate().await.unwrap();

    let cache = storage.open("app-v2.0.0").await;
    assert!(cache
        .match_url("https://app.example/index.html")
        .await
        .is_some());
    assert_eq!(storage.keys().await, vec!["app-v2.0.0".to_string()]);
}

// ==================== Intercept: cache first ====================

#[tokio::test]
async fn test_intercept_serves_cached_without_touching_network() {
    let net = Arc::new(MockFetch::default());
    seed_shell_routes(&net);

    let storage = CacheStorage::new();
    let (agent, _events) = build(shell_config(), &storage, &net);
    agent.on_install().await.unwrap();

    let calls_after_install = net.calls().len();

    let outcome = agent
        .on_intercept(&Request::get(u("https://app.example/index.html")))
        .await;
    let response = outcome.into_response().expect("cache hit");

    assert_eq!(response.text().unwrap(), SHELL_BODY);
    assert_eq!(net.calls().len(), calls_after_install);
}

#[tokio::test]
async fn test_intercept_hits_entries_from_older_generations() {
    let storage = CacheStorage::new();
    let old = storage.open("app-v1.0.0").await;

    let request = Request::get(u("https://app.example/legacy.css"));
    let response = Response {
        url: request.url.clone(),
        status: StatusCode::OK,
        headers: HeaderMap::new(),
        kind: ResponseKind::Basic,
        body: Bytes::from_static(b"body{}"),
    };
    old.put(&request, &response).await.unwrap();

    let net = Arc::new(MockFetch::default());
    let (agent, _events) = build(AgentConfig::new("app-v2.0.0", ORIGIN), &storage, &net);

    let outcome = agent.on_intercept(&request).await;
    assert!(outcome.into_response().is_some());
    assert!(net.calls().is_empty());
}

// ==================== Intercept: network fallback with refill ====================

#[tokio::test]
async fn test_intercept_miss_fetches_and_refills_current_generation() {
    let net = Arc::new(MockFetch::default());
    net.route(
        "https://app.example/api/data.json",
        200,
        ResponseKind::Basic,
        "{\"k\":1}",
    );

    let storage = CacheStorage::new();
    let (agent, _events) = build(AgentConfig::new("app-v2.0.0", ORIGIN), &storage, &net);

    let request = Request::get(u("https://app.example/api/data.json"));
    let response = agent
        .on_intercept(&request)
        .await
        .into_response()
        .expect("network response");
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text().unwrap(), "{\"k\":1}");

    // The store is fire-and-forget; give the spawned task a chance to run.
    sleep(Duration::from_millis(50)).await;

    let cache = storage.open("app-v2.0.0").await;
    assert!(cache
        .match_url("https://app.example/api/data.json")
        .await
        .is_some());

    // A second identical request is now a cache hit.
    let calls_before = net.calls().len();
    let again = agent.on_intercept(&request).await.into_response().unwrap();
    assert_eq!(again.text().unwrap(), "{\"k\":1}");
    assert_eq!(net.calls().len(), calls_before);
}

#[tokio::test]
async fn test_intercept_does_not_refill_non_basic_or_non_200() {
    let net = Arc::new(MockFetch::default());
    net.route(
        "https://app.example/flaky",
        500,
        ResponseKind::Basic,
        "boom",
    );

    let storage = CacheStorage::new();
    let mut config = AgentConfig::new("app-v2.0.0", ORIGIN);
    config
        .external_precache
        .push("https://cdn.example/widget.js".to_string());
    let (agent, _events) = build(config, &storage, &net);

    // HTTP error statuses are returned to the page unmodified, not cached.
    let response = agent
        .on_intercept(&Request::get(u("https://app.example/flaky")))
        .await
        .into_response()
        .unwrap();
    assert_eq!(response.status.as_u16(), 500);

    // Cross-origin (non-basic) results are not silently refilled either.
    net.route(
        "https://cdn.example/widget.js",
        200,
        ResponseKind::Cors,
        "js",
    );
    agent
        .on_intercept(&Request::get(u("https://cdn.example/widget.js")))
        .await
        .into_response()
        .unwrap();

    sleep(Duration::from_millis(50)).await;
    assert!(storage.match_url("https://app.example/flaky").await.is_none());
    assert!(storage
        .match_url("https://cdn.example/widget.js")
        .await
        .is_none());
}

// ==================== Intercept: offline fallback ====================

#[tokio::test]
async fn test_offline_document_navigation_serves_cached_shell() {
    let net = Arc::new(MockFetch::default());
    seed_shell_routes(&net);

    let storage = CacheStorage::new();
    let (agent, _events) = build(shell_config(), &storage, &net);
    agent.on_install().await.unwrap();

    net.set_offline(true);

    let outcome = agent
        .on_intercept(&Request::document(u("https://app.example/profile")))
        .await;
    let response = outcome.into_response().expect("shell substitute");

    assert_eq!(response.text().unwrap(), SHELL_BODY);
}

#[tokio::test]
async fn test_offline_subresource_gets_synthesized_503() {
    let net = Arc::new(MockFetch::default());
    net.set_offline(true);

    let storage = CacheStorage::new();
    let (agent, _events) = build(AgentConfig::new("app-v2.0.0", ORIGIN), &storage, &net);

    let request = Request::get(u("https://app.example/app.js")).destination(Destination::Script);
    let outcome = agent.on_intercept(&request).await;
    let response = outcome.into_response().expect("placeholder");

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.content_type(), Some("text/plain"));
}

#[tokio::test]
async fn test_offline_document_without_cached_shell_degrades_to_503() {
    let net = Arc::new(MockFetch::default());
    net.set_offline(true);

    let storage = CacheStorage::new();
    let (agent, _events) = build(AgentConfig::new("app-v2.0.0", ORIGIN), &storage, &net);

    let outcome = agent
        .on_intercept(&Request::document(u("https://app.example/")))
        .await;
    let response = outcome.into_response().unwrap();

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
}

// ==================== Intercept: scope filter ====================

#[tokio::test]
async fn test_out_of_scope_request_passes_through_untouched() {
    let net = Arc::new(MockFetch::default());
    let storage = CacheStorage::new();
    let (agent, _events) = build(AgentConfig::new("app-v2.0.0", ORIGIN), &storage, &net);

    let outcome = agent
        .on_intercept(&Request::get(u("https://tracker.example/pixel.gif")))
        .await;

    assert!(matches!(outcome, InterceptOutcome::PassThrough));
    // No cache lookup side effects, no network, no store.
    assert!(net.calls().is_empty());
    assert!(storage
        .match_url("https://tracker.example/pixel.gif")
        .await
        .is_none());
}

#[tokio::test]
async fn test_allow_listed_external_url_is_intercepted() {
    let net = Arc::new(MockFetch::default());
    net.route(
        "https://cdn.example/logo.png",
        200,
        ResponseKind::Cors,
        "png",
    );

    let storage = CacheStorage::new();
    let mut config = AgentConfig::new("app-v2.0.0", ORIGIN);
    config
        .external_precache
        .push("https://cdn.example/logo.png".to_string());
    let (agent, _events) = build(config, &storage, &net);

    let outcome = agent
        .on_intercept(&Request::get(u("https://cdn.example/logo.png")))
        .await;
    assert!(outcome.into_response().is_some());
}

#[tokio::test]
async fn test_deny_hosts_policy_passes_through_denied_hosts_only() {
    let net = Arc::new(MockFetch::default());
    net.route(
        "https://other.example/data",
        200,
        ResponseKind::Cors,
        "data",
    );

    let storage = CacheStorage::new();
    let mut config = AgentConfig::new("app-v2.0.0", ORIGIN);
    config.scope = ScopePolicy::DenyHosts {
        hosts: vec!["fonts.googleapis.com".to_string()],
    };
    let (agent, _events) = build(config, &storage, &net);

    let denied = agent
        .on_intercept(&Request::get(u("https://fonts.googleapis.com/css?family=X")))
        .await;
    assert!(matches!(denied, InterceptOutcome::PassThrough));

    // Everything else is intercepted under this policy, even cross-origin.
    let other = agent
        .on_intercept(&Request::get(u("https://other.example/data")))
        .await;
    assert!(other.into_response().is_some());
}

// ==================== Full lifecycle ====================

#[tokio::test]
async fn test_install_activate_then_survive_offline() {
    let net = Arc::new(MockFetch::default());
    seed_shell_routes(&net);

    let config = AgentConfig::from_json(
        r#"{
            "cache_name": "app-v2.0.0",
            "origin": "https://app.example",
            "precache": ["/", "/index.html", "/manifest.json"]
        }"#,
    )
    .unwrap();

    let storage = CacheStorage::new();
    storage.open("app-v1.0.0").await;

    let (agent, mut events) = build(config, &storage, &net);
    assert_eq!(agent.config().cache_name, "app-v2.0.0");

    agent.on_install().await.unwrap();
    agent.on_activate().await.unwrap();

    assert_eq!(events.try_recv().unwrap(), AgentEvent::SkipWaiting);
    assert_eq!(events.try_recv().unwrap(), AgentEvent::ClientsClaimed);
    assert_eq!(storage.keys().await, vec!["app-v2.0.0".to_string()]);

    net.set_offline(true);

    let response = agent
        .on_intercept(&Request::document(u("https://app.example/deep/link")))
        .await
        .into_response()
        .unwrap();
    assert_eq!(response.text().unwrap(), SHELL_BODY);
}
