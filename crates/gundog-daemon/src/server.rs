//! WebSocket daemon.
//!
//! One accept loop, one handler task per connection. Each connection is a
//! line-delimited JSON session: requests are dispatched in arrival order
//! and responses come back in request order, with up to
//! [`MAX_IN_FLIGHT`](crate::protocol::MAX_IN_FLIGHT) requests running
//! concurrently per connection. The daemon pings every 30 s and drops
//! connections that miss pongs for 60 s, and pushes unsolicited `status`
//! frames. Loaded indexes are kept warm in an LRU cache; at most one
//! ingest runs per index.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use futures_util::stream::FuturesOrdered;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gundog_index::config::ProjectConfig;
use gundog_index::embedding::{EmbeddingProvider, HttpEmbeddings};
use gundog_index::git::{CliGitResolver, GitResolver, RepoInfo};
use gundog_index::indexer::{no_stop, IndexBuilder, IndexStats};
use gundog_index::query::{QueryEngine, QueryOptions, QueryResult};
use gundog_index::snapshot::IndexSnapshot;
use gundog_index::IndexError;

use crate::cache::LruCache;
use crate::config::DaemonConfig;
use crate::protocol::{
    ErrorCode, Request, Response, WireGraph, WireGraphEdge, WireGraphNode, WireHit,
    WireIndexState, WireRelated, MAX_EXPAND_DEPTH, MAX_IN_FLIGHT, MAX_TOP_K,
    QUERY_TIMEOUT_SECS,
};
use crate::registry::{load_project, project_root, IndexRegistry};

/// Loaded indexes kept warm before LRU eviction kicks in.
const LOADED_CACHE_CAP: usize = 8;

/// Server ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A connection missing pongs this long is closed.
const PONG_DEADLINE: Duration = Duration::from_secs(60);
/// Cadence of unsolicited status frames.
const STATUS_INTERVAL: Duration = Duration::from_secs(15);

/// Token bucket guarding a connection against request floods.
const RATE_CAPACITY: f64 = 30.0;
const RATE_PER_SEC: f64 = 15.0;

/// Builds the embedding provider for a loaded index.
pub type EmbedderFactory =
    Arc<dyn Fn(&ProjectConfig) -> Arc<dyn EmbeddingProvider> + Send + Sync>;

/// One index opened by the daemon: immutable snapshot handle plus the
/// single-writer ingest latch.
pub struct LoadedIndex {
    pub name: String,
    pub project: Arc<ProjectConfig>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub repo: Option<RepoInfo>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    ingesting: AtomicBool,
}

/// Clears the busy latch when an ingest scope ends.
pub struct IngestGuard<'a> {
    index: &'a LoadedIndex,
}

impl Drop for IngestGuard<'_> {
    fn drop(&mut self) {
        self.index.ingesting.store(false, Ordering::SeqCst);
    }
}

impl LoadedIndex {
    pub fn open(
        name: &str,
        root: &std::path::Path,
        factory: &EmbedderFactory,
    ) -> Result<Self, IndexError> {
        let project = load_project(root)
            .map_err(|e| IndexError::Config(e.to_string()))?;
        let snapshot = IndexSnapshot::open(&project)?;
        let embedder = factory(&project);
        let repo = CliGitResolver.repo_info(&project_root(root));
        info!(index = name, files = snapshot.manifest.file_count(), "index loaded");
        Ok(Self {
            name: name.to_string(),
            project: Arc::new(project),
            embedder,
            repo,
            snapshot: RwLock::new(Arc::new(snapshot)),
            ingesting: AtomicBool::new(false),
        })
    }

    pub async fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub fn is_ingesting(&self) -> bool {
        self.ingesting.load(Ordering::SeqCst)
    }

    /// Claim the single writer slot, or fail if an ingest is running.
    pub fn begin_ingest(&self) -> Option<IngestGuard<'_>> {
        self.ingesting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| IngestGuard { index: self })
    }

    /// Run one ingest and flip the snapshot handle on success. Readers
    /// holding the old snapshot keep it until they drop it.
    pub async fn run_ingest(&self, full: bool) -> Result<IndexStats, IndexError> {
        let _guard = self
            .begin_ingest()
            .ok_or_else(|| IndexError::Store("ingest already running".to_string()))?;

        let builder = IndexBuilder::new(self.project.clone(), self.embedder.clone())
            .with_git(Arc::new(CliGitResolver));
        let stats = builder.build(full, &no_stop()).await?;

        let fresh = IndexSnapshot::open(&self.project)?;
        *self.snapshot.write().await = Arc::new(fresh);
        Ok(stats)
    }
}

pub struct DaemonState {
    pub config: DaemonConfig,
    pub registry: RwLock<IndexRegistry>,
    loaded: Mutex<LruCache<String, Arc<LoadedIndex>>>,
    /// Index served when a request names none.
    active: RwLock<Option<String>>,
    started: Instant,
    embedder_factory: EmbedderFactory,
}

impl DaemonState {
    pub fn new(config: DaemonConfig, registry: IndexRegistry) -> Self {
        Self::with_embedder_factory(
            config,
            registry,
            Arc::new(|project: &ProjectConfig| {
                Arc::new(HttpEmbeddings::from_config(&project.embedding))
                    as Arc<dyn EmbeddingProvider>
            }),
        )
    }

    /// Injection point used by tests to avoid a live embedding endpoint.
    pub fn with_embedder_factory(
        config: DaemonConfig,
        registry: IndexRegistry,
        factory: EmbedderFactory,
    ) -> Self {
        Self {
            config,
            registry: RwLock::new(registry),
            loaded: Mutex::new(LruCache::new(LOADED_CACHE_CAP)),
            active: RwLock::new(None),
            started: Instant::now(),
            embedder_factory: factory,
        }
    }

    pub async fn active_index(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// Load an index by name, reusing the warm cache.
    pub async fn load_index(
        &self,
        name: &str,
    ) -> Result<Arc<LoadedIndex>, (ErrorCode, String)> {
        {
            let mut loaded = self.loaded.lock().await;
            if let Some(index) = loaded.get(&name.to_string()) {
                return Ok(index.clone());
            }
        }

        let root = {
            let registry = self.registry.read().await;
            registry
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    (ErrorCode::IndexNotFound, format!("Unknown index: {name}"))
                })?
        };

        let index = LoadedIndex::open(name, &root, &self.embedder_factory)
            .map(Arc::new)
            .map_err(|e| (error_code_for(&e), e.to_string()))?;
        self.loaded
            .lock()
            .await
            .put(name.to_string(), index.clone());
        Ok(index)
    }

    /// Resolve the index a request targets: explicit, then active, then
    /// the registry default.
    async fn resolve_name(&self, requested: Option<&str>) -> Result<String, (ErrorCode, String)> {
        if let Some(name) = requested {
            return Ok(name.to_string());
        }
        if let Some(name) = self.active.read().await.clone() {
            return Ok(name);
        }
        let registry = self.registry.read().await;
        registry
            .default_index()
            .map(String::from)
            .ok_or_else(|| {
                (
                    ErrorCode::InvalidRequest,
                    "No index specified and no default_index configured".to_string(),
                )
            })
    }

    async fn status_frame(&self) -> Response {
        let names = self.registry.read().await.names();
        let loaded = self.loaded.lock().await;
        let indexes = names
            .into_iter()
            .map(|name| {
                let state = match loaded
                    .values()
                    .find(|index| index.name == name)
                {
                    Some(index) if index.is_ingesting() => "ingesting",
                    Some(_) => "ready",
                    None => "unloaded",
                };
                WireIndexState { name, state }
            })
            .collect();
        Response::Status {
            uptime_secs: self.started.elapsed().as_secs(),
            indexes,
        }
    }
}

fn error_code_for(error: &IndexError) -> ErrorCode {
    match error {
        IndexError::Embed(_) => ErrorCode::EmbedFailed,
        IndexError::Io(_) => ErrorCode::IoFailed,
        IndexError::ManifestMismatch { .. } | IndexError::Corrupt { .. } => {
            ErrorCode::QueryFailed
        }
        _ => ErrorCode::QueryFailed,
    }
}

/// Assemble the axum router: WebSocket endpoint, health check, and the
/// optional built-in UI page.
pub fn router(state: Arc<DaemonState>) -> Router {
    let cors = if state.config.daemon.cors.allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .daemon
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let mut router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health_handler));
    if state.config.daemon.serve_ui {
        router = router.route("/", get(ui_handler));
    }
    router.layer(cors).with_state(state)
}

/// Bind and serve until the process is terminated.
pub async fn serve(state: Arc<DaemonState>) -> anyhow::Result<()> {
    let addr = state.config.bind_addr();

    warmup(&state).await;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "daemon listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Pre-load the default index and run a throwaway query through it so
/// the embedding model and mapped stores are warm before the first real
/// request. Failures are non-fatal; the daemon still serves.
pub async fn warmup(state: &DaemonState) {
    let Some(name) = state.registry.read().await.default_index().map(String::from) else {
        return;
    };
    let loaded = match state.load_index(&name).await {
        Ok(loaded) => loaded,
        Err((_, message)) => {
            warn!(index = %name, "warmup failed (non-fatal): {message}");
            return;
        }
    };

    let opts = QueryOptions {
        top_k: 1,
        expand: false,
        expand_depth: None,
        min_score: None,
    };
    match run_query(&loaded, "warmup", &opts).await {
        Ok(_) => info!(index = %name, "warmup complete"),
        Err(e) => warn!(index = %name, "warmup query failed (non-fatal): {e}"),
    }
}

async fn health_handler(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    let registry = state.registry.read().await;
    Json(serde_json::json!({
        "status": "ok",
        "active_index": state.active_index().await,
        "available_indexes": registry.names(),
    }))
}

async fn ui_handler() -> Html<&'static str> {
    Html(include_str!("ui.html"))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<DaemonState>>,
) -> axum::response::Response {
    if state.config.daemon.auth.enabled {
        let presented = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if presented != state.config.api_key() {
            return (StatusCode::UNAUTHORIZED, "invalid API key").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct RateLimiter {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            tokens: RATE_CAPACITY,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * RATE_PER_SEC).min(RATE_CAPACITY);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

type PendingResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

async fn handle_socket(socket: WebSocket, state: Arc<DaemonState>) {
    let connection_id = Uuid::new_v4();
    info!(%connection_id, "websocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);

    // Writer task: the only place that touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    let mut status_timer = tokio::time::interval(STATUS_INTERVAL);
    let mut last_pong = Instant::now();
    let mut limiter = RateLimiter::new();
    let mut in_flight: FuturesOrdered<PendingResponse> = FuturesOrdered::new();
    // Tracked outside the stream so the select! guard does not have to
    // borrow `in_flight` while it is being polled.
    let mut pending = 0usize;

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > PONG_DEADLINE {
                    warn!(%connection_id, "missed pongs, closing connection");
                    let _ = tx.send(Message::Close(None)).await;
                    break;
                }
                if tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = status_timer.tick() => {
                let frame = state.status_frame().await;
                if send_response(&tx, &frame).await.is_err() {
                    break;
                }
            }
            Some(response) = in_flight.next() => {
                pending = pending.saturating_sub(1);
                if send_response(&tx, &response).await.is_err() {
                    break;
                }
            }
            frame = ws_rx.next(), if pending < MAX_IN_FLIGHT => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !limiter.allow() {
                            let frame = Response::error(
                                None,
                                ErrorCode::RateLimited,
                                "Too many requests",
                            );
                            if send_response(&tx, &frame).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        match serde_json::from_str::<Request>(text.as_str()) {
                            Ok(request) => {
                                let state = state.clone();
                                in_flight.push_back(Box::pin(async move {
                                    process_request(state, request).await
                                }));
                                pending += 1;
                            }
                            Err(e) => {
                                let frame = Response::error(
                                    None,
                                    ErrorCode::InvalidRequest,
                                    format!("Invalid JSON: {e}"),
                                );
                                if send_response(&tx, &frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%connection_id, "websocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // Dropping `in_flight` cancels outstanding work at its next await
    // point; results of canceled queries are discarded.
    drop(in_flight);
    writer.abort();
    info!(%connection_id, "websocket disconnected");
}

async fn send_response(
    tx: &mpsc::Sender<Message>,
    response: &Response,
) -> Result<(), ()> {
    match serde_json::to_string(response) {
        Ok(json) => tx
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| ()),
        Err(e) => {
            error!("failed to serialize response: {e}");
            Ok(())
        }
    }
}

async fn process_request(state: Arc<DaemonState>, request: Request) -> Response {
    match request {
        Request::ListIndexes {} => {
            let registry = state.registry.read().await;
            Response::IndexList {
                indexes: registry.list(),
                current: state.active_index().await,
                default: registry.default_index().map(String::from),
            }
        }

        Request::SwitchIndex { index } => {
            let Some(name) = index.filter(|n| !n.trim().is_empty()) else {
                return Response::error(
                    None,
                    ErrorCode::InvalidRequest,
                    "Index name is required",
                );
            };
            if state.registry.read().await.get(&name).is_none() {
                return Response::error(
                    None,
                    ErrorCode::IndexNotFound,
                    format!("Unknown index: {name}"),
                );
            }
            match state.load_index(&name).await {
                Ok(_) => {
                    *state.active.write().await = Some(name.clone());
                    Response::IndexSwitched { index: name }
                }
                Err((code, message)) => Response::error(None, code, message),
            }
        }

        Request::Query {
            id,
            index,
            query,
            top_k,
            expand,
            expand_depth,
            min_score,
        } => {
            let Some(text) = query.filter(|q| !q.trim().is_empty()) else {
                return Response::error(
                    id,
                    ErrorCode::InvalidRequest,
                    "Query text is required",
                );
            };
            let top_k = top_k.unwrap_or(10);
            if top_k == 0 || top_k > MAX_TOP_K {
                return Response::error(
                    id,
                    ErrorCode::InvalidRequest,
                    format!("top_k must be between 1 and {MAX_TOP_K}"),
                );
            }
            if let Some(depth) = expand_depth {
                if depth > MAX_EXPAND_DEPTH {
                    return Response::error(
                        id,
                        ErrorCode::InvalidRequest,
                        format!("expand_depth must be at most {MAX_EXPAND_DEPTH}"),
                    );
                }
            }

            let name = match state.resolve_name(index.as_deref()).await {
                Ok(name) => name,
                Err((code, message)) => return Response::error(id, code, message),
            };
            let loaded = match state.load_index(&name).await {
                Ok(loaded) => loaded,
                Err((code, message)) => return Response::error(id, code, message),
            };
            if loaded.is_ingesting() {
                return Response::error(
                    id,
                    ErrorCode::IndexBusy,
                    format!("Index '{name}' has an ingest in progress"),
                );
            }

            let opts = QueryOptions {
                top_k,
                expand: expand.unwrap_or(true),
                expand_depth,
                min_score,
            };
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                Duration::from_secs(QUERY_TIMEOUT_SECS),
                run_query(&loaded, &text, &opts),
            )
            .await;

            match outcome {
                Err(_) => Response::error(
                    id,
                    ErrorCode::Timeout,
                    format!("Query exceeded {QUERY_TIMEOUT_SECS}s"),
                ),
                Ok(Err(e)) => Response::error(id, error_code_for(&e), e.to_string()),
                Ok(Ok(result)) => {
                    let timing_ms = started.elapsed().as_millis() as u64;
                    wire_query_result(id, &name, result, loaded.repo.as_ref(), timing_ms)
                }
            }
        }
    }
}

async fn run_query(
    loaded: &LoadedIndex,
    text: &str,
    opts: &QueryOptions,
) -> Result<QueryResult, IndexError> {
    let snapshot = loaded.snapshot().await;
    let engine = QueryEngine::new(snapshot, loaded.project.clone());

    // Embed on the async side; the CPU-bound ranking runs on a blocking
    // worker thread.
    let mut vectors = loaded.embedder.embed_batch(&[text.to_string()]).await?;
    let mut query_vector = vectors
        .pop()
        .ok_or_else(|| IndexError::Embed("embedder returned no vector".to_string()))?;
    gundog_index::embedding::normalize(&mut query_vector);

    let text = text.to_string();
    let opts = opts.clone();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    tokio::task::spawn_blocking(move || {
        Ok(engine.execute(&query_vector, &text, &opts, now))
    })
    .await
    .map_err(|e| IndexError::Store(format!("query worker failed: {e}")))?
}

fn wire_query_result(
    id: Option<String>,
    index: &str,
    result: QueryResult,
    repo: Option<&RepoInfo>,
    timing_ms: u64,
) -> Response {
    let file_url = |path: &str, lines: Option<(usize, usize)>| {
        repo.and_then(|repo| gundog_index::git::build_file_url(repo, path, lines))
    };

    let direct = result
        .direct
        .into_iter()
        .map(|hit| WireHit {
            name: file_name(&hit.path),
            url: file_url(&hit.path, hit.lines),
            lines: hit.lines.map(|(s, e)| format!("{s}-{e}")),
            path: hit.path,
            doc_type: hit.source_type,
            score: hit.score,
            chunk: hit.chunk,
        })
        .collect();

    let related = result
        .related
        .into_iter()
        .map(|hit| WireRelated {
            name: file_name(&hit.path),
            via_name: file_name(&hit.via_path),
            url: file_url(&hit.path, None),
            path: hit.path,
            doc_type: hit.source_type,
            via: hit.via_path,
            weight: hit.weight,
            depth: hit.depth,
        })
        .collect();

    let graph = WireGraph {
        nodes: result
            .graph
            .nodes
            .into_iter()
            .map(|node| WireGraphNode {
                id: node.doc_id,
                path: node.path,
                direct: node.direct,
            })
            .collect(),
        edges: result
            .graph
            .edges
            .into_iter()
            .map(|(source, target, weight)| WireGraphEdge {
                source,
                target,
                weight,
            })
            .collect(),
    };

    Response::QueryResult {
        id,
        index: index.to_string(),
        timing_ms,
        direct,
        related,
        graph,
    }
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}
