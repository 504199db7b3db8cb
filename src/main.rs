mod auth;
mod circuit_breaker;
mod config;
mod error;
mod forwarding;
mod ingestion;
mod lifecycle;
mod payload_store;
mod query;
mod rate_limit;
mod replay;
mod repository;
mod signature;
mod ssrf;
mod stream;
mod webhook_manager;

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{any, get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, ConfigSnapshot, KeyedStorage};
use payload_store::{InMemoryPayloadStore, PayloadStore};
use repository::{InMemoryLogRepository, LogRepository};
use webhook_manager::WebhookManager;

/// Shared server state (§3 "Configuration Snapshot", §10.11 external
/// collaborators). `config` is the boot-time half; `config_snapshot` is the
/// hot-reloadable half, read once per request behind a lock.
pub struct AppState {
    pub config: Config,
    pub config_snapshot: RwLock<ConfigSnapshot>,
    pub storage: KeyedStorage,
    pub webhooks: Arc<WebhookManager>,
    pub repository: Arc<dyn LogRepository>,
    pub payloads: Arc<dyn PayloadStore>,
    pub rate_limiter: Arc<rate_limit::RateLimiter>,
    pub circuit_breaker: Arc<circuit_breaker::CircuitBreaker>,
    pub http_client: reqwest::Client,
    pub retry_policy: forwarding::RetryPolicy,
    pub event_bus: stream::EventBus,
}

// ─── Page / info handlers ───────────────────────────────────────────────────

async fn landing_handler() -> Html<&'static str> {
    Html(
        "<!doctype html><title>hookline</title><h1>hookline</h1>\
         <p>Webhook debugger, logger, and forwarding suite. See <code>/info</code> for status.</p>",
    )
}

/// `GET /info` (§6): version, status, and a `system` block summarizing the
/// active configuration snapshot.
async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active = state.webhooks.get_all_active().await;
    let webhook_count = state.webhooks.count().await;
    let snapshot = state.config_snapshot.read().await;
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
        "system": {
            "authActive": snapshot.auth_key.is_some(),
            "retentionHours": snapshot.retention_hours,
            "maxPayloadLimit": snapshot.max_payload_size,
            "webhookCount": webhook_count,
            "activeWebhooks": active.len(),
        },
        "features": {
            "signatureVerification": snapshot.signature_verification.is_some(),
            "forwarding": snapshot.forward_url.is_some(),
            "jsonSchema": snapshot.json_schema.is_some(),
        },
        "endpoints": [
            "/webhook/:id", "/logs", "/logs/:id", "/logs/:id/payload",
            "/replay/:webhookId/:eventId", "/log-stream", "/system/metrics",
        ],
        "docs": "/",
    }))
}

#[derive(serde::Deserialize)]
struct CreateWebhooksRequest {
    #[serde(default = "default_count")]
    count: u32,
    #[serde(default = "default_retention_hours", rename = "retentionHours")]
    retention_hours: f64,
}

fn default_count() -> u32 {
    1
}

fn default_retention_hours() -> f64 {
    24.0
}

/// `POST /webhook` (§4.7 `generateWebhooks`): management endpoint that
/// allocates new webhook identities.
async fn create_webhooks(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let snapshot = state.config_snapshot.read().await.clone();
    if let Err(err) = auth::require_auth(&headers, snapshot.auth_key.as_deref()) {
        return error::render(err, &headers);
    }

    let request: CreateWebhooksRequest = if body.is_empty() {
        CreateWebhooksRequest { count: 1, retention_hours: snapshot.retention_hours as f64 }
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return error::ApiError::validation(format!("invalid request body: {err}")).into_response(),
        }
    };

    match state.webhooks.generate_webhooks(request.count, request.retention_hours).await {
        Ok(ids) => Json(serde_json::json!({ "webhookIds": ids })).into_response(),
        Err(msg) => error::ApiError::validation(msg).into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>, headers: axum::http::HeaderMap) -> axum::response::Response {
    let snapshot = state.config_snapshot.read().await.clone();
    if let Err(err) = auth::require_auth(&headers, snapshot.auth_key.as_deref()) {
        return error::render(err, &headers);
    }

    let active = state.webhooks.get_all_active().await;
    let now_ms = chrono::Utc::now().timestamp_millis();
    Json(serde_json::json!({
        "activeWebhooks": active.len(),
        "rateLimiterEntries": state.rate_limiter.entry_count().await,
        "circuitBreakerOpenHosts": state.circuit_breaker.open_count(now_ms).await,
    }))
    .into_response()
}

// ─── Middleware ──────────────────────────────────────────────────────────────

const MANAGEMENT_RATE_LIMIT_WEBHOOK: &str = "__management__";

/// Global rate limit over every route except ingestion (§4.9 admission step
/// 2: "management-endpoint rate limit for all non-ingestion routes"), keyed
/// by client IP under one shared bucket so `/logs`, `/replay`, etc. share a
/// budget distinct from any per-webhook ingestion limit.
async fn management_rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    connect_info: axum::extract::ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    request: Request,
    next: Next,
) -> axum::response::Response {
    let client_ip =
        ingestion::client_ip_from_headers(&headers, connect_info.0).unwrap_or_else(|| connect_info.0.ip().to_string());
    let key = rate_limit::RateLimitKey {
        webhook_id: MANAGEMENT_RATE_LIMIT_WEBHOOK.to_string(),
        client_ip: Some(client_ip),
    };
    let decision = state.rate_limiter.check(key, chrono::Utc::now().timestamp_millis()).await;
    if !decision.allowed {
        return error::ApiError::rate_limited("Rate limit exceeded.").into_response();
    }
    next.run(request).await
}

async fn request_id_middleware(request: Request, next: Next) -> impl IntoResponse {
    let incoming = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response = next.run(request).await;
    let id = incoming.unwrap_or_else(|| webhook_manager::generate_id("req"));
    if let Ok(value) = id.parse() {
        response.headers_mut().insert(HeaderName::from_static("x-request-id"), value);
    }
    response
}

/// Security headers (§6): the first three apply to every response; HSTS and
/// Permissions-Policy are safe to send unconditionally, CSP is scoped to HTML
/// responses only so it never clashes with JSON/SSE content types.
async fn security_headers_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let is_html = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/html"));

    let headers = response.headers_mut();
    headers.insert(HeaderName::from_static("x-content-type-options"), HeaderValue::from_static("nosniff"));
    headers.insert(HeaderName::from_static("x-frame-options"), HeaderValue::from_static("DENY"));
    headers.insert(HeaderName::from_static("referrer-policy"), HeaderValue::from_static("no-referrer"));
    headers.insert(
        HeaderName::from_static("strict-transport-security"),
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(HeaderName::from_static("permissions-policy"), HeaderValue::from_static("geolocation=(), microphone=(), camera=()"));
    if is_html {
        headers.insert(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static("default-src 'self'"),
        );
    }
    response
}

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<HeaderValue>().ok())
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([HeaderName::from_static("content-type"), HeaderName::from_static("authorization")])
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cfg = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level)))
        .init();

    let storage = KeyedStorage::new(cfg.data_dir.clone());
    let snapshot: ConfigSnapshot = storage.get("INPUT").unwrap_or_default();

    let webhooks = Arc::new(WebhookManager::new(storage.clone()));
    webhooks.init().await;

    let repository: Arc<dyn LogRepository> = Arc::new(InMemoryLogRepository::new());
    let payloads: Arc<dyn PayloadStore> = Arc::new(InMemoryPayloadStore::new());

    let rate_limiter = Arc::new(
        rate_limit::RateLimiter::new(snapshot.rate_limit_per_minute.max(1), 60_000, 10_000)
            .expect("rate limiter configuration is valid by construction"),
    );
    let circuit_breaker = Arc::new(circuit_breaker::CircuitBreaker::new(5, 30_000, 10_000));

    let allowed_origins = cfg.allowed_origins.clone();
    let reload_poll_ms = cfg.reload_poll_ms;

    let state = Arc::new(AppState {
        config: cfg,
        config_snapshot: RwLock::new(snapshot),
        storage,
        webhooks: webhooks.clone(),
        repository: repository.clone(),
        payloads: payloads.clone(),
        rate_limiter: rate_limiter.clone(),
        circuit_breaker: circuit_breaker.clone(),
        http_client: reqwest::Client::new(),
        retry_policy: forwarding::RetryPolicy::default(),
        event_bus: stream::EventBus::default(),
    });

    // ── Background tasks ────────────────────────────────────────────────
    let mut background_tasks = Vec::new();
    background_tasks.push(rate_limit::spawn_sweeper(rate_limiter, Duration::from_secs(60)));
    background_tasks.push(circuit_breaker::spawn_pruner(circuit_breaker, Duration::from_secs(60)));
    background_tasks.push(webhook_manager::spawn_cleanup_task(
        webhooks,
        repository,
        payloads,
        Duration::from_secs(300),
    ));
    background_tasks.push(lifecycle::spawn_reload_watcher(state.clone(), Duration::from_millis(reload_poll_ms)));

    let cors = build_cors_layer(&allowed_origins);

    let management_routes = Router::new()
        .route("/", get(landing_handler))
        .route("/info", get(info_handler))
        .route("/webhook", post(create_webhooks))
        .route("/logs", get(query::list_logs))
        .route("/logs/:id", get(query::get_log))
        .route("/logs/:id/payload", get(query::get_log_payload))
        .route("/replay/:webhookId/:eventId", get(replay::replay).post(replay::replay))
        .route("/log-stream", get(stream::log_stream))
        .route("/system/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(state.clone(), management_rate_limit_middleware));

    let ingestion_routes = Router::new().route("/webhook/:id", any(ingestion::ingest));

    let app = management_routes
        .merge(ingestion_routes)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state.clone());

    let bind_addr = state.config.bind_addr.clone();
    info!("hookline listening on http://{bind_addr}");

    let addr: SocketAddr = bind_addr.parse().expect("invalid bind address");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listener");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => {
            if let Err(err) = result {
                warn!(%err, "server exited with an error");
            }
        }
        signal = lifecycle::wait_for_shutdown_signal() => {
            match signal {
                lifecycle::ShutdownSignal::Interrupt => info!("received Ctrl+C, shutting down"),
                lifecycle::ShutdownSignal::Terminate => info!("received SIGTERM, shutting down"),
            }
        }
    }

    lifecycle::graceful_shutdown(state, background_tasks, Duration::from_secs(10)).await;
}
