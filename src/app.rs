//! Application assembly.
//!
//! [`create_app`] builds the full [`Router`]: bootstrap routes, the
//! middleware stack, static client files and the single-page fallback. It
//! is the expensive, fallible step that [`crate::lazy::LazyHandler`] guards;
//! [`AppFactory`] plugs it in.
//!
//! `/health` and `/api/status` are only wrapped by request tracing. Every
//! other route also passes through CORS, compression, the no-index header
//! and the request body limit.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness check, plain `OK` |
//! | `GET`  | `/api/status` | Uptime, port, environment, invocation info |
//! | `*`    | `/api/*` | Unknown API paths → `404` JSON error |
//! | `GET`  | `/fonts/*`, `/assets/*` | Optional extra static directories |
//! | `*`    | everything else | Files from `client.dist`, else the SPA index |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no API route for /api/nope" } }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    handler::Handler,
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower::Layer;
use tower_http::{
    compression::CompressionLayer, limit::RequestBodyLimitLayer, services::ServeDir,
    trace::TraceLayer,
};

use crate::config::Config;
use crate::index::{request_language, IndexPage};
use crate::lazy::HandlerFactory;
use crate::middleware::{cors_layer, no_index, static_cache_layer};
use crate::serverless::{InvocationContext, PlatformContext};

/// Builds the application router for a [`crate::lazy::LazyHandler`].
pub struct AppFactory {
    config: Arc<Config>,
}

impl AppFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HandlerFactory for AppFactory {
    type Handler = Router;

    async fn build(&self) -> Result<Router> {
        create_app(Arc::clone(&self.config)).await
    }
}

/// Response headers for the index page, validated once at startup.
#[derive(Clone)]
struct IndexHeaders {
    cache_control: HeaderValue,
    pragma: HeaderValue,
    expires: HeaderValue,
}

impl IndexHeaders {
    fn from_config(config: &Config) -> Result<Self> {
        let value = |name: &str, raw: &str| {
            HeaderValue::from_str(raw)
                .with_context(|| format!("Invalid {} header value: '{}'", name, raw))
        };
        Ok(Self {
            cache_control: value("Cache-Control", &config.client.index_cache_control)?,
            pragma: value("Pragma", &config.client.index_pragma)?,
            expires: value("Expires", &config.client.index_expires)?,
        })
    }
}

/// Shared application state passed to route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    index: Arc<IndexPage>,
    index_headers: IndexHeaders,
    started_at: Instant,
}

/// Assembles the application.
///
/// Fails when the client index cannot be loaded outside development, when
/// `client.dist` is missing in production, or when configured header values
/// are not valid HTTP.
pub async fn create_app(config: Arc<Config>) -> Result<Router> {
    tracing::info!(
        environment = %config.server.environment,
        dist = %config.client.dist.display(),
        "assembling application"
    );

    run_startup_checks(&config)?;

    let index = IndexPage::load(&config.client, &config.server).await?;
    let state = AppState {
        index_headers: IndexHeaders::from_config(&config)?,
        index: Arc::new(index),
        started_at: Instant::now(),
        config: Arc::clone(&config),
    };

    let spa = ServeDir::new(&config.client.dist)
        .append_index_html_on_directories(false)
        .call_fallback_on_method_not_allowed(true)
        .fallback(handle_index.with_state(state.clone()));
    let static_cache = static_cache_layer(config.client.static_max_age_secs)?;

    // Bootstrap routes sit outside the body limit, no-index, compression and CORS layers.
    let bootstrap = Router::new()
        .route("/health", get(handle_health))
        .route("/api/status", get(handle_status))
        .with_state(state.clone());

    let mut router = Router::new()
        .route("/api", any(handle_api_not_found))
        .route("/api/{*rest}", any(handle_api_not_found))
        .route("/index.html", get(handle_index));

    if let Some(fonts) = &config.client.fonts {
        router = router.nest_service("/fonts", static_cache.layer(ServeDir::new(fonts)));
    }
    if let Some(assets) = &config.client.assets {
        router = router.nest_service("/assets", static_cache.layer(ServeDir::new(assets)));
    }

    let mut router = router
        .fallback_service(static_cache.layer(spa))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(config.http.body_limit_bytes));

    if config.http.no_index {
        router = router.layer(middleware::from_fn(no_index));
    }

    if config.http.compression {
        router = router.layer(CompressionLayer::new());
    } else {
        tracing::warn!("Response compression has been disabled via DISABLE_COMPRESSION.");
    }

    let router = router.layer(cors_layer(&config.cors));

    Ok(bootstrap
        .merge(router)
        .layer(TraceLayer::new_for_http()))
}

fn run_startup_checks(config: &Config) -> Result<()> {
    let dist = &config.client.dist;
    if config.server.is_production() && !dist.is_dir() {
        anyhow::bail!(
            "client.dist must be an existing directory in production: {}",
            dist.display()
        );
    }

    for (name, dir) in [("fonts", &config.client.fonts), ("assets", &config.client.assets)] {
        if let Some(dir) = dir {
            if !dir.is_dir() {
                tracing::warn!(dir = %dir.display(), "client.{} directory does not exist", name);
            }
        }
    }

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

async fn handle_health() -> &'static str {
    "OK"
}

// ============ GET /api/status ============

#[derive(Serialize)]
struct Uptime {
    hours: u64,
    minutes: u64,
    seconds: u64,
}

impl Uptime {
    fn from_secs(total: u64) -> Self {
        Self {
            hours: total / 3600,
            minutes: (total % 3600) / 60,
            seconds: total % 60,
        }
    }
}

#[derive(Serialize)]
struct Endpoint {
    method: &'static str,
    path: &'static str,
    description: &'static str,
}

const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        method: "GET",
        path: "/health",
        description: "Health check",
    },
    Endpoint {
        method: "GET",
        path: "/api/status",
        description: "This status report",
    },
];

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    uptime: Uptime,
    port: u16,
    environment: String,
    endpoints: &'static [Endpoint],
    timestamp: String,
    /// Present when the request came through the serverless adapter.
    invocation: Option<InvocationContext>,
}

async fn handle_status(State(state): State<AppState>, request: Request) -> Json<StatusResponse> {
    let invocation = request
        .extensions()
        .get::<PlatformContext>()
        .map(|platform| platform.context.clone());

    Json(StatusResponse {
        status: "online",
        version: env!("CARGO_PKG_VERSION"),
        uptime: Uptime::from_secs(state.started_at.elapsed().as_secs()),
        port: state.config.server.port,
        environment: state.config.server.environment.clone(),
        endpoints: ENDPOINTS,
        timestamp: chrono::Utc::now().to_rfc3339(),
        invocation,
    })
}

// ============ /api/* ============

async fn handle_api_not_found(uri: Uri) -> AppError {
    not_found(format!("no API route for {}", uri.path()))
}

// ============ SPA index ============

async fn handle_index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let lang = request_language(&headers);
    let html = state.index.render(&lang);
    let h = &state.index_headers;

    (
        [
            (header::CACHE_CONTROL, h.cache_control.clone()),
            (header::PRAGMA, h.pragma.clone()),
            (header::EXPIRES, h.expires.clone()),
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            ),
        ],
        html,
    )
        .into_response()
}
