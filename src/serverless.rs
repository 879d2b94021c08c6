//! Serverless entry point.
//!
//! [`ServerlessHandler`] is what a hosting platform invokes per request. It
//! makes sure the application [`Router`] has been built (once, through a
//! [`LazyHandler`]), attaches the invocation's [`PlatformContext`] to the
//! request, and forwards it. Initialization failures never escape to the
//! platform: they become a `500` with a JSON body.
//!
//! # Failure response
//!
//! ```json
//! { "error": "Server initialization failed", "message": "Failed to read client index: ..." }
//! ```

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceExt;

use crate::lazy::{HandlerFactory, InitError, LazyHandler};

/// Label used in the failure body's `error` field.
pub const INIT_FAILURE_LABEL: &str = "Server initialization failed";

/// Invocation metadata supplied by the hosting environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InvocationContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            region: None,
            function_name: None,
            received_at: Utc::now(),
        }
    }

    /// Reads the platform's request headers.
    ///
    /// `x-vercel-id` looks like `"<region>::<...>::<id>"`; its first segment
    /// is the edge region. Without it, `x-request-id` is used, and failing
    /// that a fresh UUID.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        match header("x-vercel-id") {
            Some(id) => {
                let region = id
                    .split("::")
                    .next()
                    .filter(|r| !r.is_empty() && *r != id)
                    .map(str::to_string);
                Self {
                    region,
                    ..Self::new(id)
                }
            }
            None => Self::new(
                header("x-request-id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
        }
    }
}

/// The event/context pair attached to every forwarded request.
///
/// Handlers read it from the request extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformContext {
    pub event: serde_json::Value,
    pub context: InvocationContext,
}

impl PlatformContext {
    pub fn new(event: serde_json::Value, context: InvocationContext) -> Self {
        Self { event, context }
    }

    /// Describes a request arriving over plain HTTP as an invocation event.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let uri = request.uri();
        let event = serde_json::json!({
            "method": request.method().as_str(),
            "path": uri.path(),
            "query": uri.query(),
            "host": request
                .headers()
                .get(axum::http::header::HOST)
                .and_then(|v| v.to_str().ok()),
        });
        Self::new(event, InvocationContext::from_headers(request.headers()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitFailureBody {
    pub error: String,
    pub message: String,
}

/// `500` with the initialization failure body.
pub fn init_failure_response(err: &InitError) -> Response {
    let body = InitFailureBody {
        error: INIT_FAILURE_LABEL.to_string(),
        message: err.to_string(),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// Per-invocation adapter in front of a lazily built [`Router`].
pub struct ServerlessHandler<F: HandlerFactory<Handler = Router>> {
    lazy: LazyHandler<F>,
    function_name: Option<String>,
}

impl<F: HandlerFactory<Handler = Router>> ServerlessHandler<F> {
    pub fn new(lazy: LazyHandler<F>) -> Self {
        Self {
            lazy,
            function_name: None,
        }
    }

    /// Name reported in the [`InvocationContext`] of requests routed through
    /// [`into_router`](Self::into_router).
    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    pub fn lazy(&self) -> &LazyHandler<F> {
        &self.lazy
    }

    /// Handles one invocation.
    pub async fn handle(&self, mut request: Request<Body>, platform: PlatformContext) -> Response {
        let app = match self.lazy.get().await {
            Ok(app) => app,
            Err(err) => {
                tracing::error!(
                    request_id = %platform.context.request_id,
                    error = %err,
                    "serverless function init error"
                );
                return init_failure_response(&err);
            }
        };

        request.extensions_mut().insert(platform);

        Router::clone(&app)
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {})
    }

    fn platform_for(&self, request: &Request<Body>) -> PlatformContext {
        let mut platform = PlatformContext::from_request(request);
        if platform.context.function_name.is_none() {
            platform.context.function_name = self.function_name.clone();
        }
        platform
    }

    /// A router that sends every request through [`handle`](Self::handle),
    /// deriving the platform context from request headers. Lets a plain
    /// listener emulate a warm serverless process.
    pub fn into_router(self) -> Router {
        let handler = Arc::new(self);
        Router::new().fallback(move |request: Request| {
            let handler = Arc::clone(&handler);
            async move {
                let platform = handler.platform_for(&request);
                handler.handle(request, platform).await
            }
        })
    }
}
