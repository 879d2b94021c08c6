//! Cross-cutting layers applied to the assembled application.

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::{header, request::Parts, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
};

use crate::config::CorsConfig;

static X_ROBOTS_TAG: HeaderName = HeaderName::from_static("x-robots-tag");
static X_REQUESTED_WITH: HeaderName = HeaderName::from_static("x-requested-with");

/// Whether a browser `Origin` may make credentialed requests.
///
/// An empty allow-list, or one containing `*`, allows every origin.
pub fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|o| o == "*" || o == origin)
}

/// Credentialed CORS for a client deployed separately from the API.
///
/// Requests without an `Origin` header are untouched by the layer, which
/// lets curl and native clients through.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let allowed = config.allowed_origins.clone();
    let origin = AllowOrigin::predicate(move |origin: &HeaderValue, _parts: &Parts| {
        origin
            .to_str()
            .map(|o| origin_allowed(&allowed, o))
            .unwrap_or(false)
    });

    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            X_REQUESTED_WITH.clone(),
            header::ACCEPT,
        ])
}

/// Asks crawlers not to index anything served by this process.
pub async fn no_index(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(X_ROBOTS_TAG.clone(), HeaderValue::from_static("noindex"));
    response
}

/// `Cache-Control: public, max-age=<secs>` for static files, unless the
/// response already set its own.
pub fn static_cache_layer(max_age_secs: u64) -> Result<SetResponseHeaderLayer<HeaderValue>> {
    let value = HeaderValue::from_str(&format!("public, max-age={}", max_age_secs))
        .context("Invalid static cache header")?;
    Ok(SetResponseHeaderLayer::if_not_present(
        header::CACHE_CONTROL,
        value,
    ))
}
