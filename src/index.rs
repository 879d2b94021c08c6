//! The single-page client's `index.html`.
//!
//! Loaded once while the application is built, then rendered per request
//! with the caller's language substituted into `lang="en-US"` attributes.

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, Uri};

use crate::config::{ClientConfig, ServerConfig};

const DEFAULT_LANG: &str = "en-US";

/// Served in development when the client has not been built yet.
const DEV_FALLBACK_HTML: &str = r#"<!DOCTYPE html>
<html lang="en-US">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <base href="/">
  <title>Saathi - Development Mode</title>
</head>
<body>
  <div id="root"></div>
  <p>Frontend not built. Build the client or start the Vite dev server separately.</p>
</body>
</html>
"#;

#[derive(Debug, Clone)]
pub struct IndexPage {
    html: String,
}

impl IndexPage {
    /// Reads `<dist>/index.html`.
    ///
    /// A missing file is only tolerated in `development`, where a minimal
    /// placeholder page is used instead.
    pub async fn load(client: &ClientConfig, server: &ServerConfig) -> Result<Self> {
        let path = client.dist.join("index.html");
        let html = match tokio::fs::read_to_string(&path).await {
            Ok(html) => html,
            Err(err) if server.is_development() => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "index.html not found, frontend may not be built yet; using minimal fallback"
                );
                DEV_FALLBACK_HTML.to_string()
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read client index: {}", path.display())
                })
            }
        };

        Self::from_html(html, client.domain_client.as_deref())
    }

    /// Builds a page from raw HTML, rewriting the base href when the client
    /// is served from a sub-path of `domain_client`.
    pub fn from_html(html: String, domain_client: Option<&str>) -> Result<Self> {
        let html = match domain_client.map(base_href).transpose()? {
            Some(base) if base != "/" => {
                tracing::info!(base_href = %base, "setting base href");
                rewrite_base_href(&html, &base)
            }
            _ => html,
        };
        Ok(Self { html })
    }

    /// The page with every `lang="en-US"` replaced by `lang`.
    pub fn render(&self, lang: &str) -> String {
        let sane = lang.replace('"', "&quot;");
        self.html
            .replace(r#"lang="en-US""#, &format!(r#"lang="{}""#, sane))
    }

    pub fn html(&self) -> &str {
        &self.html
    }
}

/// Path component of the client URL, always ending in `/`.
pub fn base_href(domain_client: &str) -> Result<String> {
    let uri: Uri = domain_client
        .parse()
        .with_context(|| format!("Invalid DOMAIN_CLIENT URL: {}", domain_client))?;
    let path = uri.path();
    Ok(if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    })
}

/// Replaces the first `base href="/"` with `base`.
pub fn rewrite_base_href(html: &str, base: &str) -> String {
    html.replacen(r#"base href="/""#, &format!(r#"base href="{}""#, base), 1)
}

/// Language for the index page: the `lang` cookie, then the first
/// `Accept-Language` entry, then `en-US`.
pub fn request_language(headers: &HeaderMap) -> String {
    if let Some(lang) = cookie_value(headers, "lang").filter(|l| !l.is_empty()) {
        return lang;
    }

    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(DEFAULT_LANG)
        .to_string()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| decode_cookie_value(value.trim()))
}

/// Strips surrounding double quotes and percent-decodes; a value that does
/// not decode to UTF-8 is kept as sent.
fn decode_cookie_value(raw: &str) -> String {
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(raw);
    urlencoding::decode(unquoted)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| unquoted.to_string())
}
