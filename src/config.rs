use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lazy::FailurePolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub init: InitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    3080
}
fn default_environment() -> String {
    "development".to_string()
}

impl ServerConfig {
    /// `host:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_true")]
    pub no_index: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            body_limit_bytes: default_body_limit(),
            compression: true,
            no_index: true,
        }
    }
}

fn default_body_limit() -> usize {
    3 * 1024 * 1024
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CorsConfig {
    /// Exact origins allowed to make credentialed requests. Empty allows all;
    /// a `*` entry also allows all.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_dist")]
    pub dist: PathBuf,
    #[serde(default)]
    pub fonts: Option<PathBuf>,
    #[serde(default)]
    pub assets: Option<PathBuf>,
    #[serde(default)]
    pub domain_client: Option<String>,
    #[serde(default = "default_index_cache_control")]
    pub index_cache_control: String,
    #[serde(default = "default_index_pragma")]
    pub index_pragma: String,
    #[serde(default = "default_index_expires")]
    pub index_expires: String,
    #[serde(default = "default_static_max_age")]
    pub static_max_age_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dist: default_dist(),
            fonts: None,
            assets: None,
            domain_client: None,
            index_cache_control: default_index_cache_control(),
            index_pragma: default_index_pragma(),
            index_expires: default_index_expires(),
            static_max_age_secs: default_static_max_age(),
        }
    }
}

fn default_dist() -> PathBuf {
    PathBuf::from("client/dist")
}
fn default_index_cache_control() -> String {
    "no-cache, no-store, must-revalidate".to_string()
}
fn default_index_pragma() -> String {
    "no-cache".to_string()
}
fn default_index_expires() -> String {
    "0".to_string()
}
fn default_static_max_age() -> u64 {
    172_800
}

#[derive(Debug, Deserialize, Clone)]
pub struct InitConfig {
    #[serde(default = "default_init_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_on_failure")]
    pub on_failure: String,
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown_ms: u64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_init_timeout(),
            on_failure: default_on_failure(),
            retry_cooldown_ms: default_retry_cooldown(),
        }
    }
}

fn default_init_timeout() -> u64 {
    30
}
fn default_on_failure() -> String {
    "retry".to_string()
}
fn default_retry_cooldown() -> u64 {
    1000
}

impl InitConfig {
    /// `None` when `timeout_secs = 0`.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn failure_policy(&self) -> Result<FailurePolicy> {
        match self.on_failure.as_str() {
            "retry" => Ok(FailurePolicy::Retry {
                cooldown: Duration::from_millis(self.retry_cooldown_ms),
            }),
            "sticky" => Ok(FailurePolicy::Sticky),
            other => anyhow::bail!(
                "Unknown init.on_failure policy: '{}'. Must be retry or sticky.",
                other
            ),
        }
    }
}

/// Mirrors the deployment's boolean env convention: only a trimmed,
/// case-insensitive `"true"` counts as enabled.
pub fn is_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

impl Config {
    /// Defaults for every section, without reading a file.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Applies deployment environment variables on top of file values.
    ///
    /// `lookup` is usually [`process_env`]; tests pass a map instead of
    /// touching the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_port(&port)?;
        }
        if let Some(env) = lookup("NODE_ENV").filter(|e| !e.is_empty()) {
            self.server.environment = env;
        }
        if let Some(flag) = lookup("DISABLE_COMPRESSION") {
            self.http.compression = !is_enabled(Some(&flag));
        }
        if let Some(flag) = lookup("NO_INDEX") {
            self.http.no_index = is_enabled(Some(&flag));
        }
        if let Some(origins) = lookup("CORS_ALLOWED_ORIGINS") {
            self.cors.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(domain) = lookup("DOMAIN_CLIENT").filter(|d| !d.is_empty()) {
            self.client.domain_client = Some(domain);
        }
        if let Some(value) = lookup("INDEX_CACHE_CONTROL") {
            self.client.index_cache_control = value;
        }
        if let Some(value) = lookup("INDEX_PRAGMA") {
            self.client.index_pragma = value;
        }
        if let Some(value) = lookup("INDEX_EXPIRES") {
            self.client.index_expires = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.http.body_limit_bytes == 0 {
            anyhow::bail!("http.body_limit_bytes must be > 0");
        }

        self.init.failure_policy()?;

        if let Some(domain) = &self.client.domain_client {
            if !(domain.starts_with("http://") || domain.starts_with("https://")) {
                anyhow::bail!(
                    "client.domain_client must be an absolute http(s) URL, got '{}'",
                    domain
                );
            }
        }

        for origin in &self.cors.allowed_origins {
            if origin != "*" && axum::http::HeaderValue::from_str(origin).is_err() {
                anyhow::bail!("cors.allowed_origins contains an invalid origin: '{}'", origin);
            }
        }

        Ok(())
    }
}

/// Reads `PORT` the way the deployment's numeric coercion does: blank is
/// `0` (ephemeral port), non-numeric text falls back to the default, and a
/// number that is not a valid port is an error.
fn parse_port(raw: &str) -> Result<u16> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    match raw.parse::<f64>() {
        Ok(n) if n.is_nan() => Ok(default_port()),
        Ok(n) if n.fract() == 0.0 && (0.0..=65535.0).contains(&n) => Ok(n as u16),
        Ok(_) => anyhow::bail!("PORT must be an integer between 0 and 65535, got '{}'", raw),
        Err(_) => Ok(default_port()),
    }
}

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Reads a TOML file, overlays the process environment, and validates.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.apply_env(process_env)?;
    config.validate()?;

    Ok(config)
}

/// Like [`load_config`], but a missing path means "defaults plus environment",
/// which is how a serverless deployment without a config file starts.
pub fn load_config_or_env(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let mut config = Config::minimal();
            config.apply_env(process_env)?;
            config.validate()?;
            Ok(config)
        }
    }
}
