//! Structured logging setup.
//!
//! Events go to **stderr** so stdout stays parseable for `saathi check`.
//! `RUST_LOG` wins when set; otherwise the level follows the deployment
//! environment.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogFormat {
    /// Human-readable lines, colored when stderr is a TTY.
    Human,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Installs the global subscriber once. Later calls are no-ops, and an
/// already-installed subscriber (e.g. from a test harness) is kept.
pub fn init_logging(environment: &str, format: LogFormat) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(environment)));

        let human = (format == LogFormat::Human).then(|| {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(atty::is(atty::Stream::Stderr))
        });
        let json = (format == LogFormat::Json).then(|| {
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
        });

        if tracing_subscriber::registry()
            .with(filter)
            .with(human)
            .with(json)
            .try_init()
            .is_err()
        {
            tracing::debug!("global tracing subscriber already set, keeping it");
        }

        tracing::debug!(environment, ?format, "logging initialized");
    });
}

fn default_directives(environment: &str) -> &'static str {
    match environment {
        "production" => "saathi_server=info,tower_http=info,warn",
        _ => "saathi_server=debug,tower_http=debug,info",
    }
}
