//! Process entry points.
//!
//! Two ways to run the same application:
//!
//! - [`run_standalone`] builds the app eagerly and refuses to start if that
//!   fails. This is the long-running server.
//! - [`run_serverless`] starts listening immediately and builds the app on
//!   the first request through a [`ServerlessHandler`], the way a warm
//!   function instance behaves. Build failures are answered with a `500`
//!   instead of killing the process.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::app::{create_app, AppFactory};
use crate::config::Config;
use crate::lazy::LazyHandler;
use crate::serverless::ServerlessHandler;

/// Function name reported in invocation contexts when emulating the
/// catch-all API function.
pub const FUNCTION_NAME: &str = "api/[...slug]";

/// A [`LazyHandler`] over the application, with timeout and failure policy
/// taken from `[init]`.
pub fn lazy_app(config: Arc<Config>) -> Result<LazyHandler<AppFactory>> {
    let policy = config.init.failure_policy()?;
    let timeout = config.init.timeout();
    Ok(LazyHandler::new(AppFactory::new(config))
        .with_timeout(timeout)
        .with_failure_policy(policy))
}

/// Builds the app, binds `server.host:server.port`, and serves until Ctrl-C.
pub async fn run_standalone(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let app = create_app(Arc::clone(&config)).await?;

    let bind_addr = config.server.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    tracing::info!(addr = %bind_addr, "server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Binds `server.host:server.port` and serves through a lazily built app.
pub async fn run_serverless(config: Config) -> Result<()> {
    let bind_addr = config.server.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    run_serverless_on(listener, config, shutdown_signal()).await
}

/// Like [`run_serverless`] on an existing listener, stopping when `shutdown`
/// resolves.
pub async fn run_serverless_on<S>(listener: TcpListener, config: Config, shutdown: S) -> Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let lazy = lazy_app(Arc::new(config))?;
    let router = ServerlessHandler::new(lazy)
        .with_function_name(FUNCTION_NAME)
        .into_router();

    let addr = listener.local_addr()?;
    tracing::info!(%addr, "serverless handler listening, app builds on first request");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
