//! # Saathi CLI (`saathi`)
//!
//! ## Usage
//!
//! ```bash
//! saathi [--config ./config/saathi.toml] [--log-json] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `saathi serve` | Build the app and start listening |
//! | `saathi serve --serverless` | Listen immediately; build the app on first request |
//! | `saathi check` | Print the resolved configuration and client build status |
//!
//! Without `--config`, settings come from defaults and the deployment
//! environment (`PORT`, `HOST`, `NODE_ENV`, ...).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use saathi_server::config::{load_config_or_env, Config};
use saathi_server::logging::{init_logging, LogFormat};
use saathi_server::server;

/// Saathi server: the chat backend's HTTP entry point.
#[derive(Parser)]
#[command(
    name = "saathi",
    about = "Saathi server: HTTP entry point for the Saathi chat backend",
    version,
    long_about = "Serves the Saathi API and single-page client, either as a long-running \
    server or emulating a serverless function that builds the application on its first request."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Optional. Environment variables are applied on top of the file, or
    /// on top of built-in defaults when no file is given.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].host:[server].port`. By default the application
    /// is built before listening and startup fails if the build fails.
    Serve {
        /// Build the application lazily on the first request, answering
        /// `500` while initialization fails.
        #[arg(long)]
        serverless: bool,
    },

    /// Validate configuration and report what the server would use.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config_or_env(cli.config.as_deref())?;

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    init_logging(&cfg.server.environment, format);

    match cli.command {
        Commands::Serve { serverless: true } => server::run_serverless(cfg).await?,
        Commands::Serve { serverless: false } => server::run_standalone(cfg).await?,
        Commands::Check => print_check(&cfg),
    }

    Ok(())
}

fn print_check(cfg: &Config) {
    let index = cfg.client.dist.join("index.html");
    let on_off = |b: bool| if b { "on" } else { "off" };

    println!("environment: {}", cfg.server.environment);
    println!("listen:      {}", cfg.server.bind_addr());
    println!("dist:        {}", cfg.client.dist.display());
    println!(
        "index.html:  {}",
        if index.is_file() { "present" } else { "missing" }
    );
    println!("compression: {}", on_off(cfg.http.compression));
    println!("no-index:    {}", on_off(cfg.http.no_index));
    if cfg.cors.allowed_origins.is_empty() {
        println!("cors:        any origin");
    } else {
        println!("cors:        {}", cfg.cors.allowed_origins.join(", "));
    }
    match cfg.init.timeout() {
        Some(timeout) => println!("init:        {} (timeout {:?})", cfg.init.on_failure, timeout),
        None => println!("init:        {} (no timeout)", cfg.init.on_failure),
    }
}
