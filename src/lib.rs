//! # Saathi Server
//!
//! HTTP entry point for the Saathi chat backend, built to run both as a
//! long-lived server and as a serverless function.
//!
//! In a serverless deployment the first requests reach a fresh process
//! before the application exists. The [`lazy`] module builds it exactly once
//! per attempt no matter how many requests arrive at the same time, and the
//! [`serverless`] adapter turns build failures into a structured `500`.
//!
//! ## Architecture
//!
//! ```text
//!  platform / listener
//!          │
//!          ▼
//!  ┌───────────────────┐    first request    ┌──────────────┐
//!  │ ServerlessHandler │────────────────────▶│ LazyHandler  │
//!  │  (PlatformContext)│◀──── Arc<Router> ───│ (one build)  │
//!  └─────────┬─────────┘                     └──────┬───────┘
//!            │ oneshot                               │ AppFactory
//!            ▼                                       ▼
//!      ┌──────────┐                           ┌─────────────┐
//!      │  Router  │◀──────────────────────────│ create_app  │
//!      └──────────┘                           └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! saathi check                       # show resolved settings
//! saathi serve                       # build eagerly, then listen
//! saathi serve --serverless          # listen now, build on first request
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration plus environment overrides |
//! | [`logging`] | tracing subscriber setup |
//! | [`lazy`] | Single-flight lazy handler construction |
//! | [`serverless`] | Per-invocation adapter and failure response |
//! | [`app`] | Application router assembly |
//! | [`index`] | SPA index loading and per-request rendering |
//! | [`middleware`] | CORS, no-index and static cache layers |
//! | [`server`] | Standalone and serverless run modes |

pub mod app;
pub mod config;
pub mod index;
pub mod lazy;
pub mod logging;
pub mod middleware;
pub mod server;
pub mod serverless;
