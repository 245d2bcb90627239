//! The Small POS - offline-first sync and kitchen ticket routing engine.
//!
//! Every mutation is persisted to the local SQLite store first, then mirrored
//! to the cloud when it is reachable and relayed to the other terminals on
//! the LAN. Order items are routed into per-kitchen production tickets.
//! [`engine::SyncEngine`] wires everything together from an
//! [`config::EngineConfig`].

use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod accounting;
pub mod cash;
pub mod cloud;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
mod fields;
pub mod inbound;
pub mod kds;
pub mod migration;
pub mod models;
pub mod mutation;
pub mod orchestrator;
pub mod orders;
pub mod relay;
pub mod routing;
pub mod scheduler;
pub mod storage;

pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use error::{
    ConfigError, DecodeError, EngineError, RemoteError, StoreError, StoreResult, WriteOutcome,
};
pub use orchestrator::Orchestrator;

/// Install console and daily rolling file logging.
///
/// The filter comes from `RUST_LOG` when set. Keep the returned guard alive
/// for as long as the process should write log files; dropping it flushes
/// and stops the file writer.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,the_small_pos_sync=debug"));

    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(log_dir, "pos-sync");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    // A host application may already own the global subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        "Starting The Small POS sync v{} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("BUILD_GIT_SHA").unwrap_or("unknown")
    );
    guard
}
