//! Order Sheet Sync - spreadsheet-to-order ingestion backend
//!
//! Links a spreadsheet account, maps sheet columns onto order fields for the
//! `new` and `abandoned` channels, and ingests rows into the order backend
//! from a durable per-channel cursor. The host dashboard calls the handlers
//! in [`commands`] with JSON payloads, the same way it calls its other IPC
//! commands.

use anyhow::Context;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Start time for uptime reporting (epoch seconds).
pub(crate) static APP_START_EPOCH: AtomicU64 = AtomicU64::new(0);

pub mod account;
pub mod api;
pub mod autosync;
pub mod backend;
pub mod channel;
pub mod commands;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod headers;
pub mod integration;
pub mod mapping;
pub mod provider;
pub mod storage;
pub mod store;
pub mod sync;
#[cfg(test)]
mod testing;
pub mod validator;

pub use channel::{ChannelKind, OrderField};
pub use error::{RemoteError, SyncError};
pub use integration::SheetSync;

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

// ============================================================================
// Logging
// ============================================================================

/// Install structured logging (console + daily rolling file). Call once,
/// before [`AppState::open`].
pub fn init_logging() {
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    APP_START_EPOCH.store(epoch, Ordering::Relaxed);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,order_sheet_sync_lib=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs();

    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    if installed.is_ok() {
        // Dropping the guard flushes and stops the file writer; it has to
        // live until process exit.
        std::mem::forget(guard);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        built = env!("BUILD_TIMESTAMP"),
        "Starting Order Sheet Sync"
    );
}

// ============================================================================
// Application state
// ============================================================================

/// Everything the command handlers need.
pub struct AppState {
    pub db: Arc<db::DbState>,
    pub config: config::SyncConfig,
    pub sync: SheetSync,
}

impl AppState {
    /// Open the database, read the stored connection and build the sync
    /// engine against the HTTP collaborators. Loading channel configuration
    /// is attempted but not required: an unlinked account or an unreachable
    /// backend leaves both channels at their defaults.
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let db = Arc::new(
            db::init(data_dir)
                .map_err(anyhow::Error::msg)
                .context("initialising local database")?,
        );
        let config = config::SyncConfig::load(&db)
            .map_err(anyhow::Error::msg)
            .context("loading sync configuration")?;

        let client = api::ApiClient::new(
            &config.backend_url,
            &config.api_key,
            config.request_timeout,
        )
        .context("building order backend client")?;

        let sync = SheetSync::new(
            Arc::new(provider::HttpSpreadsheetProvider::new(client.clone())),
            Arc::new(backend::HttpOrderBackend::new(client)),
            Some(db.clone()),
            config.validation_debounce,
        );
        sync.set_account_id(config.account_id.clone());

        if config.account_id.is_some() {
            if let Err(e) = sync.load().await {
                warn!(error = %e, "channel configuration not loaded at startup");
            }
        } else {
            info!("no spreadsheet account linked yet");
        }

        if let Some(interval) = config.auto_sync_interval {
            sync.scheduler().start_loop(interval);
        }

        Ok(Self { db, config, sync })
    }

    /// Seconds since [`init_logging`] ran.
    pub fn uptime_secs(&self) -> u64 {
        let started = APP_START_EPOCH.load(Ordering::Relaxed);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now.saturating_sub(started)
    }
}
