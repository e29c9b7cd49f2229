//! Runtime configuration: credentials from the keyring, tunables from the
//! `local_settings` table.

use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::api::{normalize_base_url, DEFAULT_TIMEOUT};
use crate::db::{self, DbState};
use crate::storage;
use crate::validator::DEFAULT_DEBOUNCE;

pub const SETTINGS_CATEGORY: &str = "sheet_sync";
pub const KEY_DEBOUNCE_MS: &str = "validation_debounce_ms";
pub const KEY_TIMEOUT_SECS: &str = "request_timeout_secs";
/// `0` leaves periodic ticks to the backend scheduler.
pub const KEY_AUTO_SYNC_INTERVAL_SECS: &str = "auto_sync_interval_secs";

#[derive(Clone)]
pub struct SyncConfig {
    pub backend_url: String,
    pub api_key: Zeroizing<String>,
    pub account_id: Option<String>,
    pub validation_debounce: Duration,
    pub request_timeout: Duration,
    pub auto_sync_interval: Option<Duration>,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("backend_url", &self.backend_url)
            .field("api_key", &"[REDACTED]")
            .field("account_id", &self.account_id)
            .field("validation_debounce", &self.validation_debounce)
            .field("request_timeout", &self.request_timeout)
            .field("auto_sync_interval", &self.auto_sync_interval)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_parts(backend_url: &str, api_key: &str, account_id: Option<&str>) -> Self {
        Self {
            backend_url: normalize_base_url(backend_url),
            api_key: Zeroizing::new(api_key.trim().to_string()),
            account_id: account_id
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            validation_debounce: DEFAULT_DEBOUNCE,
            request_timeout: DEFAULT_TIMEOUT,
            auto_sync_interval: None,
        }
    }

    /// Read the connection from the credential store and apply tunables
    /// from `db`. Fails when no backend connection has been stored.
    pub fn load(db: &DbState) -> Result<Self, String> {
        let backend_url = storage::backend_url().ok_or("Order backend URL is not configured")?;
        let api_key = storage::api_key().ok_or("Order backend API key is not configured")?;
        let mut config =
            Self::from_parts(&backend_url, &api_key, storage::account_id().as_deref());
        config.apply_settings(db);
        debug!(?config, "sync configuration loaded");
        Ok(config)
    }

    pub fn apply_settings(&mut self, db: &DbState) {
        let Ok(conn) = db.conn.lock() else {
            warn!("settings lock poisoned, keeping defaults");
            return;
        };
        let read = |key: &str| -> Option<u64> {
            let raw = db::get_setting(&conn, SETTINGS_CATEGORY, key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring non-numeric setting");
                    None
                }
            }
        };

        if let Some(ms) = read(KEY_DEBOUNCE_MS) {
            self.validation_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = read(KEY_TIMEOUT_SECS).filter(|s| *s > 0) {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read(KEY_AUTO_SYNC_INTERVAL_SECS) {
            self.auto_sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
    }
}
