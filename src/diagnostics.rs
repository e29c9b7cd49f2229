//! Diagnostics for the spreadsheet sync engine.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Sync health**: per-channel cursor, saved state and last commit attempt
//! - **Diagnostics export**: about, health and the recent run log written as
//!   one JSON file, with secrets redacted on request.
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use crate::channel::ChannelKind;
use crate::db::{self, DbState};
use rusqlite::params;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log.
pub const LOG_FILE_PREFIX: &str = "sheet-sync";

const RECENT_RUNS_IN_EXPORT: usize = 20;

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Sync health
// ---------------------------------------------------------------------------

/// Cursor, saved state and run counts for every channel, as mirrored locally.
pub fn get_sync_health(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let schema_version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    let mut channels = serde_json::Map::new();
    for kind in ChannelKind::ALL {
        let mirrored = db::load_channel(&conn, kind)?;
        let last_run = db::recent_sync_runs(&conn, kind, 1)?.into_iter().next();
        let failed_runs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_runs WHERE channel = ?1 AND status = 'failed'",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .unwrap_or(0);

        channels.insert(
            kind.as_str().to_string(),
            json!({
                "saved": mirrored.as_ref().is_some_and(|c| c.is_saved()),
                "cursor": mirrored.as_ref().map(|c| c.cursor),
                "autoSync": mirrored.as_ref().is_some_and(|c| c.auto_sync_enabled),
                "lastRun": last_run,
                "failedRuns": failed_runs,
            }),
        );
    }

    Ok(json!({
        "schemaVersion": schema_version,
        "channels": channels,
    }))
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Write a diagnostics bundle into `output_dir` and return its path.
pub fn export_diagnostics(
    db: &DbState,
    output_dir: &Path,
    redact_sensitive: bool,
) -> Result<String, String> {
    let mut runs = serde_json::Map::new();
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        for kind in ChannelKind::ALL {
            let recent = db::recent_sync_runs(&conn, kind, RECENT_RUNS_IN_EXPORT)?;
            runs.insert(kind.as_str().to_string(), json!(recent));
        }
    }

    let bundle = json!({
        "about": get_about_info(),
        "health": get_sync_health(db)?,
        "recentRuns": runs,
        "logDir": get_log_dir().to_string_lossy(),
    });
    let bundle = if redact_sensitive {
        redact_sensitive_fields(bundle)
    } else {
        bundle
    };

    fs::create_dir_all(output_dir).map_err(|e| format!("create export dir: {e}"))?;
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let path = output_dir.join(format!("sheet-sync-diagnostics-{stamp}.json"));
    let body = serde_json::to_string_pretty(&bundle).map_err(|e| e.to_string())?;
    fs::write(&path, body).map_err(|e| format!("write diagnostics: {e}"))?;

    info!(path = %path.display(), "diagnostics exported");
    Ok(path.to_string_lossy().to_string())
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if should_redact_key(&key) {
                        (key, Value::String("[REDACTED]".to_string()))
                    } else {
                        (key, redact_sensitive_fields(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    ["api_key", "apikey", "secret", "password", "token", "authorization", "account"]
        .iter()
        .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the log directory path (same location used by lib.rs).
pub fn get_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("order-sheet-sync").join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs() {
    prune_logs_in(&get_log_dir(), MAX_LOG_FILES);
}

fn prune_logs_in(log_dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry.path().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::db::SyncRunRecord;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{tag}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
    }

    #[test]
    fn test_log_dir_is_stable() {
        assert_eq!(get_log_dir(), get_log_dir());
        assert!(get_log_dir().to_string_lossy().contains("order-sheet-sync"));
    }

    #[test]
    fn test_sync_health_reports_channels() {
        let db = db::test_state();
        {
            let conn = db.conn.lock().unwrap();
            let mut channel = Channel::new(ChannelKind::New);
            channel.cursor = 9;
            channel.persisted_id = Some("cfg-1".into());
            db::upsert_channel(&conn, &channel).unwrap();
            db::insert_sync_run(
                &conn,
                &SyncRunRecord {
                    id: "run-1".into(),
                    channel: ChannelKind::New,
                    trigger: "manual".into(),
                    start_row: 2,
                    row_count: 7,
                    accepted_count: 0,
                    status: "failed".into(),
                    error: Some("timeout".into()),
                    fingerprint: "abc".into(),
                    started_at: "2026-01-01T00:00:00Z".into(),
                    finished_at: "2026-01-01T00:00:01Z".into(),
                },
            )
            .unwrap();
        }

        let health = get_sync_health(&db).unwrap();
        assert_eq!(health["channels"]["new"]["cursor"], 9);
        assert_eq!(health["channels"]["new"]["saved"], true);
        assert_eq!(health["channels"]["new"]["failedRuns"], 1);
        assert_eq!(health["channels"]["new"]["lastRun"]["status"], "failed");
        assert_eq!(health["channels"]["abandoned"]["saved"], false);
        assert!(health["schemaVersion"].as_i64().unwrap() >= 3);
    }

    #[test]
    fn test_export_writes_json_bundle() {
        let dir = temp_dir("diag_export");
        let db = db::test_state();
        let path = export_diagnostics(&db, &dir, true).unwrap();
        let body: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(body.get("about").is_some());
        assert!(body["recentRuns"].get("abandoned").is_some());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_redact_sensitive_fields_recurses() {
        let redacted = redact_sensitive_fields(json!({
            "apiKey": "k",
            "nested": { "accountId": "acct-1", "cursor": 4 },
            "items": [{ "token": "t" }]
        }));
        assert_eq!(redacted["apiKey"], "[REDACTED]");
        assert_eq!(redacted["nested"]["accountId"], "[REDACTED]");
        assert_eq!(redacted["nested"]["cursor"], 4);
        assert_eq!(redacted["items"][0]["token"], "[REDACTED]");
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = temp_dir("diag_prune");
        for i in 0..4 {
            fs::write(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-0{i}")), "x").unwrap();
        }
        fs::write(dir.join("other.log"), "x").unwrap();
        prune_logs_in(&dir, 2);
        let remaining = fs::read_dir(&dir).unwrap().count();
        assert_eq!(remaining, 3);
        let _ = fs::remove_dir_all(&dir);
    }
}
