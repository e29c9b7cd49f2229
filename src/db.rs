//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Holds tunable settings, a local mirror of
//! each channel's persisted configuration, and the append-only log of
//! commit attempts.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::channel::{Channel, ChannelKind, OrderField, FIRST_DATA_ROW};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/sheet-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("sheet-sync.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: category/key/value settings.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| format!("migrate v1: {e}"))
}

/// Migration v2: local mirror of channel configurations.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS channel_configs (
            kind TEXT PRIMARY KEY CHECK (kind IN ('new', 'abandoned')),
            persisted_id TEXT,
            file_id TEXT NOT NULL DEFAULT '',
            sheet_name TEXT NOT NULL DEFAULT '',
            cursor INTEGER NOT NULL DEFAULT 2,
            mapping TEXT NOT NULL DEFAULT '{}',
            auto_sync INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| format!("migrate v2: {e}"))
}

/// Migration v3: commit attempt log.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            channel TEXT NOT NULL,
            trigger_source TEXT NOT NULL DEFAULT 'manual',
            start_row INTEGER NOT NULL,
            row_count INTEGER NOT NULL,
            accepted_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error TEXT,
            fingerprint TEXT NOT NULL DEFAULT '',
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_runs_channel ON sync_runs(channel, finished_at);
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| format!("migrate v3: {e}"))
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Channel mirror
// ---------------------------------------------------------------------------

/// Write the channel to the mirror. A stored cursor is never lowered.
pub fn upsert_channel(conn: &Connection, channel: &Channel) -> Result<(), String> {
    let mapping: BTreeMap<&str, &str> = channel
        .mapping
        .iter()
        .map(|(field, column)| (field.key(), column.as_str()))
        .collect();
    let mapping_json =
        serde_json::to_string(&mapping).map_err(|e| format!("encode mapping: {e}"))?;

    conn.execute(
        "INSERT INTO channel_configs
            (kind, persisted_id, file_id, sheet_name, cursor, mapping, auto_sync, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
         ON CONFLICT(kind) DO UPDATE SET
            persisted_id = excluded.persisted_id,
            file_id = excluded.file_id,
            sheet_name = excluded.sheet_name,
            cursor = MAX(channel_configs.cursor, excluded.cursor),
            mapping = excluded.mapping,
            auto_sync = excluded.auto_sync,
            updated_at = excluded.updated_at",
        params![
            channel.kind.as_str(),
            channel.persisted_id,
            channel.file_id,
            channel.sheet_name,
            channel.cursor as i64,
            mapping_json,
            channel.auto_sync_enabled as i64,
        ],
    )
    .map_err(|e| format!("upsert channel: {e}"))?;
    Ok(())
}

pub fn load_channel(conn: &Connection, kind: ChannelKind) -> Result<Option<Channel>, String> {
    let row = conn
        .query_row(
            "SELECT persisted_id, file_id, sheet_name, cursor, mapping, auto_sync
             FROM channel_configs WHERE kind = ?1",
            params![kind.as_str()],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| format!("load channel: {e}"))?;

    let Some((persisted_id, file_id, sheet_name, cursor, mapping_json, auto_sync)) = row else {
        return Ok(None);
    };

    let raw: BTreeMap<String, String> = serde_json::from_str(&mapping_json).unwrap_or_default();
    let mapping = raw
        .into_iter()
        .filter_map(|(key, column)| OrderField::from_key(&key).map(|f| (f, column)))
        .collect();

    Ok(Some(Channel {
        kind,
        file_id,
        sheet_name,
        cursor: (cursor.max(0) as u64).max(FIRST_DATA_ROW),
        mapping,
        auto_sync_enabled: auto_sync != 0,
        persisted_id,
    }))
}

pub fn delete_channel(conn: &Connection, kind: ChannelKind) -> Result<(), String> {
    conn.execute(
        "DELETE FROM channel_configs WHERE kind = ?1",
        params![kind.as_str()],
    )
    .map_err(|e| format!("delete channel: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync run log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunRecord {
    pub id: String,
    pub channel: ChannelKind,
    pub trigger: String,
    pub start_row: u64,
    pub row_count: u64,
    pub accepted_count: u64,
    pub status: String,
    pub error: Option<String>,
    pub fingerprint: String,
    pub started_at: String,
    pub finished_at: String,
}

pub fn insert_sync_run(conn: &Connection, run: &SyncRunRecord) -> Result<(), String> {
    conn.execute(
        "INSERT INTO sync_runs
            (id, channel, trigger_source, start_row, row_count, accepted_count, status, error,
             fingerprint, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            run.id,
            run.channel.as_str(),
            run.trigger,
            run.start_row as i64,
            run.row_count as i64,
            run.accepted_count as i64,
            run.status,
            run.error,
            run.fingerprint,
            run.started_at,
            run.finished_at,
        ],
    )
    .map_err(|e| format!("insert sync run: {e}"))?;
    Ok(())
}

/// Most recent commit attempts for a channel, newest first.
pub fn recent_sync_runs(
    conn: &Connection,
    kind: ChannelKind,
    limit: usize,
) -> Result<Vec<SyncRunRecord>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, trigger_source, start_row, row_count, accepted_count, status, error,
                    fingerprint, started_at, finished_at
             FROM sync_runs
             WHERE channel = ?1
             ORDER BY finished_at DESC, rowid DESC
             LIMIT ?2",
        )
        .map_err(|e| format!("prepare sync runs: {e}"))?;

    let rows = stmt
        .query_map(params![kind.as_str(), limit as i64], |row| {
            Ok(SyncRunRecord {
                id: row.get(0)?,
                channel: kind,
                trigger: row.get(1)?,
                start_row: row.get::<_, i64>(2)?.max(0) as u64,
                row_count: row.get::<_, i64>(3)?.max(0) as u64,
                accepted_count: row.get::<_, i64>(4)?.max(0) as u64,
                status: row.get(5)?,
                error: row.get(6)?,
                fingerprint: row.get(7)?,
                started_at: row.get(8)?,
                finished_at: row.get(9)?,
            })
        })
        .map_err(|e| format!("query sync runs: {e}"))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("read sync runs: {e}"))
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory database with the full schema (test helper).
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("PRAGMA busy_timeout = 5000;")
        .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables_and_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run is a no-op");

        let tables = table_names(&conn);
        for expected in ["local_settings", "channel_configs", "sync_runs", "schema_version"] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_settings_roundtrip_and_overwrite() {
        let db = test_state();
        let conn = db.conn.lock().unwrap();
        assert_eq!(get_setting(&conn, "sheet_sync", "validation_debounce_ms"), None);
        set_setting(&conn, "sheet_sync", "validation_debounce_ms", "500").unwrap();
        set_setting(&conn, "sheet_sync", "validation_debounce_ms", "650").unwrap();
        assert_eq!(
            get_setting(&conn, "sheet_sync", "validation_debounce_ms").as_deref(),
            Some("650")
        );
    }

    #[test]
    fn test_channel_mirror_never_lowers_cursor() {
        let db = test_state();
        let conn = db.conn.lock().unwrap();

        let mut channel = Channel::new(ChannelKind::New);
        channel.file_id = "F1".into();
        channel.sheet_name = "Sheet1".into();
        channel.cursor = 9;
        channel.persisted_id = Some("cfg-1".into());
        channel.mapping.insert(OrderField::FullName, "Name".into());
        upsert_channel(&conn, &channel).unwrap();

        channel.cursor = 4;
        channel.sheet_name = "Sheet2".into();
        upsert_channel(&conn, &channel).unwrap();

        let loaded = load_channel(&conn, ChannelKind::New).unwrap().unwrap();
        assert_eq!(loaded.cursor, 9);
        assert_eq!(loaded.sheet_name, "Sheet2");
        assert_eq!(loaded.mapping.get(&OrderField::FullName).unwrap(), "Name");
        assert!(load_channel(&conn, ChannelKind::Abandoned).unwrap().is_none());

        delete_channel(&conn, ChannelKind::New).unwrap();
        assert!(load_channel(&conn, ChannelKind::New).unwrap().is_none());
    }

    #[test]
    fn test_recent_sync_runs_are_scoped_and_newest_first() {
        let db = test_state();
        let conn = db.conn.lock().unwrap();
        let run = |id: &str, channel: ChannelKind, finished: &str| SyncRunRecord {
            id: id.into(),
            channel,
            trigger: "manual".into(),
            start_row: 2,
            row_count: 3,
            accepted_count: 3,
            status: "committed".into(),
            error: None,
            fingerprint: "abc".into(),
            started_at: finished.into(),
            finished_at: finished.into(),
        };
        insert_sync_run(&conn, &run("a", ChannelKind::New, "2026-01-01T00:00:00Z")).unwrap();
        insert_sync_run(&conn, &run("b", ChannelKind::New, "2026-01-02T00:00:00Z")).unwrap();
        insert_sync_run(&conn, &run("c", ChannelKind::Abandoned, "2026-01-03T00:00:00Z"))
            .unwrap();

        let runs = recent_sync_runs(&conn, ChannelKind::New, 10).unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(recent_sync_runs(&conn, ChannelKind::New, 1).unwrap().len(), 1);
    }
}
