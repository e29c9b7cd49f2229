//! Per-channel configuration store.
//!
//! Holds one [`Channel`] per [`ChannelKind`] behind a single mutex. Readers
//! get cloned snapshots; writers go through narrow methods so the cursor
//! can only move forward. When a database is attached every mutation that
//! matters across restarts is mirrored to `channel_configs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::backend::OrderBackend;
use crate::channel::{Channel, ChannelKind, OrderField};
use crate::db::{self, DbState};
use crate::error::SyncError;

pub struct ChannelConfigStore {
    channels: Mutex<HashMap<ChannelKind, Channel>>,
    account_id: RwLock<Option<String>>,
    db: Option<Arc<DbState>>,
}

impl ChannelConfigStore {
    pub fn new(db: Option<Arc<DbState>>) -> Self {
        let channels = ChannelKind::ALL
            .into_iter()
            .map(|kind| (kind, Channel::new(kind)))
            .collect();
        Self {
            channels: Mutex::new(channels),
            account_id: RwLock::new(None),
            db,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelKind, Channel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- Account -------------------------------------------------------------

    pub fn set_account_id(&self, account_id: Option<String>) {
        let normalized = account_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        *self.account_id.write().unwrap_or_else(|e| e.into_inner()) = normalized;
    }

    /// The linked spreadsheet account, required by every remote call.
    pub fn account_id(&self) -> Result<String, SyncError> {
        self.account_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SyncError::NotConfigured)
    }

    // -- Reads ---------------------------------------------------------------

    pub fn get(&self, kind: ChannelKind) -> Channel {
        self.lock()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Channel::new(kind))
    }

    // -- Writes --------------------------------------------------------------

    fn with_channel<R>(&self, kind: ChannelKind, f: impl FnOnce(&mut Channel) -> R) -> R {
        let mut guard = self.lock();
        let channel = guard.entry(kind).or_insert_with(|| Channel::new(kind));
        f(channel)
    }

    /// Returns `true` when the value actually changed.
    pub fn set_file_id(&self, kind: ChannelKind, file_id: &str) -> bool {
        let file_id = file_id.trim();
        self.with_channel(kind, |c| {
            if c.file_id == file_id {
                return false;
            }
            c.file_id = file_id.to_string();
            true
        })
    }

    pub fn set_sheet_name(&self, kind: ChannelKind, sheet_name: &str) -> bool {
        let sheet_name = sheet_name.trim();
        self.with_channel(kind, |c| {
            if c.sheet_name == sheet_name {
                return false;
            }
            c.sheet_name = sheet_name.to_string();
            true
        })
    }

    /// Map `field` to `column`; an empty column removes the entry. The
    /// cursor is left alone.
    pub fn set_mapping(&self, kind: ChannelKind, field: OrderField, column: &str) {
        let column = column.trim();
        self.with_channel(kind, |c| {
            if column.is_empty() {
                c.mapping.remove(&field);
            } else {
                c.mapping.insert(field, column.to_string());
            }
        });
    }

    pub fn mark_saved(&self, kind: ChannelKind, persisted_id: &str) -> Channel {
        let channel = self.with_channel(kind, |c| {
            c.persisted_id = Some(persisted_id.to_string());
            c.clone()
        });
        self.mirror(&channel);
        channel
    }

    pub fn set_auto_sync(&self, kind: ChannelKind, enabled: bool) -> Channel {
        let channel = self.with_channel(kind, |c| {
            c.auto_sync_enabled = enabled;
            c.clone()
        });
        self.mirror(&channel);
        channel
    }

    /// Move the cursor forward by exactly `rows`. Returns the new cursor.
    pub fn advance_cursor(&self, kind: ChannelKind, rows: u64) -> u64 {
        let channel = self.with_channel(kind, |c| {
            c.cursor = c.cursor.saturating_add(rows);
            c.clone()
        });
        if rows > 0 {
            self.mirror(&channel);
        }
        channel.cursor
    }

    /// Back to defaults (used after the remote record is deleted).
    pub fn reset(&self, kind: ChannelKind) {
        self.with_channel(kind, |c| *c = Channel::new(kind));
        if let Some(db) = &self.db {
            match db.conn.lock() {
                Ok(conn) => {
                    if let Err(e) = db::delete_channel(&conn, kind) {
                        warn!(channel = %kind, error = %e, "failed to drop channel mirror");
                    }
                }
                Err(e) => warn!(error = %e, "channel mirror lock poisoned"),
            }
        }
    }

    // -- Persistence ---------------------------------------------------------

    fn mirror(&self, channel: &Channel) {
        let Some(db) = &self.db else {
            return;
        };
        let result = db
            .conn
            .lock()
            .map_err(|e| e.to_string())
            .and_then(|conn| db::upsert_channel(&conn, channel));
        if let Err(e) = result {
            warn!(channel = %channel.kind, error = %e, "failed to mirror channel config");
        }
    }

    /// Populate both channels from the local mirror, then from the backend.
    /// The effective cursor is the furthest of the remote and mirrored ones.
    pub async fn load(&self, backend: &dyn OrderBackend) -> Result<(), SyncError> {
        if let Some(db) = &self.db {
            let conn = db.conn.lock().map_err(|e| SyncError::Storage(e.to_string()))?;
            for kind in ChannelKind::ALL {
                if let Some(mirrored) =
                    db::load_channel(&conn, kind).map_err(SyncError::Storage)?
                {
                    debug!(channel = %kind, cursor = mirrored.cursor, "restored channel mirror");
                    self.with_channel(kind, |c| *c = mirrored);
                }
            }
        }

        let account_id = self.account_id()?;
        let records = backend.list_channel_configs(&account_id).await?;

        for kind in ChannelKind::ALL {
            let record = records.iter().find(|r| r.content.type_order == kind);
            let channel = self.with_channel(kind, |c| {
                match record {
                    Some(record) => c.apply_remote(record),
                    None if c.persisted_id.is_some() => {
                        // Remote record is gone; keep local edits but drop the link.
                        c.persisted_id = None;
                        c.auto_sync_enabled = false;
                    }
                    None => {}
                }
                c.clone()
            });
            self.mirror(&channel);
            info!(
                channel = %kind,
                saved = channel.is_saved(),
                cursor = channel.cursor,
                "channel configuration loaded"
            );
        }
        Ok(())
    }
}
