//! Incremental sync engine for spreadsheet channels.
//!
//! Each channel runs the cycle `idle -> fetching -> staged -> committing ->
//! idle`. `fetch` reads every row from the channel's cursor onward into a
//! staged batch for review; `commit` hands that exact row range to the order
//! backend and advances the cursor by the number of rows the backend
//! accepted. The cursor is the only record of what was ingested, so it
//! never moves on a failed commit and a retry always re-reads the same rows.
//!
//! Fetch and commit are mutually exclusive per channel: a fetch while a
//! commit is outstanding is rejected, never interleaved.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{CommitRequest, OrderBackend};
use crate::channel::{ChannelKind, OrderField};
use crate::db::{self, DbState, SyncRunRecord};
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::provider::SpreadsheetProvider;
use crate::store::ChannelConfigStore;

// ---------------------------------------------------------------------------
// Staged batch
// ---------------------------------------------------------------------------

/// Rows fetched from the cursor onward, waiting for review and commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedBatch {
    pub file_id: String,
    pub sheet_name: String,
    /// Sheet row number of `rows[0]`.
    pub start_row: u64,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub fingerprint: String,
    pub fetched_at: String,
}

impl StagedBatch {
    fn new(
        file_id: String,
        sheet_name: String,
        start_row: u64,
        header: Vec<String>,
        rows: Vec<Vec<String>>,
    ) -> Self {
        let fingerprint = fingerprint(start_row, &header, &rows);
        Self {
            file_id,
            sheet_name,
            start_row,
            header,
            rows,
            fingerprint,
            fetched_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sheet row number of the last staged row.
    pub fn end_row(&self) -> u64 {
        self.start_row + self.rows.len() as u64 - 1
    }

    /// Drop the first `count` rows after a partial commit.
    fn drop_accepted(&mut self, count: usize) {
        let count = count.min(self.rows.len());
        self.rows.drain(..count);
        self.start_row += count as u64;
        self.fingerprint = fingerprint(self.start_row, &self.header, &self.rows);
    }
}

fn fingerprint(start_row: u64, header: &[String], rows: &[Vec<String>]) -> String {
    let mut ctx = md5::Context::new();
    ctx.consume(start_row.to_le_bytes());
    for row in std::iter::once(header).chain(rows.iter().map(Vec::as_slice)) {
        for cell in row {
            ctx.consume(cell.as_bytes());
            ctx.consume([0x1f]);
        }
        ctx.consume([0x1e]);
    }
    format!("{:x}", ctx.compute())
}

fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

/// Resolve a mapped column to a cell index: header name first (exact, then
/// case-insensitive), then a column letter such as `C` or `AA`.
pub fn resolve_column(header: &[String], column: &str) -> Option<usize> {
    let column = column.trim();
    if column.is_empty() {
        return None;
    }
    if let Some(idx) = header.iter().position(|h| h.trim() == column) {
        return Some(idx);
    }
    if let Some(idx) = header
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(column))
    {
        return Some(idx);
    }
    if !column.chars().all(|c| c.is_ascii_alphabetic()) || column.len() > 3 {
        return None;
    }
    let idx = column
        .to_ascii_uppercase()
        .bytes()
        .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize);
    Some(idx - 1)
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Staged,
    Committing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Manual,
    Auto,
}

impl SyncTrigger {
    fn as_str(self) -> &'static str {
        match self {
            SyncTrigger::Manual => "manual",
            SyncTrigger::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FetchOutcome {
    /// File or sheet not selected; nothing was requested.
    NotConfigured,
    NoNewData { cursor: u64 },
    Staged { start_row: u64, rows: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CommitOutcome {
    NothingStaged,
    Committed { accepted: u64, cursor: u64 },
    /// The backend accepted only a prefix; the rest stays staged.
    Partial {
        accepted: u64,
        remaining: usize,
        cursor: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRow {
    pub row_number: u64,
    pub cells: Vec<String>,
    pub mapped: BTreeMap<OrderField, String>,
}

struct ChannelSync {
    phase: SyncPhase,
    batch: Option<StagedBatch>,
    /// A configuration write carrying a cursor snapshot is outstanding.
    config_write: bool,
}

/// Held while a channel configuration update is in flight; commits on the
/// channel are refused until it drops.
pub struct ConfigWriteGuard<'a> {
    engine: &'a SyncCursorEngine,
    kind: ChannelKind,
}

impl Drop for ConfigWriteGuard<'_> {
    fn drop(&mut self) {
        self.engine.slot(self.kind).config_write = false;
    }
}

pub struct SyncCursorEngine {
    store: Arc<ChannelConfigStore>,
    provider: Arc<dyn SpreadsheetProvider>,
    backend: Arc<dyn OrderBackend>,
    db: Option<Arc<DbState>>,
    events: EventBus,
    channels: HashMap<ChannelKind, Mutex<ChannelSync>>,
}

impl SyncCursorEngine {
    pub fn new(
        store: Arc<ChannelConfigStore>,
        provider: Arc<dyn SpreadsheetProvider>,
        backend: Arc<dyn OrderBackend>,
        db: Option<Arc<DbState>>,
        events: EventBus,
    ) -> Self {
        let channels = ChannelKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    Mutex::new(ChannelSync {
                        phase: SyncPhase::Idle,
                        batch: None,
                        config_write: false,
                    }),
                )
            })
            .collect();
        Self {
            store,
            provider,
            backend,
            db,
            events,
            channels,
        }
    }

    fn slot(&self, kind: ChannelKind) -> MutexGuard<'_, ChannelSync> {
        self.channels[&kind]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self, kind: ChannelKind) -> SyncPhase {
        self.slot(kind).phase
    }

    /// Reserve the channel for a configuration write. The remote record
    /// carries `lastRowSynced`, so it must not race a commit that moves the
    /// cursor.
    pub fn begin_config_write(&self, kind: ChannelKind) -> Result<ConfigWriteGuard<'_>, SyncError> {
        let mut slot = self.slot(kind);
        if slot.phase == SyncPhase::Committing {
            return Err(SyncError::CommitInFlight(kind));
        }
        if slot.config_write {
            return Err(SyncError::SaveInFlight(kind));
        }
        slot.config_write = true;
        Ok(ConfigWriteGuard { engine: self, kind })
    }

    pub fn staged(&self, kind: ChannelKind) -> Option<StagedBatch> {
        self.slot(kind).batch.clone()
    }

    /// Staged rows projected through the channel's current mapping.
    pub fn preview(&self, kind: ChannelKind) -> Vec<PreviewRow> {
        let Some(batch) = self.staged(kind) else {
            return Vec::new();
        };
        let mapping = self.store.get(kind).mapping;
        let columns: Vec<(OrderField, Option<usize>)> = mapping
            .iter()
            .map(|(field, column)| (*field, resolve_column(&batch.header, column)))
            .collect();

        batch
            .rows
            .iter()
            .enumerate()
            .map(|(i, cells)| PreviewRow {
                row_number: batch.start_row + i as u64,
                cells: cells.clone(),
                mapped: columns
                    .iter()
                    .map(|(field, idx)| {
                        let value = idx
                            .and_then(|idx| cells.get(idx))
                            .map(|v| v.trim().to_string())
                            .unwrap_or_default();
                        (*field, value)
                    })
                    .collect(),
            })
            .collect()
    }

    /// Throw away the staged batch (`staged -> idle`). Returns whether a
    /// batch existed.
    pub fn discard(&self, kind: ChannelKind) -> Result<bool, SyncError> {
        let mut slot = self.slot(kind);
        match slot.phase {
            SyncPhase::Committing => return Err(SyncError::CommitInFlight(kind)),
            SyncPhase::Fetching => return Err(SyncError::FetchInFlight(kind)),
            _ => {}
        }
        slot.phase = SyncPhase::Idle;
        let had_batch = slot.batch.take().is_some();
        if had_batch {
            self.events.emit(SyncEvent::BatchCleared { channel: kind });
        }
        Ok(had_batch)
    }

    /// Clear everything for a deleted channel.
    pub fn reset(&self, kind: ChannelKind) -> Result<(), SyncError> {
        self.discard(kind).map(|_| ())
    }

    /// Read rows from the cursor onward and stage them, replacing any
    /// previously staged batch.
    pub async fn fetch(&self, kind: ChannelKind) -> Result<FetchOutcome, SyncError> {
        let channel = self.store.get(kind);
        if channel.file_id.is_empty() || channel.sheet_name.is_empty() {
            debug!(channel = %kind, "fetch skipped, channel has no file or sheet");
            return Ok(FetchOutcome::NotConfigured);
        }
        let account_id = self.store.account_id()?;

        {
            let mut slot = self.slot(kind);
            match slot.phase {
                SyncPhase::Committing => return Err(SyncError::CommitInFlight(kind)),
                SyncPhase::Fetching => return Err(SyncError::FetchInFlight(kind)),
                _ => {}
            }
            slot.phase = SyncPhase::Fetching;
            if slot.batch.take().is_some() {
                self.events.emit(SyncEvent::BatchCleared { channel: kind });
            }
        }

        let start_row = channel.cursor;
        debug!(channel = %kind, start_row, sheet = %channel.sheet_name, "fetching rows");
        let result = self
            .provider
            .get_rows(&account_id, &channel.file_id, &channel.sheet_name, start_row)
            .await;

        let current = self.store.get(kind);
        let mut slot = self.slot(kind);
        slot.phase = SyncPhase::Idle;

        let mut rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                warn!(channel = %kind, start_row, error = %e, "row fetch failed");
                return Err(e.into());
            }
        };

        if current.file_id != channel.file_id
            || current.sheet_name != channel.sheet_name
            || current.cursor != start_row
        {
            warn!(channel = %kind, "channel changed while fetching, dropping rows");
            return Err(SyncError::Validation(
                "The channel configuration changed while rows were being read; fetch again".into(),
            ));
        }

        let header = if rows.is_empty() {
            Vec::new()
        } else {
            rows.remove(0)
        };
        while rows.last().is_some_and(|r| is_blank_row(r)) {
            rows.pop();
        }

        if rows.is_empty() {
            info!(channel = %kind, cursor = start_row, "no new rows");
            return Ok(FetchOutcome::NoNewData { cursor: start_row });
        }

        let batch = StagedBatch::new(
            channel.file_id.clone(),
            channel.sheet_name.clone(),
            start_row,
            header,
            rows,
        );
        let count = batch.len();
        info!(channel = %kind, start_row, rows = count, "rows staged for review");
        slot.batch = Some(batch);
        slot.phase = SyncPhase::Staged;
        self.events.emit(SyncEvent::BatchStaged {
            channel: kind,
            start_row,
            rows: count,
        });
        Ok(FetchOutcome::Staged {
            start_row,
            rows: count,
        })
    }

    /// Submit the staged batch and advance the cursor by the rows the
    /// backend accepted.
    pub async fn commit(
        &self,
        kind: ChannelKind,
        trigger: SyncTrigger,
    ) -> Result<CommitOutcome, SyncError> {
        let (batch, persisted_id, account_id) = {
            let mut slot = self.slot(kind);
            match slot.phase {
                SyncPhase::Committing => return Err(SyncError::CommitInFlight(kind)),
                SyncPhase::Fetching => return Err(SyncError::FetchInFlight(kind)),
                _ => {}
            }
            if slot.config_write {
                return Err(SyncError::SaveInFlight(kind));
            }
            let batch = match &slot.batch {
                Some(batch) if !batch.is_empty() => batch.clone(),
                _ => return Ok(CommitOutcome::NothingStaged),
            };

            let channel = self.store.get(kind);
            let persisted_id = channel
                .persisted_id
                .clone()
                .ok_or(SyncError::UnsavedChannel("committing rows"))?;
            let missing = channel.missing_required();
            if !missing.is_empty() {
                return Err(SyncError::MappingIncomplete { missing });
            }
            let account_id = self.store.account_id()?;

            if batch.start_row != channel.cursor
                || batch.file_id != channel.file_id
                || batch.sheet_name != channel.sheet_name
            {
                warn!(
                    channel = %kind,
                    staged_start = batch.start_row,
                    cursor = channel.cursor,
                    "staged rows no longer match the channel, discarding"
                );
                slot.batch = None;
                slot.phase = SyncPhase::Idle;
                self.events.emit(SyncEvent::BatchCleared { channel: kind });
                return Err(SyncError::Validation(
                    "Staged rows no longer match the channel cursor or sheet; fetch again".into(),
                ));
            }

            slot.phase = SyncPhase::Committing;
            (batch, persisted_id, account_id)
        };

        let request = CommitRequest {
            id_config: persisted_id,
            start_row: batch.start_row,
            end_row: batch.end_row(),
            row_count: batch.len() as u64,
            fingerprint: batch.fingerprint.clone(),
        };
        let started_at = Utc::now().to_rfc3339();
        info!(
            channel = %kind,
            start_row = request.start_row,
            rows = request.row_count,
            trigger = trigger.as_str(),
            "committing staged rows"
        );
        let result = self.backend.commit_rows(&account_id, &request).await;

        let failure = match result {
            Err(e) => Some(e.to_string()),
            Ok(resp) if !resp.success => Some(
                resp.message
                    .unwrap_or_else(|| "order backend rejected the batch".into()),
            ),
            Ok(resp) => match resp.accepted {
                Some(accepted) if accepted > request.row_count => Some(format!(
                    "order backend reported {accepted} rows accepted for a batch of {}",
                    request.row_count
                )),
                accepted => {
                    let accepted = accepted.unwrap_or(request.row_count);
                    return Ok(self.apply_commit(kind, trigger, &request, accepted, started_at));
                }
            },
        };

        let error = failure.unwrap_or_default();
        {
            let mut slot = self.slot(kind);
            slot.phase = SyncPhase::Staged;
        }
        warn!(channel = %kind, start_row = request.start_row, error = %error, "commit failed, cursor unchanged");
        self.record_run(kind, trigger, &request, 0, "failed", Some(&error), started_at);
        self.events.emit(SyncEvent::CommitFailed {
            channel: kind,
            error: error.clone(),
        });
        Err(SyncError::CommitFailed(error))
    }

    fn apply_commit(
        &self,
        kind: ChannelKind,
        trigger: SyncTrigger,
        request: &CommitRequest,
        accepted: u64,
        started_at: String,
    ) -> CommitOutcome {
        let cursor = self.store.advance_cursor(kind, accepted);
        let mut slot = self.slot(kind);

        let outcome = if accepted == request.row_count {
            slot.batch = None;
            slot.phase = SyncPhase::Idle;
            CommitOutcome::Committed { accepted, cursor }
        } else {
            let remaining = match slot.batch.as_mut() {
                Some(batch) => {
                    batch.drop_accepted(accepted as usize);
                    batch.len()
                }
                None => 0,
            };
            slot.phase = if remaining > 0 {
                SyncPhase::Staged
            } else {
                SyncPhase::Idle
            };
            CommitOutcome::Partial {
                accepted,
                remaining,
                cursor,
            }
        };
        drop(slot);

        let status = match outcome {
            CommitOutcome::Committed { .. } => "committed",
            _ => "partial",
        };
        info!(channel = %kind, accepted, cursor, status, "commit applied");
        self.record_run(kind, trigger, request, accepted, status, None, started_at);
        self.events.emit(SyncEvent::Committed {
            channel: kind,
            accepted,
            cursor,
        });
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn record_run(
        &self,
        kind: ChannelKind,
        trigger: SyncTrigger,
        request: &CommitRequest,
        accepted: u64,
        status: &str,
        error: Option<&str>,
        started_at: String,
    ) {
        let Some(db) = &self.db else {
            return;
        };
        let run = SyncRunRecord {
            id: Uuid::new_v4().to_string(),
            channel: kind,
            trigger: trigger.as_str().to_string(),
            start_row: request.start_row,
            row_count: request.row_count,
            accepted_count: accepted,
            status: status.to_string(),
            error: error.map(|e| e.to_string()),
            fingerprint: request.fingerprint.clone(),
            started_at,
            finished_at: Utc::now().to_rfc3339(),
        };
        let result = db
            .conn
            .lock()
            .map_err(|e| e.to_string())
            .and_then(|conn| db::insert_sync_run(&conn, &run));
        if let Err(e) = result {
            warn!(channel = %kind, error = %e, "failed to record sync run");
        }
    }

    pub fn recent_runs(
        &self,
        kind: ChannelKind,
        limit: usize,
    ) -> Result<Vec<SyncRunRecord>, SyncError> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let conn = db.conn.lock().map_err(|e| SyncError::Storage(e.to_string()))?;
        db::recent_sync_runs(&conn, kind, limit).map_err(SyncError::Storage)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
