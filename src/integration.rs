//! The spreadsheet integration as one unit: every per-channel operation
//! the settings screen needs, wired to a shared store and event bus.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::autosync::{AutoSyncScheduler, TickReport, ToggleOutcome};
use crate::backend::OrderBackend;
use crate::channel::{Channel, ChannelKind, OrderField};
use crate::db::{DbState, SyncRunRecord};
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::headers::{HeaderInspector, HeaderOptions};
use crate::mapping::{MappingEditor, SaveOutcome};
use crate::provider::SpreadsheetProvider;
use crate::store::ChannelConfigStore;
use crate::sync::{
    CommitOutcome, FetchOutcome, PreviewRow, StagedBatch, SyncCursorEngine, SyncPhase, SyncTrigger,
};
use crate::validator::{SpreadsheetValidator, ValidationState};

/// Read-only projection of one channel for the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub channel: Channel,
    pub required_missing: Vec<String>,
    pub validation: ValidationState,
    pub headers: HeaderOptions,
    pub phase: SyncPhase,
    pub staged: Option<StagedBatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    /// Whether a remote record was deleted (unsaved channels only reset).
    pub remote: bool,
}

pub struct SheetSync {
    store: Arc<ChannelConfigStore>,
    headers: HeaderInspector,
    validator: SpreadsheetValidator,
    editor: MappingEditor,
    engine: Arc<SyncCursorEngine>,
    scheduler: Arc<AutoSyncScheduler>,
    backend: Arc<dyn OrderBackend>,
    events: EventBus,
}

impl SheetSync {
    pub fn new(
        provider: Arc<dyn SpreadsheetProvider>,
        backend: Arc<dyn OrderBackend>,
        db: Option<Arc<DbState>>,
        debounce: Duration,
    ) -> Self {
        let events = EventBus::new();
        let store = Arc::new(ChannelConfigStore::new(db.clone()));
        let headers = HeaderInspector::new(provider.clone(), store.clone(), events.clone());
        let validator = SpreadsheetValidator::new(
            provider.clone(),
            store.clone(),
            headers.clone(),
            events.clone(),
            debounce,
        );
        let editor = MappingEditor::new(
            store.clone(),
            validator.clone(),
            backend.clone(),
            events.clone(),
        );
        let engine = Arc::new(SyncCursorEngine::new(
            store.clone(),
            provider,
            backend.clone(),
            db,
            events.clone(),
        ));
        let scheduler = Arc::new(AutoSyncScheduler::new(
            store.clone(),
            engine.clone(),
            backend.clone(),
            events.clone(),
        ));
        Self {
            store,
            headers,
            validator,
            editor,
            engine,
            scheduler,
            backend,
            events,
        }
    }

    pub fn store(&self) -> &Arc<ChannelConfigStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<AutoSyncScheduler> {
        &self.scheduler
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_validation(
        &self,
        kind: ChannelKind,
    ) -> tokio::sync::watch::Receiver<ValidationState> {
        self.validator.subscribe(kind)
    }

    pub fn set_account_id(&self, account_id: Option<String>) {
        self.store.set_account_id(account_id);
    }

    /// Load both channels from the backend, then validate any stored file
    /// id right away so sheets and headers are ready without an edit.
    pub async fn load(&self) -> Result<(), SyncError> {
        self.store.load(self.backend.as_ref()).await?;
        for kind in ChannelKind::ALL {
            self.validator.validate_now(kind).await;
        }
        Ok(())
    }

    pub fn snapshot(&self, kind: ChannelKind) -> ChannelSnapshot {
        let channel = self.store.get(kind);
        ChannelSnapshot {
            required_missing: channel.missing_required(),
            channel,
            validation: self.validator.state(kind),
            headers: self.headers.options(kind),
            phase: self.engine.phase(kind),
            staged: self.engine.staged(kind),
        }
    }

    fn ensure_not_committing(&self, kind: ChannelKind) -> Result<(), SyncError> {
        match self.engine.phase(kind) {
            SyncPhase::Committing => Err(SyncError::CommitInFlight(kind)),
            SyncPhase::Fetching => Err(SyncError::FetchInFlight(kind)),
            _ => Ok(()),
        }
    }

    /// File id edit from the UI. Drops staged rows and header options that
    /// belonged to the previous file; validation runs after the debounce.
    pub fn set_file_id(&self, kind: ChannelKind, file_id: &str) -> Result<(), SyncError> {
        self.ensure_not_committing(kind)?;
        if self.store.get(kind).file_id != file_id.trim() {
            self.engine.discard(kind)?;
            self.headers.clear(kind);
        }
        self.validator.on_file_id_changed(kind, file_id);
        Ok(())
    }

    /// Pick the sheet to map and sync. An empty name clears the selection.
    pub async fn select_sheet(
        &self,
        kind: ChannelKind,
        sheet_name: &str,
    ) -> Result<HeaderOptions, SyncError> {
        self.ensure_not_committing(kind)?;
        let sheet_name = sheet_name.trim();
        let validation = self.validator.state(kind);

        if !sheet_name.is_empty() {
            if let Some(sheets) = validation.sheet_names() {
                if !sheets.iter().any(|s| s == sheet_name) {
                    return Err(SyncError::Validation(format!(
                        "sheet not found: {sheet_name}"
                    )));
                }
            }
        }

        if self.store.set_sheet_name(kind, sheet_name) {
            self.engine.discard(kind)?;
            info!(channel = %kind, sheet = %sheet_name, "sheet selected");
        }

        if sheet_name.is_empty() {
            self.headers.clear(kind);
        } else if validation.sheet_names().is_some() {
            self.headers.fetch_headers(kind).await;
        }
        Ok(self.headers.options(kind))
    }

    pub fn set_mapping(&self, kind: ChannelKind, field: OrderField, column: &str) {
        self.editor.set_mapping(kind, field, column);
    }

    /// Persist the channel. Refused while a commit is moving the cursor,
    /// since the saved record carries `lastRowSynced`.
    pub async fn save(&self, kind: ChannelKind) -> Result<SaveOutcome, SyncError> {
        let _write = self.engine.begin_config_write(kind)?;
        self.editor.save(kind).await
    }

    pub async fn fetch(&self, kind: ChannelKind) -> Result<FetchOutcome, SyncError> {
        self.engine.fetch(kind).await
    }

    pub async fn commit(&self, kind: ChannelKind) -> Result<CommitOutcome, SyncError> {
        self.engine.commit(kind, SyncTrigger::Manual).await
    }

    pub fn preview(&self, kind: ChannelKind) -> Vec<PreviewRow> {
        self.engine.preview(kind)
    }

    pub fn discard(&self, kind: ChannelKind) -> Result<bool, SyncError> {
        self.engine.discard(kind)
    }

    pub async fn toggle_auto_sync(&self, kind: ChannelKind) -> Result<ToggleOutcome, SyncError> {
        self.scheduler.toggle(kind).await
    }

    pub async fn tick(&self, kind: ChannelKind) -> Result<TickReport, SyncError> {
        self.scheduler.tick(kind).await
    }

    pub fn recent_runs(
        &self,
        kind: ChannelKind,
        limit: usize,
    ) -> Result<Vec<SyncRunRecord>, SyncError> {
        self.engine.recent_runs(kind, limit)
    }

    /// Remove the channel's remote record (if any) and return it to defaults.
    pub async fn delete(&self, kind: ChannelKind) -> Result<DeleteOutcome, SyncError> {
        self.ensure_not_committing(kind)?;
        let channel = self.store.get(kind);

        let remote = match channel.persisted_id.as_deref() {
            Some(id) => {
                let account_id = self.store.account_id()?;
                if let Err(e) = self.backend.delete_channel_config(&account_id, id).await {
                    warn!(channel = %kind, error = %e, "deleting channel configuration failed");
                    return Err(e.into());
                }
                true
            }
            None => false,
        };

        self.engine.reset(kind)?;
        self.validator.reset(kind);
        self.headers.clear(kind);
        self.store.reset(kind);
        info!(channel = %kind, remote, "channel configuration deleted");
        self.events.emit(SyncEvent::ChannelDeleted { channel: kind });
        Ok(DeleteOutcome { remote })
    }
}
