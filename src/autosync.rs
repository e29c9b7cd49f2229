//! Auto-sync: the persisted per-channel flag and the periodic tick.
//!
//! The flag lives on the remote channel record. Whoever drives the period
//! (the backend scheduler, or [`AutoSyncScheduler::start_loop`] when the
//! host runs it locally) calls [`AutoSyncScheduler::tick`], which reuses the
//! engine's fetch and commit so manual and automatic runs share one cursor.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::OrderBackend;
use crate::channel::ChannelKind;
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::store::ChannelConfigStore;
use crate::sync::{CommitOutcome, FetchOutcome, SyncCursorEngine, SyncPhase, SyncTrigger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleOutcome {
    pub success: bool,
    pub new_state: bool,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TickReport {
    Disabled,
    /// A manual fetch or commit is outstanding; this tick is dropped.
    Busy,
    NotConfigured,
    NoNewData { cursor: u64 },
    Committed { outcome: CommitOutcome },
}

pub struct AutoSyncScheduler {
    store: Arc<ChannelConfigStore>,
    engine: Arc<SyncCursorEngine>,
    backend: Arc<dyn OrderBackend>,
    events: EventBus,
    pub is_running: Arc<AtomicBool>,
    pub last_tick: Arc<Mutex<Option<String>>>,
}

impl AutoSyncScheduler {
    pub fn new(
        store: Arc<ChannelConfigStore>,
        engine: Arc<SyncCursorEngine>,
        backend: Arc<dyn OrderBackend>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            engine,
            backend,
            events,
            is_running: Arc::new(AtomicBool::new(false)),
            last_tick: Arc::new(Mutex::new(None)),
        }
    }

    /// Flip the channel's auto-sync flag and persist it with the full
    /// channel snapshot. Local state changes only after the backend
    /// acknowledges the update.
    pub async fn toggle(&self, kind: ChannelKind) -> Result<ToggleOutcome, SyncError> {
        let _write = self.engine.begin_config_write(kind)?;
        let channel = self.store.get(kind);
        let persisted_id = channel
            .persisted_id
            .clone()
            .ok_or(SyncError::UnsavedChannel("enabling auto-sync"))?;
        let account_id = self.store.account_id()?;

        let new_state = !channel.auto_sync_enabled;
        let mut content = channel.to_content();
        content.auto_sync = new_state;

        if let Err(e) = self
            .backend
            .update_channel_config(&account_id, &persisted_id, &content)
            .await
        {
            warn!(channel = %kind, error = %e, "auto-sync toggle failed");
            return Err(e.into());
        }

        self.store.set_auto_sync(kind, new_state);
        info!(channel = %kind, enabled = new_state, "auto-sync toggled");
        self.events.emit(SyncEvent::AutoSyncChanged {
            channel: kind,
            enabled: new_state,
        });
        Ok(ToggleOutcome {
            success: true,
            new_state,
        })
    }

    /// Run one fetch-then-commit cycle for the channel if auto-sync is on.
    /// A staged batch left from a manual fetch is replaced by the fresh
    /// fetch, so the committed rows always start at the current cursor.
    pub async fn tick(&self, kind: ChannelKind) -> Result<TickReport, SyncError> {
        let channel = self.store.get(kind);
        if !channel.auto_sync_enabled || !channel.is_saved() {
            return Ok(TickReport::Disabled);
        }
        if matches!(
            self.engine.phase(kind),
            SyncPhase::Fetching | SyncPhase::Committing
        ) {
            debug!(channel = %kind, "auto-sync tick skipped, engine busy");
            return Ok(TickReport::Busy);
        }

        let fetched = match self.engine.fetch(kind).await {
            Ok(outcome) => outcome,
            Err(
                SyncError::CommitInFlight(_)
                | SyncError::FetchInFlight(_)
                | SyncError::SaveInFlight(_),
            ) => return Ok(TickReport::Busy),
            Err(e) => return Err(e),
        };

        match fetched {
            FetchOutcome::NotConfigured => Ok(TickReport::NotConfigured),
            FetchOutcome::NoNewData { cursor } => Ok(TickReport::NoNewData { cursor }),
            FetchOutcome::Staged { .. } => {
                match self.engine.commit(kind, SyncTrigger::Auto).await {
                    Ok(outcome) => Ok(TickReport::Committed { outcome }),
                    Err(
                        SyncError::CommitInFlight(_)
                        | SyncError::FetchInFlight(_)
                        | SyncError::SaveInFlight(_),
                    ) => Ok(TickReport::Busy),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Tick every channel once.
    pub async fn tick_all(&self) -> Vec<(ChannelKind, Result<TickReport, SyncError>)> {
        let mut reports = Vec::with_capacity(ChannelKind::ALL.len());
        for kind in ChannelKind::ALL {
            reports.push((kind, self.tick(kind).await));
        }
        if let Ok(mut guard) = self.last_tick.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
        reports
    }

    /// Drive [`tick_all`](Self::tick_all) every `interval` until
    /// [`stop`](Self::stop) is called. For hosts without a server-side
    /// scheduler.
    pub fn start_loop(self: &Arc<Self>, interval: Duration) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("auto-sync loop already running");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "auto-sync loop started");
            loop {
                tokio::time::sleep(interval).await;
                if !this.is_running.load(Ordering::SeqCst) {
                    break;
                }
                for (kind, report) in this.tick_all().await {
                    match report {
                        Ok(TickReport::Committed { outcome }) => {
                            info!(channel = %kind, ?outcome, "auto-sync committed rows")
                        }
                        Ok(report) => debug!(channel = %kind, ?report, "auto-sync tick"),
                        Err(e) => warn!(channel = %kind, error = %e, "auto-sync tick failed"),
                    }
                }
            }
            info!("auto-sync loop stopped");
        });
    }

    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::OrderField;
    use crate::db;
    use crate::testing::{BackendCall, FakeBackend, FakeProvider};

    struct Fixture {
        store: Arc<ChannelConfigStore>,
        provider: Arc<FakeProvider>,
        backend: Arc<FakeBackend>,
        engine: Arc<SyncCursorEngine>,
        scheduler: Arc<AutoSyncScheduler>,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(FakeProvider::new());
        provider.add_sheet(
            "SHEET123",
            "Sheet1",
            &[&["Name", "Phone"], &["Ana", "555-0101"], &["Bo", "555-0102"]],
        );
        let backend = Arc::new(FakeBackend::new());
        let store = Arc::new(ChannelConfigStore::new(None));
        store.set_account_id(Some("acct-1".into()));
        store.set_file_id(ChannelKind::New, "SHEET123");
        store.set_sheet_name(ChannelKind::New, "Sheet1");
        for (field, column) in [
            (OrderField::FullName, "Name"),
            (OrderField::Phone, "Phone"),
            (OrderField::ProductName, "A"),
            (OrderField::ProductSku, "A"),
        ] {
            store.set_mapping(ChannelKind::New, field, column);
        }
        let events = EventBus::new();
        let engine = Arc::new(SyncCursorEngine::new(
            store.clone(),
            provider.clone(),
            backend.clone(),
            Some(Arc::new(db::test_state())),
            events.clone(),
        ));
        let scheduler = Arc::new(AutoSyncScheduler::new(
            store.clone(),
            engine.clone(),
            backend.clone(),
            events,
        ));
        Fixture {
            store,
            provider,
            backend,
            engine,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_toggle_requires_saved_channel() {
        let f = fixture();
        assert_eq!(
            f.scheduler.toggle(ChannelKind::New).await,
            Err(SyncError::UnsavedChannel("enabling auto-sync"))
        );
        assert!(f.backend.calls().is_empty());
        assert!(!f.store.get(ChannelKind::New).auto_sync_enabled);
    }

    #[tokio::test]
    async fn test_toggle_sends_full_snapshot() {
        let f = fixture();
        f.store.mark_saved(ChannelKind::New, "cfg-1");
        f.store.advance_cursor(ChannelKind::New, 2);

        let outcome = f.scheduler.toggle(ChannelKind::New).await.unwrap();
        assert_eq!(
            outcome,
            ToggleOutcome {
                success: true,
                new_state: true
            }
        );
        match f.backend.calls().last().unwrap() {
            BackendCall::Update { id, content } => {
                assert_eq!(id, "cfg-1");
                assert!(content.auto_sync);
                assert_eq!(content.last_row_synced, 3);
                assert_eq!(content.name_sheet, "Sheet1");
            }
            other => panic!("unexpected call {other:?}"),
        }

        let outcome = f.scheduler.toggle(ChannelKind::New).await.unwrap();
        assert!(!outcome.new_state);
    }

    #[tokio::test]
    async fn test_failed_toggle_keeps_flag() {
        let f = fixture();
        f.store.mark_saved(ChannelKind::New, "cfg-1");
        f.backend.fail_next_save("backend down");
        assert!(f.scheduler.toggle(ChannelKind::New).await.is_err());
        assert!(!f.store.get(ChannelKind::New).auto_sync_enabled);
    }

    #[tokio::test]
    async fn test_tick_disabled_is_noop() {
        let f = fixture();
        f.store.mark_saved(ChannelKind::New, "cfg-1");
        assert_eq!(
            f.scheduler.tick(ChannelKind::New).await.unwrap(),
            TickReport::Disabled
        );
        assert!(f.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tick_and_manual_share_cursor() {
        let f = fixture();
        f.store.mark_saved(ChannelKind::New, "cfg-1");
        f.store.set_auto_sync(ChannelKind::New, true);

        let report = f.scheduler.tick(ChannelKind::New).await.unwrap();
        assert_eq!(
            report,
            TickReport::Committed {
                outcome: CommitOutcome::Committed {
                    accepted: 2,
                    cursor: 4
                }
            }
        );

        f.provider
            .append_rows("SHEET123", "Sheet1", &[&["Cy", "555-0103"]]);
        f.engine.fetch(ChannelKind::New).await.unwrap();
        let manual = f
            .engine
            .commit(ChannelKind::New, SyncTrigger::Manual)
            .await
            .unwrap();
        assert_eq!(
            manual,
            CommitOutcome::Committed {
                accepted: 1,
                cursor: 5
            }
        );

        assert_eq!(
            f.scheduler.tick(ChannelKind::New).await.unwrap(),
            TickReport::NoNewData { cursor: 5 }
        );

        let runs = f.engine.recent_runs(ChannelKind::New, 10).unwrap();
        let triggers: Vec<_> = runs.iter().map(|r| r.trigger.as_str()).collect();
        assert_eq!(triggers, vec!["manual", "auto"]);
    }

    #[tokio::test]
    async fn test_tick_skipped_while_commit_in_flight() {
        let f = fixture();
        f.store.mark_saved(ChannelKind::New, "cfg-1");
        f.store.set_auto_sync(ChannelKind::New, true);
        f.engine.fetch(ChannelKind::New).await.unwrap();
        let gate = f.backend.gate_commits();

        let pending = {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.commit(ChannelKind::New, SyncTrigger::Manual).await })
        };
        while f.engine.phase(ChannelKind::New) != SyncPhase::Committing {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            f.scheduler.tick(ChannelKind::New).await.unwrap(),
            TickReport::Busy
        );
        gate.notify_one();
        pending.await.unwrap().unwrap();
        assert_eq!(f.store.get(ChannelKind::New).cursor, 4);
    }

    #[tokio::test]
    async fn test_toggle_refused_while_commit_in_flight() {
        let f = fixture();
        f.store.mark_saved(ChannelKind::New, "cfg-1");
        f.engine.fetch(ChannelKind::New).await.unwrap();
        let gate = f.backend.gate_commits();

        let pending = {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.commit(ChannelKind::New, SyncTrigger::Manual).await })
        };
        while f.engine.phase(ChannelKind::New) != SyncPhase::Committing {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            f.scheduler.toggle(ChannelKind::New).await,
            Err(SyncError::CommitInFlight(ChannelKind::New))
        );
        gate.notify_one();
        pending.await.unwrap().unwrap();
        assert!(!f
            .backend
            .calls()
            .iter()
            .any(|call| matches!(call, BackendCall::Update { .. })));

        f.scheduler.toggle(ChannelKind::New).await.unwrap();
        match f.backend.calls().last().unwrap() {
            BackendCall::Update { content, .. } => assert_eq!(content.last_row_synced, 3),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tick_all_records_last_tick() {
        let f = fixture();
        let reports = f.scheduler.tick_all().await;
        assert_eq!(reports.len(), 2);
        assert!(f.scheduler.last_tick.lock().unwrap().is_some());
    }
}
