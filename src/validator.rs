//! Spreadsheet file validation with debounce and stale-response discard.
//!
//! Every edit of a channel's file id bumps that channel's request token and
//! cancels the pending debounce timer. Only the task holding the current
//! token may publish a result, so superseded requests are ignored rather
//! than queued. Results are published on a per-channel `watch` channel.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelKind;
use crate::events::{EventBus, SyncEvent};
use crate::headers::HeaderInspector;
use crate::provider::SpreadsheetProvider;
use crate::store::ChannelConfigStore;

/// Default quiet period before a file id is checked remotely.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ValidationState {
    Idle,
    Validating,
    Valid {
        #[serde(rename = "sheetNames")]
        sheet_names: Vec<String>,
    },
    Invalid {
        reason: String,
    },
}

impl ValidationState {
    pub fn is_invalid(&self) -> bool {
        matches!(self, ValidationState::Invalid { .. })
    }

    pub fn sheet_names(&self) -> Option<&[String]> {
        match self {
            ValidationState::Valid { sheet_names } => Some(sheet_names),
            _ => None,
        }
    }
}

struct ValidationSlot {
    token: u64,
    pending: Option<CancellationToken>,
    tx: watch::Sender<ValidationState>,
}

struct Inner {
    provider: Arc<dyn SpreadsheetProvider>,
    store: Arc<ChannelConfigStore>,
    headers: HeaderInspector,
    events: EventBus,
    debounce: Duration,
    slots: HashMap<ChannelKind, Mutex<ValidationSlot>>,
}

#[derive(Clone)]
pub struct SpreadsheetValidator {
    inner: Arc<Inner>,
}

impl SpreadsheetValidator {
    pub fn new(
        provider: Arc<dyn SpreadsheetProvider>,
        store: Arc<ChannelConfigStore>,
        headers: HeaderInspector,
        events: EventBus,
        debounce: Duration,
    ) -> Self {
        let slots = ChannelKind::ALL
            .into_iter()
            .map(|kind| {
                let (tx, _) = watch::channel(ValidationState::Idle);
                (
                    kind,
                    Mutex::new(ValidationSlot {
                        token: 0,
                        pending: None,
                        tx,
                    }),
                )
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                headers,
                events,
                debounce,
                slots,
            }),
        }
    }

    fn slot(&self, kind: ChannelKind) -> MutexGuard<'_, ValidationSlot> {
        self.inner.slots[&kind]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self, kind: ChannelKind) -> ValidationState {
        self.slot(kind).tx.borrow().clone()
    }

    pub fn subscribe(&self, kind: ChannelKind) -> watch::Receiver<ValidationState> {
        self.slot(kind).tx.subscribe()
    }

    fn publish(&self, kind: ChannelKind, slot: &ValidationSlot, state: ValidationState) {
        let changed = slot.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            self.inner.events.emit(SyncEvent::ValidationChanged {
                channel: kind,
                state,
            });
        }
    }

    /// Invalidate whatever is pending and return the new current token.
    fn supersede(&self, slot: &mut ValidationSlot) -> u64 {
        if let Some(pending) = slot.pending.take() {
            pending.cancel();
        }
        slot.token += 1;
        slot.token
    }

    /// Record a file id edit. Empty ids reset to `idle` immediately with no
    /// request; anything else is checked once the debounce window passes
    /// without another edit. Must be called within a tokio runtime.
    pub fn on_file_id_changed(&self, kind: ChannelKind, file_id: &str) {
        let file_id = file_id.trim().to_string();
        self.inner.store.set_file_id(kind, &file_id);

        let mut slot = self.slot(kind);
        let token = self.supersede(&mut slot);
        self.publish(kind, &slot, ValidationState::Idle);

        if file_id.is_empty() {
            drop(slot);
            self.inner.headers.clear(kind);
            return;
        }

        let cancel = CancellationToken::new();
        slot.pending = Some(cancel.clone());
        drop(slot);

        let this = self.clone();
        let debounce = self.inner.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(channel = %kind, "validation superseded during debounce");
                }
                _ = tokio::time::sleep(debounce) => {
                    this.run(kind, file_id, token).await;
                }
            }
        });
    }

    /// Validate the channel's current file id right away (no debounce),
    /// e.g. after configuration is loaded.
    pub async fn validate_now(&self, kind: ChannelKind) -> ValidationState {
        let file_id = self.inner.store.get(kind).file_id;
        let token = {
            let mut slot = self.slot(kind);
            let token = self.supersede(&mut slot);
            if file_id.is_empty() {
                self.publish(kind, &slot, ValidationState::Idle);
                return ValidationState::Idle;
            }
            token
        };
        self.run(kind, file_id, token).await
    }

    /// Cancel anything pending and go back to `idle`.
    pub fn reset(&self, kind: ChannelKind) {
        let mut slot = self.slot(kind);
        self.supersede(&mut slot);
        self.publish(kind, &slot, ValidationState::Idle);
    }

    async fn run(&self, kind: ChannelKind, file_id: String, token: u64) -> ValidationState {
        {
            let slot = self.slot(kind);
            if slot.token != token {
                return slot.tx.borrow().clone();
            }
            self.publish(kind, &slot, ValidationState::Validating);
        }

        let outcome = match self.inner.store.account_id() {
            Ok(account_id) => {
                debug!(channel = %kind, file_id = %file_id, "listing sheets");
                match self.inner.provider.list_sheets(&account_id, &file_id).await {
                    Ok(sheets) if sheets.is_empty() => ValidationState::Invalid {
                        reason: "no sheets found".into(),
                    },
                    Ok(sheets) => ValidationState::Valid {
                        sheet_names: sheets.into_iter().map(|s| s.name).collect(),
                    },
                    Err(e) => ValidationState::Invalid {
                        reason: e.to_string(),
                    },
                }
            }
            Err(e) => ValidationState::Invalid {
                reason: e.to_string(),
            },
        };

        {
            let slot = self.slot(kind);
            if slot.token != token || self.inner.store.get(kind).file_id != file_id {
                debug!(channel = %kind, file_id = %file_id, "discarding stale validation response");
                return outcome;
            }
            self.publish(kind, &slot, outcome.clone());
        }

        match &outcome {
            ValidationState::Valid { sheet_names } => {
                info!(channel = %kind, file_id = %file_id, sheets = sheet_names.len(), "spreadsheet validated");
                if !self.inner.store.get(kind).sheet_name.is_empty() {
                    self.inner.headers.fetch_headers(kind).await;
                }
            }
            ValidationState::Invalid { reason } => {
                warn!(channel = %kind, file_id = %file_id, reason = %reason, "spreadsheet validation failed");
            }
            _ => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderSource;
    use crate::testing::{FakeProvider, ProviderCall};

    fn validator(provider: Arc<FakeProvider>) -> (SpreadsheetValidator, Arc<ChannelConfigStore>) {
        let store = Arc::new(ChannelConfigStore::new(None));
        store.set_account_id(Some("acct-1".into()));
        let events = EventBus::new();
        let headers = HeaderInspector::new(provider.clone(), store.clone(), events.clone());
        let validator =
            SpreadsheetValidator::new(provider, store.clone(), headers, events, DEFAULT_DEBOUNCE);
        (validator, store)
    }

    async fn settled(rx: &mut watch::Receiver<ValidationState>) -> ValidationState {
        rx.wait_for(|s| matches!(s, ValidationState::Valid { .. } | ValidationState::Invalid { .. }))
            .await
            .expect("validator dropped")
            .clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_typing_burst() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_sheet("ABC", "Sheet1", &[&["Name"]]);
        let (validator, _store) = validator(provider.clone());
        let mut rx = validator.subscribe(ChannelKind::New);

        validator.on_file_id_changed(ChannelKind::New, "A");
        tokio::time::sleep(Duration::from_millis(200)).await;
        validator.on_file_id_changed(ChannelKind::New, "AB");
        tokio::time::sleep(Duration::from_millis(200)).await;
        validator.on_file_id_changed(ChannelKind::New, "ABC");

        let state = settled(&mut rx).await;
        assert_eq!(
            state,
            ValidationState::Valid {
                sheet_names: vec!["Sheet1".into()]
            }
        );
        assert_eq!(
            provider.calls(),
            vec![ProviderCall::ListSheets("ABC".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_file_id_resets_without_request() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_sheet("F1", "Sheet1", &[&["Name"]]);
        let (validator, _store) = validator(provider.clone());
        let mut rx = validator.subscribe(ChannelKind::New);

        validator.on_file_id_changed(ChannelKind::New, "F1");
        settled(&mut rx).await;
        validator.on_file_id_changed(ChannelKind::New, "   ");
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;

        assert_eq!(validator.state(ChannelKind::New), ValidationState::Idle);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_sheets_is_invalid() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_empty_file("EMPTY");
        let (validator, store) = validator(provider);
        store.set_file_id(ChannelKind::New, "EMPTY");

        let state = validator.validate_now(ChannelKind::New).await;
        assert_eq!(
            state,
            ValidationState::Invalid {
                reason: "no sheets found".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_file_is_invalid() {
        let provider = Arc::new(FakeProvider::new());
        let (validator, store) = validator(provider);
        store.set_file_id(ChannelKind::Abandoned, "MISSING");

        let state = validator.validate_now(ChannelKind::Abandoned).await;
        assert!(state.is_invalid());
        assert_eq!(validator.state(ChannelKind::New), ValidationState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_response_is_discarded() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_sheet("OLD", "Sheet1", &[&["Name"]]);
        provider.add_sheet("NEW", "Orders", &[&["Name"]]);
        let gate = provider.gate_list_sheets("OLD");
        let (validator, store) = validator(provider.clone());

        store.set_file_id(ChannelKind::New, "OLD");
        let slow = {
            let validator = validator.clone();
            tokio::spawn(async move { validator.validate_now(ChannelKind::New).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(validator.state(ChannelKind::New), ValidationState::Validating);

        let mut rx = validator.subscribe(ChannelKind::New);
        validator.on_file_id_changed(ChannelKind::New, "NEW");
        let state = settled(&mut rx).await;
        assert_eq!(state.sheet_names().unwrap(), ["Orders".to_string()]);

        gate.notify_one();
        let old = slow.await.unwrap();
        assert_eq!(old.sheet_names().unwrap(), ["Sheet1".to_string()]);
        assert_eq!(validator.state(ChannelKind::New), state);
    }

    #[tokio::test]
    async fn test_valid_with_selected_sheet_fetches_headers() {
        let provider = Arc::new(FakeProvider::new());
        provider.add_sheet("F1", "Sheet1", &[&["Name", "Phone"]]);
        let store = Arc::new(ChannelConfigStore::new(None));
        store.set_account_id(Some("acct-1".into()));
        let events = EventBus::new();
        let headers = HeaderInspector::new(provider.clone(), store.clone(), events.clone());
        let validator = SpreadsheetValidator::new(
            provider.clone(),
            store.clone(),
            headers.clone(),
            events,
            DEFAULT_DEBOUNCE,
        );
        store.set_file_id(ChannelKind::New, "F1");
        store.set_sheet_name(ChannelKind::New, "Sheet1");

        validator.validate_now(ChannelKind::New).await;
        let options = headers.options(ChannelKind::New);
        assert_eq!(options.source, HeaderSource::Sheet);
        assert_eq!(options.columns, vec!["Name", "Phone"]);
    }
}
