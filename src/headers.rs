//! Header inspection: the selectable mapping targets for a channel.
//!
//! A failed or empty header fetch falls back to spreadsheet letters A-Z so
//! the mapping editor is never blocked by a transient provider error.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::channel::ChannelKind;
use crate::events::{EventBus, SyncEvent};
use crate::provider::SpreadsheetProvider;
use crate::store::ChannelConfigStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderSource {
    Sheet,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderOptions {
    pub columns: Vec<String>,
    pub source: HeaderSource,
}

impl HeaderOptions {
    pub fn fallback() -> Self {
        Self {
            columns: fallback_columns(),
            source: HeaderSource::Fallback,
        }
    }
}

/// Column letters `A` through `Z`.
pub fn fallback_columns() -> Vec<String> {
    (b'A'..=b'Z').map(|c| (c as char).to_string()).collect()
}

/// Trim, skip blanks, keep the first occurrence of each name.
fn clean_header(cells: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    cells
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

struct HeaderSlot {
    token: u64,
    options: HeaderOptions,
}

struct Inner {
    provider: Arc<dyn SpreadsheetProvider>,
    store: Arc<ChannelConfigStore>,
    events: EventBus,
    slots: HashMap<ChannelKind, Mutex<HeaderSlot>>,
}

#[derive(Clone)]
pub struct HeaderInspector {
    inner: Arc<Inner>,
}

impl HeaderInspector {
    pub fn new(
        provider: Arc<dyn SpreadsheetProvider>,
        store: Arc<ChannelConfigStore>,
        events: EventBus,
    ) -> Self {
        let slots = ChannelKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    Mutex::new(HeaderSlot {
                        token: 0,
                        options: HeaderOptions::fallback(),
                    }),
                )
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                events,
                slots,
            }),
        }
    }

    fn slot(&self, kind: ChannelKind) -> MutexGuard<'_, HeaderSlot> {
        self.inner.slots[&kind]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self, kind: ChannelKind) -> HeaderOptions {
        self.slot(kind).options.clone()
    }

    /// Drop any fetched header and invalidate in-flight fetches.
    pub fn clear(&self, kind: ChannelKind) {
        let mut slot = self.slot(kind);
        slot.token += 1;
        self.publish(kind, &mut slot, HeaderOptions::fallback());
    }

    fn publish(&self, kind: ChannelKind, slot: &mut HeaderSlot, options: HeaderOptions) {
        if slot.options == options {
            return;
        }
        slot.options = options;
        self.inner.events.emit(SyncEvent::HeadersChanged {
            channel: kind,
            columns: slot.options.columns.clone(),
            fallback: slot.options.source == HeaderSource::Fallback,
        });
    }

    /// Fetch the header row of the channel's selected sheet and make it the
    /// channel's mapping targets. Returns the resulting column list.
    pub async fn fetch_headers(&self, kind: ChannelKind) -> Vec<String> {
        let channel = self.inner.store.get(kind);
        let token = {
            let mut slot = self.slot(kind);
            slot.token += 1;
            if channel.file_id.is_empty() || channel.sheet_name.is_empty() {
                self.publish(kind, &mut slot, HeaderOptions::fallback());
                return slot.options.columns.clone();
            }
            slot.token
        };

        let fetched = match self.inner.store.account_id() {
            Ok(account_id) => {
                debug!(channel = %kind, sheet = %channel.sheet_name, "fetching header row");
                self.inner
                    .provider
                    .get_header_row(&account_id, &channel.file_id, &channel.sheet_name)
                    .await
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };

        let options = match fetched.map(clean_header) {
            Ok(columns) if !columns.is_empty() => HeaderOptions {
                columns,
                source: HeaderSource::Sheet,
            },
            Ok(_) => {
                warn!(channel = %kind, "header row is empty, using column letters");
                HeaderOptions::fallback()
            }
            Err(error) => {
                warn!(channel = %kind, error = %error, "header fetch failed, using column letters");
                HeaderOptions::fallback()
            }
        };

        let current = self.inner.store.get(kind);
        let mut slot = self.slot(kind);
        if slot.token != token
            || current.file_id != channel.file_id
            || current.sheet_name != channel.sheet_name
        {
            debug!(channel = %kind, "discarding stale header response");
            return options.columns;
        }
        self.publish(kind, &mut slot, options);
        slot.options.columns.clone()
    }
}
