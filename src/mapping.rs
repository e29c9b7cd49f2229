//! Mapping editor: field-to-column assignment and gated save.

use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::OrderBackend;
use crate::channel::{Channel, ChannelKind, OrderField};
use crate::error::SyncError;
use crate::events::{EventBus, SyncEvent};
use crate::store::ChannelConfigStore;
use crate::validator::{SpreadsheetValidator, ValidationState};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub persisted_id: String,
    pub created: bool,
}

/// Local preconditions for persisting a channel. The first unmet one is
/// reported.
pub fn check_saveable(channel: &Channel, validation: &ValidationState) -> Result<(), SyncError> {
    if channel.file_id.trim().is_empty() {
        return Err(SyncError::MissingFileId);
    }
    if let ValidationState::Invalid { reason } = validation {
        return Err(SyncError::InvalidFile(reason.clone()));
    }
    if channel.sheet_name.trim().is_empty() {
        return Err(SyncError::MissingSheetName);
    }
    let missing = channel.missing_required();
    if !missing.is_empty() {
        return Err(SyncError::MappingIncomplete { missing });
    }
    Ok(())
}

pub struct MappingEditor {
    store: Arc<ChannelConfigStore>,
    validator: SpreadsheetValidator,
    backend: Arc<dyn OrderBackend>,
    events: EventBus,
}

impl MappingEditor {
    pub fn new(
        store: Arc<ChannelConfigStore>,
        validator: SpreadsheetValidator,
        backend: Arc<dyn OrderBackend>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            validator,
            backend,
            events,
        }
    }

    /// Assign `column` to `field`. Reusing a column for several fields is
    /// allowed; an empty column clears the field.
    pub fn set_mapping(&self, kind: ChannelKind, field: OrderField, column: &str) {
        self.store.set_mapping(kind, field, column);
    }

    /// Persist the channel: create when it has never been saved, update
    /// otherwise. Nothing is sent when a local precondition fails.
    pub async fn save(&self, kind: ChannelKind) -> Result<SaveOutcome, SyncError> {
        let channel = self.store.get(kind);
        check_saveable(&channel, &self.validator.state(kind))?;
        let account_id = self.store.account_id()?;
        let content = channel.to_content();

        let (result, created) = match channel.persisted_id.as_deref() {
            None => (
                self.backend
                    .create_channel_config(&account_id, &content)
                    .await,
                true,
            ),
            Some(id) => (
                self.backend
                    .update_channel_config(&account_id, id, &content)
                    .await,
                false,
            ),
        };

        let persisted_id = match result {
            Ok(id) => id,
            Err(e) => {
                warn!(channel = %kind, error = %e, "saving channel configuration failed");
                return Err(e.into());
            }
        };

        self.store.mark_saved(kind, &persisted_id);
        info!(
            channel = %kind,
            persisted_id = %persisted_id,
            created,
            fields = content.config_with_order_collection.len(),
            "channel configuration saved"
        );
        self.events.emit(SyncEvent::ConfigSaved {
            channel: kind,
            persisted_id: persisted_id.clone(),
        });
        Ok(SaveOutcome {
            persisted_id,
            created,
        })
    }
}
