//! Error taxonomy for the spreadsheet sync engine.
//!
//! Remote collaborators fail with [`RemoteError`]; every component converts
//! those into a [`SyncError`] at its boundary so callers only ever see one
//! of the documented kinds.

use serde_json::Value;
use thiserror::Error;

use crate::channel::ChannelKind;

/// Failure reported by the spreadsheet provider or the order backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The request never produced an HTTP response (DNS, connect, timeout).
    #[error("{0}")]
    Transport(String),
    /// The server answered with a non-success status.
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    /// The server answered 2xx but the body was not what we expected.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("No spreadsheet account is linked")]
    NotConfigured,
    #[error("A spreadsheet file id is required")]
    MissingFileId,
    #[error("The spreadsheet file is not valid: {0}")]
    InvalidFile(String),
    #[error("A sheet must be selected")]
    MissingSheetName,
    #[error("Required fields are not mapped: {}", .missing.join(", "))]
    MappingIncomplete { missing: Vec<String> },
    #[error("{0}")]
    Validation(String),
    #[error("Save the channel mapping before {0}")]
    UnsavedChannel(&'static str),
    #[error("A commit is already in progress for the {0} channel")]
    CommitInFlight(ChannelKind),
    #[error("A fetch is already in progress for the {0} channel")]
    FetchInFlight(ChannelKind),
    #[error("A configuration update is already in progress for the {0} channel")]
    SaveInFlight(ChannelKind),
    #[error("Commit failed, staged rows were kept: {0}")]
    CommitFailed(String),
    #[error("Remote request failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("Local storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Stable identifier used by the UI layer to pick a presentation.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::NotConfigured => "not_configured",
            SyncError::MissingFileId | SyncError::InvalidFile(_) | SyncError::Validation(_) => {
                "validation"
            }
            SyncError::MissingSheetName | SyncError::MappingIncomplete { .. } => {
                "mapping_incomplete"
            }
            SyncError::UnsavedChannel(_) => "unsaved_channel",
            SyncError::CommitInFlight(_)
            | SyncError::FetchInFlight(_)
            | SyncError::SaveInFlight(_) => "busy",
            SyncError::CommitFailed(_) => "commit_failed",
            SyncError::Remote(_) => "remote",
            SyncError::Storage(_) => "storage",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::CommitFailed(_)
                | SyncError::Remote(_)
                | SyncError::CommitInFlight(_)
                | SyncError::FetchInFlight(_)
                | SyncError::SaveInFlight(_)
        )
    }

    /// JSON body handed to the UI instead of a raw error.
    pub fn to_json(&self) -> Value {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "errorKind": self.kind(),
            "retryable": self.is_retryable(),
        });
        if let SyncError::MappingIncomplete { missing } = self {
            body["missingFields"] = serde_json::json!(missing);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_incomplete_lists_labels() {
        let err = SyncError::MappingIncomplete {
            missing: vec!["Customer name".into(), "Phone".into()],
        };
        assert_eq!(
            err.to_string(),
            "Required fields are not mapped: Customer name, Phone"
        );
        let body = err.to_json();
        assert_eq!(body["errorKind"], "mapping_incomplete");
        assert_eq!(body["missingFields"][1], "Phone");
        assert_eq!(body["retryable"], false);
    }

    #[test]
    fn test_commit_failures_are_retryable() {
        assert!(SyncError::CommitFailed("boom".into()).is_retryable());
        assert!(SyncError::Remote(RemoteError::Transport("down".into())).is_retryable());
        assert!(!SyncError::UnsavedChannel("committing rows").is_retryable());
        assert_eq!(
            SyncError::CommitInFlight(ChannelKind::New).to_string(),
            "A commit is already in progress for the new channel"
        );
    }
}
