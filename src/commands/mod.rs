//! JSON command handlers called by the host dashboard.
//!
//! Every handler takes the raw first IPC argument and returns
//! `Result<Value, String>`. Engine errors never surface as `Err`: they come
//! back as `{ success: false, error, errorKind, retryable }` so the UI can
//! decide how to present them. `Err` is reserved for malformed payloads.

use serde::Serialize;
use serde_json::Value;

use crate::channel::ChannelKind;
use crate::error::SyncError;

pub mod account;
pub mod diagnostics;
pub mod integration;

/// Accept either a bare string or an object for single-value payloads.
pub(crate) fn normalize_payload(arg0: Option<Value>, key: &str) -> Value {
    match arg0 {
        Some(Value::String(s)) => serde_json::json!({ key: s }),
        Some(v) => v,
        None => serde_json::json!({}),
    }
}

pub(crate) fn parse_channel(raw: &str) -> Result<ChannelKind, String> {
    ChannelKind::parse(raw).ok_or_else(|| format!("Unknown channel: {}", raw.trim()))
}

/// Flatten an engine result into the command response body.
pub(crate) fn to_command_result<T: Serialize>(result: Result<T, SyncError>) -> Result<Value, String> {
    match result {
        Ok(value) => {
            let value = serde_json::to_value(value).map_err(|e| e.to_string())?;
            Ok(match value {
                Value::Object(mut obj) => {
                    obj.insert("success".into(), Value::Bool(true));
                    Value::Object(obj)
                }
                other => serde_json::json!({ "success": true, "data": other }),
            })
        }
        Err(e) => Ok(e.to_json()),
    }
}
