use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::{normalize_payload, to_command_result};
use crate::{account, storage, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkAccountPayload {
    #[serde(alias = "account_id", alias = "id")]
    account_id: String,
}

fn parse_link_account_payload(arg0: Option<Value>) -> Result<String, String> {
    let payload = normalize_payload(arg0, "accountId");
    let parsed: LinkAccountPayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid account payload: {e}"))?;
    let account_id = parsed.account_id.trim().to_string();
    if account_id.is_empty() {
        return Err("Missing accountId".into());
    }
    Ok(account_id)
}

pub fn sheet_sync_open_link_page(state: &AppState) -> Result<Value, String> {
    account::open_link_page(&state.config.backend_url, Some(state.db.as_ref()))
}

/// Store the account id returned by the link flow and load both channels
/// for it.
pub async fn sheet_sync_link_account(
    state: &AppState,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let account_id = parse_link_account_payload(arg0)?;
    account::set_linked_account(&account_id)?;
    state.sync.set_account_id(Some(account_id));
    to_command_result(state.sync.load().await.map(|_| serde_json::json!({ "linked": true })))
}

pub fn sheet_sync_unlink_account(state: &AppState) -> Result<Value, String> {
    account::unlink_account()?;
    state.sync.set_account_id(None);
    Ok(serde_json::json!({ "success": true, "linked": false }))
}

pub fn sheet_sync_update_connection(arg0: Option<Value>) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    let result = storage::update_connection(&payload)?;
    warn!("backend connection changed, restart required to apply");
    Ok(result)
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn parse_link_account_payload_supports_string_and_object() {
        assert_eq!(
            parse_link_account_payload(Some(serde_json::json!(" acct-1 "))).unwrap(),
            "acct-1"
        );
        assert_eq!(
            parse_link_account_payload(Some(serde_json::json!({ "account_id": "acct-2" })))
                .unwrap(),
            "acct-2"
        );
        assert_eq!(
            parse_link_account_payload(Some(serde_json::json!("  "))).unwrap_err(),
            "Missing accountId"
        );
    }
}
