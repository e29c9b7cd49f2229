//! Secure connection storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Holds the order backend URL, its
//! API key and the linked spreadsheet account id.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "order-sheet-sync";

pub const KEY_BACKEND_URL: &str = "backend_url";
pub const KEY_API_KEY: &str = "api_key";
pub const KEY_ACCOUNT_ID: &str = "account_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY, KEY_ACCOUNT_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The API key, wiped from memory when dropped.
pub fn api_key() -> Option<Zeroizing<String>> {
    get_credential(KEY_API_KEY).map(Zeroizing::new)
}

pub fn backend_url() -> Option<String> {
    get_credential(KEY_BACKEND_URL)
}

pub fn account_id() -> Option<String> {
    get_credential(KEY_ACCOUNT_ID).filter(|s| !s.trim().is_empty())
}

/// The backend connection is usable once URL and API key are present.
pub fn is_connected() -> bool {
    backend_url().is_some() && get_credential(KEY_API_KEY).is_some()
}

/// Store the order backend connection.
///
/// Expected JSON shape (camelCase, snake_case accepted):
/// ```json
/// { "backendUrl": "https://orders.example.com", "apiKey": "..." }
/// ```
pub fn update_connection(payload: &Value) -> Result<Value, String> {
    let api_key = Zeroizing::new(
        payload
            .get("apiKey")
            .or_else(|| payload.get("api_key"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or("Missing required field: apiKey")?,
    );
    let backend_url = payload
        .get("backendUrl")
        .or_else(|| payload.get("backend_url"))
        .and_then(Value::as_str)
        .map(crate::api::normalize_base_url)
        .filter(|s| !s.is_empty())
        .ok_or("Missing required field: backendUrl")?;

    set_credential(KEY_BACKEND_URL, &backend_url)?;
    set_credential(KEY_API_KEY, &api_key)?;

    info!(backend_url = %backend_url, "backend connection updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset, deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_update_connection_requires_fields() {
        let err = update_connection(&serde_json::json!({ "backendUrl": "x" })).unwrap_err();
        assert_eq!(err, "Missing required field: apiKey");
        let err = update_connection(&serde_json::json!({ "apiKey": "k" })).unwrap_err();
        assert_eq!(err, "Missing required field: backendUrl");
    }

    // CI machines often have no secret service; only assert round-trips when
    // the write itself succeeded.
    #[test]
    #[serial]
    fn test_credential_roundtrip_when_keyring_available() {
        let key = "test_roundtrip_key";
        if set_credential(key, "value-1").is_err() {
            return;
        }
        if let Some(value) = get_credential(key) {
            assert_eq!(value, "value-1");
        }
        delete_credential(key).unwrap();
        assert_eq!(get_credential(key), None);
    }

    #[test]
    #[serial]
    fn test_delete_missing_credential_is_ok() {
        let _ = delete_credential("never_written_key");
    }
}
