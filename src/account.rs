//! Spreadsheet account linking.
//!
//! Linking itself happens in the browser against the order backend, which
//! brokers the provider's consent flow and hands back an account id. This
//! module builds and opens that page and keeps the resulting id in the
//! credential store.

use reqwest::Url;
use serde_json::Value;
use tracing::info;

use crate::api::normalize_base_url;
use crate::db::{self, DbState};
use crate::storage;

const LINK_URL_MAX_LEN: usize = 2048;
const LINK_PATH: &str = "/integrations/sheets/link";

/// The page that starts the provider consent flow.
pub fn link_url(backend_url: &str) -> Result<String, String> {
    let base = normalize_base_url(backend_url);
    if base.is_empty() {
        return Err("Order backend URL is not configured".into());
    }
    Ok(format!("{base}{LINK_PATH}"))
}

/// Extra hosts allowed to serve the link page, stored as a JSON array or a
/// comma-separated list under `sheet_sync.allowed_link_hosts`.
fn extra_allowed_hosts(db: Option<&DbState>) -> Vec<String> {
    let Some(conn) = db.and_then(|db| db.conn.lock().ok()) else {
        return Vec::new();
    };
    let raw = db::get_setting(&conn, crate::config::SETTINGS_CATEGORY, "allowed_link_hosts").unwrap_or_default();
    let hosts = serde_json::from_str::<Vec<String>>(&raw)
        .unwrap_or_else(|_| raw.split(',').map(str::to_string).collect());
    hosts
        .into_iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Accept only plain http(s) URLs on the backend host (or an allowlisted
/// one). Plain http is accepted for localhost only.
pub fn validate_link_url(
    url_raw: &str,
    backend_url: &str,
    db: Option<&DbState>,
) -> Result<Url, String> {
    let trimmed = url_raw.trim();
    if trimmed.is_empty() {
        return Err("Link URL cannot be empty".into());
    }
    if trimmed.len() > LINK_URL_MAX_LEN {
        return Err("Link URL is too long".into());
    }

    let parsed = Url::parse(trimmed).map_err(|e| format!("Invalid link URL: {e}"))?;
    let scheme = parsed.scheme().to_ascii_lowercase();
    if scheme != "https" && scheme != "http" {
        return Err("Only http/https URLs are allowed".into());
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err("Credentialed URLs are not allowed".into());
    }
    let host = parsed
        .host_str()
        .ok_or("Link URL is missing a host")?
        .to_ascii_lowercase();
    let is_local = matches!(host.as_str(), "localhost" | "127.0.0.1");
    if scheme == "http" && !is_local {
        return Err("Plain http is only allowed for localhost".into());
    }

    let backend_host = Url::parse(&normalize_base_url(backend_url))
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase));
    let allowed = backend_host.as_deref() == Some(host.as_str())
        || extra_allowed_hosts(db).contains(&host);
    if !allowed {
        return Err(format!("Link host is not allowlisted: {host}"));
    }
    Ok(parsed)
}

/// Open the account link page in the system browser.
pub fn open_link_page(backend_url: &str, db: Option<&DbState>) -> Result<Value, String> {
    let url = link_url(backend_url)?;
    let parsed = validate_link_url(&url, backend_url, db)?;
    webbrowser::open(parsed.as_str()).map_err(|e| format!("Failed to open link page: {e}"))?;
    info!(host = parsed.host_str().unwrap_or("unknown"), "opened account link page");
    Ok(serde_json::json!({ "success": true, "url": parsed.as_str() }))
}

pub fn set_linked_account(account_id: &str) -> Result<(), String> {
    let account_id = account_id.trim();
    if account_id.is_empty() {
        return Err("Account id cannot be empty".into());
    }
    storage::set_credential(storage::KEY_ACCOUNT_ID, account_id)?;
    info!("spreadsheet account linked");
    Ok(())
}

pub fn linked_account() -> Option<String> {
    storage::account_id()
}

pub fn unlink_account() -> Result<(), String> {
    storage::delete_credential(storage::KEY_ACCOUNT_ID)?;
    info!("spreadsheet account unlinked");
    Ok(())
}
