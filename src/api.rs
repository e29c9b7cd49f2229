//! Order backend HTTP client.
//!
//! Provides authenticated JSON communication with the order backend, which
//! also proxies the linked spreadsheet account. Both remote collaborators
//! ([`crate::provider`] and [`crate::backend`]) are built on [`ApiClient`].

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::RemoteError;

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Percent-encode a path segment or query value.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    let message = if err.is_connect() {
        format!("Cannot reach order backend at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid order backend URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    RemoteError::Transport(message)
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Spreadsheet account is not authorized".to_string(),
        404 => "Requested spreadsheet or configuration was not found".to_string(),
        s if s >= 500 => format!("Order backend server error (HTTP {s})"),
        s => format!("Unexpected response from order backend (HTTP {s})"),
    }
}

/// Pick the most useful message out of an error body.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_message(status));
        return match json.get("details").or_else(|| json.get("errors")) {
            Some(details) => format!("{message}: {details}"),
            None => message,
        };
    }
    if trimmed.is_empty() {
        status_message(status)
    } else {
        format!("{}: {trimmed}", status_message(status))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Authenticated JSON client for the order backend.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    api_key: Zeroizing<String>,
    client: Client,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = normalize_base_url(base_url);
        if base_url.is_empty() {
            return Err(RemoteError::Transport(
                "Order backend URL is not configured".into(),
            ));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            api_key: Zeroizing::new(api_key.trim().to_string()),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform an authenticated request. `path` includes the leading slash.
    /// Empty 2xx bodies come back as `Value::Null`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        let full_url = format!("{}{path}", self.base_url);
        debug!(method = %method, path, "order backend request");

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-API-Key", self.api_key.as_str())
            .header("Content-Type", "application/json");
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message: error_detail(status, &body_text),
            });
        }

        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| RemoteError::InvalidResponse(format!("body is not JSON: {e}")))
    }

    pub async fn get(&self, path: &str) -> Result<Value, RemoteError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, RemoteError> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value, RemoteError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, RemoteError> {
        self.request(Method::DELETE, path, None).await
    }
}

/// Unwrap the common `{ data: ... }` envelope, if present.
pub fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut obj) if obj.contains_key("data") => {
            obj.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Whether a `{status}` style response reports success.
pub fn response_succeeded(value: &Value) -> bool {
    if let Some(flag) = value.get("success").and_then(Value::as_bool) {
        return flag;
    }
    match value.get("status") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "success" | "ok" | "created" | "updated" | "deleted" | "done"
        ),
        Some(Value::Number(n)) => n.as_u64().map(|c| (200..300).contains(&c)).unwrap_or(false),
        _ => value.is_null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("orders.example.com/api/"), "https://orders.example.com");
        assert_eq!(normalize_base_url("localhost:3000/"), "http://localhost:3000");
        assert_eq!(normalize_base_url(" https://x.io// "), "https://x.io");
        assert_eq!(normalize_base_url("   "), "");
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("Sheet 1/A&B"), "Sheet%201%2FA%26B");
        assert_eq!(percent_encode("abc-_.~"), "abc-_.~");
    }

    #[test]
    fn test_error_detail_prefers_json_message() {
        let detail = error_detail(
            StatusCode::BAD_REQUEST,
            r#"{"error":"mapping missing","details":["fullName"]}"#,
        );
        assert_eq!(detail, r#"mapping missing: ["fullName"]"#);
        assert_eq!(
            error_detail(StatusCode::UNAUTHORIZED, ""),
            "API key is invalid or expired"
        );
    }

    #[test]
    fn test_response_succeeded_variants() {
        assert!(response_succeeded(&serde_json::json!({ "status": "success" })));
        assert!(response_succeeded(&serde_json::json!({ "status": 200 })));
        assert!(response_succeeded(&serde_json::json!({ "success": true, "status": "x" })));
        assert!(response_succeeded(&Value::Null));
        assert!(!response_succeeded(&serde_json::json!({ "status": "error" })));
        assert!(!response_succeeded(&serde_json::json!({ "message": "nope" })));
    }

    #[test]
    fn test_client_requires_base_url() {
        assert!(ApiClient::new("", "key", DEFAULT_TIMEOUT).is_err());
        let client = ApiClient::new("orders.example.com", "key", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(client.base_url(), "https://orders.example.com");
    }
}
