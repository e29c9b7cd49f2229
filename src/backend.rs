//! Order backend contract: channel configuration CRUD and row commits.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::api::{percent_encode, response_succeeded, unwrap_data, ApiClient};
use crate::channel::{ChannelContent, StoredChannelConfig};
use crate::error::RemoteError;

/// Body of a `commitRows` call. The backend applies the persisted mapping
/// of `id_config` to rows `start_row..=end_row`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub id_config: String,
    pub start_row: u64,
    pub end_row: u64,
    pub row_count: u64,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResponse {
    pub success: bool,
    /// Rows the backend confirms it ingested, when it reports a count.
    pub accepted: Option<u64>,
    pub message: Option<String>,
}

impl CommitResponse {
    /// Parse a commit reply. The success flag is read from the outer body
    /// first, the count and message from the `data` envelope or the top
    /// level.
    pub fn from_json(value: &Value) -> Self {
        let data = value.get("data").filter(|d| d.is_object());
        let layers: Vec<&Value> = data.into_iter().chain(std::iter::once(value)).collect();

        let accepted = layers.iter().find_map(|layer| {
            ["rowsSynced", "rowsAccepted", "count", "accepted"]
                .iter()
                .find_map(|key| layer.get(*key).and_then(Value::as_u64))
        });
        let message = layers.iter().find_map(|layer| {
            layer
                .get("message")
                .or_else(|| layer.get("error"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        });
        let has_flag = |v: &Value| v.get("success").is_some() || v.get("status").is_some();
        let success = match data {
            _ if has_flag(value) => response_succeeded(value),
            Some(inner) if has_flag(inner) => response_succeeded(inner),
            _ => response_succeeded(value),
        };
        Self {
            success,
            accepted,
            message,
        }
    }
}

#[async_trait]
pub trait OrderBackend: Send + Sync {
    async fn list_channel_configs(
        &self,
        account_id: &str,
    ) -> Result<Vec<StoredChannelConfig>, RemoteError>;

    /// Returns the identifier of the new record.
    async fn create_channel_config(
        &self,
        account_id: &str,
        content: &ChannelContent,
    ) -> Result<String, RemoteError>;

    /// Returns the identifier of the updated record.
    async fn update_channel_config(
        &self,
        account_id: &str,
        id: &str,
        content: &ChannelContent,
    ) -> Result<String, RemoteError>;

    async fn delete_channel_config(&self, account_id: &str, id: &str) -> Result<(), RemoteError>;

    async fn commit_rows(
        &self,
        account_id: &str,
        request: &CommitRequest,
    ) -> Result<CommitResponse, RemoteError>;
}

pub struct HttpOrderBackend {
    api: ApiClient,
}

impl HttpOrderBackend {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    fn configs_path(account_id: &str) -> String {
        format!(
            "/api/integrations/sheets/{}/configs",
            percent_encode(account_id)
        )
    }
}

fn extract_id(value: &Value) -> Option<String> {
    let data = unwrap_data(value.clone());
    ["id", "_id"]
        .iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn ensure_succeeded(value: &Value, what: &str) -> Result<(), RemoteError> {
    if response_succeeded(value) || extract_id(value).is_some() {
        Ok(())
    } else {
        Err(RemoteError::InvalidResponse(format!(
            "{what} was not acknowledged: {value}"
        )))
    }
}

#[async_trait]
impl OrderBackend for HttpOrderBackend {
    async fn list_channel_configs(
        &self,
        account_id: &str,
    ) -> Result<Vec<StoredChannelConfig>, RemoteError> {
        let body = unwrap_data(self.api.get(&Self::configs_path(account_id)).await?);
        let list = match body {
            Value::Object(mut obj) => obj.remove("configs").unwrap_or(Value::Array(vec![])),
            Value::Null => Value::Array(vec![]),
            other => other,
        };
        serde_json::from_value(list)
            .map_err(|e| RemoteError::InvalidResponse(format!("channel configs: {e}")))
    }

    async fn create_channel_config(
        &self,
        account_id: &str,
        content: &ChannelContent,
    ) -> Result<String, RemoteError> {
        let body = serde_json::to_value(content)
            .map_err(|e| RemoteError::InvalidResponse(format!("encode config: {e}")))?;
        let resp = self.api.post(&Self::configs_path(account_id), &body).await?;
        extract_id(&resp)
            .ok_or_else(|| RemoteError::InvalidResponse("create response has no id".into()))
    }

    async fn update_channel_config(
        &self,
        account_id: &str,
        id: &str,
        content: &ChannelContent,
    ) -> Result<String, RemoteError> {
        let body = serde_json::to_value(content)
            .map_err(|e| RemoteError::InvalidResponse(format!("encode config: {e}")))?;
        let path = format!("{}/{}", Self::configs_path(account_id), percent_encode(id));
        let resp = self.api.put(&path, &body).await?;
        ensure_succeeded(&resp, "update")?;
        Ok(extract_id(&resp).unwrap_or_else(|| id.to_string()))
    }

    async fn delete_channel_config(&self, account_id: &str, id: &str) -> Result<(), RemoteError> {
        let path = format!("{}/{}", Self::configs_path(account_id), percent_encode(id));
        let resp = self.api.delete(&path).await?;
        ensure_succeeded(&resp, "delete")
    }

    async fn commit_rows(
        &self,
        account_id: &str,
        request: &CommitRequest,
    ) -> Result<CommitResponse, RemoteError> {
        let body = serde_json::to_value(request)
            .map_err(|e| RemoteError::InvalidResponse(format!("encode commit: {e}")))?;
        let path = format!(
            "/api/integrations/sheets/{}/commit",
            percent_encode(account_id)
        );
        let resp = self.api.post(&path, &body).await?;
        Ok(CommitResponse::from_json(&resp))
    }
}
