//! Spreadsheet provider contract and its HTTP implementation.
//!
//! Row numbers are 1-based as in the spreadsheet UI. `get_rows` always
//! returns the header row first, followed by data rows from `start_row`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{percent_encode, unwrap_data, ApiClient};
use crate::error::RemoteError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetInfo {
    #[serde(default, alias = "sheetId")]
    pub id: String,
    #[serde(alias = "title")]
    pub name: String,
}

#[async_trait]
pub trait SpreadsheetProvider: Send + Sync {
    async fn list_sheets(&self, account_id: &str, file_id: &str)
        -> Result<Vec<SheetInfo>, RemoteError>;

    async fn get_header_row(
        &self,
        account_id: &str,
        file_id: &str,
        sheet_name: &str,
    ) -> Result<Vec<String>, RemoteError>;

    /// Header row followed by every data row at or after `start_row`.
    async fn get_rows(
        &self,
        account_id: &str,
        file_id: &str,
        sheet_name: &str,
        start_row: u64,
    ) -> Result<Vec<Vec<String>>, RemoteError>;
}

/// Provider reached through the order backend's spreadsheet proxy.
pub struct HttpSpreadsheetProvider {
    api: ApiClient,
}

impl HttpSpreadsheetProvider {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    fn file_path(account_id: &str, file_id: &str) -> String {
        format!(
            "/api/integrations/sheets/{}/files/{}",
            percent_encode(account_id),
            percent_encode(file_id)
        )
    }
}

#[async_trait]
impl SpreadsheetProvider for HttpSpreadsheetProvider {
    async fn list_sheets(
        &self,
        account_id: &str,
        file_id: &str,
    ) -> Result<Vec<SheetInfo>, RemoteError> {
        let path = format!("{}/sheets", Self::file_path(account_id, file_id));
        let body = unwrap_data(self.api.get(&path).await?);
        let list = match body {
            Value::Object(mut obj) => obj.remove("sheets").unwrap_or(Value::Array(vec![])),
            other => other,
        };
        serde_json::from_value(list)
            .map_err(|e| RemoteError::InvalidResponse(format!("sheet list: {e}")))
    }

    async fn get_header_row(
        &self,
        account_id: &str,
        file_id: &str,
        sheet_name: &str,
    ) -> Result<Vec<String>, RemoteError> {
        let path = format!(
            "{}/header?sheet={}",
            Self::file_path(account_id, file_id),
            percent_encode(sheet_name)
        );
        let body = unwrap_data(self.api.get(&path).await?);
        let row = match body {
            Value::Object(mut obj) => obj.remove("header").unwrap_or(Value::Array(vec![])),
            other => other,
        };
        parse_row(&row).ok_or_else(|| RemoteError::InvalidResponse("header row".into()))
    }

    async fn get_rows(
        &self,
        account_id: &str,
        file_id: &str,
        sheet_name: &str,
        start_row: u64,
    ) -> Result<Vec<Vec<String>>, RemoteError> {
        let path = format!(
            "{}/rows?sheet={}&startRow={start_row}",
            Self::file_path(account_id, file_id),
            percent_encode(sheet_name)
        );
        let body = unwrap_data(self.api.get(&path).await?);
        let rows = match body {
            Value::Object(mut obj) => obj
                .remove("values")
                .or_else(|| obj.remove("rows"))
                .unwrap_or(Value::Array(vec![])),
            other => other,
        };
        parse_rows(&rows).ok_or_else(|| RemoteError::InvalidResponse("row values".into()))
    }
}

/// Render a cell as the text the spreadsheet shows.
pub fn cell_to_string(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn parse_row(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(cells) => Some(cells.iter().map(cell_to_string).collect()),
        Value::Null => Some(Vec::new()),
        _ => None,
    }
}

fn parse_rows(value: &Value) -> Option<Vec<Vec<String>>> {
    value.as_array()?.iter().map(parse_row).collect()
}
