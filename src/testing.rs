//! In-memory provider and backend doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::backend::{CommitRequest, CommitResponse, OrderBackend};
use crate::channel::{ChannelContent, StoredChannelConfig};
use crate::error::RemoteError;
use crate::provider::{SheetInfo, SpreadsheetProvider};

fn not_found(what: &str) -> RemoteError {
    RemoteError::Status {
        status: 404,
        message: format!("{what} not found"),
    }
}

fn to_rows(rows: &[&[&str]]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|r| r.iter().map(|c| c.to_string()).collect())
        .collect()
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    ListSheets(String),
    Header { file: String, sheet: String },
    Rows { file: String, sheet: String, start_row: u64 },
}

#[derive(Default)]
struct ProviderState {
    /// file -> ordered (sheet name, header + data rows)
    files: HashMap<String, Vec<(String, Vec<Vec<String>>)>>,
    header_error: Option<String>,
    rows_error: Option<String>,
    list_gates: HashMap<String, Arc<Notify>>,
    calls: Vec<ProviderCall>,
}

#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sheet; the first row is the header.
    pub fn add_sheet(&self, file: &str, sheet: &str, rows: &[&[&str]]) {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .entry(file.to_string())
            .or_default()
            .push((sheet.to_string(), to_rows(rows)));
    }

    pub fn add_empty_file(&self, file: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .entry(file.to_string())
            .or_default();
    }

    /// Append data rows to an existing sheet.
    pub fn append_rows(&self, file: &str, sheet: &str, rows: &[&[&str]]) {
        let mut state = self.state.lock().unwrap();
        let sheets = state.files.get_mut(file).expect("unknown file");
        let (_, existing) = sheets
            .iter_mut()
            .find(|(name, _)| name == sheet)
            .expect("unknown sheet");
        existing.extend(to_rows(rows));
    }

    /// Every header fetch fails with `message` from now on.
    pub fn fail_headers(&self, message: &str) {
        self.state.lock().unwrap().header_error = Some(message.to_string());
    }

    /// The next row fetch fails with `message`.
    pub fn fail_rows(&self, message: &str) {
        self.state.lock().unwrap().rows_error = Some(message.to_string());
    }

    /// Hold `list_sheets(file)` until the returned notify fires.
    pub fn gate_list_sheets(&self, file: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state
            .lock()
            .unwrap()
            .list_gates
            .insert(file.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn sheet(&self, file: &str, sheet: &str) -> Result<Vec<Vec<String>>, RemoteError> {
        let state = self.state.lock().unwrap();
        let sheets = state.files.get(file).ok_or_else(|| not_found("file"))?;
        sheets
            .iter()
            .find(|(name, _)| name == sheet)
            .map(|(_, rows)| rows.clone())
            .ok_or_else(|| not_found("sheet"))
    }
}

#[async_trait]
impl SpreadsheetProvider for FakeProvider {
    async fn list_sheets(
        &self,
        _account_id: &str,
        file_id: &str,
    ) -> Result<Vec<SheetInfo>, RemoteError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(ProviderCall::ListSheets(file_id.to_string()));
            state.list_gates.get(file_id).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = self.state.lock().unwrap();
        let sheets = state.files.get(file_id).ok_or_else(|| not_found("file"))?;
        Ok(sheets
            .iter()
            .enumerate()
            .map(|(i, (name, _))| SheetInfo {
                id: i.to_string(),
                name: name.clone(),
            })
            .collect())
    }

    async fn get_header_row(
        &self,
        _account_id: &str,
        file_id: &str,
        sheet_name: &str,
    ) -> Result<Vec<String>, RemoteError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(ProviderCall::Header {
                file: file_id.to_string(),
                sheet: sheet_name.to_string(),
            });
            if let Some(message) = &state.header_error {
                return Err(RemoteError::Transport(message.clone()));
            }
        }
        let rows = self.sheet(file_id, sheet_name)?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn get_rows(
        &self,
        _account_id: &str,
        file_id: &str,
        sheet_name: &str,
        start_row: u64,
    ) -> Result<Vec<Vec<String>>, RemoteError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(ProviderCall::Rows {
                file: file_id.to_string(),
                sheet: sheet_name.to_string(),
                start_row,
            });
            if let Some(message) = state.rows_error.take() {
                return Err(RemoteError::Transport(message));
            }
        }
        let rows = self.sheet(file_id, sheet_name)?;
        let mut iter = rows.into_iter();
        let Some(header) = iter.next() else {
            return Ok(Vec::new());
        };
        let skip = start_row.saturating_sub(2) as usize;
        Ok(std::iter::once(header).chain(iter.skip(skip)).collect())
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    List,
    Create { content: ChannelContent },
    Update { id: String, content: ChannelContent },
    Delete { id: String },
    Commit(CommitRequest),
}

#[derive(Default)]
struct BackendState {
    configs: Vec<StoredChannelConfig>,
    next_id: u64,
    save_error: Option<String>,
    delete_error: Option<String>,
    commit_script: VecDeque<Result<CommitResponse, RemoteError>>,
    commit_gate: Option<Arc<Notify>>,
    calls: Vec<BackendCall>,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_configs(&self, configs: Vec<StoredChannelConfig>) {
        self.state.lock().unwrap().configs = configs;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// The next create or update fails with `message`.
    pub fn fail_next_save(&self, message: &str) {
        self.state.lock().unwrap().save_error = Some(message.to_string());
    }

    pub fn fail_next_delete(&self, message: &str) {
        self.state.lock().unwrap().delete_error = Some(message.to_string());
    }

    /// The next commit never reaches the backend.
    pub fn fail_next_commit(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .commit_script
            .push_back(Err(RemoteError::Transport(message.to_string())));
    }

    /// The next commit is answered with an error status in the body.
    pub fn reject_next_commit(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .commit_script
            .push_back(Ok(CommitResponse {
                success: false,
                accepted: None,
                message: Some(message.to_string()),
            }));
    }

    /// The next commit succeeds reporting `accepted` rows.
    pub fn accept_next_commit(&self, accepted: Option<u64>) {
        self.state
            .lock()
            .unwrap()
            .commit_script
            .push_back(Ok(CommitResponse {
                success: true,
                accepted,
                message: None,
            }));
    }

    /// Hold every commit until the returned notify fires once per commit.
    pub fn gate_commits(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().commit_gate = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl OrderBackend for FakeBackend {
    async fn list_channel_configs(
        &self,
        _account_id: &str,
    ) -> Result<Vec<StoredChannelConfig>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(BackendCall::List);
        Ok(state.configs.clone())
    }

    async fn create_channel_config(
        &self,
        _account_id: &str,
        content: &ChannelContent,
    ) -> Result<String, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(BackendCall::Create {
            content: content.clone(),
        });
        if let Some(message) = state.save_error.take() {
            return Err(RemoteError::Transport(message));
        }
        state.next_id += 1;
        let id = format!("cfg-{}", state.next_id);
        state.configs.push(StoredChannelConfig {
            id: id.clone(),
            content: content.clone(),
        });
        Ok(id)
    }

    async fn update_channel_config(
        &self,
        _account_id: &str,
        id: &str,
        content: &ChannelContent,
    ) -> Result<String, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(BackendCall::Update {
            id: id.to_string(),
            content: content.clone(),
        });
        if let Some(message) = state.save_error.take() {
            return Err(RemoteError::Transport(message));
        }
        match state.configs.iter_mut().find(|c| c.id == id) {
            Some(existing) => existing.content = content.clone(),
            None => state.configs.push(StoredChannelConfig {
                id: id.to_string(),
                content: content.clone(),
            }),
        }
        Ok(id.to_string())
    }

    async fn delete_channel_config(&self, _account_id: &str, id: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(BackendCall::Delete { id: id.to_string() });
        if let Some(message) = state.delete_error.take() {
            return Err(RemoteError::Transport(message));
        }
        state.configs.retain(|c| c.id != id);
        Ok(())
    }

    async fn commit_rows(
        &self,
        _account_id: &str,
        request: &CommitRequest,
    ) -> Result<CommitResponse, RemoteError> {
        let (gate, scripted) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(BackendCall::Commit(request.clone()));
            (state.commit_gate.clone(), state.commit_script.pop_front())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        scripted.unwrap_or_else(|| {
            Ok(CommitResponse {
                success: true,
                accepted: Some(request.row_count),
                message: None,
            })
        })
    }
}
