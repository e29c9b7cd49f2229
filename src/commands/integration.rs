use serde::Deserialize;
use serde_json::Value;

use super::{normalize_payload, parse_channel, to_command_result};
use crate::channel::{ChannelKind, OrderField};
use crate::integration::SheetSync;

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelPayload {
    #[serde(alias = "type_order", alias = "typeOrder", alias = "kind")]
    channel: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetFileIdPayload {
    #[serde(alias = "type_order", alias = "typeOrder", alias = "kind")]
    channel: String,
    #[serde(default, alias = "file_id", alias = "idFile")]
    file_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectSheetPayload {
    #[serde(alias = "type_order", alias = "typeOrder", alias = "kind")]
    channel: String,
    #[serde(default, alias = "sheet_name", alias = "nameSheet", alias = "sheet")]
    sheet_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetMappingPayload {
    #[serde(alias = "type_order", alias = "typeOrder", alias = "kind")]
    channel: String,
    field: String,
    #[serde(default)]
    column: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentRunsPayload {
    #[serde(alias = "type_order", alias = "typeOrder", alias = "kind")]
    channel: String,
    #[serde(default, alias = "max", alias = "count")]
    limit: Option<usize>,
}

fn parse_channel_payload(arg0: Option<Value>) -> Result<ChannelKind, String> {
    let payload = normalize_payload(arg0, "channel");
    let parsed: ChannelPayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid channel payload: {e}"))?;
    parse_channel(&parsed.channel)
}

fn parse_set_file_id_payload(arg0: Option<Value>) -> Result<(ChannelKind, String), String> {
    let parsed: SetFileIdPayload = serde_json::from_value(arg0.unwrap_or_default())
        .map_err(|e| format!("Invalid file id payload: {e}"))?;
    Ok((parse_channel(&parsed.channel)?, parsed.file_id))
}

fn parse_select_sheet_payload(arg0: Option<Value>) -> Result<(ChannelKind, String), String> {
    let parsed: SelectSheetPayload = serde_json::from_value(arg0.unwrap_or_default())
        .map_err(|e| format!("Invalid sheet payload: {e}"))?;
    Ok((parse_channel(&parsed.channel)?, parsed.sheet_name))
}

fn parse_set_mapping_payload(
    arg0: Option<Value>,
) -> Result<(ChannelKind, OrderField, String), String> {
    let parsed: SetMappingPayload = serde_json::from_value(arg0.unwrap_or_default())
        .map_err(|e| format!("Invalid mapping payload: {e}"))?;
    let field = OrderField::from_key(&parsed.field)
        .ok_or_else(|| format!("Unknown order field: {}", parsed.field.trim()))?;
    Ok((
        parse_channel(&parsed.channel)?,
        field,
        parsed.column.unwrap_or_default(),
    ))
}

fn parse_recent_runs_payload(arg0: Option<Value>) -> Result<(ChannelKind, usize), String> {
    let payload = normalize_payload(arg0, "channel");
    let parsed: RecentRunsPayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid runs payload: {e}"))?;
    let limit = parsed
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT);
    Ok((parse_channel(&parsed.channel)?, limit))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub fn sheet_sync_get_state(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    match arg0 {
        None => {
            let mut channels = serde_json::Map::new();
            for kind in ChannelKind::ALL {
                let snapshot = serde_json::to_value(sync.snapshot(kind)).map_err(|e| e.to_string())?;
                channels.insert(kind.as_str().to_string(), snapshot);
            }
            Ok(serde_json::json!({
                "success": true,
                "accountLinked": sync.store().account_id().is_ok(),
                "channels": channels,
            }))
        }
        some => {
            let kind = parse_channel_payload(some)?;
            to_command_result(Ok(sync.snapshot(kind)))
        }
    }
}

pub fn sheet_sync_set_file_id(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let (kind, file_id) = parse_set_file_id_payload(arg0)?;
    to_command_result(sync.set_file_id(kind, &file_id).map(|_| sync.snapshot(kind)))
}

pub async fn sheet_sync_select_sheet(
    sync: &SheetSync,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let (kind, sheet_name) = parse_select_sheet_payload(arg0)?;
    to_command_result(sync.select_sheet(kind, &sheet_name).await)
}

pub fn sheet_sync_set_mapping(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let (kind, field, column) = parse_set_mapping_payload(arg0)?;
    sync.set_mapping(kind, field, &column);
    let channel = sync.store().get(kind);
    Ok(serde_json::json!({
        "success": true,
        "mapping": channel.mapping,
        "requiredMissing": channel.missing_required(),
    }))
}

pub async fn sheet_sync_save(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let kind = parse_channel_payload(arg0)?;
    to_command_result(sync.save(kind).await)
}

pub async fn sheet_sync_fetch(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let kind = parse_channel_payload(arg0)?;
    to_command_result(sync.fetch(kind).await)
}

pub fn sheet_sync_preview(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let kind = parse_channel_payload(arg0)?;
    let staged = sync.snapshot(kind).staged;
    Ok(serde_json::json!({
        "success": true,
        "startRow": staged.as_ref().map(|b| b.start_row),
        "header": staged.as_ref().map(|b| b.header.clone()).unwrap_or_default(),
        "rows": sync.preview(kind),
    }))
}

pub fn sheet_sync_discard(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let kind = parse_channel_payload(arg0)?;
    to_command_result(
        sync.discard(kind)
            .map(|discarded| serde_json::json!({ "discarded": discarded })),
    )
}

pub async fn sheet_sync_commit(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let kind = parse_channel_payload(arg0)?;
    to_command_result(sync.commit(kind).await)
}

pub async fn sheet_sync_toggle_auto(
    sync: &SheetSync,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let kind = parse_channel_payload(arg0)?;
    to_command_result(sync.toggle_auto_sync(kind).await)
}

pub async fn sheet_sync_delete(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let kind = parse_channel_payload(arg0)?;
    to_command_result(sync.delete(kind).await)
}

pub fn sheet_sync_recent_runs(sync: &SheetSync, arg0: Option<Value>) -> Result<Value, String> {
    let (kind, limit) = parse_recent_runs_payload(arg0)?;
    to_command_result(
        sync.recent_runs(kind, limit)
            .map(|runs| serde_json::json!({ "runs": runs })),
    )
}
