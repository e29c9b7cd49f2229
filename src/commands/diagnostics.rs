use serde_json::Value;
use std::path::PathBuf;

use crate::{diagnostics, value_str, AppState};

fn parse_diagnostics_export_payload(arg0: Option<Value>) -> Result<(PathBuf, bool), String> {
    let (dir, redact) = match arg0 {
        Some(Value::String(path)) => (Some(path.trim().to_string()), true),
        Some(obj @ Value::Object(_)) => (
            value_str(&obj, &["path", "exportPath", "export_path"]),
            obj.get("redactSensitive")
                .or_else(|| obj.get("redact_sensitive"))
                .and_then(Value::as_bool)
                .unwrap_or(true),
        ),
        _ => (None, true),
    };
    let dir = dir
        .filter(|d| !d.is_empty())
        .ok_or("Missing diagnostics export path")?;
    Ok((PathBuf::from(dir), redact))
}

pub fn sheet_sync_about(state: &AppState) -> Result<Value, String> {
    let mut about = diagnostics::get_about_info();
    about["uptimeSeconds"] = Value::from(state.uptime_secs());
    about["dbPath"] = Value::from(state.db.db_path.to_string_lossy().to_string());
    Ok(about)
}

pub fn sheet_sync_health(state: &AppState) -> Result<Value, String> {
    let mut health = diagnostics::get_sync_health(&state.db)?;
    health["autoSyncLoopRunning"] = Value::from(
        state
            .sync
            .scheduler()
            .is_running
            .load(std::sync::atomic::Ordering::SeqCst),
    );
    Ok(health)
}

pub fn sheet_sync_export_diagnostics(
    state: &AppState,
    arg0: Option<Value>,
) -> Result<Value, String> {
    let (dir, redact) = parse_diagnostics_export_payload(arg0)?;
    let path = diagnostics::export_diagnostics(&state.db, &dir, redact)?;
    Ok(serde_json::json!({ "success": true, "path": path }))
}
