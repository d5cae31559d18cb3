use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tracing::warn;

// Standardize audit log shape. Fields may be null depending on the command.
const REQUIRED_KEYS: [&str; 5] = ["ts", "command", "key_id", "result", "error_name"];

pub fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn normalize_entry(v: Value) -> Value {
    let mut obj = match v {
        Value::Object(m) => m,
        other @ (Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::String(_)
        | Value::Array(_)) => {
            let mut m = Map::new();
            m.insert("raw".to_owned(), other);
            m
        }
    };

    if !obj.contains_key("ts") {
        obj.insert("ts".to_owned(), Value::String(utc_now_iso()));
    }
    for k in REQUIRED_KEYS {
        if !obj.contains_key(k) {
            obj.insert(k.to_owned(), Value::Null);
        }
    }
    Value::Object(obj)
}

/// Append-only JSONL record of vault commands. Never holds passwords or key material.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, entry: Value) -> eyre::Result<()> {
        let line = serde_json::to_string(&normalize_entry(entry))?;
        crate::fsutil::append_line_private(&self.path, &line)
    }

    /// One line per finished command. A failed write is logged, never surfaced to the
    /// caller of the command.
    pub fn record(&self, command: &str, key_id: Option<&str>, error_name: Option<&str>) {
        let entry = json!({
            "command": command,
            "key_id": key_id,
            "result": if error_name.is_some() { "error" } else { "ok" },
            "error_name": error_name,
        });
        if let Err(e) = self.append(entry) {
            warn!(error = %e, command, "failed to write audit entry");
        }
    }
}
