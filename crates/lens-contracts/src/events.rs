use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::AnalyzeError;

pub type EventPayload = Map<String, Value>;

/// Append-only session log (`events.jsonl`).
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// A writer without a path still builds events but writes nothing.
#[derive(Debug, Clone)]
pub struct EventWriter {
    path: Option<PathBuf>,
    session_id: String,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            session_id: session_id.into(),
        }
    }

    pub fn disabled(session_id: impl Into<String>) -> Self {
        Self {
            path: None,
            session_id: session_id.into(),
        }
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.path.as_deref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Records a failed chat action under `event_type` with its error kind.
    pub fn emit_failure(
        &self,
        event_type: &str,
        err: &AnalyzeError,
        mut payload: EventPayload,
    ) -> anyhow::Result<Value> {
        payload.insert("error_kind".to_string(), Value::String(err.kind().to_string()));
        payload.insert("error".to_string(), Value::String(err.to_string()));
        self.emit(event_type, payload)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
