//! Line-delimited agent event log (`chat_log`) -> ordered records.

use serde::Serialize;
use serde_json::Value;

/// Role given to lines that are not a JSON object with a `role`.
pub const RAW_ROLE: &str = "raw";

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub role: String,
    pub step: Option<i64>,
    /// `output` (or `content`) of a structured line; the line itself for raw ones.
    pub content: String,
    /// The decoded line, or the original text as a JSON string for raw lines.
    pub payload: Value,
}

impl EventRecord {
    fn raw(line: &str) -> Self {
        Self {
            role: RAW_ROLE.to_string(),
            step: None,
            content: line.to_string(),
            payload: Value::String(line.to_string()),
        }
    }

    pub fn is_raw(&self) -> bool {
        self.role == RAW_ROLE && self.payload.is_string()
    }
}

/// Parse every non-blank line; lines that fail to decode become raw records.
pub fn parse_event_log(text: &str) -> Vec<EventRecord> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> EventRecord {
    let Ok(payload) = serde_json::from_str::<Value>(line) else {
        return EventRecord::raw(line);
    };
    let Some(role) = payload.get("role").and_then(Value::as_str).map(str::to_string) else {
        return EventRecord::raw(line);
    };

    let content = ["output", "content"]
        .iter()
        .find_map(|field| payload.get(*field))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    EventRecord {
        role,
        step: payload.get("step").and_then(Value::as_i64),
        content,
        payload,
    }
}
