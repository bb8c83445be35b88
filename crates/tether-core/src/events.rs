//! Typed turn events decoded from stream frames.
//!
//! Backend payloads are loosely typed. Each known event name maps to one
//! variant; anything else is kept as [`TurnEvent::Unknown`] and forwarded.

use crate::stream::Frame;
use serde_json::Value;
use tether_types::TurnCoordinates;

/// One event on a turn's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Status line text (e.g. "queued", "Reading files").
    Status(String),
    /// Incremental response text.
    Token(String),
    /// Structured update; parsed later with recovery fallbacks.
    Update(String),
    Error(String),
    Interrupted(String),
    Done,
    /// Live coordinates of the turn on the backend.
    Turn(TurnCoordinates),
    /// Structured agent activity (reasoning, commands, file changes...).
    Activity(ActivityEvent),
    Unknown { event: String, data: String },
}

/// Structured app events from the live event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    Reasoning {
        item_id: Option<String>,
        delta: String,
    },
    Command {
        item_id: Option<String>,
        command: String,
        status: Option<String>,
        output: Option<String>,
        exit_code: Option<i64>,
    },
    FileChange {
        item_id: Option<String>,
        path: String,
        change: String,
    },
    ToolCall {
        item_id: Option<String>,
        tool: String,
        status: Option<String>,
        detail: Option<String>,
    },
    Error {
        message: String,
    },
}

impl TurnEvent {
    /// Decode a frame. Never fails: unparseable known frames degrade to the
    /// most useful text, unknown names become `Unknown`.
    pub fn from_frame(frame: &Frame) -> Self {
        let data = frame.data.as_str();
        match frame.event.as_str() {
            "status" => TurnEvent::Status(text_payload(data, &["status", "message", "text"]).trim().to_string()),
            "token" | "delta" => TurnEvent::Token(text_payload(data, &["delta", "text", "token"])),
            "update" => TurnEvent::Update(data.to_string()),
            "error" => TurnEvent::Error(text_payload(data, &["detail", "message", "error"])),
            "interrupted" => TurnEvent::Interrupted(text_payload(data, &["detail", "message", "reason"])),
            "done" => TurnEvent::Done,
            "turn" => match parse_coordinates(data) {
                Some(coords) => TurnEvent::Turn(coords),
                None => unknown(frame),
            },
            other => match ActivityEvent::parse(other, data) {
                Some(activity) => TurnEvent::Activity(activity),
                None => unknown(frame),
            },
        }
    }
}

impl ActivityEvent {
    fn parse(event: &str, data: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(data).unwrap_or(Value::Null);
        let item_id = str_field(&value, &["itemId", "item_id", "id"]);

        match event {
            "reasoning" | "reasoning_delta" => Some(ActivityEvent::Reasoning {
                item_id,
                delta: text_payload(data, &["delta", "text"]),
            }),
            "command" | "command_execution" | "exec" => Some(ActivityEvent::Command {
                item_id,
                command: str_field(&value, &["command", "cmd"]).unwrap_or_default(),
                status: str_field(&value, &["status"]),
                output: str_field(&value, &["output", "aggregatedOutput", "delta"]),
                exit_code: value
                    .get("exitCode")
                    .or_else(|| value.get("exit_code"))
                    .and_then(Value::as_i64),
            }),
            "file_change" | "fileChange" | "patch_apply" => Some(ActivityEvent::FileChange {
                item_id,
                path: str_field(&value, &["path", "file"]).unwrap_or_default(),
                change: str_field(&value, &["kind", "change", "type"]).unwrap_or_else(|| "modified".to_string()),
            }),
            "tool_call" | "toolCall" | "mcp_tool_call" => Some(ActivityEvent::ToolCall {
                item_id,
                tool: str_field(&value, &["tool", "name"]).unwrap_or_else(|| "tool".to_string()),
                status: str_field(&value, &["status"]),
                detail: str_field(&value, &["detail", "result", "arguments"]),
            }),
            "app_error" => Some(ActivityEvent::Error {
                message: text_payload(data, &["message", "detail"]),
            }),
            _ => None,
        }
    }
}

fn unknown(frame: &Frame) -> TurnEvent {
    TurnEvent::Unknown {
        event: frame.event.clone(),
        data: frame.data.clone(),
    }
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Extract text from a payload that may be a JSON string, an object with one
/// of `keys`, or raw text.
fn text_payload(data: &str, keys: &[&str]) -> String {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::String(s)) => s,
        Ok(value @ Value::Object(_)) => str_field(&value, keys).unwrap_or_default(),
        _ => data.to_string(),
    }
}

fn parse_coordinates(data: &str) -> Option<TurnCoordinates> {
    let value: Value = serde_json::from_str(data).ok()?;
    Some(TurnCoordinates {
        thread_id: str_field(&value, &["threadId", "thread_id"])?,
        turn_id: str_field(&value, &["turnId", "turn_id"])?,
        agent: str_field(&value, &["agent"])?,
    })
}
