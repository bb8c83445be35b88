//! Update payload parsing with layered recovery.
//!
//! Update payloads routinely carry code patches full of quotes, backslashes
//! and newlines, and lossy transports mangle exactly those characters. Parsing
//! therefore tries the payload as-is, then three alternate unescaping
//! transforms, then pattern extraction of just the `patch` text or `drafts`
//! map. It never fails: the worst case is an empty payload that leaves the
//! current draft untouched.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use tether_types::Draft;
use tracing::{debug, warn};

static PATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)"patch"\s*:\s*"(.*?)"\s*(?:,\s*"[A-Za-z_]+"\s*:|\}\s*$)"#).unwrap()
});

static DRAFTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)"drafts"\s*:\s*\{(.*?)\}\s*(?:,|\}\s*$)"#).unwrap());

static DRAFT_ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

static BASE_HASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(?:baseHash|base_hash)"\s*:\s*"([0-9A-Fa-f]+)""#).unwrap());

/// Structured content of an `update` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePayload {
    /// Full proposed document
    pub content: Option<String>,
    /// Unified diff; `Some("")` means the agent explicitly proposed nothing
    pub patch: Option<String>,
    /// Per-path proposed contents
    pub drafts: BTreeMap<String, String>,
    pub base_hash: Option<String>,
    pub agent_message: Option<String>,
    /// The payload said outright that there is no draft
    pub explicit_none: bool,
}

/// Which layer of parsing produced the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Direct,
    ControlCharsEscaped,
    StringDecoded,
    DoubleEscapesCollapsed,
    PatternExtracted,
    Unparsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUpdate {
    pub payload: UpdatePayload,
    pub strategy: ParseStrategy,
}

/// What an update means for the target's current draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftDirective {
    Install(Draft),
    Clear,
    Keep,
}

impl UpdatePayload {
    /// Read a payload from an already-parsed JSON value.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut payload = UpdatePayload {
            content: string_at(value, &["content"]),
            patch: string_at(value, &["patch"]),
            drafts: drafts_at(value),
            base_hash: string_at(value, &["baseHash", "base_hash"]),
            agent_message: string_at(value, &["agentMessage", "agent_message", "message"]),
            explicit_none: matches!(obj.get("hasDraft"), Some(Value::Bool(false)))
                || matches!(obj.get("draft"), Some(Value::Null)),
        };

        // Some backends nest the draft one level down.
        if let Some(nested @ Value::Object(_)) = obj.get("draft") {
            if let Some(inner) = UpdatePayload::from_value(nested) {
                payload.content = payload.content.or(inner.content);
                payload.patch = payload.patch.or(inner.patch);
                payload.base_hash = payload.base_hash.or(inner.base_hash);
                if payload.drafts.is_empty() {
                    payload.drafts = inner.drafts;
                }
            }
        }

        Some(payload)
    }

    /// Decide what to do with the target's draft.
    pub fn draft_directive(&self) -> DraftDirective {
        if self.explicit_none {
            return DraftDirective::Clear;
        }
        let patch = self.patch.clone().unwrap_or_default();
        if !patch.is_empty() || !self.drafts.is_empty() {
            let mut draft = Draft::new(patch);
            draft.content = self.content.clone();
            draft.drafts = self.drafts.clone();
            draft.base_hash = self.base_hash.clone();
            draft.agent_message = self.agent_message.clone();
            return DraftDirective::Install(draft);
        }
        if self.patch.is_some() {
            return DraftDirective::Clear;
        }
        DraftDirective::Keep
    }
}

/// Parse an update payload, falling back through the recovery layers.
pub fn parse_update(raw: &str) -> ParsedUpdate {
    let raw = raw.trim();

    if let Some(payload) = try_parse(raw) {
        return ParsedUpdate { payload, strategy: ParseStrategy::Direct };
    }

    let transforms: [(ParseStrategy, fn(&str) -> Option<String>); 3] = [
        (ParseStrategy::ControlCharsEscaped, |s| Some(escape_control_chars_in_strings(s))),
        (ParseStrategy::StringDecoded, decode_string_wrapped),
        (ParseStrategy::DoubleEscapesCollapsed, |s| Some(escape_control_chars_in_strings(&collapse_double_escapes(s)))),
    ];

    for (strategy, transform) in transforms {
        if let Some(candidate) = transform(raw) {
            if let Some(payload) = try_parse(&candidate) {
                debug!(target: "tether::turn", "Recovered update payload via {:?}", strategy);
                return ParsedUpdate { payload, strategy };
            }
        }
    }

    if let Some(payload) = extract_by_pattern(raw) {
        warn!(target: "tether::turn", "Update payload unparseable; extracted draft by pattern");
        return ParsedUpdate { payload, strategy: ParseStrategy::PatternExtracted };
    }

    warn!(target: "tether::turn", "Dropping unparseable update payload ({} bytes)", raw.len());
    ParsedUpdate {
        payload: UpdatePayload::default(),
        strategy: ParseStrategy::Unparsed,
    }
}

fn try_parse(candidate: &str) -> Option<UpdatePayload> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    UpdatePayload::from_value(&value)
}

fn string_at(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
}

fn drafts_at(value: &Value) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = value.get("drafts") else {
        return BTreeMap::new();
    };
    map.iter()
        .map(|(path, content)| {
            let text = match content {
                Value::String(s) => s.clone(),
                other => string_at(other, &["content", "patch"]).unwrap_or_else(|| other.to_string()),
            };
            (path.clone(), text)
        })
        .collect()
}

/// Transform 1: escape raw control characters inside JSON string literals.
///
/// A backslash followed by a raw line break becomes the `\n` escape.
fn escape_control_chars_in_strings(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }

        if escaped {
            escaped = false;
            match c {
                '\n' => out.push('n'),
                '\r' => out.push('r'),
                '\t' => out.push('t'),
                _ => out.push(c),
            }
            continue;
        }

        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Transform 2: the payload was itself serialized as a JSON string.
fn decode_string_wrapped(input: &str) -> Option<String> {
    if !input.starts_with('"') {
        return None;
    }
    serde_json::from_str::<String>(input)
        .or_else(|_| serde_json::from_str::<String>(&escape_control_chars_in_strings(input)))
        .ok()
        .map(|inner| escape_control_chars_in_strings(&inner))
}

/// Transform 3: undo one level of escaping applied to the whole payload.
fn collapse_double_escapes(input: &str) -> String {
    input.replace("\\\"", "\"").replace("\\\\", "\\")
}

/// Unescape the body of a JSON string literal captured by a pattern.
fn unescape_fragment(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut chars = fragment.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('\n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn extract_by_pattern(raw: &str) -> Option<UpdatePayload> {
    let patch = PATCH_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| unescape_fragment(m.as_str()));

    let drafts: BTreeMap<String, String> = DRAFTS_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|body| {
            DRAFT_ENTRY_RE
                .captures_iter(body.as_str())
                .filter_map(|entry| {
                    let path = entry.get(1)?.as_str();
                    let content = entry.get(2)?.as_str();
                    Some((unescape_fragment(path), unescape_fragment(content)))
                })
                .collect()
        })
        .unwrap_or_default();

    if patch.is_none() && drafts.is_empty() {
        return None;
    }

    Some(UpdatePayload {
        patch,
        drafts,
        base_hash: BASE_HASH_RE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string()),
        ..UpdatePayload::default()
    })
}
