//! Bounded activity log for a turn.
//!
//! Entries live in a fixed-capacity ring buffer (oldest evicted first). An
//! auxiliary `item_id -> position` index lets repeated deltas for the same
//! backend item mutate one entry in place; the index is rebuilt from the
//! retained tail whenever an eviction shifts positions.

use crate::events::ActivityEvent;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tether_types::{EventKind, EventLogEntry};

/// Default number of entries retained per turn.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 200;

/// Longest summary kept on an entry before truncation.
const MAX_SUMMARY_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<EventLogEntry>,
    index: HashMap<String, usize>,
    capacity: usize,
    next_id: u64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_LOG_CAPACITY)),
            index: HashMap::new(),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &EventLogEntry> {
        self.entries.iter()
    }

    pub fn get_by_item(&self, item_id: &str) -> Option<&EventLogEntry> {
        self.index.get(item_id).and_then(|&pos| self.entries.get(pos))
    }

    /// Append a new entry, evicting the oldest when full. Returns its id.
    pub fn push(
        &mut self,
        kind: EventKind,
        title: impl Into<String>,
        detail: impl Into<String>,
        item_id: Option<String>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let detail = detail.into();
        let entry = EventLogEntry {
            id,
            title: title.into(),
            summary: summarize(&detail),
            detail,
            kind,
            timestamp: Utc::now(),
            item_id: item_id.clone(),
        };

        self.entries.push_back(entry);
        if let Some(item_id) = item_id {
            self.index.insert(item_id, self.entries.len() - 1);
        }

        if self.entries.len() > self.capacity {
            while self.entries.len() > self.capacity {
                self.entries.pop_front();
            }
            self.rebuild_index();
        }

        id
    }

    /// Update the entry for `item_id` in place, or append one if it is unknown.
    ///
    /// When `append` is set the detail is concatenated (streamed deltas);
    /// otherwise it replaces the previous detail.
    pub fn upsert(
        &mut self,
        kind: EventKind,
        item_id: &str,
        title: impl Into<String>,
        detail: &str,
        append: bool,
    ) -> u64 {
        if let Some(&pos) = self.index.get(item_id) {
            if let Some(entry) = self.entries.get_mut(pos) {
                if append {
                    entry.detail.push_str(detail);
                } else {
                    entry.detail = detail.to_string();
                }
                entry.title = title.into();
                entry.summary = summarize(&entry.detail);
                entry.timestamp = Utc::now();
                return entry.id;
            }
        }
        self.push(kind, title, detail, Some(item_id.to_string()))
    }

    /// Record a structured app event.
    pub fn record(&mut self, event: &ActivityEvent) -> u64 {
        match event {
            ActivityEvent::Reasoning { item_id, delta } => match item_id {
                Some(id) => self.upsert(EventKind::Reasoning, id, "Reasoning", delta, true),
                None => self.push(EventKind::Reasoning, "Reasoning", delta.clone(), None),
            },
            ActivityEvent::Command { item_id, command, status, output, exit_code } => {
                let title = match (status.as_deref(), exit_code) {
                    (_, Some(code)) => format!("$ {} (exit {})", command, code),
                    (Some(status), None) => format!("$ {} ({})", command, status),
                    (None, None) => format!("$ {}", command),
                };
                let detail = output.clone().unwrap_or_default();
                match item_id {
                    Some(id) => self.upsert(EventKind::Command, id, title, &detail, false),
                    None => self.push(EventKind::Command, title, detail, None),
                }
            }
            ActivityEvent::FileChange { item_id, path, change } => {
                let title = format!("{} {}", change, path);
                match item_id {
                    Some(id) => self.upsert(EventKind::FileChange, id, title, path, false),
                    None => self.push(EventKind::FileChange, title, path.clone(), None),
                }
            }
            ActivityEvent::ToolCall { item_id, tool, status, detail } => {
                let title = match status {
                    Some(status) => format!("{} ({})", tool, status),
                    None => tool.clone(),
                };
                let detail = detail.clone().unwrap_or_default();
                match item_id {
                    Some(id) => self.upsert(EventKind::ToolCall, id, title, &detail, false),
                    None => self.push(EventKind::ToolCall, title, detail, None),
                }
            }
            ActivityEvent::Error { message } => {
                self.push(EventKind::Error, "Error", message.clone(), None)
            }
        }
    }

    pub fn record_status(&mut self, status: &str) -> u64 {
        self.push(EventKind::Status, "Status", status, None)
    }

    /// Log an event the client does not understand as a generic entry.
    pub fn record_unknown(&mut self, event: &str, data: &str) -> u64 {
        self.push(EventKind::Other, event, data, None)
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (pos, entry) in self.entries.iter().enumerate() {
            if let Some(item_id) = &entry.item_id {
                self.index.insert(item_id.clone(), pos);
            }
        }
    }
}

fn summarize(detail: &str) -> String {
    let first_line = detail.trim().lines().next().unwrap_or("");
    if first_line.chars().count() > MAX_SUMMARY_CHARS {
        let truncated: String = first_line.chars().take(MAX_SUMMARY_CHARS - 3).collect();
        format!("{}...", truncated)
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasoning(id: &str, delta: &str) -> ActivityEvent {
        ActivityEvent::Reasoning { item_id: Some(id.into()), delta: delta.into() }
    }

    #[test]
    fn test_deltas_mutate_one_entry() {
        let mut log = EventLog::new(10);
        log.record(&reasoning("r1", "Looking "));
        log.record(&reasoning("r1", "at files"));
        assert_eq!(log.len(), 1);
        assert_eq!(log.get_by_item("r1").unwrap().detail, "Looking at files");
    }

    #[test]
    fn test_overflow_evicts_oldest_and_rebuilds_index() {
        let mut log = EventLog::new(3);
        log.record(&reasoning("a", "1"));
        log.record(&reasoning("b", "2"));
        log.record(&reasoning("c", "3"));
        log.record(&reasoning("d", "4"));

        assert_eq!(log.len(), 3);
        assert!(log.get_by_item("a").is_none());

        // Positions shifted; the index must still point at the right entries.
        log.record(&reasoning("b", "+"));
        assert_eq!(log.get_by_item("b").unwrap().detail, "2+");
        assert_eq!(log.get_by_item("d").unwrap().detail, "4");
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_evicted_item_gets_fresh_entry() {
        let mut log = EventLog::new(2);
        log.record(&reasoning("a", "old"));
        log.record_status("x");
        log.record_status("y");
        log.record(&reasoning("a", "new"));
        assert_eq!(log.get_by_item("a").unwrap().detail, "new");
    }

    #[test]
    fn test_command_title_and_replace() {
        let mut log = EventLog::new(10);
        log.record(&ActivityEvent::Command {
            item_id: Some("c1".into()),
            command: "cargo test".into(),
            status: Some("running".into()),
            output: None,
            exit_code: None,
        });
        log.record(&ActivityEvent::Command {
            item_id: Some("c1".into()),
            command: "cargo test".into(),
            status: Some("completed".into()),
            output: Some("ok\n".into()),
            exit_code: Some(0),
        });
        let entry = log.get_by_item("c1").unwrap();
        assert_eq!(entry.title, "$ cargo test (exit 0)");
        assert_eq!(entry.detail, "ok\n");
        assert_eq!(entry.kind, EventKind::Command);
    }

    #[test]
    fn test_summary_truncation() {
        let mut log = EventLog::new(4);
        let long = "x".repeat(500);
        log.record_unknown("heartbeat", &long);
        let entry = log.entries().next().unwrap();
        assert_eq!(entry.summary.chars().count(), MAX_SUMMARY_CHARS);
        assert!(entry.summary.ends_with("..."));
        assert_eq!(entry.kind, EventKind::Other);
    }
}
