use crate::modules::ports::LogPort;
use chrono::{DateTime, Local};
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.text)
    }
}

/// In-memory rolling log. Insertion order is display order.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn texts(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.text).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|g| g.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogPort for MemoryLog {
    fn append(&self, text: &str) {
        let entry = LogEntry {
            timestamp: Local::now(),
            text: text.to_string(),
        };
        tracing::info!(target: "tipswitch::log", "{}", entry.text);
        let mut g = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        g.push(entry);
    }
}
