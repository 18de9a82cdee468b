//! Structured audit trail for loading, compiling and running a model.
//!
//! Each model load and each run context owns its own `AuditLog`; nothing is
//! global. Every record is mirrored to the `log` facade so an embedding binary
//! can route it with whatever logger it installs.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    Load,
    Replacement,
    Option,
    Compile,
    NumericCorrection,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogCategory::Load => "load",
            LogCategory::Replacement => "replacement",
            LogCategory::Option => "option",
            LogCategory::Compile => "compile",
            LogCategory::NumericCorrection => "numeric",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub category: LogCategory,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    entries: Vec<LogEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. `warn` raises the mirrored record to warning level.
    pub fn record(&mut self, category: LogCategory, message: impl Into<String>, warn: bool) {
        let message = message.into();
        if warn {
            log::warn!(target: "canopy_core", "[{}] {}", category, message);
        } else {
            log::debug!(target: "canopy_core", "[{}] {}", category, message);
        }
        self.entries.push(LogEntry {
            timestamp: SystemTime::now(),
            category,
            message,
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn of_category(&self, category: LogCategory) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.category == category)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends copies of all entries of `other`, keeping their timestamps.
    pub fn extend_from(&mut self, other: &AuditLog) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// One line per entry: seconds since the epoch, category, message.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let secs = entry
                .timestamp
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let _ = writeln!(out, "{:.3} [{}] {}", secs, entry.category, entry.message);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_filter() {
        let mut log = AuditLog::new();
        log.record(LogCategory::Load, "Merged 3 variable(s) from base", false);
        log.record(LogCategory::Replacement, "Replaced definition of 'c'", true);

        assert_eq!(log.len(), 2);
        assert_eq!(log.of_category(LogCategory::Replacement).count(), 1);
        let rendered = log.render();
        assert!(rendered.contains("[replacement] Replaced definition of 'c'"));
        assert_eq!(rendered.lines().count(), 2);
    }

    #[test]
    fn test_extend_keeps_order() {
        let mut load = AuditLog::new();
        load.record(LogCategory::Load, "first", false);
        let mut run = AuditLog::new();
        run.extend_from(&load);
        run.record(LogCategory::NumericCorrection, "second", false);
        let messages: Vec<_> = run.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }
}
