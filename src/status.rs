// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use chrono::{DateTime, Local};
use log::info;

#[derive(Clone, Debug)]
pub struct StatusEntry {
    pub time: DateTime<Local>,
    pub message: String,
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.time.format("%H:%M:%S"), self.message)
    }
}

/// User-facing progress messages, newest last. Each update is also logged.
#[derive(Clone, Debug, Default)]
pub struct StatusLog {
    entries: Vec<StatusEntry>,
}

impl StatusLog {
    pub fn new() -> Self {
        StatusLog::default()
    }

    pub fn update(&mut self, message: impl Into<String>) {
        self.update_at(message, Local::now());
    }

    pub fn update_at(&mut self, message: impl Into<String>, time: DateTime<Local>) {
        let entry = StatusEntry { time, message: message.into() };
        info!("Status: {}", entry.message);
        self.entries.push(entry);
    }

    /// The most recent message.
    pub fn current(&self) -> Option<&str> {
        self.entries.last().map(|entry| entry.message.as_str())
    }

    pub fn entries(&self) -> &[StatusEntry] {
        &self.entries
    }

    /// All entries, one per line.
    pub fn render(&self) -> String {
        self.entries.iter().map(|entry| entry.to_string())
            .collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn render_prefixes_time() {
        let mut log = StatusLog::new();
        assert_eq!(log.current(), None);
        assert_eq!(log.render(), "");
        let when = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 3).unwrap();
        log.update_at("Starting photo capture", when);
        log.update_at("Processing image", when + chrono::Duration::seconds(61));
        assert_eq!(log.current(), Some("Processing image"));
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.render(),
                   "[07:05:03] Starting photo capture\n[07:06:04] Processing image");
    }
}
