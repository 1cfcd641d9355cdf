// src/logs.rs
//
// =============================================================================
// DATALAB: NOTIFICATION BUFFER
// =============================================================================
//
// A bounded buffer of transient user notifications (rejected edits, failed
// requests, settled joins). The session writes, the UI reads and renders.
// Every notification is also forwarded to the `log` facade.

use chrono::{DateTime, Local};
use log::Level;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub at: DateTime<Local>,
    pub level: Level,
    pub message: String,
}

impl Notification {
    pub fn render(&self) -> String {
        format!("[{} {}] {}", self.at.format("%H:%M:%S"), self.level, self.message)
    }
}

#[derive(Clone)]
pub struct NotificationBuffer {
    // Shared with UI readers.
    lines: Arc<Mutex<VecDeque<Notification>>>,
    capacity: usize,
}

impl NotificationBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        // A panicking reader cannot corrupt a queue of plain values.
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a notification, dropping the oldest if full.
    pub fn push(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{}", message);
        let mut lines = self.guard();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(Notification {
            at: Local::now(),
            level,
            message,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(Level::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(Level::Error, message);
    }

    /// Snapshot for rendering.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.guard().iter().cloned().collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.guard().iter().map(|n| n.message.clone()).collect()
    }

    /// Removes and returns everything (the UI has shown it).
    pub fn drain(&self) -> Vec<Notification> {
        self.guard().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
