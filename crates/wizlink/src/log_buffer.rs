//! Bounded in-memory log.
//!
//! A tracing layer that keeps the most recent events so `simulate
//! --show-log` can print them after the run, independent of the stderr
//! verbosity.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Entries kept before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 512;

/// One captured event.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Structured fields as `key=value`, comma separated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>5} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.message
        )?;
        if let Some(ref fields) = self.fields {
            write!(f, " {fields}")?;
        }
        Ok(())
    }
}

/// Shared ring buffer handle. Clones see the same entries.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A layer feeding this buffer with events at `min_level` or more severe.
    pub fn layer(&self, min_level: Level) -> LogBufferLayer {
        LogBufferLayer {
            buffer: self.clone(),
            min_level,
        }
    }
}

// ── Layer ───────────────────────────────────────────────────────────

pub struct LogBufferLayer {
    buffer: LogBuffer,
    min_level: Level,
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        if level > self.min_level {
            return;
        }

        let mut message = String::new();
        let mut fields = Vec::new();
        event.record(&mut MessageVisitor {
            message: &mut message,
            fields: &mut fields,
        });

        self.buffer.push(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: metadata.target().to_owned(),
            message,
            fields: (!fields.is_empty()).then(|| fields.join(", ")),
        });
    }
}

struct MessageVisitor<'a> {
    message: &'a mut String,
    fields: &'a mut Vec<String>,
}

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            *self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(self.message);
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: "INFO".into(),
            target: "test".into(),
            message: message.into(),
            fields: None,
        }
    }

    #[test]
    fn oldest_entries_rotate_out() {
        let buffer = LogBuffer::new(2);
        buffer.push(entry("one"));
        buffer.push(entry("two"));
        buffer.push(entry("three"));

        let messages: Vec<_> = buffer.tail(10).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, ["two", "three"]);
    }

    #[test]
    fn tail_returns_most_recent_in_order() {
        let buffer = LogBuffer::default();
        for m in ["a", "b", "c", "d"] {
            buffer.push(entry(m));
        }
        let messages: Vec<_> = buffer.tail(2).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, ["c", "d"]);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn layer_captures_message_and_fields() {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::registry().with(buffer.layer(Level::DEBUG));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(channel = "data1", value = 7, "push failed");
            tracing::debug!("advertising started");
            tracing::trace!("dropped by level");
        });

        let entries = buffer.tail(10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, "WARN");
        assert_eq!(entries[0].message, "push failed");
        assert_eq!(entries[0].fields.as_deref(), Some("channel=data1, value=7"));
        assert_eq!(entries[1].message, "advertising started");
        assert!(entries[1].to_string().contains("DEBUG advertising started"));
    }
}
