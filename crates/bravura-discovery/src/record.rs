//! Discovery records and the bracketing collector.
//!
//! A scanner child reports each discovered unit as a run of field messages
//! bracketed by `init` and `end` sentinels. Standalone error/warning/info
//! lines may appear anywhere, including outside any bracket.

use bravura_bridge::{Message, RecordKey, Severity};

/// One discovered plugin unit. Field order is the order the scanner
/// reported them in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginRecord {
    fields: Vec<(RecordKey, String)>,
}

impl PluginRecord {
    pub fn get(&self, key: RecordKey) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_u32(&self, key: RecordKey) -> Option<u32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i64(&self, key: RecordKey) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn set(&mut self, key: RecordKey, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (RecordKey, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A standalone diagnostic line from the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub text: String,
}

/// Accumulates scanner output into completed records and notifications.
///
/// Malformed sequences - a field outside any bracket, a nested `init`, a
/// stray `end` - are logged and skipped; the stream keeps flowing. Records
/// are only surfaced once their closing `end` arrives, so a crash mid-unit
/// never yields a half-reported record.
#[derive(Debug, Default)]
pub struct RecordCollector {
    current: Option<PluginRecord>,
    records: Vec<PluginRecord>,
    notifications: Vec<Notification>,
}

impl RecordCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded message. Returns whether the message belonged to
    /// the discovery vocabulary at all.
    pub fn feed(&mut self, msg: &Message) -> bool {
        match msg {
            Message::Init => {
                if self.current.is_some() {
                    tracing::warn!("scanner opened a record inside another, discarding the outer");
                }
                self.current = Some(PluginRecord::default());
                true
            }
            Message::End => {
                match self.current.take() {
                    Some(record) => self.records.push(record),
                    None => tracing::warn!("scanner closed a record it never opened"),
                }
                true
            }
            Message::Field { key, value } => {
                match self.current.as_mut() {
                    Some(record) => record.set(*key, value.clone()),
                    None => {
                        tracing::warn!(key = key.as_str(), "scanner field outside any record")
                    }
                }
                true
            }
            Message::Notify { severity, text } => {
                self.notifications.push(Notification {
                    severity: *severity,
                    text: text.clone(),
                });
                true
            }
            _ => false,
        }
    }

    /// Whether a record is open and unfinished.
    pub fn in_record(&self) -> bool {
        self.current.is_some()
    }

    pub fn records(&self) -> &[PluginRecord] {
        &self.records
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Consume the collector, abandoning any unfinished record.
    pub fn finish(mut self) -> (Vec<PluginRecord>, Vec<Notification>) {
        if self.current.take().is_some() {
            tracing::debug!("discarding unterminated record");
        }
        (self.records, self.notifications)
    }
}
