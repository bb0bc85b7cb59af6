use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::agent::LinkError;

/// Value stored in a plant tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Boolean coil / bit.
    Bool(bool),
    /// Numeric register.
    Number(f64),
    /// String data block.
    Text(String),
}

impl TagValue {
    /// Returns the boolean value, treating non-zero numbers as true.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Number(value) => Some(*value != 0.0),
            Self::Text(_) => None,
        }
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    /// Returns the text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Bool(_) | Self::Number(_) => None,
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Tag-addressed read/write access to the plant control system.
///
/// Reads return `None` on transient failure. Writes are idempotent and report
/// success as a boolean.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Whether the client currently holds a live connection.
    fn is_connected(&self) -> bool;

    /// Opens the connection.
    async fn connect(&self) -> Result<(), LinkError>;

    /// Closes the connection.
    async fn disconnect(&self);

    /// Reads a tag.
    async fn read(&self, tag: &str) -> Option<TagValue>;

    /// Writes a tag.
    async fn write(&self, tag: &str, value: TagValue) -> bool;

    /// Reads a boolean tag.
    async fn read_bool(&self, tag: &str) -> Option<bool> {
        self.read(tag).await.and_then(|value| value.as_bool())
    }

    /// Reads a text tag.
    async fn read_text(&self, tag: &str) -> Option<String> {
        self.read(tag)
            .await
            .and_then(|value| value.as_text().map(str::to_string))
    }
}

/// In-memory tag table standing in for the plant control system.
///
/// The `set` method plays the plant side (conveyance signals); `write` is the
/// cell side and is journaled so tests can assert on emitted tags.
#[derive(Debug, Default)]
pub struct MemorySignalBus {
    tags: RwLock<IndexMap<String, TagValue>>,
    journal: RwLock<Vec<(String, TagValue)>>,
    connected: AtomicBool,
    reads_fail: AtomicBool,
}

impl MemorySignalBus {
    /// Creates a connected bus with no tags.
    #[must_use]
    pub fn connected() -> Self {
        let bus = Self::default();
        bus.connected.store(true, Ordering::SeqCst);
        bus
    }

    /// Plant-side assignment; not journaled.
    pub fn set(&self, tag: &str, value: impl Into<TagValue>) {
        self.tags.write().insert(tag.to_string(), value.into());
    }

    /// Current value without going through the client path.
    #[must_use]
    pub fn peek(&self, tag: &str) -> Option<TagValue> {
        self.tags.read().get(tag).cloned()
    }

    /// Every cell-side write in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(String, TagValue)> {
        self.journal.read().clone()
    }

    /// Cell-side writes to one tag, in order.
    #[must_use]
    pub fn writes_to(&self, tag: &str) -> Vec<TagValue> {
        self.journal
            .read()
            .iter()
            .filter(|(name, _)| name == tag)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Forces the connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes every read return `None` until cleared.
    pub fn set_reads_fail(&self, fail: bool) {
        self.reads_fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalBus for MemorySignalBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), LinkError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn read(&self, tag: &str) -> Option<TagValue> {
        if !self.is_connected() || self.reads_fail.load(Ordering::SeqCst) {
            return None;
        }
        self.tags.read().get(tag).cloned()
    }

    async fn write(&self, tag: &str, value: TagValue) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.tags.write().insert(tag.to_string(), value.clone());
        self.journal.write().push((tag.to_string(), value));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_visible_and_journaled() {
        let bus = MemorySignalBus::connected();
        assert!(bus.write("station_1_complete", true.into()).await);
        assert!(bus.write("station_1_complete", true.into()).await);
        assert_eq!(bus.read_bool("station_1_complete").await, Some(true));
        assert_eq!(bus.writes_to("station_1_complete").len(), 2);
    }

    #[tokio::test]
    async fn disconnected_bus_rejects_io() {
        let bus = MemorySignalBus::default();
        bus.set("agv_arrived", true);
        assert_eq!(bus.read("agv_arrived").await, None);
        assert!(!bus.write("bypass_on", true.into()).await);
        bus.connect().await.unwrap();
        assert_eq!(bus.read_bool("agv_arrived").await, Some(true));
    }

    #[test]
    fn numbers_coerce_to_bool() {
        assert_eq!(TagValue::Number(1.0).as_bool(), Some(true));
        assert_eq!(TagValue::Number(0.0).as_bool(), Some(false));
        assert_eq!(TagValue::from("SEDAN").as_bool(), None);
    }
}
