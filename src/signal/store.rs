//! Shared document store contract.
//!
//! The real store is a replicated document shared with the annotation UI.
//! The build side only needs a key/value view of it plus change
//! notifications, so that is all [`SharedStore`] exposes.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::broadcast;

/// Observers lagging more than this many events miss the oldest ones.
const EVENT_CAPACITY: usize = 64;

/// A change observed on the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Set { key: String, value: Value },
    Deleted { key: String },
    /// Transient message, never stored.
    Broadcast { key: String, value: Value },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Deleted { key } | Self::Broadcast { key, .. } => key,
        }
    }
}

pub trait SharedStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// Store `value`, replacing any previous one.
    fn set(&self, key: &str, value: Value);

    fn delete(&self, key: &str);

    /// Subscribe to every subsequent change.
    fn observe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Notify observers without storing anything.
    fn broadcast(&self, key: &str, value: Value);
}

/// Namespaced key of a per-document record.
pub fn document_key(document: &str, name: &str) -> String {
    format!("{document}/{name}")
}

/// In-process store.
#[derive(Debug)]
pub struct MemoryStore {
    values: RwLock<FxHashMap<String, Value>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            values: RwLock::new(FxHashMap::default()),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }
}

impl MemoryStore {
    fn emit(&self, event: StoreEvent) {
        // no observers is fine
        let _ = self.events.send(event);
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_owned(), value.clone());
        self.emit(StoreEvent::Set {
            key: key.to_owned(),
            value,
        });
    }

    fn delete(&self, key: &str) {
        if self.values.write().remove(key).is_some() {
            self.emit(StoreEvent::Deleted {
                key: key.to_owned(),
            });
        }
    }

    fn observe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn broadcast(&self, key: &str, value: Value) {
        self.emit(StoreEvent::Broadcast {
            key: key.to_owned(),
            value,
        });
    }
}
