//! Reload signals and viewport records.
//!
//! Signals are latest-value-wins: publishing overwrites the document's
//! `reload` record, nothing is queued or retried.

use super::store::{SharedStore, StoreEvent, document_key};
use crate::document::BuildStatus;
use crate::log;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

pub const RELOAD_KEY: &str = "reload";
pub const VIEWPORT_KEY: &str = "viewport";
/// Transient build status announcements; never stored.
pub const STATUS_KEY: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadKind {
    /// Only the listed pages changed.
    Partial,
    /// Every page may have changed.
    Full,
}

/// Tells viewers to reload page artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSignal {
    #[serde(rename = "type")]
    pub kind: ReloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<u32>>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ReloadSignal {
    pub fn partial(pages: Vec<u32>) -> Self {
        Self {
            kind: ReloadKind::Partial,
            pages: Some(pages),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn full() -> Self {
        Self {
            kind: ReloadKind::Full,
            pages: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Viewer-reported visible pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub pages: Vec<u32>,
}

/// Publishes signals and reads viewports through the shared store.
#[derive(Clone)]
pub struct SignalDispatcher {
    store: Arc<dyn SharedStore>,
}

impl std::fmt::Debug for SignalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalDispatcher").finish_non_exhaustive()
    }
}

impl SignalDispatcher {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn publish(&self, document: &str, signal: &ReloadSignal) {
        let value = match serde_json::to_value(signal) {
            Ok(value) => value,
            Err(e) => {
                log!("error"; "{document}: failed to encode reload signal: {e}");
                return;
            }
        };
        match &signal.pages {
            Some(pages) => log!("signal"; "{document}: partial reload {pages:?}"),
            None => log!("signal"; "{document}: full reload"),
        }
        self.store.set(&document_key(document, RELOAD_KEY), value);
    }

    /// Most recently published signal.
    pub fn latest(&self, document: &str) -> Option<ReloadSignal> {
        let value = self.store.get(&document_key(document, RELOAD_KEY))?;
        serde_json::from_value(value).ok()
    }

    pub fn set_viewport(&self, document: &str, viewport: &Viewport) {
        if let Ok(value) = serde_json::to_value(viewport) {
            self.store.set(&document_key(document, VIEWPORT_KEY), value);
        }
    }

    /// Forget the viewport; priority rendering falls back to page 1.
    pub fn clear_viewport(&self, document: &str) {
        self.store.delete(&document_key(document, VIEWPORT_KEY));
    }

    pub fn viewport(&self, document: &str) -> Option<Viewport> {
        let value = self.store.get(&document_key(document, VIEWPORT_KEY))?;
        serde_json::from_value(value).ok()
    }

    /// Tell viewers about a status change without touching the stored records.
    pub fn announce_status(&self, document: &str, status: BuildStatus) {
        self.store
            .broadcast(&document_key(document, STATUS_KEY), json!({ "status": status }));
    }

    pub fn observe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.observe()
    }

    /// Pages to render first: the visible ones, `[1]` when unknown.
    pub fn priority_pages(&self, document: &str) -> Vec<u32> {
        let mut pages = self
            .viewport(document)
            .map(|v| v.pages)
            .unwrap_or_default();
        pages.retain(|&p| p > 0);
        pages.sort_unstable();
        pages.dedup();
        if pages.is_empty() {
            pages.push(1);
        }
        pages
    }
}

/// Document name of a per-document `name` record key.
fn record_document<'a>(key: &'a str, name: &str) -> Option<&'a str> {
    key.strip_suffix(name)?.strip_suffix('/')
}

/// Log viewport changes until the store goes away.
///
/// Returns the number of changes seen.
pub async fn trace_viewers(mut events: broadcast::Receiver<StoreEvent>) -> usize {
    let mut seen = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                log!("viewer"; "missed {missed} store events");
                continue;
            }
            Err(RecvError::Closed) => return seen,
        };
        let Some(document) = record_document(event.key(), VIEWPORT_KEY) else {
            continue;
        };
        match &event {
            StoreEvent::Set { value, .. } => {
                let pages = serde_json::from_value::<Viewport>(value.clone())
                    .map(|v| v.pages)
                    .unwrap_or_default();
                log!("viewer"; "{document}: showing pages {pages:?}");
            }
            StoreEvent::Deleted { .. } => log!("viewer"; "{document}: viewport cleared"),
            StoreEvent::Broadcast { .. } => continue,
        }
        seen += 1;
    }
}
