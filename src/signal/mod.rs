//! Reload signalling to viewers and cascading rebuilds of dependents.

pub mod cascade;
pub mod dispatch;
pub mod store;

pub use dispatch::{ReloadSignal, SignalDispatcher, Viewport};
pub use store::MemoryStore;
