//! Build orchestration.
//!
//! - [`job`]: job records, tokens and the stage error taxonomy
//! - [`debounce`]: change coalescing and the extraction timer
//! - [`pipeline`]: the stages of one build
//! - [`scheduler`]: one actor per document

pub mod debounce;
pub mod job;
pub mod pipeline;
pub mod scheduler;

pub use pipeline::{Pipeline, build_once};
pub use scheduler::{DocumentHandle, Scheduler};
