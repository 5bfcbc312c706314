//! Build jobs, their cancellation tokens and the stage error taxonomy.
//!
//! Every build gets a monotonically increasing generation. A [`JobToken`]
//! couples that generation with a cancellation token and the document's
//! "current generation" cell; a stage calls [`JobToken::ensure_current`]
//! before every side effect (file move, signal publish, table swap) so a
//! superseded job can never overwrite the newer job's results.

use crate::document::DocumentState;
use crate::log;
use crate::utils::exec::ExecError;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Phase
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPhase {
    Compiling,
    Converting,
    Extracting,
    Done,
    Failed,
    Cancelled,
}

/// One build of a document, as recorded on the status board.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub generation: u64,
    pub phase: BuildPhase,
    /// Ordered log lines, including captured tool output on failure.
    pub log: Vec<String>,
    pub started: DateTime<Local>,
}

impl BuildJob {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            phase: BuildPhase::Compiling,
            log: Vec::new(),
            started: Local::now(),
        }
    }
}

/// Log sink of one job: lines land in the job's status record and on the
/// terminal.
#[derive(Debug, Clone)]
pub struct JobLog {
    state: Arc<DocumentState>,
    generation: u64,
}

impl JobLog {
    pub fn new(state: Arc<DocumentState>, generation: u64) -> Self {
        Self { state, generation }
    }

    fn push(&self, lines: impl IntoIterator<Item = String>) {
        self.state.update_job(self.generation, |board| {
            if let Some(job) = &mut board.job {
                job.log.extend(lines);
            }
        });
    }

    /// Record a line and echo it under `module`.
    pub fn line(&self, module: &str, message: impl Into<String>) {
        let message = message.into();
        log!(module; "{}: {}", self.state.doc.name, message);
        self.push([message]);
    }

    /// Record captured tool output without echoing it.
    pub fn output(&self, output: &str) {
        self.push(output.lines().map(|l| l.trim_end().to_owned()));
    }

    pub fn phase(&self, phase: BuildPhase) {
        self.state.update_job(self.generation, |board| {
            if let Some(job) = &mut board.job {
                job.phase = phase;
            }
        });
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures of a pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// Compiler exited non-zero or produced no output. Fatal to the job.
    #[error("compile failed: {0}")]
    Compile(String),

    /// Converter failure. Logged, prior artifacts stay visible.
    #[error("render failed: {0}")]
    Render(String),

    /// Missing or unreadable cross-reference log. The lookup table goes stale.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// A newer build took over. Not an error from the user's point of view.
    #[error("superseded by a newer build")]
    Superseded,
}

impl StageError {
    /// Map a runner error into the taxonomy; cancellation means supersession.
    pub fn from_exec(err: ExecError, wrap: fn(String) -> Self) -> Self {
        match err {
            ExecError::Cancelled { .. } => Self::Superseded,
            other => wrap(other.to_string()),
        }
    }

    pub const fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

// ============================================================================
// Tokens
// ============================================================================

/// Monotonic generation counter of one document.
#[derive(Debug, Default, Clone)]
pub struct GenerationClock {
    current: Arc<AtomicU64>,
}

impl GenerationClock {
    /// Start a new generation; every older token stops being current.
    pub fn advance(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Token for `generation` bound to this clock.
    pub fn token(&self, generation: u64) -> JobToken {
        JobToken {
            generation,
            cancel: CancellationToken::new(),
            clock: self.clone(),
        }
    }
}

/// Generation-scoped cancellation token of a build job.
#[derive(Debug, Clone)]
pub struct JobToken {
    generation: u64,
    cancel: CancellationToken,
    clock: GenerationClock,
}

impl JobToken {
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Request cancellation; live subprocesses tied to the token are killed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Not cancelled, and no newer generation has started.
    pub fn is_current(&self) -> bool {
        !self.is_cancelled() && self.clock.current() == self.generation
    }

    /// Guard for side-effecting writes.
    pub fn ensure_current(&self) -> Result<(), StageError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(StageError::Superseded)
        }
    }

    /// Child token sharing the generation, cancelled with its parent.
    pub fn child(&self) -> Self {
        Self {
            generation: self.generation,
            cancel: self.cancel.child_token(),
            clock: self.clock.clone(),
        }
    }
}
