//! Debounce state machines for the build scheduler.
//!
//! Both timers are plain data driven by explicit `now` arguments, so they can
//! be tested without waiting on a real clock. The scheduler actor turns their
//! deadlines into `sleep_until` futures.
//!
//! ```text
//!            change               deadline reached
//!   Idle ───────────▶ Pending ─────────────────────▶ Running
//!    ▲                  ▲  │ change (deadline reset)    │
//!    │                  └──┘                            │
//!    │                  ▲         change                │
//!    │                  └───────────────────────────────┤
//!    └──────────────────────────────────────────────────┘
//!                         job finished
//! ```

use crate::utils::category::ChangeKind;
use rustc_hash::FxHashSet;
use std::{path::PathBuf, time::Duration};
use tokio::time::Instant;

/// Changes collected during one debounce window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub paths: Vec<PathBuf>,
    /// Strongest change kind in the batch.
    pub kind: ChangeKind,
}

impl Batch {
    pub fn is_structural(&self) -> bool {
        self.kind == ChangeKind::Structural
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Pending { deadline: Instant },
    Running,
}

/// Short build debounce: batches rapid change notifications into one build.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: State,
    pending: FxHashSet<PathBuf>,
    kind: ChangeKind,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: State::Idle,
            pending: FxHashSet::default(),
            kind: ChangeKind::Ignored,
        }
    }

    /// Record a change; (re)starts the quiet window.
    pub fn add(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        if kind == ChangeKind::Ignored {
            return;
        }
        self.pending.insert(path);
        self.kind = self.kind.max(kind);
        self.state = State::Pending {
            deadline: now + self.window,
        };
    }

    /// When the pending batch becomes ready, if any.
    pub const fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Take the batch if its window has elapsed, entering `Running`.
    pub fn fire(&mut self, now: Instant) -> Option<Batch> {
        match self.state {
            State::Pending { deadline } if now >= deadline => {
                self.state = State::Running;
                let mut paths: Vec<_> = self.pending.drain().collect();
                paths.sort();
                let kind = std::mem::replace(&mut self.kind, ChangeKind::Ignored);
                Some(Batch { paths, kind })
            }
            _ => None,
        }
    }

    /// The build started by the last batch finished its foreground part.
    pub fn finish(&mut self) {
        if self.state == State::Running {
            self.state = State::Idle;
        }
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }
}

/// Long extraction debounce: one extraction per idle period.
///
/// Every qualifying build completion resets (not extends) the deadline.
#[derive(Debug)]
pub struct ExtractionTimer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl ExtractionTimer {
    pub const fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once per armed deadline.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(200);

    fn path(name: &str) -> PathBuf {
        PathBuf::from(format!("/proj/{name}"))
    }

    #[test]
    fn test_burst_coalesces_into_one_batch() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);

        for i in 0..5u64 {
            let now = start + Duration::from_millis(i * 50);
            debouncer.add(path("main.tex"), ChangeKind::Body, now);
            assert!(debouncer.fire(now).is_none());
        }

        let last = start + Duration::from_millis(200);
        assert_eq!(debouncer.deadline(), Some(last + WINDOW));
        assert!(debouncer.fire(last + Duration::from_millis(199)).is_none());

        let batch = debouncer.fire(last + WINDOW).unwrap();
        assert_eq!(batch.paths, vec![path("main.tex")]);
        assert_eq!(batch.kind, ChangeKind::Body);
        assert!(debouncer.is_running());
        assert!(debouncer.fire(last + WINDOW * 10).is_none());
    }

    #[test]
    fn test_structural_wins_within_batch() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.add(path("main.tex"), ChangeKind::Body, now);
        debouncer.add(path("refs.bib"), ChangeKind::Structural, now);
        debouncer.add(path("main.tex"), ChangeKind::Body, now);

        let batch = debouncer.fire(now + WINDOW).unwrap();
        assert!(batch.is_structural());
        assert_eq!(batch.paths.len(), 2);
    }

    #[test]
    fn test_ignored_changes_do_not_arm() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.add(path("main.aux"), ChangeKind::Ignored, now);
        assert!(debouncer.deadline().is_none());
        assert!(debouncer.is_idle());
    }

    #[test]
    fn test_change_while_running_rearms() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.add(path("a.tex"), ChangeKind::Body, now);
        debouncer.fire(now + WINDOW).unwrap();

        debouncer.add(path("b.tex"), ChangeKind::Body, now + WINDOW);
        // finishing the old build must not drop the new batch
        debouncer.finish();
        assert!(!debouncer.is_idle());

        let batch = debouncer.fire(now + WINDOW * 2).unwrap();
        assert_eq!(batch.paths, vec![path("b.tex")]);
        debouncer.finish();
        assert!(debouncer.is_idle());
    }

    #[test]
    fn test_extraction_timer_reset_not_extended() {
        let start = Instant::now();
        let delay = Duration::from_secs(30);
        let mut timer = ExtractionTimer::new(delay);
        assert!(!timer.fire(start + delay));

        timer.reset(start);
        timer.reset(start + Duration::from_secs(10));
        assert!(!timer.fire(start + delay));
        assert!(timer.fire(start + Duration::from_secs(40)));
        // fires once per armed deadline
        assert!(!timer.fire(start + Duration::from_secs(80)));

        timer.reset(start);
        timer.cancel();
        assert!(timer.deadline().is_none());
    }
}
