//! Build scheduler: one actor task per primary document.
//!
//! The actor owns the document's debounce state, generation clock and the
//! running job. Everything else talks to it over a channel:
//!
//! ```text
//!  watcher / CLI ──Command──▶ ┌───────────────┐ ──spawn──▶ job task
//!                             │  actor (loop) │ ◀──Event── (foreground, background)
//!       debounce deadline ──▶ │               │ ──spawn──▶ extraction task
//!     extraction deadline ──▶ └───────────────┘
//! ```
//!
//! A build that fires while another is active cancels it, waits up to the
//! grace period for it to wind down, then starts regardless; the old job's
//! stages notice through their token and turn every remaining side effect
//! into a no-op.

use super::debounce::{Debouncer, ExtractionTimer};
use super::job::{BuildJob, BuildPhase, GenerationClock, JobToken, StageError};
use super::pipeline::{Foreground, Pipeline};
use crate::config::DocumentConfig;
use crate::document::{BuildStatus, Document, DocumentState};
use crate::log;
use crate::signal::cascade;
use crate::utils::category::{ChangeKind, categorize_path};
use chrono::Local;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until},
};

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum Command {
    /// A source file changed.
    Change(PathBuf),
    /// Build now, bypassing the debounce.
    Build { structural: bool },
    /// Extract the lookup table now.
    Extract,
    Shutdown,
}

#[derive(Debug)]
enum Event {
    Foreground {
        generation: u64,
        result: Result<Foreground, StageError>,
    },
    Background {
        generation: u64,
        result: Result<u32, StageError>,
    },
    Extracted {
        generation: u64,
        result: Result<usize, StageError>,
    },
}

// ============================================================================
// Handles
// ============================================================================

/// Sending side of a document actor plus its shared state.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    pub state: Arc<DocumentState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl DocumentHandle {
    fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn notify_change(&self, path: PathBuf) -> bool {
        self.send(Command::Change(path))
    }

    pub fn request_build(&self, structural: bool) -> bool {
        self.send(Command::Build { structural })
    }

    pub fn request_extraction(&self) -> bool {
        self.send(Command::Extract)
    }
}

/// All registered documents and their actors.
pub struct Scheduler {
    pipeline: Pipeline,
    states: FxHashMap<String, Arc<DocumentState>>,
    handles: FxHashMap<String, DocumentHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Register every configured document and spawn one actor per primary.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(pipeline: Pipeline) -> Self {
        let config = Arc::clone(&pipeline.config);
        let state_of = |doc: &DocumentConfig| {
            let state = Arc::new(DocumentState::new(Document::from_config(doc, &config)));
            state.restore_lookup();
            state
        };

        let states: FxHashMap<String, Arc<DocumentState>> = config
            .documents
            .iter()
            .map(|doc| (doc.name.clone(), state_of(doc)))
            .collect();

        let mut handles = FxHashMap::default();
        let mut tasks = Vec::new();
        for doc in config.primaries() {
            let state = Arc::clone(&states[&doc.name]);
            let dependents = config
                .dependents_of(&doc.name)
                .filter_map(|d| states.get(&d.name).cloned())
                .collect();

            let (tx, rx) = mpsc::unbounded_channel();
            let actor = Actor::new(Arc::clone(&state), dependents, pipeline.clone(), rx);
            tasks.push(tokio::spawn(actor.run()));
            handles.insert(
                doc.name.clone(),
                DocumentHandle {
                    state,
                    commands: tx,
                },
            );
        }

        Self {
            pipeline,
            states,
            handles,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// State of any registered document, primary or dependent.
    #[cfg(test)]
    pub fn state(&self, name: &str) -> Option<&Arc<DocumentState>> {
        self.states.get(name)
    }

    pub fn states(&self) -> impl Iterator<Item = &Arc<DocumentState>> {
        self.states.values()
    }

    #[cfg(test)]
    pub fn handle(&self, name: &str) -> Option<&DocumentHandle> {
        self.handles.get(name)
    }

    pub fn handles(&self) -> impl Iterator<Item = &DocumentHandle> {
        self.handles.values()
    }

    /// Route a changed path to every document whose source root contains it.
    ///
    /// Returns the number of documents notified.
    pub fn notify_change(&self, path: &Path) -> usize {
        self.handles
            .values()
            .filter(|h| h.state.doc.root.as_deref().is_some_and(|root| path.starts_with(root)))
            .filter(|h| h.notify_change(path.to_path_buf()))
            .count()
    }

    /// Stop every actor, cancelling running jobs.
    pub async fn shutdown(&self) {
        for handle in self.handles.values() {
            handle.send(Command::Shutdown);
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.await.ok();
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct Actor {
    state: Arc<DocumentState>,
    dependents: Vec<Arc<DocumentState>>,
    pipeline: Pipeline,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    debouncer: Debouncer,
    extraction: ExtractionTimer,
    clock: GenerationClock,
    /// Token of the latest job, kept after it finishes for its extraction.
    token: Option<JobToken>,
    task: Option<JoinHandle<()>>,
    /// A fast build saw unresolved references.
    next_structural: bool,
}

/// Sleep until `deadline`, forever if there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    fn new(
        state: Arc<DocumentState>,
        dependents: Vec<Arc<DocumentState>>,
        pipeline: Pipeline,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let build = &pipeline.config.build;
        let debouncer = Debouncer::new(build.debounce());
        let extraction = ExtractionTimer::new(build.extract_debounce());
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            state,
            dependents,
            pipeline,
            commands,
            events_tx,
            events,
            debouncer,
            extraction,
            clock: GenerationClock::default(),
            token: None,
            task: None,
            next_structural: false,
        }
    }

    fn name(&self) -> &str {
        &self.state.doc.name
    }

    async fn run(mut self) {
        loop {
            let debounce = self.debouncer.deadline();
            let extraction = self.extraction.deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Change(path)) => self.on_change(path),
                    Some(Command::Build { structural }) => self.start_build(structural).await,
                    Some(Command::Extract) => self.start_extraction(),
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event),
                () = wait_until(debounce) => {
                    if let Some(batch) = self.debouncer.fire(Instant::now()) {
                        log!("build"; "{}: {} changed file(s), {}", self.name(), batch.paths.len(), batch.kind.name());
                        self.start_build(batch.is_structural()).await;
                    }
                }
                () = wait_until(extraction) => {
                    if self.extraction.fire(Instant::now()) {
                        self.start_extraction();
                    }
                }
            }
        }

        self.cancel_active().await;
    }

    fn on_change(&mut self, path: PathBuf) {
        let kind = categorize_path(&path, &self.state.doc.output, &self.pipeline.config.build);
        if kind == ChangeKind::Ignored {
            return;
        }
        self.debouncer.add(path, kind, Instant::now());
        if matches!(
            self.state.status(),
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Cancelled
        ) {
            self.state.set_status(BuildStatus::Stale);
            self.announce(BuildStatus::Stale);
        }
    }

    /// Cancel the latest job and give a still-running task the grace period.
    async fn cancel_active(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        token.cancel();

        let Some(task) = self.task.take().filter(|t| !t.is_finished()) else {
            return;
        };
        self.state.update_job(token.generation(), |board| {
            board.status = BuildStatus::Cancelled;
            if let Some(job) = &mut board.job {
                job.phase = BuildPhase::Cancelled;
                job.log.push("superseded".into());
            }
        });
        log!("build"; "{}: cancelling build #{}", self.name(), token.generation());

        let grace = self.pipeline.config.build.cancel_grace();
        if tokio::time::timeout(grace, task).await.is_err() {
            log!("build"; "{}: build #{} still winding down, continuing", self.name(), token.generation());
        }
    }

    async fn start_build(&mut self, structural: bool) {
        let structural = structural || std::mem::take(&mut self.next_structural);
        self.extraction.cancel();
        self.cancel_active().await;

        let generation = self.clock.advance();
        let token = self.clock.token(generation);
        self.state.begin_job(BuildJob::new(generation));
        self.announce(BuildStatus::Building);
        log!(
            "build"; "{}: build #{generation} ({})",
            self.name(),
            if structural { "structural" } else { "body" }
        );

        let pipeline = self.pipeline.clone();
        let state = Arc::clone(&self.state);
        let events = self.events_tx.clone();
        let job = token.clone();
        let task = tokio::spawn(async move {
            let result = pipeline.foreground(&state, &job, structural).await;
            let proceed = result.is_ok() && job.is_current();
            events.send(Event::Foreground { generation, result }).ok();

            if proceed {
                let result = pipeline.background(&state, &job).await;
                events.send(Event::Background { generation, result }).ok();
            }
        });

        self.token = Some(token);
        self.task = Some(task);
    }

    fn start_extraction(&mut self) {
        // A child token: an extraction timeout must not cancel the build
        let token = match &self.token {
            Some(token) if !token.is_cancelled() => token.child(),
            _ => {
                let token = self.clock.token(self.clock.current());
                self.token = Some(token.clone());
                token.child()
            }
        };

        let pipeline = self.pipeline.clone();
        let state = Arc::clone(&self.state);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = pipeline.extract(&state, &token).await;
            events
                .send(Event::Extracted {
                    generation: token.generation(),
                    result,
                })
                .ok();
        });
    }

    fn on_event(&mut self, event: Event) {
        let current = self.clock.current();
        match event {
            Event::Foreground { generation, .. } | Event::Background { generation, .. }
                if generation != current => {}
            Event::Foreground { result: Ok(foreground), .. } => {
                self.debouncer.finish();
                if foreground.compile.unresolved {
                    self.next_structural = true;
                }
            }
            Event::Foreground {
                generation,
                result: Err(e),
            } => {
                self.debouncer.finish();
                self.fail(generation, &e);
            }
            Event::Background {
                generation,
                result: Err(StageError::Superseded),
            } => self.fail(generation, &StageError::Superseded),
            Event::Background { generation, result } => self.finish_build(generation, result),
            Event::Extracted { generation, result } => match result {
                Ok(_) => self.share_lookup(),
                Err(e) if e.is_superseded() => {}
                Err(e) => {
                    log!("synctex"; "{}: {e}", self.name());
                    self.state.update_job(generation, |board| {
                        if let Some(job) = &mut board.job {
                            job.log.push(e.to_string());
                            job.phase = BuildPhase::Done;
                        }
                    });
                }
            },
        }
    }

    fn announce(&self, status: BuildStatus) {
        self.pipeline.dispatcher.announce_status(self.name(), status);
    }

    fn fail(&mut self, generation: u64, error: &StageError) {
        let (status, phase) = if error.is_superseded() {
            (BuildStatus::Cancelled, BuildPhase::Cancelled)
        } else {
            log!("error"; "{}: {error}", self.name());
            (BuildStatus::Failed, BuildPhase::Failed)
        };
        let current = self.state.update_job(generation, |board| {
            board.status = status;
            if let Some(job) = &mut board.job {
                job.phase = phase;
                job.log.push(error.to_string());
            }
        });
        if current {
            self.announce(status);
        }
    }

    /// Full render finished (or failed without supersession).
    fn finish_build(&mut self, generation: u64, result: Result<u32, StageError>) {
        let doc = &self.state.doc;
        if let Err(e) = &result {
            log!("render"; "{}: {e}", doc.name);
        }

        // A failed full render still leaves the priority pages viewable
        let has_pages = doc
            .page_artifacts(&doc.output)
            .is_ok_and(|pages| !pages.is_empty());
        let (status, phase) = if has_pages {
            (BuildStatus::Success, BuildPhase::Done)
        } else {
            (BuildStatus::Failed, BuildPhase::Failed)
        };

        let current = self.state.update_job(generation, |board| {
            board.status = status;
            board.last_build = Some(Local::now());
            if let Some(job) = &mut board.job {
                job.phase = phase;
                if let Err(e) = &result {
                    job.log.push(e.to_string());
                }
            }
        });
        if current {
            log!("build"; "{}: build #{generation} {:?}", doc.name, status);
            self.announce(status);
        }

        if has_pages {
            self.cascade();
        }
        self.extraction.reset(Instant::now());
    }

    /// Refresh dependents in the background; failures are only logged.
    fn cascade(&self) {
        for dependent in &self.dependents {
            let primary = Arc::clone(&self.state);
            let dependent = Arc::clone(dependent);
            let dispatcher = self.pipeline.dispatcher.clone();
            tokio::task::spawn_blocking(move || {
                match cascade::cascade(&primary.doc, &dependent.doc, &dispatcher) {
                    Ok(pairs) => {
                        let current = pairs.iter().filter(|p| p.current).count();
                        dependent.set_page_count(u32::try_from(current).unwrap_or(u32::MAX));
                        dependent.restore_lookup();
                        dependent.set_status(BuildStatus::Success);
                    }
                    Err(e) => {
                        log!("error"; "cascade {} -> {}: {e:#}", primary.doc.name, dependent.doc.name);
                        dependent.set_status(BuildStatus::Failed);
                    }
                }
                dispatcher.announce_status(&dependent.doc.name, dependent.status());
            });
        }
    }

    /// Hand a freshly extracted lookup table to every dependent.
    fn share_lookup(&self) {
        for dependent in &self.dependents {
            let primary = Arc::clone(&self.state);
            let dependent = Arc::clone(dependent);
            tokio::task::spawn_blocking(move || {
                match cascade::share_lookup(&primary.doc, &dependent.doc) {
                    Ok(()) => dependent.restore_lookup(),
                    Err(e) => {
                        log!("error"; "lookup {} -> {}: {e:#}", primary.doc.name, dependent.doc.name);
                    }
                }
            });
        }
    }
}
