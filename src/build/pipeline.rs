//! One build of one document, stage by stage.
//!
//! ```text
//! foreground:  compile ─▶ render priority pages ─▶ partial signal
//! background:  render all pages ─▶ page count ─▶ full signal
//! later:       extract lookup table ─▶ lookup.json + atomic swap
//! ```
//!
//! The scheduler runs the foreground and background parts in one task and
//! the extraction separately, after its long debounce.

use super::job::{BuildJob, BuildPhase, JobLog, JobToken, StageError};
use crate::compiler::{self, CompileOutcome, FormatCache, PageSelection, StageContext};
use crate::config::AppConfig;
use crate::document::{BuildStatus, DocumentState};
use crate::log;
use crate::signal::{ReloadSignal, SignalDispatcher};
use crate::synctex;
use crate::utils::exec::CommandRunner;
use chrono::Local;
use std::sync::Arc;

/// Services shared by every build.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<AppConfig>,
    pub runner: Arc<dyn CommandRunner>,
    pub formats: FormatCache,
    pub dispatcher: SignalDispatcher,
}

/// Result of the foreground part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Foreground {
    pub compile: CompileOutcome,
    /// Pages published with the partial signal; empty if rendering failed.
    pub priority: Vec<u32>,
}

impl Pipeline {
    fn context<'a>(
        &'a self,
        state: &'a DocumentState,
        token: &'a JobToken,
        log: &'a JobLog,
    ) -> StageContext<'a> {
        StageContext {
            doc: &state.doc,
            config: &self.config,
            runner: self.runner.as_ref(),
            token,
            log,
        }
    }

    /// Compile, then render and announce the priority pages.
    ///
    /// Only a compile failure (or supersession) is an error.
    pub async fn foreground(
        &self,
        state: &Arc<DocumentState>,
        token: &JobToken,
        structural: bool,
    ) -> Result<Foreground, StageError> {
        let log = JobLog::new(Arc::clone(state), token.generation());
        let ctx = self.context(state, token, &log);

        log.phase(BuildPhase::Compiling);
        let compile = compiler::compile(&ctx, &self.formats, structural).await?;

        log.phase(BuildPhase::Converting);
        let wanted = self.dispatcher.priority_pages(&state.doc.name);
        let priority = match compiler::render(&ctx, &PageSelection::Pages(wanted)).await {
            Ok(pages) => pages,
            Err(StageError::Superseded) => return Err(StageError::Superseded),
            Err(e) => {
                log.line("render", e.to_string());
                Vec::new()
            }
        };

        if !priority.is_empty() {
            token.ensure_current()?;
            self.dispatcher
                .publish(&state.doc.name, &ReloadSignal::partial(priority.clone()));
        }

        Ok(Foreground { compile, priority })
    }

    /// Render every page, update the page count and announce it.
    ///
    /// Returns the new page count.
    pub async fn background(
        &self,
        state: &Arc<DocumentState>,
        token: &JobToken,
    ) -> Result<u32, StageError> {
        let log = JobLog::new(Arc::clone(state), token.generation());
        let ctx = self.context(state, token, &log);

        let pages = compiler::render(&ctx, &PageSelection::All).await?;
        let count = compiler::page_count(&state.doc, &pages);

        token.ensure_current()?;
        state.set_page_count(count);
        self.dispatcher
            .publish(&state.doc.name, &ReloadSignal::full());
        Ok(count)
    }

    /// Parse the cross-reference log and install the new lookup table.
    ///
    /// Returns the number of entries.
    pub async fn extract(
        &self,
        state: &Arc<DocumentState>,
        token: &JobToken,
    ) -> Result<usize, StageError> {
        let log = JobLog::new(Arc::clone(state), token.generation());
        log.phase(BuildPhase::Extracting);

        let doc = Arc::clone(&state.doc);
        let extensions = self.config.build.tracked_extensions.clone();
        let cancel = token.cancellation().clone();
        let task = tokio::task::spawn_blocking(move || {
            synctex::extract(&doc, &extensions, Some(&cancel))
        });

        let timeout = self.config.build.extract_timeout();
        let table = match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                token.cancel();
                return Err(StageError::Extraction(format!(
                    "timed out after {}s",
                    timeout.as_secs()
                )));
            }
            Ok(Err(e)) => return Err(StageError::Extraction(e.to_string())),
            Ok(Ok(Err(synctex::SynctexError::Cancelled))) => return Err(StageError::Superseded),
            Ok(Ok(Err(e))) => return Err(StageError::Extraction(e.to_string())),
            Ok(Ok(Ok(table))) => table,
        };

        token.ensure_current()?;
        table
            .write(&state.doc.lookup_path())
            .map_err(|e| StageError::Extraction(format!("cannot write lookup table: {e}")))?;
        let count = table.len();
        if table.is_empty() {
            log.line("synctex", "lookup table is empty, no tracked source lines in the log");
        }
        state.replace_lookup(table);

        log.line("synctex", format!("lookup table: {count} lines"));
        log.phase(BuildPhase::Done);
        Ok(count)
    }
}

/// Slow-path build, full render and extraction, without a scheduler.
///
/// Used by the one-shot `build` command.
pub async fn build_once(
    pipeline: &Pipeline,
    state: &Arc<DocumentState>,
    token: &JobToken,
) -> Result<u32, StageError> {
    state.begin_job(BuildJob::new(token.generation()));
    let log = JobLog::new(Arc::clone(state), token.generation());

    let result = async {
        pipeline.foreground(state, token, true).await?;
        pipeline.background(state, token).await
    }
    .await;

    let count = match result {
        Ok(count) => count,
        Err(e) => {
            log.line("error", e.to_string());
            state.update_job(token.generation(), |board| {
                board.status = BuildStatus::Failed;
                if let Some(job) = &mut board.job {
                    job.phase = BuildPhase::Failed;
                }
            });
            return Err(e);
        }
    };

    if let Err(e) = pipeline.extract(state, token).await {
        log.line("synctex", e.to_string());
    }

    state.update_job(token.generation(), |board| {
        board.status = BuildStatus::Success;
        board.last_build = Some(Local::now());
        if let Some(job) = &mut board.job {
            job.phase = BuildPhase::Done;
        }
    });
    log!("build"; "{}: {} pages", state.doc.name, count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::job::GenerationClock;
    use crate::compiler::testing::{self, FakeRunner};
    use crate::document::Document;
    use crate::signal::{
        MemoryStore, Viewport,
        dispatch::ReloadKind,
        store::{SharedStore, StoreEvent},
    };
    use crate::synctex::LineKey;
    use flate2::{Compression, write::GzEncoder};
    use std::{fs, io::Write};

    struct Fixture {
        _dir: tempfile::TempDir,
        pipeline: Pipeline,
        store: Arc<MemoryStore>,
        state: Arc<DocumentState>,
        runner: Arc<FakeRunner>,
    }

    fn fixture(runner: FakeRunner) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        testing::project(dir.path());
        let config = Arc::new(testing::config(dir.path(), 1));
        let state = Arc::new(DocumentState::new(Document::from_config(
            &config.documents[0],
            &config,
        )));
        let store = Arc::new(MemoryStore::default());
        let runner = Arc::new(runner);
        let pipeline = Pipeline {
            config,
            runner: runner.clone(),
            formats: FormatCache::default(),
            dispatcher: SignalDispatcher::new(store.clone()),
        };
        Fixture {
            _dir: dir,
            pipeline,
            store,
            state,
            runner,
        }
    }

    fn write_synctex(state: &DocumentState) {
        let main = state.doc.main_path().unwrap();
        let log = format!("Input:1:{}\n{{1\nx1,4:4718592,655360\n", main.display());
        let file = fs::File::create(state.doc.synctex_path()).unwrap();
        let mut gz = GzEncoder::new(file, Compression::default());
        gz.write_all(log.as_bytes()).unwrap();
        gz.finish().unwrap();
    }

    #[tokio::test]
    async fn test_partial_signal_before_full() {
        let f = fixture(FakeRunner::new(5));
        let dispatcher = &f.pipeline.dispatcher;
        dispatcher.set_viewport("paper", &Viewport { pages: vec![3, 4] });
        let mut events = f.store.observe();

        let clock = GenerationClock::default();
        let token = clock.token(clock.advance());
        f.state.begin_job(BuildJob::new(token.generation()));

        let fg = f.pipeline.foreground(&f.state, &token, false).await.unwrap();
        assert_eq!(fg.priority, vec![3, 4]);
        let count = f.pipeline.background(&f.state, &token).await.unwrap();
        assert_eq!(count, 5);
        assert_eq!(f.state.page_count(), 5);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.key() == "paper/reload"
                && let StoreEvent::Set { value, .. } = event
            {
                let signal: ReloadSignal = serde_json::from_value(value).unwrap();
                kinds.push((signal.kind, signal.pages));
            }
        }
        assert_eq!(
            kinds,
            vec![
                (ReloadKind::Partial, Some(vec![3, 4])),
                (ReloadKind::Full, None)
            ]
        );
    }

    #[tokio::test]
    async fn test_render_failure_is_not_fatal() {
        // only one page exists, priority page 2 renders nothing
        let f = fixture(FakeRunner::new(1));
        f.pipeline
            .dispatcher
            .set_viewport("paper", &Viewport { pages: vec![2] });

        let clock = GenerationClock::default();
        let token = clock.token(clock.advance());
        f.state.begin_job(BuildJob::new(token.generation()));

        let fg = f.pipeline.foreground(&f.state, &token, false).await.unwrap();
        assert!(fg.priority.is_empty());
        assert!(f.pipeline.dispatcher.latest("paper").is_none());
    }

    #[tokio::test]
    async fn test_build_once_with_extraction() {
        let f = fixture(FakeRunner::new(2));
        let clock = GenerationClock::default();
        let token = clock.token(clock.advance());

        // the fake compiler writes no cross-reference log; provide one
        fs::create_dir_all(f.state.doc.build_dir()).unwrap();
        write_synctex(&f.state);

        let count = build_once(&f.pipeline, &f.state, &token).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(f.state.status(), BuildStatus::Success);

        let table = f.state.lookup().unwrap();
        let entry = table.get(&LineKey::Main(4)).unwrap();
        assert_eq!((entry.page, entry.x, entry.y), (1, 72.0, 10.0));
        assert_eq!(entry.content, "Hello.");
        assert!(f.state.doc.lookup_path().is_file());
        assert_eq!(f.runner.count("format"), 1);
    }

    #[tokio::test]
    async fn test_build_once_compile_failure() {
        let f = fixture(FakeRunner {
            fail_compile: true,
            ..FakeRunner::new(2)
        });
        let clock = GenerationClock::default();
        let token = clock.token(clock.advance());

        assert!(build_once(&f.pipeline, &f.state, &token).await.is_err());
        assert_eq!(f.state.status(), BuildStatus::Failed);
        assert_eq!(f.state.report().phase, Some(BuildPhase::Failed));
    }

    #[tokio::test]
    async fn test_superseded_extraction_keeps_table() {
        let f = fixture(FakeRunner::new(1));
        fs::create_dir_all(f.state.doc.build_dir()).unwrap();
        write_synctex(&f.state);

        let clock = GenerationClock::default();
        let old = clock.token(clock.advance());
        clock.advance();

        let err = f.pipeline.extract(&f.state, &old).await.unwrap_err();
        assert!(err.is_superseded());
        assert!(f.state.lookup().is_none());
        assert!(!f.state.doc.lookup_path().exists());
    }
}
