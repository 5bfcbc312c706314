//! Preamble format cache.
//!
//! Everything before `\begin{document}` is precompiled once into a format
//! file; body edits then compile against it in a single fast pass. The
//! cache entry is keyed by a hash of that preamble text and persisted next
//! to the format (`<name>.fmt.hash`) so restarts can reuse it.

use super::StageContext;
use crate::build::job::StageError;
use crate::utils::hash;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

const BODY_MARKER: &str = "\\begin{document}";

/// Result of [`FormatCache::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatState {
    /// Hash unchanged, existing format used.
    Reused,
    /// Format compiled during this call.
    Rebuilt,
    /// No usable format; compile on the slow path.
    Unavailable,
}

#[derive(Debug, Clone)]
struct FormatEntry {
    hash: String,
    available: bool,
}

/// Format entries of every document, keyed by document name.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct FormatCache {
    entries: Arc<Mutex<FxHashMap<String, FormatEntry>>>,
}

/// Hash of the text before `\begin{document}`, `None` if there is no body.
pub fn preamble_hash(source: &str) -> Option<String> {
    let (preamble, _) = source.split_once(BODY_MARKER)?;
    Some(hash::compute(preamble.as_bytes()))
}

fn hash_path(format: &Path) -> PathBuf {
    format.with_extension("fmt.hash")
}

impl FormatCache {
    /// Make sure a format matching the current preamble exists.
    ///
    /// A known-bad preamble is not retried unless `force` is set (structural
    /// changes). Only supersession is an error; every other failure yields
    /// [`FormatState::Unavailable`].
    pub async fn ensure(&self, ctx: &StageContext<'_>, force: bool) -> Result<FormatState, StageError> {
        let doc = ctx.doc;
        let Some(main) = doc.main_path() else {
            return Ok(FormatState::Unavailable);
        };
        let source = match fs::read_to_string(&main) {
            Ok(source) => source,
            Err(e) => {
                ctx.log.line("format", format!("cannot read {}: {e}", main.display()));
                return Ok(FormatState::Unavailable);
            }
        };
        let Some(hash) = preamble_hash(&source) else {
            return Ok(FormatState::Unavailable);
        };

        let format = doc.format_path();
        let known = self.entries.lock().get(&doc.name).cloned();
        match known {
            Some(entry) if entry.hash == hash && entry.available && format.is_file() => {
                return Ok(FormatState::Reused);
            }
            Some(entry) if entry.hash == hash && !entry.available && !force => {
                return Ok(FormatState::Unavailable);
            }
            None if format.is_file()
                && fs::read_to_string(hash_path(&format)).is_ok_and(|h| h.trim() == hash) =>
            {
                self.store(&doc.name, hash, true);
                return Ok(FormatState::Reused);
            }
            _ => {}
        }

        ctx.log.line("format", "preamble changed, rebuilding format");
        let build_dir = doc.build_dir();
        if let Err(e) = fs::create_dir_all(&build_dir) {
            ctx.log.line("format", format!("cannot create {}: {e}", build_dir.display()));
            return Ok(FormatState::Unavailable);
        }

        let result = ctx
            .run(
                "format",
                &ctx.config.build.commands.format,
                &ctx.vars(),
                ctx.config.build.compile_timeout(),
                StageError::Compile,
            )
            .await;

        match result {
            Ok(_) if format.is_file() => {
                ctx.token.ensure_current()?;
                if let Err(e) = fs::write(hash_path(&format), &hash) {
                    ctx.log.line("format", format!("cannot persist format hash: {e}"));
                }
                self.store(&doc.name, hash, true);
                Ok(FormatState::Rebuilt)
            }
            Err(StageError::Superseded) => Err(StageError::Superseded),
            other => {
                if let Err(e) = other {
                    ctx.log.line("format", e.to_string());
                } else {
                    ctx.log.line("format", "format command produced no format file");
                }
                // Stale hash file must not revive the old format after a restart
                fs::remove_file(hash_path(&format)).ok();
                self.store(&doc.name, hash, false);
                Ok(FormatState::Unavailable)
            }
        }
    }

    fn store(&self, name: &str, hash: String, available: bool) {
        self.entries
            .lock()
            .insert(name.to_owned(), FormatEntry { hash, available });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::job::{BuildJob, GenerationClock, JobLog};
    use crate::compiler::testing::{self, FakeRunner};
    use crate::document::{Document, DocumentState};

    struct Fixture {
        _dir: tempfile::TempDir,
        config: crate::config::AppConfig,
        state: Arc<DocumentState>,
        clock: GenerationClock,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        testing::project(dir.path());
        let config = testing::config(dir.path(), 1);
        let state = Arc::new(DocumentState::new(Document::from_config(
            &config.documents[0],
            &config,
        )));
        Fixture {
            _dir: dir,
            config,
            state,
            clock: GenerationClock::default(),
        }
    }

    async fn ensure(f: &Fixture, cache: &FormatCache, runner: &FakeRunner, force: bool) -> FormatState {
        let token = f.clock.token(f.clock.advance());
        f.state.begin_job(BuildJob::new(token.generation()));
        let log = JobLog::new(Arc::clone(&f.state), token.generation());
        let ctx = StageContext {
            doc: &f.state.doc,
            config: &f.config,
            runner,
            token: &token,
            log: &log,
        };
        cache.ensure(&ctx, force).await.unwrap()
    }

    #[test]
    fn test_preamble_hash() {
        let a = preamble_hash("\\documentclass{article}\n\\begin{document}\nA\n").unwrap();
        let b = preamble_hash("\\documentclass{article}\n\\begin{document}\nB\n").unwrap();
        let c = preamble_hash("\\documentclass{book}\n\\begin{document}\nA\n").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(preamble_hash("no body").is_none());
    }

    #[tokio::test]
    async fn test_build_then_reuse() {
        let f = fixture();
        let cache = FormatCache::default();
        let runner = FakeRunner::new(1);

        assert_eq!(ensure(&f, &cache, &runner, false).await, FormatState::Rebuilt);
        assert_eq!(ensure(&f, &cache, &runner, false).await, FormatState::Reused);
        assert_eq!(runner.count("format"), 1);
        assert!(hash_path(&f.state.doc.format_path()).is_file());

        // body edits keep the format
        let main = f.state.doc.main_path().unwrap();
        fs::write(&main, testing::MAIN.replace("Hello.", "Bye.")).unwrap();
        assert_eq!(ensure(&f, &cache, &runner, false).await, FormatState::Reused);

        // preamble edits rebuild it
        fs::write(&main, testing::MAIN.replace("amsmath", "amssymb")).unwrap();
        assert_eq!(ensure(&f, &cache, &runner, false).await, FormatState::Rebuilt);
        assert_eq!(runner.count("format"), 2);
    }

    #[tokio::test]
    async fn test_persisted_hash_survives_restart() {
        let f = fixture();
        let runner = FakeRunner::new(1);
        ensure(&f, &FormatCache::default(), &runner, false).await;

        let fresh = FormatCache::default();
        assert_eq!(ensure(&f, &fresh, &runner, false).await, FormatState::Reused);
        assert_eq!(runner.count("format"), 1);
    }

    #[tokio::test]
    async fn test_failure_not_retried_until_forced() {
        let f = fixture();
        let cache = FormatCache::default();
        let runner = FakeRunner {
            fail_format: true,
            ..FakeRunner::new(1)
        };

        assert_eq!(ensure(&f, &cache, &runner, false).await, FormatState::Unavailable);
        assert_eq!(ensure(&f, &cache, &runner, false).await, FormatState::Unavailable);
        assert_eq!(runner.count("format"), 1);

        assert_eq!(ensure(&f, &cache, &runner, true).await, FormatState::Unavailable);
        assert_eq!(runner.count("format"), 2);
        assert!(!f.state.report().log.is_empty());
    }
}
