//! File system watcher feeding the build scheduler.
//!
//! Each primary document's source root is watched recursively. Events are
//! forwarded as-is; classification and debouncing happen in the document's
//! actor, so the loop here stays a thin relay.
//!
//! ```text
//! notify ──▶ is_relevant ──▶ Scheduler::notify_change ──▶ document actor
//! ```

use crate::{build::Scheduler, log, utils::category::is_temp_file};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

const fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

/// Source roots of the primary documents, deduplicated.
fn watched_roots(scheduler: &Scheduler) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = scheduler
        .handles()
        .filter_map(|h| h.state.doc.root.clone())
        .collect();
    roots.sort();
    roots.dedup();
    roots
}

/// Format path relative to the project root for log display.
fn rel_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

/// Forward the paths of one event; returns how many reached a document.
fn forward(event: Event, scheduler: &Scheduler) -> usize {
    event
        .paths
        .iter()
        .filter(|path| !is_temp_file(path))
        .map(|path| scheduler.notify_change(path))
        .sum()
}

/// Watch every primary document until the watcher channel closes.
///
/// Blocking; run it on a dedicated thread.
pub fn watch_documents(scheduler: &Scheduler) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(tx).context("Failed to create file watcher")?;

    let project = &scheduler.pipeline().config.root;
    for root in watched_roots(scheduler) {
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        log!("watch"; "{}/", rel_path(&root, project));
    }

    for result in rx {
        match result {
            Ok(event) if is_relevant(&event) => {
                forward(event, scheduler);
            }
            Ok(_) => {}
            Err(e) => log!("watch"; "error: {e}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::Pipeline;
    use crate::compiler::{
        FormatCache,
        testing::{self, FakeRunner},
    };
    use crate::signal::{MemoryStore, SignalDispatcher};
    use notify::event::{CreateKind, ModifyKind};
    use std::sync::Arc;

    fn scheduler(root: &Path) -> Scheduler {
        testing::project(root);
        let pipeline = Pipeline {
            config: Arc::new(testing::config(root, 1)),
            runner: Arc::new(FakeRunner::new(1)),
            formats: FormatCache::default(),
            dispatcher: SignalDispatcher::new(Arc::new(MemoryStore::default())),
        };
        Scheduler::start(pipeline)
    }

    #[test]
    fn test_is_relevant() {
        assert!(is_relevant(&Event::new(EventKind::Create(CreateKind::File))));
        assert!(is_relevant(&Event::new(EventKind::Modify(ModifyKind::Any))));
        assert!(!is_relevant(&Event::new(EventKind::Access(
            notify::event::AccessKind::Any
        ))));
    }

    #[tokio::test]
    async fn test_forward_routes_to_owning_document() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());
        assert_eq!(watched_roots(&scheduler), vec![dir.path().join("src")]);

        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(dir.path().join("src/main.tex"))
            .add_path(dir.path().join("src/.#main.tex"))
            .add_path(dir.path().join("notes.txt"));
        assert_eq!(forward(event, &scheduler), 1);
        scheduler.shutdown().await;
    }
}
