//! Page render stage: intermediate → numbered page artifacts.
//!
//! The converter writes into a private staging directory of the job. Files
//! are moved into the output directory only after the job token confirms
//! the job is still current, so a superseded converter that outlived its
//! cancellation cannot overwrite the newer job's pages.
//!
//! ```text
//! out/.staging/<gen>/<kind>/page-3.svg ──(guard)──▶ out/page-3.svg
//! ```

use super::StageContext;
use crate::build::job::StageError;
use crate::config::LayoutMode;
use crate::coords::layout::read_metadata;
use crate::document::Document;
use std::{fs, path::Path};

/// Which pages to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSelection {
    /// Priority subset; existing artifacts of other pages stay.
    Pages(Vec<u32>),
    /// Every page; artifacts past the new last page are deleted.
    All,
}

impl PageSelection {
    /// Value of the `{pages}` placeholder.
    fn placeholder(&self) -> String {
        match self {
            Self::Pages(pages) => pages
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(","),
            Self::All => "1-".to_owned(),
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Pages(_) => "priority",
            Self::All => "full",
        }
    }
}

/// Render `selection` and publish the artifacts. Returns the published pages.
pub async fn render(
    ctx: &StageContext<'_>,
    selection: &PageSelection,
) -> Result<Vec<u32>, StageError> {
    let doc = ctx.doc;
    let io_err = |what: &str, e: std::io::Error| StageError::Render(format!("{what}: {e}"));

    let staging = doc
        .staging_dir(ctx.token.generation())
        .join(selection.kind());
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| io_err("cannot clear staging", e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| io_err("cannot create staging", e))?;

    let mut vars = ctx.vars();
    vars.set("pages", selection.placeholder());
    vars.set(
        "output",
        staging.join(doc.page_pattern()).display().to_string(),
    );

    let result = ctx
        .run(
            "render",
            &ctx.config.build.commands.render,
            &vars,
            ctx.config.build.render_timeout(),
            StageError::Render,
        )
        .await
        .and_then(|_| publish(ctx, selection, &staging));

    // The generation directory goes once its last kind is done
    fs::remove_dir_all(&staging).ok();
    if let Some(parent) = staging.parent() {
        fs::remove_dir(parent).ok();
    }

    let pages = result?;
    ctx.log
        .line("render", format!("{} {:?}", selection.kind(), pages));
    Ok(pages)
}

/// Move staged artifacts into the output directory.
fn publish(
    ctx: &StageContext<'_>,
    selection: &PageSelection,
    staging: &Path,
) -> Result<Vec<u32>, StageError> {
    let doc = ctx.doc;
    let io_err = |e: std::io::Error| StageError::Render(e.to_string());

    let mut staged = doc.page_artifacts(staging).map_err(io_err)?;
    if let PageSelection::Pages(wanted) = selection {
        staged.retain(|page, _| wanted.contains(page));
    }
    if staged.is_empty() {
        return Err(StageError::Render("converter produced no pages".into()));
    }

    ctx.token.ensure_current()?;
    for (page, path) in &staged {
        fs::rename(path, doc.output.join(doc.page_file(*page))).map_err(io_err)?;
    }

    if *selection == PageSelection::All {
        let metadata = staging.join(doc.metadata_path().file_name().unwrap_or_default());
        if metadata.is_file() {
            fs::rename(&metadata, doc.metadata_path()).map_err(io_err)?;
        }

        for (page, path) in doc.page_artifacts(&doc.output).map_err(io_err)? {
            if !staged.contains_key(&page) {
                fs::remove_file(path).map_err(io_err)?;
            }
        }
    }

    Ok(staged.into_keys().collect())
}

/// Page count after a full render.
///
/// Fixed layouts count the pages written; flow layouts trust the page
/// metadata when present.
pub fn page_count(doc: &Document, published: &[u32]) -> u32 {
    let written = published.iter().copied().max().unwrap_or(0);
    match doc.layout {
        LayoutMode::Fixed => written,
        LayoutMode::Flow => read_metadata(&doc.metadata_path())
            .ok()
            .and_then(|pages| u32::try_from(pages.len()).ok())
            .unwrap_or(written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::job::{BuildJob, GenerationClock, JobLog, JobToken};
    use crate::compiler::testing::{self, FakeRunner};
    use crate::config::AppConfig;
    use crate::document::DocumentState;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: AppConfig,
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
        let doc = &state.doc;
        fs::create_dir_all(doc.build_dir()).unwrap();
        fs::write(doc.pdf_path(), "rev 1").unwrap();
        Fixture {
            _dir: dir,
            config,
            state,
            clock: GenerationClock::default(),
        }
    }

    impl Fixture {
        fn token(&self) -> JobToken {
            let token = self.clock.token(self.clock.advance());
            self.state.begin_job(BuildJob::new(token.generation()));
            token
        }

        async fn render(
            &self,
            runner: &FakeRunner,
            token: &JobToken,
            selection: PageSelection,
        ) -> Result<Vec<u32>, StageError> {
            let log = JobLog::new(Arc::clone(&self.state), token.generation());
            let ctx = StageContext {
                doc: &self.state.doc,
                config: &self.config,
                runner,
                token,
                log: &log,
            };
            render(&ctx, &selection).await
        }

        fn pages(&self) -> Vec<u32> {
            let doc = &self.state.doc;
            doc.page_artifacts(&doc.output).unwrap().into_keys().collect()
        }
    }

    #[tokio::test]
    async fn test_priority_then_full() {
        let f = fixture();
        let runner = FakeRunner::new(5);
        let token = f.token();

        let pages = f
            .render(&runner, &token, PageSelection::Pages(vec![3, 4]))
            .await
            .unwrap();
        assert_eq!(pages, vec![3, 4]);
        assert_eq!(f.pages(), vec![3, 4]);
        assert!(runner.calls()[0].starts_with("render 3,4 "));

        let pages = f.render(&runner, &token, PageSelection::All).await.unwrap();
        assert_eq!(pages, vec![1, 2, 3, 4, 5]);
        assert_eq!(page_count(&f.state.doc, &pages), 5);
        assert!(!f.state.doc.staging_dir(token.generation()).exists());
    }

    #[tokio::test]
    async fn test_full_render_deletes_stale_pages() {
        let f = fixture();
        let output = &f.state.doc.output;
        for page in 1..=7 {
            fs::write(output.join(format!("page-{page}.svg")), "old").unwrap();
        }

        let runner = FakeRunner::new(4);
        let token = f.token();
        f.render(&runner, &token, PageSelection::All).await.unwrap();

        assert_eq!(f.pages(), vec![1, 2, 3, 4]);
        assert_eq!(fs::read_to_string(output.join("page-1.svg")).unwrap(), "rev 1");
    }

    #[tokio::test]
    async fn test_priority_page_past_end() {
        let f = fixture();
        let runner = FakeRunner::new(2);
        let token = f.token();

        let err = f
            .render(&runner, &token, PageSelection::Pages(vec![9]))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Render(_)));
    }

    #[tokio::test]
    async fn test_superseded_render_publishes_nothing() {
        let f = fixture();
        let runner = FakeRunner::new(3);
        let old = f.token();
        let _new = f.token();

        let err = f.render(&runner, &old, PageSelection::All).await.unwrap_err();
        assert!(err.is_superseded());
        assert!(f.pages().is_empty());
        assert_eq!(runner.count("render"), 0);
    }
}
