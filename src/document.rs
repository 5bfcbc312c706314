//! Registered documents and their shared, concurrently readable state.
//!
//! A [`Document`] is the immutable description of one registered document
//! (paths and layout mode). [`DocumentState`] is what the build scheduler
//! mutates and what queries read: the build status board, the current
//! lookup table and the page layout cache.
//!
//! # Concurrency
//!
//! ```text
//!   scheduler actor ──writes──▶ StatusBoard (RwLock)   ◀──reads── status query
//!   extraction task ──swaps───▶ lookup (ArcSwapOption) ◀──loads── mapper / lookup
//!                               layout (LayoutCache)   ◀──reads── mapper
//! ```
//!
//! The lookup table is replaced with a single atomic pointer swap, so a
//! reader sees either the previous complete table or the next one.

use crate::build::job::{BuildJob, BuildPhase};
use crate::config::{AppConfig, DocumentConfig, LayoutMode};
use crate::coords::layout::LayoutCache;
use crate::synctex::LookupTable;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

// ============================================================================
// Document
// ============================================================================

/// Build status as reported to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[default]
    None,
    Building,
    Success,
    Failed,
    /// Sources changed since the last successful build.
    Stale,
    /// Superseded by a newer change.
    Cancelled,
}

/// One registered document.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    /// Source root (primary documents only).
    pub root: Option<PathBuf>,
    /// Main source file, relative to `root`.
    pub main: Option<PathBuf>,
    pub output: PathBuf,
    pub layout: LayoutMode,
    pub depends_on: Option<String>,
    page_pattern: String,
    metadata_file: String,
}

impl Document {
    pub fn from_config(doc: &DocumentConfig, config: &AppConfig) -> Self {
        Self {
            name: doc.name.clone(),
            root: doc.root.clone(),
            main: doc.main.clone(),
            output: doc.output.clone(),
            layout: doc.layout,
            depends_on: doc.depends_on.clone(),
            page_pattern: config.build.page_pattern.clone(),
            metadata_file: config.build.metadata_file.clone(),
        }
    }

    /// Source root, or the output directory for derived documents.
    pub fn root(&self) -> &Path {
        self.root.as_deref().unwrap_or(&self.output)
    }

    /// Absolute path of the main source file.
    pub fn main_path(&self) -> Option<PathBuf> {
        Some(self.root.as_ref()?.join(self.main.as_ref()?))
    }

    /// Compiler job name (main file stem).
    pub fn jobname(&self) -> String {
        self.main
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Compiler working directory for intermediate files.
    pub fn build_dir(&self) -> PathBuf {
        self.output.join(".build")
    }

    /// Intermediate paginated artifact.
    pub fn pdf_path(&self) -> PathBuf {
        self.build_dir().join(format!("{}.pdf", self.jobname()))
    }

    /// Cross-reference log (gzip compressed).
    pub fn synctex_path(&self) -> PathBuf {
        self.build_dir().join(format!("{}.synctex.gz", self.jobname()))
    }

    /// Job name of the precompiled preamble format.
    pub fn format_jobname(&self) -> String {
        format!("{}-preamble", self.jobname())
    }

    pub fn format_path(&self) -> PathBuf {
        self.build_dir().join(format!("{}.fmt", self.format_jobname()))
    }

    pub fn lookup_path(&self) -> PathBuf {
        self.output.join("lookup.json")
    }

    /// Page dimension metadata (paginated-flow layout).
    pub fn metadata_path(&self) -> PathBuf {
        self.output.join(&self.metadata_file)
    }

    /// Private directory a job renders into before publishing.
    pub fn staging_dir(&self, generation: u64) -> PathBuf {
        self.output.join(".staging").join(generation.to_string())
    }

    /// Artifact file name pattern, `%p` is the page number.
    pub fn page_pattern(&self) -> &str {
        &self.page_pattern
    }

    /// Artifact file name of `page`.
    pub fn page_file(&self, page: u32) -> String {
        self.page_pattern.replace("%p", &page.to_string())
    }

    /// Page number encoded in an artifact file name.
    pub fn page_number(&self, file_name: &str) -> Option<u32> {
        let (prefix, suffix) = self.page_pattern.split_once("%p")?;
        file_name
            .strip_prefix(prefix)?
            .strip_suffix(suffix)?
            .parse()
            .ok()
    }

    /// Page artifacts in `dir`, by page number.
    pub fn page_artifacts(&self, dir: &Path) -> io::Result<BTreeMap<u32, PathBuf>> {
        let mut pages = BTreeMap::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(pages),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(page) = name.to_str().and_then(|n| self.page_number(n)) {
                pages.insert(page, entry.path());
            }
        }
        Ok(pages)
    }

    pub fn is_dependent(&self) -> bool {
        self.depends_on.is_some()
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Build status board of one document.
#[derive(Debug, Default)]
pub struct StatusBoard {
    pub status: BuildStatus,
    pub page_count: u32,
    pub last_build: Option<DateTime<Local>>,
    /// Most recent job (current or finished).
    pub job: Option<BuildJob>,
}

/// Status query response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub status: BuildStatus,
    pub phase: Option<BuildPhase>,
    pub log: Vec<String>,
    pub page_count: u32,
    /// When the most recent job began.
    pub started: Option<String>,
    pub last_build: Option<String>,
}

/// State shared between the scheduler (writer) and queries (readers).
#[derive(Debug)]
pub struct DocumentState {
    pub doc: Arc<Document>,
    board: RwLock<StatusBoard>,
    lookup: ArcSwapOption<LookupTable>,
    pub layout: LayoutCache,
}

impl DocumentState {
    pub fn new(doc: Document) -> Self {
        Self {
            doc: Arc::new(doc),
            board: RwLock::new(StatusBoard::default()),
            lookup: ArcSwapOption::empty(),
            layout: LayoutCache::default(),
        }
    }

    pub fn report(&self) -> BuildReport {
        let board = self.board.read();
        BuildReport {
            status: board.status,
            phase: board.job.as_ref().map(|j| j.phase),
            log: board.job.as_ref().map(|j| j.log.clone()).unwrap_or_default(),
            page_count: board.page_count,
            started: board.job.as_ref().map(|j| j.started.to_rfc3339()),
            last_build: board.last_build.map(|t| t.to_rfc3339()),
        }
    }

    pub fn status(&self) -> BuildStatus {
        self.board.read().status
    }

    pub fn page_count(&self) -> u32 {
        self.board.read().page_count
    }

    pub fn set_status(&self, status: BuildStatus) {
        self.board.write().status = status;
    }

    pub fn set_page_count(&self, count: u32) {
        self.board.write().page_count = count;
    }

    /// Install a new job as the current one.
    pub fn begin_job(&self, job: BuildJob) {
        let mut board = self.board.write();
        board.status = BuildStatus::Building;
        board.job = Some(job);
    }

    /// Apply `f` to the recorded job only if it is still `generation`.
    ///
    /// Returns whether the job matched.
    pub fn update_job(&self, generation: u64, f: impl FnOnce(&mut StatusBoard)) -> bool {
        let mut board = self.board.write();
        if board.job.as_ref().is_some_and(|j| j.generation == generation) {
            f(&mut board);
            true
        } else {
            false
        }
    }

    /// Current lookup table snapshot.
    pub fn lookup(&self) -> Option<Arc<LookupTable>> {
        self.lookup.load_full()
    }

    /// Atomically replace the lookup table.
    pub fn replace_lookup(&self, table: LookupTable) {
        self.lookup.store(Some(Arc::new(table)));
    }

    /// Load a previously persisted lookup table, if present and readable.
    pub fn restore_lookup(&self) {
        if let Ok(table) = LookupTable::read(&self.doc.lookup_path()) {
            self.replace_lookup(table);
        }
    }
}
