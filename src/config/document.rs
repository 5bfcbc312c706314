//! `[[document]]` entries.
//!
//! Each entry registers one document with the scheduler. Primary documents
//! are compiled from source; dependent (diff) documents are derived from a
//! primary after each full render.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Coordinate regime used for a document's canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    /// Every page shares one intrinsic size (PDF-like).
    #[default]
    Fixed,
    /// Heterogeneous pages, optionally grouped side-by-side.
    Flow,
}

/// One `[[document]]` entry.
///
/// # Example
/// ```toml
/// [[document]]
/// name = "paper"
/// root = "paper"
/// main = "main.tex"
/// output = "out/paper"
///
/// [[document]]
/// name = "paper-diff"
/// output = "out/paper-diff"
/// depends_on = "paper"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentConfig {
    pub name: String,

    /// Source root; required for primary documents.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Main source file, relative to `root`.
    #[serde(default)]
    pub main: Option<PathBuf>,

    /// Output directory for page artifacts, metadata and the lookup table.
    pub output: PathBuf,

    #[serde(default)]
    pub layout: LayoutMode,

    /// Name of the primary document this diff document is derived from.
    #[serde(default)]
    pub depends_on: Option<String>,
}

impl DocumentConfig {
    pub const fn is_dependent(&self) -> bool {
        self.depends_on.is_some()
    }
}
