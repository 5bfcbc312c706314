//! Change classification for the build scheduler.
//!
//! Decides whether a changed file allows the fast single-pass compile or
//! forces the slow multi-pass path.
//!
//! | Category   | Compile path | Example Files                     |
//! |------------|--------------|-----------------------------------|
//! | Body       | Fast         | `chapters/*.tex`, `figures/*.pdf` |
//! | Structural | Slow         | `refs.bib`, `paper.cls`, `*.sty`  |
//! | Ignored    | -            | editor temp files, build output   |

use crate::config::BuildConfig;
use std::path::Path;

/// Category of a changed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    /// Not a build input.
    Ignored,
    /// Body content; the cached preamble format stays usable.
    Body,
    /// Bibliography, style or class change.
    Structural,
}

impl ChangeKind {
    /// Short name used in logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Body => "body",
            Self::Structural => "structural",
        }
    }
}

/// Files the compiler writes next to its inputs; watching them would loop.
const GENERATED_EXTENSIONS: &[&str] = &[
    "aux", "log", "pdf", "fls", "fdb_latexmk", "out", "toc", "lof", "lot", "bbl", "blg", "synctex",
    "gz", "fmt",
];

/// Check if path is a temp/backup file (editor artifacts).
pub fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
        || name.starts_with("#")
}

/// Categorize a changed path for a document with the given output directory.
pub fn categorize_path(path: &Path, output: &Path, config: &BuildConfig) -> ChangeKind {
    if is_temp_file(path) || path.starts_with(output) {
        return ChangeKind::Ignored;
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    if GENERATED_EXTENSIONS.contains(&ext.as_str()) && !is_figure_pdf(path) {
        ChangeKind::Ignored
    } else if config.structural_extensions.iter().any(|s| s == &ext) {
        ChangeKind::Structural
    } else {
        ChangeKind::Body
    }
}

/// Included PDF figures are inputs, compiler output PDFs are not.
fn is_figure_pdf(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "pdf")
        && path
            .components()
            .any(|c| matches!(c.as_os_str().to_str(), Some("figures" | "figs" | "images" | "img")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn kind(path: &str) -> ChangeKind {
        categorize_path(
            Path::new(path),
            Path::new("/proj/out"),
            &BuildConfig::default(),
        )
    }

    #[test]
    fn test_body_changes() {
        assert_eq!(kind("/proj/paper/main.tex"), ChangeKind::Body);
        assert_eq!(kind("/proj/paper/chapters/intro.tex"), ChangeKind::Body);
        assert_eq!(kind("/proj/paper/figures/plot.pdf"), ChangeKind::Body);
        assert_eq!(kind("/proj/paper/figures/plot.png"), ChangeKind::Body);
    }

    #[test]
    fn test_structural_changes() {
        assert_eq!(kind("/proj/paper/refs.bib"), ChangeKind::Structural);
        assert_eq!(kind("/proj/paper/acm.cls"), ChangeKind::Structural);
        assert_eq!(kind("/proj/paper/macros.STY"), ChangeKind::Structural);
    }

    #[test]
    fn test_ignored_changes() {
        assert_eq!(kind("/proj/paper/main.aux"), ChangeKind::Ignored);
        assert_eq!(kind("/proj/paper/main.pdf"), ChangeKind::Ignored);
        assert_eq!(kind("/proj/paper/.main.tex.swp"), ChangeKind::Ignored);
        assert_eq!(kind("/proj/paper/main.tex~"), ChangeKind::Ignored);
        assert_eq!(kind("/proj/out/page-1.svg"), ChangeKind::Ignored);
    }

    #[test]
    fn test_structural_outranks_body() {
        let kinds = [ChangeKind::Body, ChangeKind::Structural, ChangeKind::Ignored];
        assert_eq!(kinds.into_iter().max(), Some(ChangeKind::Structural));
        assert!(is_temp_file(&PathBuf::from("#main.tex#")));
    }
}
