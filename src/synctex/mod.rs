//! Cross-reference extraction: compiler SyncTeX log → [`LookupTable`].
//!
//! # Pipeline
//!
//! ```text
//! main.synctex.gz ──gunzip──▶ parser (one pass) ──▶ raw entries
//!                                                      │
//!            source files ──▶ SourceCache ──snippets───┤
//!                                                      ▼
//!                                              LookupTable ──▶ lookup.json
//! ```
//!
//! Extraction is blocking I/O; callers on the async side run it on the
//! blocking pool.

mod parser;
mod table;

pub use parser::{ParseOptions, RawEntry, normalize};
pub use table::{LineKey, LookupEntry, LookupTable, TableMeta};

use crate::{document::Document, log};
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Maximum snippet length, in characters.
const SNIPPET_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum SynctexError {
    #[error("Failed to read `{0}`")]
    Io(PathBuf, #[source] io::Error),

    #[error("No cross-reference log at `{0}`")]
    Missing(PathBuf),

    #[error("Document `{0}` has no main source file")]
    NoMainFile(String),

    #[error("Extraction cancelled")]
    Cancelled,
}

// ============================================================================
// Source Snippets
// ============================================================================

/// Lazily loaded source files, split into lines.
#[derive(Debug, Default)]
pub struct SourceCache {
    files: FxHashMap<PathBuf, Option<Vec<String>>>,
}

impl SourceCache {
    /// Provide file content directly.
    #[cfg(test)]
    pub fn insert(&mut self, path: PathBuf, text: &str) {
        self.files
            .insert(path, Some(text.lines().map(str::to_owned).collect()));
    }

    fn lines(&mut self, path: &Path) -> Option<&[String]> {
        self.files
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                let bytes = fs::read(path).ok()?;
                Some(
                    String::from_utf8_lossy(&bytes)
                        .lines()
                        .map(str::to_owned)
                        .collect(),
                )
            })
            .as_deref()
    }

    /// Number of lines in `path`, 0 if unreadable.
    pub fn line_count(&mut self, path: &Path) -> usize {
        self.lines(path).map_or(0, <[String]>::len)
    }

    /// Trimmed, shortened text of a 1-based line.
    ///
    /// `None` for blank lines, comment lines and lines that do not exist.
    pub fn snippet(&mut self, path: &Path, line: u32) -> Option<String> {
        let index = usize::try_from(line).ok()?.checked_sub(1)?;
        let text = self.lines(path)?.get(index)?.trim();
        if text.is_empty() || text.starts_with('%') {
            return None;
        }
        Some(text.chars().take(SNIPPET_CHARS).collect())
    }
}

/// Turn raw parser output into table entries, dropping lines without text.
pub fn attach_snippets(
    raw: BTreeMap<LineKey, RawEntry>,
    sources: &mut SourceCache,
) -> BTreeMap<LineKey, LookupEntry> {
    raw.into_iter()
        .filter_map(|(key, entry)| {
            let content = sources.snippet(&entry.file, entry.line)?;
            Some((
                key,
                LookupEntry {
                    page: entry.page,
                    x: entry.x,
                    y: entry.y,
                    content,
                },
            ))
        })
        .collect()
}

// ============================================================================
// Extraction
// ============================================================================

/// Source files under `root` with a tracked extension, excluding `output`.
pub fn tracked_sources(root: &Path, output: &Path, extensions: &[String]) -> FxHashSet<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(output))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|t| t.eq_ignore_ascii_case(ext)))
        })
        .map(|e| normalize(root, e.path()))
        .collect()
}

/// Locate the log: compressed first, plain `.synctex` as fallback.
fn find_log(doc: &Document) -> Option<PathBuf> {
    let gz = doc.synctex_path();
    if gz.is_file() {
        return Some(gz);
    }
    let plain = gz.with_extension("");
    plain.is_file().then_some(plain)
}

fn open_log(path: &Path) -> Result<Box<dyn BufRead>, SynctexError> {
    let file = File::open(path).map_err(|e| SynctexError::Io(path.to_path_buf(), e))?;
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Build a fresh lookup table from the document's latest cross-reference log.
///
/// `generatedAt` is the log's modification time, so extracting the same log
/// twice yields identical tables.
pub fn extract(
    doc: &Document,
    tracked_extensions: &[String],
    cancel: Option<&CancellationToken>,
) -> Result<LookupTable, SynctexError> {
    let main = doc
        .main_path()
        .ok_or_else(|| SynctexError::NoMainFile(doc.name.clone()))?;
    let root = doc.root();
    let main = normalize(root, &main);

    let log = find_log(doc).ok_or_else(|| SynctexError::Missing(doc.synctex_path()))?;
    let modified = fs::metadata(&log)
        .and_then(|m| m.modified())
        .map_err(|e| SynctexError::Io(log.clone(), e))?;

    let tracked = tracked_sources(root, &doc.output, tracked_extensions);
    let opts = ParseOptions {
        root,
        main_file: &main,
        tracked: &tracked,
    };
    let raw = parser::parse(open_log(&log)?, opts, cancel).map_err(|e| match e {
        SynctexError::Io(_, source) => SynctexError::Io(log.clone(), source),
        other => other,
    })?;

    if raw.stats.skipped_malformed > 0 {
        log!("synctex"; "{}: skipped {} malformed records", doc.name, raw.stats.skipped_malformed);
    }

    let mut sources = SourceCache::default();
    let total_lines = sources.line_count(&main);
    let lines = attach_snippets(raw.entries, &mut sources);

    let meta = TableMeta {
        source_file: main
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        generated_at: DateTime::<Utc>::from(modified).to_rfc3339(),
        total_lines,
    };

    Ok(LookupTable { meta, lines })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    const MAIN: &str = "\\documentclass{article}\n\\begin{document}\n\n% a comment\nHello world.\n\\input{chap}\n\\end{document}\n";

    fn document(root: &Path) -> Document {
        let config = format!(
            "[[document]]\nname = \"paper\"\nroot = \"{}\"\nmain = \"main.tex\"\noutput = \"{}\"\n",
            root.display(),
            root.join("out").display()
        );
        let config: AppConfig = toml::from_str(&config).unwrap();
        Document::from_config(&config.documents[0], &config)
    }

    fn write_log(doc: &Document, root: &Path) {
        let log = format!(
            "SyncTeX Version:1\nInput:1:{main}\nInput:2:{chap}\nInput:3:/usr/share/texmf/article.cls\nOutput:pdf\nMagnification:1000\nUnit:1\nContent:\n{{1\n[1,5:0,0:100,100,0\nx1,5:4718592,7208960\nx1,4:4718592,7208960\nx1,3:4718592,7208960\nx3,80:1,1\n}}1\n{{2\nx2,1:4718592,3276800\nx1,5:1,1\n}}2\n",
            main = root.join("main.tex").display(),
            chap = root.join("chap.tex").display(),
        );
        fs::create_dir_all(doc.build_dir()).unwrap();
        let mut gz = GzEncoder::new(File::create(doc.synctex_path()).unwrap(), Compression::default());
        gz.write_all(log.as_bytes()).unwrap();
        gz.finish().unwrap();
    }

    fn project() -> (tempfile::TempDir, Document) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.tex"), MAIN).unwrap();
        fs::write(dir.path().join("chap.tex"), "Chapter text here.\n").unwrap();
        let doc = document(dir.path());
        write_log(&doc, dir.path());
        (dir, doc)
    }

    #[test]
    fn test_extract_table() {
        let (_dir, doc) = project();
        let table = extract(&doc, &["tex".into()], None).unwrap();

        assert_eq!(table.meta.source_file, "main.tex");
        assert_eq!(table.meta.total_lines, 7);

        let hello = table.get(&LineKey::Main(5)).unwrap();
        assert_eq!((hello.page, hello.x, hello.y), (1, 72.0, 110.0));
        assert_eq!(hello.content, "Hello world.");

        // comment and blank lines have no entry
        assert!(table.get(&LineKey::Main(4)).is_none());
        assert!(table.get(&LineKey::Main(3)).is_none());

        let chap = table.get_str("chap.tex:1").unwrap();
        assert_eq!((chap.page, chap.y), (2, 50.0));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_extract_idempotent() {
        let (_dir, doc) = project();
        let first = extract(&doc, &["tex".into()], None).unwrap();
        let second = extract(&doc, &["tex".into()], None).unwrap();
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn test_plain_log_fallback() {
        let (_dir, doc) = project();
        let plain = doc.synctex_path().with_extension("");
        fs::write(&plain, format!("Input:1:{}\n{{1\nx1,5:65536,65536\n", doc.main_path().unwrap().display())).unwrap();
        fs::remove_file(doc.synctex_path()).unwrap();

        let table = extract(&doc, &["tex".into()], None).unwrap();
        assert_eq!(table.get(&LineKey::Main(5)).unwrap().x, 1.0);
    }

    #[test]
    fn test_missing_log() {
        let (_dir, doc) = project();
        fs::remove_file(doc.synctex_path()).unwrap();
        assert!(matches!(
            extract(&doc, &["tex".into()], None),
            Err(SynctexError::Missing(_))
        ));
    }

    #[test]
    fn test_snippet_truncated() {
        let mut sources = SourceCache::default();
        let long = "x".repeat(200);
        sources.insert(PathBuf::from("/p/a.tex"), &format!("  {long}\n%c\n"));

        assert_eq!(sources.snippet(Path::new("/p/a.tex"), 1).unwrap().len(), SNIPPET_CHARS);
        assert!(sources.snippet(Path::new("/p/a.tex"), 2).is_none());
        assert!(sources.snippet(Path::new("/p/a.tex"), 0).is_none());
        assert!(sources.snippet(Path::new("/p/a.tex"), 9).is_none());
    }
}
