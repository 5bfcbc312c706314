//! Single-pass streaming parser for SyncTeX cross-reference logs.
//!
//! # Record Format
//!
//! ```text
//! SyncTeX Version:1
//! Input:1:/proj/main.tex          input identifier → path
//! Magnification:1000
//! Unit:1
//! Content:
//! {1                              page 1 begins
//! x1,12:4736286,8799634           current point: tag,line:h,v
//! g1,14:4736286,9586066           glue
//! (1,15:4736286,10372498:...      hbox with width/height/depth
//! }1                              page 1 ends
//! Input:3:/proj/chap.tex          inputs may be declared mid-stream
//! ```
//!
//! Raw coordinates are scaled to points with
//! `unit * magnification / 1000 / 65536`.
//!
//! Memory is bounded by the input table plus one entry per distinct line:
//! the log itself is consumed line by line.

use super::table::LineKey;
use super::SynctexError;
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    collections::BTreeMap,
    io::BufRead,
    path::{Component, Path, PathBuf},
};
use tokio_util::sync::CancellationToken;

/// Record types placed at a source line position.
///
/// `[` (vbox) spans whole paragraphs and would pin every line of the
/// paragraph to its top.
const CONTENT_TYPES: &[u8] = b"xkg$hv(";

/// Scaled points per point.
const SP_PER_PT: f64 = 65536.0;

/// Records between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 4096;

/// First position seen for a line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    /// Resolved source file.
    pub file: PathBuf,
    pub line: u32,
}

/// Parser inputs describing the project.
#[derive(Debug, Clone)]
pub struct ParseOptions<'a> {
    /// Directory relative input paths are resolved against.
    pub root: &'a Path,
    /// Main source file (keys without a file prefix).
    pub main_file: &'a Path,
    /// Files worth indexing; anything else (class files, packages) is skipped.
    pub tracked: &'a FxHashSet<PathBuf>,
}

/// Counters for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseStats {
    pub records: usize,
    pub skipped_malformed: usize,
    pub skipped_undeclared: usize,
    pub skipped_untracked: usize,
}

/// Parse result before snippets are attached.
#[derive(Debug, Default)]
pub struct RawTable {
    pub entries: BTreeMap<LineKey, RawEntry>,
    pub stats: ParseStats,
}

struct Parser<'a> {
    opts: ParseOptions<'a>,
    inputs: FxHashMap<u32, PathBuf>,
    unit: f64,
    magnification: f64,
    page: u32,
    out: RawTable,
}

impl<'a> Parser<'a> {
    fn new(opts: ParseOptions<'a>) -> Self {
        Self {
            opts,
            inputs: FxHashMap::default(),
            unit: 1.0,
            magnification: 1000.0,
            page: 0,
            out: RawTable::default(),
        }
    }

    fn scale(&self) -> f64 {
        self.unit * self.magnification / 1000.0 / SP_PER_PT
    }

    fn line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(&first) = line.as_bytes().first() else {
            return;
        };

        match first {
            b'{' => {
                if let Ok(page) = line[1..].trim().parse() {
                    self.page = page;
                }
            }
            t if CONTENT_TYPES.contains(&t) => self.content(&line[1..]),
            _ => self.preamble(line),
        }
    }

    fn preamble(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix("Input:") {
            if let Some((tag, path)) = rest.split_once(':')
                && let Ok(tag) = tag.trim().parse()
            {
                let path = normalize(self.opts.root, Path::new(path));
                self.inputs.insert(tag, path);
            }
        } else if let Some(rest) = line.strip_prefix("Unit:") {
            if let Ok(unit) = rest.trim().parse::<f64>()
                && unit > 0.0
            {
                self.unit = unit;
            }
        } else if let Some(rest) = line.strip_prefix("Magnification:")
            && let Ok(mag) = rest.trim().parse::<f64>()
            && mag > 0.0
        {
            self.magnification = mag;
        }
    }

    /// `tag,line[,column]:h,v[:W,H,D]`
    fn content(&mut self, body: &str) {
        self.out.stats.records += 1;

        let Some((ids, coords)) = parse_record(body) else {
            self.out.stats.skipped_malformed += 1;
            return;
        };
        let (tag, line) = ids;

        let Some(path) = self.inputs.get(&tag) else {
            self.out.stats.skipped_undeclared += 1;
            return;
        };
        if !self.opts.tracked.contains(path) {
            self.out.stats.skipped_untracked += 1;
            return;
        }

        let key = if path == self.opts.main_file {
            LineKey::Main(line)
        } else {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            LineKey::File(name, line)
        };

        if self.out.entries.contains_key(&key) {
            return;
        }

        let scale = self.scale();
        let entry = RawEntry {
            page: self.page,
            x: coords.0 as f64 * scale,
            y: coords.1 as f64 * scale,
            file: path.clone(),
            line,
        };
        self.out.entries.insert(key, entry);
    }
}

/// Split a content record into `(tag, line)` and raw `(h, v)`.
fn parse_record(body: &str) -> Option<((u32, u32), (i64, i64))> {
    let (ids, rest) = body.split_once(':')?;
    let mut ids = ids.split(',');
    let tag = ids.next()?.trim().parse().ok()?;
    let line = ids.next()?.trim().parse().ok()?;

    let coords = rest.split(':').next()?;
    let (h, v) = coords.split_once(',')?;
    Some(((tag, line), (h.trim().parse().ok()?, v.trim().parse().ok()?)))
}

/// Absolute, lexically normalized path (`.` dropped, `..` applied).
pub fn normalize(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Parse a whole log stream.
///
/// Returns [`SynctexError::Cancelled`] if `cancel` fires mid-stream.
pub fn parse<R: BufRead>(
    mut reader: R,
    opts: ParseOptions<'_>,
    cancel: Option<&CancellationToken>,
) -> Result<RawTable, SynctexError> {
    let mut parser = Parser::new(opts);
    let mut buf = Vec::with_capacity(256);
    let mut count = 0usize;

    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| SynctexError::Io(PathBuf::new(), e))?;
        if read == 0 {
            break;
        }

        count += 1;
        if count % CANCEL_CHECK_INTERVAL == 0 && cancel.is_some_and(CancellationToken::is_cancelled)
        {
            return Err(SynctexError::Cancelled);
        }

        parser.line(&String::from_utf8_lossy(&buf));
    }

    Ok(parser.out)
}
