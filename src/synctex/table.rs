//! The source line → page coordinate lookup table.
//!
//! Persisted per document as `lookup.json`:
//!
//! ```json
//! {
//!   "meta": { "sourceFile": "main.tex", "generatedAt": "...", "totalLines": 240 },
//!   "lines": {
//!     "12": { "page": 1, "x": 72.0, "y": 110.5, "content": "\\section{Intro}" },
//!     "chap.tex:4": { "page": 3, "x": 72.0, "y": 96.2, "content": "Some text" }
//!   }
//! }
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::BTreeMap,
    fmt,
    fs, io,
    path::Path,
    str::FromStr,
};

// ============================================================================
// Keys
// ============================================================================

/// Line identity: a bare line of the main file, or `file:line` elsewhere.
///
/// Ordering puts main-file lines first (numerically), then included files by
/// name and line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LineKey {
    Main(u32),
    File(String, u32),
}

impl LineKey {
    pub const fn line(&self) -> u32 {
        match self {
            Self::Main(line) | Self::File(_, line) => *line,
        }
    }
}

impl fmt::Display for LineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main(line) => write!(f, "{line}"),
            Self::File(file, line) => write!(f, "{file}:{line}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidLineKey(pub String);

impl fmt::Display for InvalidLineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid line key `{}`", self.0)
    }
}

impl std::error::Error for InvalidLineKey {}

impl FromStr for LineKey {
    type Err = InvalidLineKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidLineKey(s.to_owned());
        match s.rsplit_once(':') {
            Some((file, line)) if !file.is_empty() => {
                let line = line.trim().parse().map_err(|_| invalid())?;
                Ok(Self::File(file.to_owned(), line))
            }
            Some(_) => Err(invalid()),
            None => s.trim().parse().map(Self::Main).map_err(|_| invalid()),
        }
    }
}

impl Serialize for LineKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LineKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Table
// ============================================================================

/// Position of the first rendered record of a source line, in engine points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupEntry {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMeta {
    pub source_file: String,
    pub generated_at: String,
    pub total_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupTable {
    pub meta: TableMeta,
    pub lines: BTreeMap<LineKey, LookupEntry>,
}

impl LookupTable {
    pub fn get(&self, key: &LineKey) -> Option<&LookupEntry> {
        self.lines.get(key)
    }

    /// Look up by the textual key form (`12`, `chap.tex:4`).
    pub fn get_str(&self, key: &str) -> Option<&LookupEntry> {
        self.get(&key.parse().ok()?)
    }

    /// Entries rendered on `page`.
    pub fn on_page(&self, page: u32) -> impl Iterator<Item = (&LineKey, &LookupEntry)> {
        self.lines.iter().filter(move |(_, e)| e.page == page)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write atomically: a temp file in the same directory, then rename.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(io::Error::other)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(io::Error::other)
    }
}
