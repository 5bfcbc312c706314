//! Cascading rebuild of dependent (diff) documents.
//!
//! After a primary's full render, each dependent receives a copy of the
//! primary's page artifacts and lookup table. The table is copied again
//! whenever a later extraction replaces it:
//!
//! ```text
//! <dependent output>/
//! ├── baseline/      pages of the reference revision (managed externally)
//! ├── current/       page-N.svg copied from the primary
//! ├── lookup.json    copied from the primary
//! └── pairs.json     per-page pairing of baseline/ and current/
//! ```

use super::dispatch::{ReloadSignal, SignalDispatcher};
use crate::document::Document;
use crate::log;
use crate::utils::hash;
use anyhow::{Context, Result};
use serde::Serialize;
use std::{collections::BTreeMap, fs, path::Path};

pub const BASELINE_DIR: &str = "baseline";
pub const CURRENT_DIR: &str = "current";
pub const PAIRS_FILE: &str = "pairs.json";

/// Pairing of one page number across both revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PagePair {
    pub page: u32,
    pub base: bool,
    pub current: bool,
    /// Present on one side only, or content differs.
    pub changed: bool,
}

/// Refresh `dependent` from `primary` and publish a full reload on it.
pub fn cascade(
    primary: &Document,
    dependent: &Document,
    dispatcher: &SignalDispatcher,
) -> Result<Vec<PagePair>> {
    let current = dependent.output.join(CURRENT_DIR);
    fs::create_dir_all(&current)
        .with_context(|| format!("Failed to create {}", current.display()))?;

    let source = primary.page_artifacts(&primary.output)?;
    for (page, path) in &source {
        let target = current.join(dependent.page_file(*page));
        fs::copy(path, &target)
            .with_context(|| format!("Failed to copy {} to {}", path.display(), target.display()))?;
    }

    // Stale pages from a longer previous revision
    for (page, path) in dependent.page_artifacts(&current)? {
        if !source.contains_key(&page) {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
    }

    share_lookup(primary, dependent)?;
    copy_if_exists(&primary.metadata_path(), &dependent.metadata_path())?;

    let pairs = pair_pages(dependent, &dependent.output.join(BASELINE_DIR), &current)?;
    let json = serde_json::to_string_pretty(&pairs)?;
    fs::write(dependent.output.join(PAIRS_FILE), json)?;

    let changed = pairs.iter().filter(|p| p.changed).count();
    log!("cascade"; "{} -> {}: {} pages, {} changed", primary.name, dependent.name, pairs.len(), changed);

    dispatcher.publish(&dependent.name, &ReloadSignal::full());
    Ok(pairs)
}

/// Copy the primary's lookup table, if it has one yet.
pub fn share_lookup(primary: &Document, dependent: &Document) -> Result<()> {
    fs::create_dir_all(&dependent.output)
        .with_context(|| format!("Failed to create {}", dependent.output.display()))?;
    copy_if_exists(&primary.lookup_path(), &dependent.lookup_path())
}

fn copy_if_exists(from: &Path, to: &Path) -> Result<()> {
    if from.is_file() {
        fs::copy(from, to)
            .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    }
    Ok(())
}

/// Pair every page number present in either directory.
pub fn pair_pages(doc: &Document, base_dir: &Path, current_dir: &Path) -> Result<Vec<PagePair>> {
    let base = doc.page_artifacts(base_dir)?;
    let current = doc.page_artifacts(current_dir)?;

    let mut pages: BTreeMap<u32, PagePair> = BTreeMap::new();
    for &page in base.keys().chain(current.keys()) {
        if pages.contains_key(&page) {
            continue;
        }
        let pair = match (base.get(&page), current.get(&page)) {
            (Some(a), Some(b)) => PagePair {
                page,
                base: true,
                current: true,
                changed: hash::file(a)? != hash::file(b)?,
            },
            (a, b) => PagePair {
                page,
                base: a.is_some(),
                current: b.is_some(),
                changed: true,
            },
        };
        pages.insert(page, pair);
    }

    Ok(pages.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::signal::{dispatch::ReloadKind, store::MemoryStore};
    use std::sync::Arc;

    fn documents(root: &Path) -> (Document, Document) {
        let config = format!(
            r#"
            [[document]]
            name = "paper"
            root = "{root}/src"
            main = "main.tex"
            output = "{root}/out/paper"

            [[document]]
            name = "paper-diff"
            output = "{root}/out/diff"
            depends_on = "paper"
            "#,
            root = root.display()
        );
        let config: AppConfig = toml::from_str(&config).unwrap();
        (
            Document::from_config(&config.documents[0], &config),
            Document::from_config(&config.documents[1], &config),
        )
    }

    #[test]
    fn test_cascade_copies_and_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, dependent) = documents(dir.path());

        fs::create_dir_all(&primary.output).unwrap();
        fs::write(primary.output.join("page-1.svg"), "<svg>1</svg>").unwrap();
        fs::write(primary.output.join("page-2.svg"), "<svg>2 new</svg>").unwrap();
        fs::write(primary.lookup_path(), "{}").unwrap();

        let baseline = dependent.output.join(BASELINE_DIR);
        fs::create_dir_all(&baseline).unwrap();
        fs::write(baseline.join("page-1.svg"), "<svg>1</svg>").unwrap();
        fs::write(baseline.join("page-2.svg"), "<svg>2 old</svg>").unwrap();
        fs::write(baseline.join("page-3.svg"), "<svg>3</svg>").unwrap();

        // left over from an earlier, longer revision
        let current = dependent.output.join(CURRENT_DIR);
        fs::create_dir_all(&current).unwrap();
        fs::write(current.join("page-3.svg"), "stale").unwrap();

        let store = Arc::new(MemoryStore::default());
        let dispatcher = SignalDispatcher::new(store);
        let pairs = cascade(&primary, &dependent, &dispatcher).unwrap();

        assert_eq!(
            pairs,
            vec![
                PagePair { page: 1, base: true, current: true, changed: false },
                PagePair { page: 2, base: true, current: true, changed: true },
                PagePair { page: 3, base: true, current: false, changed: true },
            ]
        );
        assert!(!current.join("page-3.svg").exists());
        assert!(dependent.lookup_path().exists());
        assert!(dependent.output.join(PAIRS_FILE).exists());

        let signal = dispatcher.latest("paper-diff").unwrap();
        assert_eq!(signal.kind, ReloadKind::Full);
        assert!(dispatcher.latest("paper").is_none());
    }

    #[test]
    fn test_share_lookup_replaces_table() {
        let dir = tempfile::tempdir().unwrap();
        let (primary, dependent) = documents(dir.path());

        // nothing extracted yet: no table, no error
        share_lookup(&primary, &dependent).unwrap();
        assert!(!dependent.lookup_path().exists());

        fs::create_dir_all(&primary.output).unwrap();
        fs::write(primary.lookup_path(), "{\"rev\": 2}").unwrap();
        share_lookup(&primary, &dependent).unwrap();
        assert_eq!(fs::read_to_string(dependent.lookup_path()).unwrap(), "{\"rev\": 2}");
    }
}
