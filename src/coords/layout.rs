//! Paginated-flow regime: heterogeneous pages, optionally grouped.
//!
//! The renderer writes one dimension record per page:
//!
//! ```json
//! [
//!   { "page": 1, "width": 800, "height": 1100 },
//!   { "page": 2, "width": 400, "height": 600, "group": "tabs" },
//!   { "page": 3, "width": 400, "height": 500, "group": "tabs" }
//! ]
//! ```
//!
//! Consecutive pages sharing a group form one unit laid out side by side.
//! Units are stacked top to bottom and centered against the widest unit:
//!
//! ```text
//!   ┌──────────────┐
//!   │      1       │
//!   └──────────────┘
//!     ┌─────┐ ┌─────┐
//!     │  2  │ │  3  │
//!     └─────┘ │     │
//!             └─────┘
//! ```

use super::{CanvasPoint, CoordError, PagePoint};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

// ============================================================================
// Metadata
// ============================================================================

/// Intrinsic size of one rendered page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDimension {
    pub page: u32,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MetadataFile {
    List(Vec<PageDimension>),
    Wrapped { pages: Vec<PageDimension> },
}

/// Read the dimension metadata written next to the page artifacts.
pub fn read_metadata(path: &Path) -> Result<Vec<PageDimension>, CoordError> {
    let content =
        fs::read_to_string(path).map_err(|e| CoordError::Metadata(path.to_path_buf(), e))?;
    let file: MetadataFile = serde_json::from_str(&content)
        .map_err(|e| CoordError::InvalidMetadata(path.to_path_buf(), e))?;
    Ok(match file {
        MetadataFile::List(pages) | MetadataFile::Wrapped { pages } => pages,
    })
}

// ============================================================================
// Layout
// ============================================================================

/// Placement of one page on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageBox {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Position inside the group, from the left.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_index: Option<usize>,
}

impl PageBox {
    fn bottom(&self) -> f64 {
        self.y + self.height
    }

    fn contains_y(&self, y: f64) -> bool {
        y >= self.y && y <= self.bottom()
    }

    /// Horizontal distance from `x` to the box, 0 inside.
    fn distance_x(&self, x: f64) -> f64 {
        if x < self.x {
            self.x - x
        } else {
            (x - (self.x + self.width)).max(0.0)
        }
    }

    /// Vertical distance from `y` to the box, 0 inside.
    fn distance_y(&self, y: f64) -> f64 {
        if y < self.y {
            self.y - y
        } else {
            (y - self.bottom()).max(0.0)
        }
    }

    fn local(&self, x: f64, y: f64) -> PagePoint {
        PagePoint {
            page: self.page,
            x: x - self.x,
            y: y - self.y,
        }
    }
}

/// Ordered page boxes of a paginated-flow document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageLayout {
    boxes: Vec<PageBox>,
}

impl PageLayout {
    pub fn compute(pages: &[PageDimension], gap: f64) -> Self {
        // Runs of consecutive pages sharing a group
        let mut units: Vec<&[PageDimension]> = Vec::new();
        let mut start = 0;
        for i in 1..=pages.len() {
            let split = i == pages.len()
                || pages[i].group.is_none()
                || pages[i].group != pages[i - 1].group;
            if split {
                units.push(&pages[start..i]);
                start = i;
            }
        }

        let unit_width = |unit: &[PageDimension]| {
            unit.iter().map(|p| p.width).sum::<f64>() + gap * (unit.len().saturating_sub(1)) as f64
        };
        let max_width = units.iter().map(|u| unit_width(u)).fold(0.0, f64::max);

        let mut boxes = Vec::with_capacity(pages.len());
        let mut cursor_y = 0.0;
        for unit in units {
            let mut cursor_x = (max_width - unit_width(unit)) / 2.0;
            let grouped = unit.len() > 1 || unit[0].group.is_some();

            for (index, page) in unit.iter().enumerate() {
                boxes.push(PageBox {
                    page: page.page,
                    x: cursor_x,
                    y: cursor_y,
                    width: page.width,
                    height: page.height,
                    group: page.group.clone(),
                    group_index: grouped.then_some(index),
                });
                cursor_x += page.width + gap;
            }

            let height = unit.iter().map(|p| p.height).fold(0.0, f64::max);
            cursor_y += height + gap;
        }

        Self { boxes }
    }

    #[cfg(test)]
    pub fn boxes(&self) -> &[PageBox] {
        &self.boxes
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn page(&self, page: u32) -> Option<&PageBox> {
        self.boxes.iter().find(|b| b.page == page)
    }

    pub fn to_canvas(&self, page: u32, x: f64, y: f64) -> Result<CanvasPoint, CoordError> {
        let b = self.page(page).ok_or(CoordError::UnknownPage(page))?;
        Ok(CanvasPoint {
            x: b.x + x,
            y: b.y + y,
        })
    }

    /// Canvas point → local coordinates on `page`, `y` clamped to its box.
    pub fn to_page_on(&self, page: u32, x: f64, y: f64) -> Result<PagePoint, CoordError> {
        let b = self.page(page).ok_or(CoordError::UnknownPage(page))?;
        Ok(b.local(x, y.clamp(b.y, b.bottom())))
    }

    /// Canvas point → page and page-local coordinates.
    ///
    /// Within the vertical band of a row an exact hit wins, otherwise the
    /// horizontally closest box (gutters between grouped pages). Below the
    /// last page clamps to the last page; gaps between rows and points above
    /// the first page go to the vertically closest box.
    pub fn to_page(&self, x: f64, y: f64) -> Result<PagePoint, CoordError> {
        let last = self.boxes.last().ok_or(CoordError::EmptyLayout)?;

        let mut best: Option<(&PageBox, f64)> = None;
        for b in self.boxes.iter().filter(|b| b.contains_y(y)) {
            let distance = b.distance_x(x);
            if distance == 0.0 {
                return Ok(b.local(x, y));
            }
            if best.is_none_or(|(_, d)| distance < d) {
                best = Some((b, distance));
            }
        }
        if let Some((b, _)) = best {
            return Ok(b.local(x, y));
        }

        let bottom = self.boxes.iter().map(PageBox::bottom).fold(f64::MIN, f64::max);
        if y > bottom {
            return Ok(last.local(x, y));
        }

        let closest = self
            .boxes
            .iter()
            .min_by(|a, b| {
                (a.distance_y(y), a.distance_x(x)).partial_cmp(&(b.distance_y(y), b.distance_x(x)))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(last);
        Ok(closest.local(x, y))
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug)]
struct CachedLayout {
    path: PathBuf,
    modified: SystemTime,
    layout: Arc<PageLayout>,
}

/// Layout of one document, recomputed when the metadata file's
/// modification time advances.
#[derive(Debug, Default)]
pub struct LayoutCache {
    entry: RwLock<Option<CachedLayout>>,
}

impl LayoutCache {
    pub fn get(&self, path: &Path, gap: f64) -> Result<Arc<PageLayout>, CoordError> {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| CoordError::Metadata(path.to_path_buf(), e))?;

        if let Some(cached) = self.entry.read().as_ref()
            && cached.path == path
            && cached.modified >= modified
        {
            return Ok(Arc::clone(&cached.layout));
        }

        let layout = Arc::new(PageLayout::compute(&read_metadata(path)?, gap));
        *self.entry.write() = Some(CachedLayout {
            path: path.to_path_buf(),
            modified,
            layout: Arc::clone(&layout),
        });
        Ok(layout)
    }

    #[cfg(test)]
    /// Number of pages of the cached layout, if any.
    pub fn cached_len(&self) -> Option<usize> {
        self.entry.read().as_ref().map(|c| c.layout.boxes().len())
    }
}
