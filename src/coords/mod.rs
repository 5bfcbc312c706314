//! Coordinate mapping between engine page space and the annotation canvas.
//!
//! | Regime | Mapper            | Page geometry                      |
//! |--------|-------------------|------------------------------------|
//! | Fixed  | [`FixedMapper`]   | one configured page size, stacked  |
//! | Flow   | [`PageLayout`]    | per-page sizes from page metadata  |
//!
//! All functions here are pure apart from [`Mapper::for_document`], which
//! loads the current page layout snapshot.

pub mod fixed;
pub mod layout;
pub mod nearby;

pub use fixed::FixedMapper;
pub use layout::PageLayout;
pub use nearby::find_nearby_lines;

use crate::config::{CanvasConfig, LayoutMode};
use crate::document::DocumentState;
use serde::Serialize;
use std::{io, path::PathBuf, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("page {0} is not part of the layout")]
    UnknownPage(u32),

    #[error("page layout is empty")]
    EmptyLayout,

    #[error("Failed to read page metadata `{0}`")]
    Metadata(PathBuf, #[source] io::Error),

    #[error("Invalid page metadata `{0}`")]
    InvalidMetadata(PathBuf, #[source] serde_json::Error),
}

/// A point on the annotation canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CanvasPoint {
    pub x: f64,
    pub y: f64,
}

/// A point on a page, in engine units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PagePoint {
    pub page: u32,
    pub x: f64,
    pub y: f64,
}

/// Canvas bounding box given by two corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasRect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl CanvasRect {
    pub const fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Same rectangle with `(x0, y0)` as the top-left corner.
    pub fn normalized(self) -> Self {
        Self {
            x0: self.x0.min(self.x1),
            y0: self.y0.min(self.y1),
            x1: self.x0.max(self.x1),
            y1: self.y0.max(self.y1),
        }
    }

    pub fn width(&self) -> f64 {
        (self.x1 - self.x0).abs()
    }

    pub fn height(&self) -> f64 {
        (self.y1 - self.y0).abs()
    }
}

/// Regime-specific mapper of one document.
#[derive(Debug, Clone)]
pub enum Mapper {
    Fixed(FixedMapper),
    Flow(Arc<PageLayout>),
}

impl Mapper {
    pub fn for_document(state: &DocumentState, canvas: &CanvasConfig) -> Result<Self, CoordError> {
        match state.doc.layout {
            LayoutMode::Fixed => Ok(Self::Fixed(FixedMapper::new(canvas, state.page_count()))),
            LayoutMode::Flow => {
                let layout = state.layout.get(&state.doc.metadata_path(), canvas.gap)?;
                Ok(Self::Flow(layout))
            }
        }
    }

    /// Page-local engine coordinates → canvas.
    pub fn to_canvas(&self, page: u32, x: f64, y: f64) -> Result<CanvasPoint, CoordError> {
        match self {
            Self::Fixed(mapper) => mapper.to_canvas(page, x, y),
            Self::Flow(layout) => layout.to_canvas(page, x, y),
        }
    }

    /// Canvas → page and page-local engine coordinates.
    pub fn to_page(&self, x: f64, y: f64) -> Result<PagePoint, CoordError> {
        match self {
            Self::Fixed(mapper) => Ok(mapper.to_page(x, y)),
            Self::Flow(layout) => layout.to_page(x, y),
        }
    }

    /// Canvas → page-local coordinates on a known `page`.
    pub fn to_page_on(&self, page: u32, x: f64, y: f64) -> Result<PagePoint, CoordError> {
        match self {
            Self::Fixed(mapper) => Ok(mapper.to_page_on(page, x, y)),
            Self::Flow(layout) => layout.to_page_on(page, x, y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::document::Document;
    use std::fs;

    fn state(root: &std::path::Path, layout: &str) -> DocumentState {
        let config = format!(
            "[[document]]\nname = \"site\"\nroot = \"{root}\"\nmain = \"index.html\"\noutput = \"{root}/out\"\nlayout = \"{layout}\"\n",
            root = root.display()
        );
        let config: AppConfig = toml::from_str(&config).unwrap();
        DocumentState::new(Document::from_config(&config.documents[0], &config))
    }

    #[test]
    fn test_flow_mapper_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), "flow");
        fs::create_dir_all(&state.doc.output).unwrap();
        fs::write(
            state.doc.metadata_path(),
            r#"[{"page": 1, "width": 800, "height": 1000}, {"page": 2, "width": 600, "height": 900}]"#,
        )
        .unwrap();

        let mapper = Mapper::for_document(&state, &CanvasConfig::default()).unwrap();
        let p = mapper.to_canvas(2, 10.0, 10.0).unwrap();
        // centered in 800, below page 1 and the default 24 gap
        assert_eq!((p.x, p.y), (110.0, 1034.0));
        assert_eq!(mapper.to_page(p.x, p.y).unwrap().page, 2);
    }

    #[test]
    fn test_flow_mapper_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), "flow");
        assert!(matches!(
            Mapper::for_document(&state, &CanvasConfig::default()),
            Err(CoordError::Metadata(..))
        ));
    }

    #[test]
    fn test_fixed_mapper_uses_page_count() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), "fixed");
        state.set_page_count(2);

        let mapper = Mapper::for_document(&state, &CanvasConfig::default()).unwrap();
        assert_eq!(mapper.to_page(0.0, 1.0e9).unwrap().page, 2);
    }
}
