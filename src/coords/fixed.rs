//! Fixed-page regime: every page has the same intrinsic size.
//!
//! Pages are stacked vertically on the canvas, separated by `gap`:
//!
//! ```text
//! canvasX = localX * scaleX
//! canvasY = (page - 1) * (pageHeight + gap) + localY * scaleY
//! ```
//!
//! where `pageHeight` is the scaled (canvas) page height.

use super::{CanvasPoint, CoordError, PagePoint};
use crate::config::{CanvasConfig, Origin};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedMapper {
    scale_x: f64,
    scale_y: f64,
    /// Intrinsic page height in engine points.
    page_height: f64,
    gap: f64,
    origin: Origin,
    /// Pages known to exist; 0 when unknown.
    page_count: u32,
}

impl FixedMapper {
    pub fn new(canvas: &CanvasConfig, page_count: u32) -> Self {
        let scale_x = canvas.target_width / canvas.page_width;
        let scale_y = canvas
            .target_height
            .map_or(scale_x, |height| height / canvas.page_height);
        Self {
            scale_x,
            scale_y,
            page_height: canvas.page_height,
            gap: canvas.gap,
            origin: canvas.origin,
            page_count,
        }
    }

    /// Height of one page on the canvas.
    pub fn canvas_page_height(&self) -> f64 {
        self.page_height * self.scale_y
    }

    fn stride(&self) -> f64 {
        self.canvas_page_height() + self.gap
    }

    /// Engine y measured from the top of the page.
    fn from_top(&self, y: f64) -> f64 {
        match self.origin {
            Origin::Top => y,
            Origin::Bottom => self.page_height - y,
        }
    }

    pub fn to_canvas(&self, page: u32, x: f64, y: f64) -> Result<CanvasPoint, CoordError> {
        if page == 0 {
            return Err(CoordError::UnknownPage(page));
        }
        Ok(CanvasPoint {
            x: x * self.scale_x,
            y: f64::from(page - 1) * self.stride() + self.from_top(y) * self.scale_y,
        })
    }

    /// Points above the first page map to page 1, points past the last
    /// known page to that page.
    pub fn to_page(&self, x: f64, y: f64) -> PagePoint {
        let stride = self.stride();
        let mut index = (y / stride).floor().max(0.0);
        if self.page_count > 0 {
            index = index.min(f64::from(self.page_count - 1));
        }
        let local_y = (y - index * stride) / self.scale_y;

        PagePoint {
            page: index as u32 + 1,
            x: x / self.scale_x,
            // flipping is its own inverse
            y: self.from_top(local_y),
        }
    }

    /// Like [`Self::to_page`], but with `y` clamped onto `page`.
    pub fn to_page_on(&self, page: u32, x: f64, y: f64) -> PagePoint {
        let top = f64::from(page.saturating_sub(1)) * self.stride();
        let local_y = ((y - top) / self.scale_y).clamp(0.0, self.page_height);
        PagePoint {
            page: page.max(1),
            x: x / self.scale_x,
            y: self.from_top(local_y),
        }
    }
}
