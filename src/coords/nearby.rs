//! Region queries: which source lines sit under an annotation's bounds.

use super::{CanvasRect, CoordError, Mapper};
use crate::config::CanvasConfig;
use crate::synctex::LookupTable;
use serde::Serialize;

/// A source line found near a canvas region, positioned on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyLine {
    /// Lookup key (`12`, `chap.tex:4`).
    pub line: String,
    pub content: String,
    pub x: f64,
    pub y: f64,
}

/// Lines on the page under `rect`, sorted by line number.
///
/// The page is taken from the top-left corner; regions spanning a page
/// boundary only see the first page. Entries must fall within the
/// configured vertical margin of the region. Only wide regions (horizontal
/// strokes, underlines) are also filtered horizontally, so vertical marks
/// in the margin still find their lines.
pub fn find_nearby_lines(
    table: &LookupTable,
    mapper: &Mapper,
    canvas: &CanvasConfig,
    rect: CanvasRect,
) -> Result<Vec<NearbyLine>, CoordError> {
    let rect = rect.normalized();
    let top_left = mapper.to_page(rect.x0, rect.y0)?;
    let page = top_left.page;
    // Cut off at the bottom edge of the top-left page
    let bottom_right = mapper.to_page_on(page, rect.x1, rect.y1)?;

    // Flipped origins swap the corners' engine y
    let (min_y, max_y) = (
        top_left.y.min(bottom_right.y) - canvas.nearby_margin,
        top_left.y.max(bottom_right.y) + canvas.nearby_margin,
    );
    let (min_x, max_x) = (
        top_left.x.min(bottom_right.x) - canvas.horizontal_margin,
        top_left.x.max(bottom_right.x) + canvas.horizontal_margin,
    );
    let horizontal = rect.width() > rect.height() * canvas.horizontal_ratio;

    let mut lines = Vec::new();
    for (key, entry) in table.on_page(page) {
        if entry.y < min_y || entry.y > max_y {
            continue;
        }
        if horizontal && (entry.x < min_x || entry.x > max_x) {
            continue;
        }
        let point = mapper.to_canvas(entry.page, entry.x, entry.y)?;
        lines.push((key, entry, point));
    }

    lines.sort_by(|(a, ..), (b, ..)| a.line().cmp(&b.line()).then_with(|| a.cmp(b)));

    Ok(lines
        .into_iter()
        .map(|(key, entry, point)| NearbyLine {
            line: key.to_string(),
            content: entry.content.clone(),
            x: point.x,
            y: point.y,
        })
        .collect())
}
