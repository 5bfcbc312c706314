//! `[canvas]` section configuration.
//!
//! Geometry of the annotation canvas in the fixed-page regime, plus the
//! tolerances used by region queries.

use super::defaults;
use educe::Educe;
use serde::{Deserialize, Serialize};

/// Which edge the engine's vertical coordinate is measured from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// `y` grows downwards from the top edge (SyncTeX).
    #[default]
    Top,
    /// `y` grows upwards from the bottom edge (PDF user space).
    Bottom,
}

/// `[canvas]` section in pagesync.toml.
///
/// # Example
/// ```toml
/// [canvas]
/// target_width = 1000.0
/// gap = 16.0
/// page_width = 595.0   # A4
/// page_height = 842.0
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct CanvasConfig {
    /// Canvas width a page is scaled to.
    #[serde(default = "defaults::canvas::target_width")]
    #[educe(Default = defaults::canvas::target_width())]
    pub target_width: f64,

    /// Canvas height a page is scaled to; proportional to width when unset.
    #[serde(default)]
    pub target_height: Option<f64>,

    /// Vertical space between consecutive pages (and between flow units).
    #[serde(default = "defaults::canvas::gap")]
    #[educe(Default = defaults::canvas::gap())]
    pub gap: f64,

    /// Intrinsic page width in engine points.
    #[serde(default = "defaults::canvas::page_width")]
    #[educe(Default = defaults::canvas::page_width())]
    pub page_width: f64,

    /// Intrinsic page height in engine points.
    #[serde(default = "defaults::canvas::page_height")]
    #[educe(Default = defaults::canvas::page_height())]
    pub page_height: f64,

    #[serde(default)]
    pub origin: Origin,

    /// Vertical tolerance (engine points) around a region query box.
    #[serde(default = "defaults::canvas::nearby_margin")]
    #[educe(Default = defaults::canvas::nearby_margin())]
    pub nearby_margin: f64,

    /// Horizontal tolerance (engine points) for wide region queries.
    #[serde(default = "defaults::canvas::horizontal_margin")]
    #[educe(Default = defaults::canvas::horizontal_margin())]
    pub horizontal_margin: f64,

    /// Width/height ratio above which a region counts as a horizontal gesture.
    #[serde(default = "defaults::canvas::horizontal_ratio")]
    #[educe(Default = defaults::canvas::horizontal_ratio())]
    pub horizontal_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_canvas_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();

        assert_eq!(config.canvas.target_width, 1200.0);
        assert_eq!(config.canvas.page_width, 612.0);
        assert_eq!(config.canvas.origin, Origin::Top);
        assert!(config.canvas.target_height.is_none());
    }

    #[test]
    fn test_canvas_origin_bottom() {
        let config = r#"
            [canvas]
            origin = "bottom"
            target_height = 1500.0
        "#;
        let config: AppConfig = toml::from_str(config).unwrap();

        assert_eq!(config.canvas.origin, Origin::Bottom);
        assert_eq!(config.canvas.target_height, Some(1500.0));
    }
}
