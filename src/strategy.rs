//! Full-page versus tiled rendering decision

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::render::BYTES_PER_PIXEL;

/// Tile edge used up to [`StrategyThresholds::large_tile_zoom`]
pub const DEFAULT_TILE_SIZE: u32 = 256;
/// Tile edge used at extreme zoom, where small tiles mean too many calls
pub const LARGE_TILE_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyThresholds {
    /// At or below this zoom pages are always rendered whole
    pub low_zoom: f32,
    /// Above this zoom pages are always tiled
    pub high_zoom: f32,
    pub max_full_page_pixels: u64,
    pub max_full_page_bytes: u64,
    /// Tiling wins when less than this share of the page is on screen
    pub visibility_threshold: f32,
    pub tile_size: u32,
    pub large_tile_zoom: f32,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            low_zoom: 1.5,
            high_zoom: 4.0,
            max_full_page_pixels: 16_000_000,
            max_full_page_bytes: 64 * 1024 * 1024,
            visibility_threshold: 0.5,
            tile_size: DEFAULT_TILE_SIZE,
            large_tile_zoom: 8.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    FullPage,
    Tiled,
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RenderMode::FullPage => "full-page",
            RenderMode::Tiled => "tiled",
        })
    }
}

/// What the strategy looks at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyInput {
    pub zoom: f32,
    /// Page size in PDF points
    pub page_width: f32,
    pub page_height: f32,
    /// Viewport size in CSS pixels, when known
    pub viewport: Option<(f32, f32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderDecision {
    pub mode: RenderMode,
    pub tile_size: u32,
    /// Why this mode was picked; shown in diagnostics
    pub reason: String,
}

/// Picks full-page or tiled rendering for one page at one zoom.
#[must_use]
pub fn decide(input: &StrategyInput, thresholds: &StrategyThresholds) -> RenderDecision {
    let tile_size = if input.zoom > thresholds.large_tile_zoom {
        LARGE_TILE_SIZE.max(thresholds.tile_size)
    } else {
        thresholds.tile_size
    };
    let decision = |mode: RenderMode, reason: String| RenderDecision {
        mode,
        tile_size,
        reason,
    };

    let result = if input.zoom <= thresholds.low_zoom {
        decision(
            RenderMode::FullPage,
            format!("zoom {:.2} at or below {:.2}", input.zoom, thresholds.low_zoom),
        )
    } else if input.zoom > thresholds.high_zoom {
        decision(
            RenderMode::Tiled,
            format!("zoom {:.2} above {:.2}", input.zoom, thresholds.high_zoom),
        )
    } else {
        let width = (input.page_width * input.zoom).ceil().max(0.0) as u64;
        let height = (input.page_height * input.zoom).ceil().max(0.0) as u64;
        let pixels = width * height;
        let bytes = pixels * BYTES_PER_PIXEL as u64;

        if pixels > thresholds.max_full_page_pixels {
            decision(
                RenderMode::Tiled,
                format!(
                    "full page would be {width}x{height} = {pixels} px, over {} px",
                    thresholds.max_full_page_pixels
                ),
            )
        } else if bytes > thresholds.max_full_page_bytes {
            decision(
                RenderMode::Tiled,
                format!(
                    "full page would take {} MiB, over {} MiB",
                    bytes / (1024 * 1024),
                    thresholds.max_full_page_bytes / (1024 * 1024)
                ),
            )
        } else {
            match visible_fraction(input) {
                Some(visible) if visible < thresholds.visibility_threshold => decision(
                    RenderMode::Tiled,
                    format!(
                        "only {:.0}% of the page is visible at zoom {:.2}",
                        visible * 100.0,
                        input.zoom
                    ),
                ),
                Some(visible) => decision(
                    RenderMode::FullPage,
                    format!(
                        "{:.0}% of the page visible, {pixels} px fits budget",
                        visible * 100.0
                    ),
                ),
                None => decision(
                    RenderMode::FullPage,
                    format!("{pixels} px fits budget, viewport unknown"),
                ),
            }
        }
    };

    debug!(
        "render strategy at zoom {:.2}: {} ({})",
        input.zoom, result.mode, result.reason
    );
    result
}

/// Share of the zoomed page area the viewport can show
fn visible_fraction(input: &StrategyInput) -> Option<f32> {
    let (viewport_width, viewport_height) = input.viewport?;
    let page_width = input.page_width * input.zoom;
    let page_height = input.page_height * input.zoom;
    if page_width <= 0.0 || page_height <= 0.0 {
        return None;
    }
    let visible_width = viewport_width.min(page_width).max(0.0);
    let visible_height = viewport_height.min(page_height).max(0.0);
    Some((visible_width * visible_height) / (page_width * page_height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(zoom: f32, viewport: Option<(f32, f32)>) -> StrategyInput {
        StrategyInput {
            zoom,
            page_width: 612.0,
            page_height: 792.0,
            viewport,
        }
    }

    #[test]
    fn low_zoom_is_full_page() {
        let decision = decide(&letter(1.0, Some((100.0, 100.0))), &StrategyThresholds::default());
        assert_eq!(decision.mode, RenderMode::FullPage);
        assert_eq!(decision.tile_size, 256);
        assert!(decision.reason.contains("at or below"));
    }

    #[test]
    fn high_zoom_is_tiled_with_large_tiles() {
        let thresholds = StrategyThresholds::default();
        let decision = decide(&letter(5.0, None), &thresholds);
        assert_eq!(decision.mode, RenderMode::Tiled);
        assert_eq!(decision.tile_size, 256);

        let decision = decide(&letter(12.0, None), &thresholds);
        assert_eq!(decision.tile_size, 512);
    }

    #[test]
    fn pixel_budget_forces_tiles() {
        let thresholds = StrategyThresholds {
            max_full_page_pixels: 1_000_000,
            ..StrategyThresholds::default()
        };
        // 612*2 x 792*2 is ~1.9 Mpx
        let decision = decide(&letter(2.0, None), &thresholds);
        assert_eq!(decision.mode, RenderMode::Tiled);
        assert!(decision.reason.contains("px"));
    }

    #[test]
    fn memory_budget_forces_tiles() {
        let thresholds = StrategyThresholds {
            max_full_page_bytes: 4 * 1024 * 1024,
            ..StrategyThresholds::default()
        };
        let decision = decide(&letter(2.0, None), &thresholds);
        assert_eq!(decision.mode, RenderMode::Tiled);
        assert!(decision.reason.contains("MiB"));
    }

    #[test]
    fn visibility_decides_between_thresholds() {
        let thresholds = StrategyThresholds::default();
        let small = decide(&letter(3.0, Some((800.0, 600.0))), &thresholds);
        assert_eq!(small.mode, RenderMode::Tiled);
        assert!(small.reason.contains("visible"));

        let large = decide(&letter(2.0, Some((1300.0, 1600.0))), &thresholds);
        assert_eq!(large.mode, RenderMode::FullPage);

        let unknown = decide(&letter(2.0, None), &thresholds);
        assert_eq!(unknown.mode, RenderMode::FullPage);
        assert!(unknown.reason.contains("viewport unknown"));
    }
}
