//! Write-time checks on tiles entering the cache

use std::fmt;

use serde::{Deserialize, Serialize};

use super::key::{TileCoordinate, quantize_scale};
use crate::types::PageSize;

/// Tile index bound used when the page size is not known yet
pub const FALLBACK_MAX_TILE_INDEX: u32 = 4096;

/// What to do with a tile that fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompliancePolicy {
    /// Skip validation
    Off,
    /// Log violations and cache the tile anyway
    #[default]
    Log,
    /// Log violations and drop the tile
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Violation {
    ScaleMismatch { expected: f32, actual: f32 },
    IndexOutOfBounds { tile_x: u32, tile_y: u32, max_x: u32, max_y: u32 },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::ScaleMismatch { expected, actual } => {
                write!(f, "tile scale {actual} does not match expected {expected}")
            }
            Violation::IndexOutOfBounds {
                tile_x,
                tile_y,
                max_x,
                max_y,
            } => write!(
                f,
                "tile ({tile_x}, {tile_y}) outside grid bounds ({max_x}, {max_y})"
            ),
        }
    }
}

/// Largest valid tile indices for a page at `scale`
#[must_use]
pub fn max_tile_indices(size: Option<PageSize>, scale: f32, tile_size: u32) -> (u32, u32) {
    match size {
        Some(size) if tile_size > 0 => {
            let (width, height) = size.pixels_at(scale);
            (
                width.div_ceil(tile_size).saturating_sub(1),
                height.div_ceil(tile_size).saturating_sub(1),
            )
        }
        _ => (FALLBACK_MAX_TILE_INDEX, FALLBACK_MAX_TILE_INDEX),
    }
}

/// Validates a tile against the scale its caller expected for that grid
/// position and against the page's tile grid.
#[must_use]
pub fn check(
    tile: &TileCoordinate,
    expected_scale: f32,
    page_size: Option<PageSize>,
    max_tier: f32,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    let actual = quantize_scale(tile.scale, max_tier);
    let expected = quantize_scale(expected_scale, max_tier);
    if actual != expected {
        violations.push(Violation::ScaleMismatch { expected, actual });
    }

    let (max_x, max_y) = max_tile_indices(page_size, actual, tile.tile_size);
    if tile.tile_x > max_x || tile.tile_y > max_y {
        violations.push(Violation::IndexOutOfBounds {
            tile_x: tile.tile_x,
            tile_y: tile.tile_y,
            max_x,
            max_y,
        });
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentId;

    fn tile(x: u32, y: u32, scale: f32) -> TileCoordinate {
        TileCoordinate {
            document: DocumentId::new(1),
            page: 0,
            tile_x: x,
            tile_y: y,
            scale,
            tile_size: 256,
        }
    }

    #[test]
    fn compliant_tile_passes() {
        let letter = Some(PageSize::new(612.0, 792.0));
        assert!(check(&tile(2, 3, 1.0), 1.1, letter, 32.0).is_empty());
    }

    #[test]
    fn scale_mismatch_is_reported() {
        let violations = check(&tile(0, 0, 4.0), 8.0, None, 32.0);
        assert_eq!(
            violations,
            vec![Violation::ScaleMismatch {
                expected: 8.0,
                actual: 4.0
            }]
        );
    }

    #[test]
    fn index_bound_uses_page_size() {
        // 612pt at 1x is 3 tiles wide (0..=2), 792pt is 4 tall (0..=3)
        let letter = Some(PageSize::new(612.0, 792.0));
        assert_eq!(max_tile_indices(letter, 1.0, 256), (2, 3));
        assert_eq!(check(&tile(3, 0, 1.0), 1.0, letter, 32.0).len(), 1);

        assert!(check(&tile(3, 0, 1.0), 1.0, None, 32.0).is_empty());
        assert_eq!(check(&tile(5000, 0, 1.0), 1.0, None, 32.0).len(), 1);
    }
}
