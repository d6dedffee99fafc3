//! Tile identity and scale quantization

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::render::TileTarget;
use crate::types::DocumentId;

/// Render scale tiers at or above 1x
pub const SCALE_TIERS: [f32; 11] = [1.0, 1.5, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0, 24.0, 32.0];

/// Highest tier used unless reconfigured
pub const DEFAULT_MAX_SCALE_TIER: f32 = 32.0;

/// Snaps a raw scale onto the tier list.
///
/// Below 1 the buckets are 0.25, 0.5 and 1. From 1 upwards the nearest tier
/// by midpoint wins, capped at `max_tier`. Quantizing a quantized scale
/// returns it unchanged.
#[must_use]
pub fn quantize_scale(scale: f32, max_tier: f32) -> f32 {
    if scale.is_nan() {
        return 1.0;
    }
    if scale < 1.0 {
        return if scale < 0.375 {
            0.25
        } else if scale < 0.75 {
            0.5
        } else {
            1.0
        };
    }

    let cap = clamp_max_tier(max_tier);
    let mut tiers = SCALE_TIERS.iter().copied().filter(|&t| t <= cap).peekable();
    while let Some(tier) = tiers.next() {
        match tiers.peek() {
            Some(&next) if scale < (tier + next) / 2.0 => return tier,
            Some(_) => {}
            None => return tier,
        }
    }
    1.0
}

/// Largest tier not above `max_tier`, never below 1
#[must_use]
pub fn clamp_max_tier(max_tier: f32) -> f32 {
    SCALE_TIERS
        .iter()
        .copied()
        .rev()
        .find(|&t| t <= max_tier)
        .unwrap_or(1.0)
}

/// Quantized scale in thousandths, for exact hashing and ordering
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScaleKey(pub u32);

impl ScaleKey {
    /// Wraps an already quantized scale.
    #[must_use]
    pub fn from_quantized(scale: f32) -> Self {
        Self((scale * 1000.0).round() as u32)
    }

    #[must_use]
    pub fn as_f32(self) -> f32 {
        self.0 as f32 / 1000.0
    }
}

impl fmt::Display for ScaleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f32())
    }
}

/// A tile as requested by the compositor.
///
/// `scale` is the raw scale; the tile indices address the grid of the
/// quantized scale, so the tile's PDF-space origin is
/// `index * tile_size / quantized_scale`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileCoordinate {
    pub document: DocumentId,
    pub page: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub scale: f32,
    pub tile_size: u32,
}

impl TileCoordinate {
    /// Worker-side render target at `scale`
    #[must_use]
    pub fn target_at(&self, scale: f32) -> TileTarget {
        TileTarget {
            page: self.page,
            tile_x: self.tile_x,
            tile_y: self.tile_y,
            scale,
            tile_size: self.tile_size,
        }
    }

    /// PDF-space rectangle `(x, y, width, height)` covered at `scale`
    #[must_use]
    pub fn pdf_rect(&self, scale: f32) -> (f32, f32, f32, f32) {
        let extent = self.tile_size as f32 / scale;
        (
            self.tile_x as f32 * extent,
            self.tile_y as f32 * extent,
            extent,
            extent,
        )
    }
}

/// Structured cache key; tiles and whole pages live in separate namespaces
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    Tile {
        document: DocumentId,
        page: u32,
        tile_x: u32,
        tile_y: u32,
        scale: ScaleKey,
        tile_size: u32,
    },
    FullPage {
        document: DocumentId,
        page: u32,
        scale: ScaleKey,
    },
}

impl CacheKey {
    #[must_use]
    pub fn document(&self) -> DocumentId {
        match self {
            CacheKey::Tile { document, .. } | CacheKey::FullPage { document, .. } => *document,
        }
    }

    #[must_use]
    pub fn page(&self) -> u32 {
        match self {
            CacheKey::Tile { page, .. } | CacheKey::FullPage { page, .. } => *page,
        }
    }

    #[must_use]
    pub fn scale(&self) -> ScaleKey {
        match self {
            CacheKey::Tile { scale, .. } | CacheKey::FullPage { scale, .. } => *scale,
        }
    }

    #[must_use]
    pub fn is_full_page(&self) -> bool {
        matches!(self, CacheKey::FullPage { .. })
    }

    /// `(tile_x, tile_y, tile_size)` for tile keys
    #[must_use]
    pub fn tile(&self) -> Option<(u32, u32, u32)> {
        match self {
            CacheKey::Tile {
                tile_x,
                tile_y,
                tile_size,
                ..
            } => Some((*tile_x, *tile_y, *tile_size)),
            CacheKey::FullPage { .. } => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Tile {
                document,
                page,
                tile_x,
                tile_y,
                scale,
                tile_size,
            } => write!(
                f,
                "{document}-p{page}-{tile_x}x{tile_y}-t{tile_size}-s{scale}"
            ),
            CacheKey::FullPage {
                document,
                page,
                scale,
            } => write!(f, "{document}-p{page}-full-s{scale}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_unit_buckets() {
        assert_eq!(quantize_scale(0.1, 32.0), 0.25);
        assert_eq!(quantize_scale(0.374, 32.0), 0.25);
        assert_eq!(quantize_scale(0.375, 32.0), 0.5);
        assert_eq!(quantize_scale(0.74, 32.0), 0.5);
        assert_eq!(quantize_scale(0.75, 32.0), 1.0);
    }

    #[test]
    fn nearest_tier_by_midpoint() {
        assert_eq!(quantize_scale(1.2, 32.0), 1.0);
        assert_eq!(quantize_scale(1.25, 32.0), 1.5);
        assert_eq!(quantize_scale(2.4, 32.0), 2.0);
        assert_eq!(quantize_scale(2.6, 32.0), 3.0);
        assert_eq!(quantize_scale(11.0, 32.0), 12.0);
        assert_eq!(quantize_scale(19.9, 32.0), 16.0);
        assert_eq!(quantize_scale(100.0, 32.0), 32.0);
    }

    #[test]
    fn max_tier_caps() {
        assert_eq!(quantize_scale(20.0, 8.0), 8.0);
        assert_eq!(quantize_scale(7.5, 10.0), 8.0);
        assert_eq!(clamp_max_tier(10.0), 8.0);
        assert_eq!(clamp_max_tier(0.5), 1.0);
    }

    #[test]
    fn quantization_is_idempotent() {
        let mut raw = 0.05_f32;
        while raw < 40.0 {
            let q = quantize_scale(raw, DEFAULT_MAX_SCALE_TIER);
            assert_eq!(quantize_scale(q, DEFAULT_MAX_SCALE_TIER), q, "raw {raw}");
            raw += 0.07;
        }
    }

    #[test]
    fn key_namespaces_do_not_collide() {
        let doc = DocumentId::new(1);
        let tile = CacheKey::Tile {
            document: doc,
            page: 2,
            tile_x: 0,
            tile_y: 0,
            scale: ScaleKey::from_quantized(4.0),
            tile_size: 256,
        };
        let full = CacheKey::FullPage {
            document: doc,
            page: 2,
            scale: ScaleKey::from_quantized(4.0),
        };
        assert_ne!(tile, full);
        assert_eq!(full.to_string(), "doc1-p2-full-s4");
        assert_eq!(tile.to_string(), "doc1-p2-0x0-t256-s4");
        assert_eq!(ScaleKey::from_quantized(1.5).to_string(), "1.5");
    }

    #[test]
    fn tile_size_is_part_of_identity() {
        let doc = DocumentId::new(1);
        let key = |tile_size| CacheKey::Tile {
            document: doc,
            page: 0,
            tile_x: 1,
            tile_y: 1,
            scale: ScaleKey::from_quantized(2.0),
            tile_size,
        };
        assert_ne!(key(256), key(512));
    }
}
