//! Scale-quantized multi-tier tile cache
//!
//! Scales are snapped to a fixed set of tiers before they become part of a
//! key, so renders at 3.9x and 4.2x land on the same entry. Misses can be
//! answered with a tile from a neighbouring tier or a slice of a cached
//! whole page, stretched to fit.

mod compliance;
mod data;
mod eviction;
mod index;
mod key;
mod pressure;
mod tier;
mod tile_cache;

pub use compliance::{CompliancePolicy, FALLBACK_MAX_TILE_INDEX, Violation, max_tile_indices};
pub use data::{
    Bitmap, CachedTileData, CssFit, DecodeError, PageMetadata, PixelRect, PixelView, TilePayload,
};
pub use eviction::Gesture;
pub use key::{
    CacheKey, DEFAULT_MAX_SCALE_TIER, SCALE_TIERS, ScaleKey, TileCoordinate, clamp_max_tier,
    quantize_scale,
};
pub use pressure::PressureLevel;
pub use tier::{SizedLru, Weighted};
pub use tile_cache::{
    BestSource, BestTile, CacheConfig, CacheStats, MAX_DECODE_FACTOR, MAX_DOWNSCALE_RATIO,
    TileCache, slice_full_page,
};
