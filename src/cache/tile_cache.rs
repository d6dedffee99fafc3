//! Three-tier tile cache
//!
//! L2 is the authoritative store: every write lands there and every entry in
//! L1 also lives in L2. L1 is a small hot set promoted from L2 on reads. L3
//! holds page metadata for the active document and is never evicted, only
//! cleared when the document changes.
//!
//! Locks are always taken in the order L1, L2, L3.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::compliance::{self, CompliancePolicy};
use super::data::{Bitmap, CachedTileData, PageMetadata, PixelRect, PixelView};
use super::index::ScaleIndex;
use super::key::{
    CacheKey, DEFAULT_MAX_SCALE_TIER, ScaleKey, TileCoordinate, clamp_max_tier, quantize_scale,
};
use super::tier::{SizedLru, Weighted};
use crate::types::{DocumentId, PageClassification};

/// A decoded tile wider or taller than this multiple of its tile size is
/// treated as a misfiled entry
pub const MAX_DECODE_FACTOR: u32 = 2;

/// Higher tiers more than this many times the requested scale are not
/// searched for fallbacks; each of their tiles covers too little
pub const MAX_DOWNSCALE_RATIO: f32 = 4.0;

/// Cache bounds and behavior
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_max_entries: usize,
    pub l2_max_entries: usize,
    pub l2_max_bytes: usize,
    pub max_scale_tier: f32,
    pub compliance: CompliancePolicy,
    /// PNG-compress rendered pixels before caching them
    pub store_compressed: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: 64,
            l2_max_entries: 512,
            l2_max_bytes: 256 * 1024 * 1024,
            max_scale_tier: DEFAULT_MAX_SCALE_TIER,
            compliance: CompliancePolicy::Log,
            store_compressed: false,
        }
    }
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub l1_entries: usize,
    pub l1_max_entries: usize,
    pub l2_entries: usize,
    pub l2_max_entries: usize,
    pub l2_bytes: usize,
    pub l2_max_bytes: usize,
    pub l3_pages: usize,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub fallback_hits: u64,
    pub full_page_slice_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub purges: u64,
    pub compliance_violations: u64,
    pub rejected_writes: u64,
    pub pressure_level: u8,
    pub max_scale_tier: f32,
}

impl CacheStats {
    /// Exact hits over all lookups that ended in a hit or a miss
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
pub(super) struct Counters {
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub fallback_hits: AtomicU64,
    pub full_page_slice_hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub purges: AtomicU64,
    pub compliance_violations: AtomicU64,
    pub rejected_writes: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub(super) struct L2Entry {
    pub data: Arc<CachedTileData>,
    /// Logical time of the last read or write
    pub touched: u64,
}

impl Weighted for L2Entry {
    fn weight(&self) -> usize {
        self.data.byte_size()
    }
}

pub(super) struct L2State {
    pub store: SizedLru<CacheKey, L2Entry>,
    pub index: ScaleIndex,
    pub clock: u64,
}

impl L2State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

pub(super) type L1Store = SizedLru<CacheKey, Arc<CachedTileData>>;

#[derive(Default)]
struct L3State {
    document: Option<DocumentId>,
    pages: HashMap<u32, PageMetadata>,
}

/// Where a best-available result came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BestSource {
    /// The requested key itself
    Exact,
    /// A tile cached at another scale
    Tile(TileCoordinate),
    /// A region sliced out of a whole-page entry
    FullPageSlice,
}

/// Something displayable for a requested tile.
///
/// Draw `source` of `bitmap` into `dest` of the requested tile, where
/// `dest` is in the requested tile's pixels. `css_stretch` is
/// requested scale over actual scale.
#[derive(Debug, Clone)]
pub struct BestTile {
    pub bitmap: Bitmap,
    pub actual_scale: f32,
    pub css_stretch: f32,
    pub source: BestSource,
    pub source_rect: PixelRect,
    pub dest_rect: PixelRect,
}

impl BestTile {
    /// The tile this result falls back to, if any
    #[must_use]
    pub fn fallback_tile(&self) -> Option<TileCoordinate> {
        match self.source {
            BestSource::Tile(tile) => Some(tile),
            BestSource::Exact | BestSource::FullPageSlice => None,
        }
    }
}

/// Intersection of two PDF-space rectangles `(x0, y0, x1, y1)`
fn intersect(a: (f32, f32, f32, f32), b: (f32, f32, f32, f32)) -> Option<(f32, f32, f32, f32)> {
    let x0 = a.0.max(b.0);
    let y0 = a.1.max(b.1);
    let x1 = a.2.min(b.2);
    let y1 = a.3.min(b.3);
    (x1 > x0 && y1 > y0).then_some((x0, y0, x1, y1))
}

/// Cuts the region of `tile` out of a whole page rendered at `page_scale`.
///
/// `requested` is the quantized scale the tile was asked for. Returns
/// `None` when the tile lies outside the page.
#[must_use]
pub fn slice_full_page(
    page: PixelView<'_>,
    page_scale: f32,
    tile: &TileCoordinate,
    requested: f32,
) -> Option<BestTile> {
    let (req_x, req_y, extent, _) = tile.pdf_rect(requested);
    let page_rect = (
        0.0,
        0.0,
        page.width as f32 / page_scale,
        page.height as f32 / page_scale,
    );
    let (x0, y0, x1, y1) = intersect((req_x, req_y, req_x + extent, req_y + extent), page_rect)?;

    let crop_x = (x0 * page_scale).floor() as u32;
    let crop_y = (y0 * page_scale).floor() as u32;
    let crop_w = ((x1 * page_scale).ceil() as u32).saturating_sub(crop_x);
    let crop_h = ((y1 * page_scale).ceil() as u32).saturating_sub(crop_y);
    let bitmap = page.crop(crop_x, crop_y, crop_w, crop_h)?;

    Some(BestTile {
        source_rect: PixelRect::new(0.0, 0.0, bitmap.width as f32, bitmap.height as f32),
        dest_rect: PixelRect::new(
            (x0 - req_x) * requested,
            (y0 - req_y) * requested,
            (x1 - x0) * requested,
            (y1 - y0) * requested,
        ),
        bitmap,
        actual_scale: page_scale,
        css_stretch: requested / page_scale,
        source: BestSource::FullPageSlice,
    })
}

/// Multi-tier tile cache, safe to share across threads
pub struct TileCache {
    pub(super) l1: Mutex<L1Store>,
    pub(super) l2: Mutex<L2State>,
    l3: Mutex<L3State>,
    pub(super) baseline: CacheConfig,
    /// f32 bits of the quantization cap
    max_scale_tier: AtomicU32,
    pub(super) pressure: AtomicU8,
    pub(super) counters: Counters,
}

impl TileCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            l1: Mutex::new(SizedLru::new(config.l1_max_entries, None)),
            l2: Mutex::new(L2State {
                store: SizedLru::new(config.l2_max_entries, Some(config.l2_max_bytes)),
                index: ScaleIndex::default(),
                clock: 0,
            }),
            l3: Mutex::new(L3State::default()),
            baseline: config,
            max_scale_tier: AtomicU32::new(clamp_max_tier(config.max_scale_tier).to_bits()),
            pressure: AtomicU8::new(0),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.baseline
    }

    pub(super) fn lock_l1(&self) -> MutexGuard<'_, L1Store> {
        self.l1.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn lock_l2(&self) -> MutexGuard<'_, L2State> {
        self.l2.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_l3(&self) -> MutexGuard<'_, L3State> {
        self.l3.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn max_scale_tier(&self) -> f32 {
        f32::from_bits(self.max_scale_tier.load(Ordering::Relaxed))
    }

    /// Sets the quantization cap, snapped down to a tier.
    pub fn set_max_scale_tier(&self, scale: f32) {
        let tier = clamp_max_tier(scale);
        self.max_scale_tier.store(tier.to_bits(), Ordering::Relaxed);
        debug!("max scale tier set to {tier}");
    }

    #[must_use]
    pub fn quantize(&self, scale: f32) -> f32 {
        quantize_scale(scale, self.max_scale_tier())
    }

    #[must_use]
    pub fn tile_key(&self, tile: &TileCoordinate) -> CacheKey {
        CacheKey::Tile {
            document: tile.document,
            page: tile.page,
            tile_x: tile.tile_x,
            tile_y: tile.tile_y,
            scale: ScaleKey::from_quantized(self.quantize(tile.scale)),
            tile_size: tile.tile_size,
        }
    }

    #[must_use]
    pub fn full_page_key(&self, document: DocumentId, page: u32, scale: f32) -> CacheKey {
        CacheKey::FullPage {
            document,
            page,
            scale: ScaleKey::from_quantized(self.quantize(scale)),
        }
    }

    // Document and page metadata (L3)

    /// Makes `document` the active one. L3 is cleared when it changes; L1
    /// and L2 are keyed by document and keep their entries.
    pub fn set_document(&self, document: DocumentId) -> bool {
        let mut l3 = self.lock_l3();
        if l3.document == Some(document) {
            return false;
        }
        debug!(
            "active document {document}, dropping metadata for {} pages",
            l3.pages.len()
        );
        l3.document = Some(document);
        l3.pages.clear();
        true
    }

    #[must_use]
    pub fn active_document(&self) -> Option<DocumentId> {
        self.lock_l3().document
    }

    #[must_use]
    pub fn page_metadata(&self, page: u32) -> Option<PageMetadata> {
        self.lock_l3().pages.get(&page).copied()
    }

    pub fn set_page_metadata(&self, metadata: PageMetadata) {
        self.lock_l3().pages.insert(metadata.page, metadata);
    }

    /// Attaches a classification to known page metadata.
    pub fn set_classification(&self, page: u32, classification: PageClassification) -> bool {
        match self.lock_l3().pages.get_mut(&page) {
            Some(metadata) => {
                metadata.classification = Some(classification);
                true
            }
            None => false,
        }
    }

    // Reads

    /// Returns the entry for `key`, promoting L2 hits into L1.
    fn fetch(&self, key: &CacheKey) -> Option<Arc<CachedTileData>> {
        let mut l1 = self.lock_l1();
        let mut l2 = self.lock_l2();
        let now = l2.tick();

        if let Some(data) = l1.get(key).cloned() {
            if let Some(entry) = l2.store.get_mut(key) {
                entry.touched = now;
            }
            Counters::bump(&self.counters.l1_hits, 1);
            return Some(data);
        }

        let entry = l2.store.get_mut(key)?;
        entry.touched = now;
        let data = Arc::clone(&entry.data);
        Counters::bump(&self.counters.l2_hits, 1);

        // L1 overflow only demotes; the entry stays in L2
        let _ = l1.insert(*key, Arc::clone(&data));
        Some(data)
    }

    /// Decodes a fresh bitmap, purging entries that fail to decode or are
    /// implausibly large for `tile_size`.
    fn materialize(
        &self,
        key: &CacheKey,
        data: &CachedTileData,
        tile_size: Option<u32>,
    ) -> Option<Bitmap> {
        match data.decode() {
            Ok(bitmap) => {
                let limit = tile_size.map(|size| size.saturating_mul(MAX_DECODE_FACTOR));
                if limit.is_some_and(|max| bitmap.width > max || bitmap.height > max) {
                    warn!(
                        "purging {key}: decoded {}x{} exceeds tile bound",
                        bitmap.width, bitmap.height
                    );
                    self.purge(key);
                    return None;
                }
                Some(bitmap)
            }
            Err(e) => {
                warn!("purging {key}: {e}");
                self.purge(key);
                None
            }
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Bitmap> {
        let data = self.fetch(key)?;
        let tile_size = key.tile().map(|(_, _, size)| size);
        self.materialize(key, &data, tile_size)
    }

    /// Recorded dimensions of an L2 entry; neither recency nor hit
    /// counters change.
    fn peek_dimensions(&self, key: &CacheKey) -> Option<(u32, u32)> {
        self.lock_l2()
            .store
            .peek(key)
            .map(|entry| (entry.data.width, entry.data.height))
    }

    fn purge(&self, key: &CacheKey) {
        if self.remove_keys(std::slice::from_ref(key)) > 0 {
            Counters::bump(&self.counters.purges, 1);
        }
    }

    /// A fresh bitmap for the exact tile, or `None`.
    #[must_use]
    pub fn get(&self, tile: &TileCoordinate) -> Option<Bitmap> {
        let bitmap = self.lookup(&self.tile_key(tile));
        if bitmap.is_none() {
            Counters::bump(&self.counters.misses, 1);
        }
        bitmap
    }

    #[must_use]
    pub fn get_full_page(&self, document: DocumentId, page: u32, scale: f32) -> Option<Bitmap> {
        let bitmap = self.lookup(&self.full_page_key(document, page, scale));
        if bitmap.is_none() {
            Counters::bump(&self.counters.misses, 1);
        }
        bitmap
    }

    /// Whether the exact tile is cached; does not touch recency.
    #[must_use]
    pub fn contains(&self, tile: &TileCoordinate) -> bool {
        let key = self.tile_key(tile);
        self.lock_l2().store.contains(&key)
    }

    #[must_use]
    pub fn contains_full_page(&self, document: DocumentId, page: u32, scale: f32) -> bool {
        let key = self.full_page_key(document, page, scale);
        self.lock_l2().store.contains(&key)
    }

    /// The exact tile or the closest tile cached at another scale.
    ///
    /// Higher scales are tried before lower ones, nearest first. For each
    /// scale the request's PDF-space rectangle is mapped onto that scale's
    /// grid, so the fallback always shows the same page region.
    #[must_use]
    pub fn get_best_available(&self, tile: &TileCoordinate) -> Option<BestTile> {
        let best = self.best_tile(tile);
        if best.is_none() {
            Counters::bump(&self.counters.misses, 1);
        }
        best
    }

    /// Like [`TileCache::get_best_available`], then falls back to slicing
    /// the region out of a cached whole page.
    #[must_use]
    pub fn get_best_available_bitmap(&self, tile: &TileCoordinate) -> Option<BestTile> {
        let best = self
            .best_tile(tile)
            .or_else(|| self.full_page_slice(tile));
        if best.is_none() {
            Counters::bump(&self.counters.misses, 1);
        }
        best
    }

    /// Search order for fallbacks: higher scales ascending, then lower
    /// scales descending
    fn fallback_order(requested: ScaleKey, mut scales: Vec<ScaleKey>) -> Vec<ScaleKey> {
        scales.retain(|s| *s != requested);
        let (mut lower, higher): (Vec<_>, Vec<_>) = scales.into_iter().partition(|s| *s < requested);
        lower.reverse();
        higher.into_iter().chain(lower).collect()
    }

    fn best_tile(&self, tile: &TileCoordinate) -> Option<BestTile> {
        let requested = self.quantize(tile.scale);
        let requested_key = ScaleKey::from_quantized(requested);
        let size = tile.tile_size as f32;

        if let Some(bitmap) = self.lookup(&self.tile_key(tile)) {
            let full = PixelRect::new(0.0, 0.0, bitmap.width as f32, bitmap.height as f32);
            return Some(BestTile {
                bitmap,
                actual_scale: requested,
                css_stretch: 1.0,
                source: BestSource::Exact,
                source_rect: full,
                dest_rect: full,
            });
        }

        let scales = self
            .lock_l2()
            .index
            .tile_scales(tile.document, tile.page, tile.tile_size);
        let (req_x, req_y, extent, _) = tile.pdf_rect(requested);
        let request_rect = (req_x, req_y, req_x + extent, req_y + extent);

        for scale_key in Self::fallback_order(requested_key, scales) {
            let scale = scale_key.as_f32();
            let ratio = scale / requested;
            if ratio > MAX_DOWNSCALE_RATIO {
                continue;
            }

            // Tiles of `scale` that overlap the requested rectangle
            let first_x = (tile.tile_x as f32 * ratio).floor() as u32;
            let first_y = (tile.tile_y as f32 * ratio).floor() as u32;
            let last_x = (((tile.tile_x + 1) as f32 * ratio).ceil() as u32).saturating_sub(1).max(first_x);
            let last_y = (((tile.tile_y + 1) as f32 * ratio).ceil() as u32).saturating_sub(1).max(first_y);

            for fy in first_y..=last_y {
                for fx in first_x..=last_x {
                    let candidate = TileCoordinate {
                        tile_x: fx,
                        tile_y: fy,
                        scale,
                        ..*tile
                    };
                    let key = self.tile_key(&candidate);
                    let Some((width, height)) = self.peek_dimensions(&key) else {
                        continue;
                    };

                    let fb_x = fx as f32 * size / scale;
                    let fb_y = fy as f32 * size / scale;
                    let fallback_rect = (
                        fb_x,
                        fb_y,
                        fb_x + width as f32 / scale,
                        fb_y + height as f32 / scale,
                    );
                    let Some((x0, y0, x1, y1)) = intersect(request_rect, fallback_rect) else {
                        continue;
                    };
                    // Only the tile actually served is promoted and counted
                    let Some(bitmap) = self.lookup(&key) else {
                        continue;
                    };

                    Counters::bump(&self.counters.fallback_hits, 1);
                    return Some(BestTile {
                        source_rect: PixelRect::new(
                            (x0 - fb_x) * scale,
                            (y0 - fb_y) * scale,
                            (x1 - x0) * scale,
                            (y1 - y0) * scale,
                        ),
                        dest_rect: PixelRect::new(
                            (x0 - req_x) * requested,
                            (y0 - req_y) * requested,
                            (x1 - x0) * requested,
                            (y1 - y0) * requested,
                        ),
                        bitmap,
                        actual_scale: scale,
                        css_stretch: requested / scale,
                        source: BestSource::Tile(candidate),
                    });
                }
            }
        }

        None
    }

    fn full_page_slice(&self, tile: &TileCoordinate) -> Option<BestTile> {
        let requested = self.quantize(tile.scale);
        let scales = self
            .lock_l2()
            .index
            .full_page_scales(tile.document, tile.page);

        // Same preference as tiles, but the requested scale itself counts
        let requested_key = ScaleKey::from_quantized(requested);
        let mut order: Vec<ScaleKey> = scales.iter().copied().filter(|s| *s == requested_key).collect();
        order.extend(Self::fallback_order(requested_key, scales));

        let (req_x, req_y, extent, _) = tile.pdf_rect(requested);
        let request_rect = (req_x, req_y, req_x + extent, req_y + extent);

        for scale_key in order {
            let scale = scale_key.as_f32();
            let key = CacheKey::FullPage {
                document: tile.document,
                page: tile.page,
                scale: scale_key,
            };
            let Some((width, height)) = self.peek_dimensions(&key) else {
                continue;
            };
            let page_rect = (0.0, 0.0, width as f32 / scale, height as f32 / scale);
            if intersect(request_rect, page_rect).is_none() {
                continue;
            }

            let Some(data) = self.fetch(&key) else {
                continue;
            };
            // Raw pages are sliced in place; PNG pages are decoded once
            let sliced = match data.raw_view() {
                Some(page) => slice_full_page(page, scale, tile, requested),
                None => self
                    .materialize(&key, &data, None)
                    .and_then(|page| slice_full_page(page.view(), scale, tile, requested)),
            };
            let Some(best) = sliced else {
                continue;
            };
            Counters::bump(&self.counters.full_page_slice_hits, 1);
            return Some(best);
        }

        None
    }

    // Writes

    fn store(&self, key: CacheKey, data: CachedTileData) {
        let data = Arc::new(data);
        let mut l1 = self.lock_l1();
        let mut l2 = self.lock_l2();
        let now = l2.tick();

        let fresh = !l2.store.contains(&key);
        // A replaced entry must not stay visible through L1
        l1.remove(&key);

        let evicted = l2.store.insert(
            key,
            L2Entry {
                data,
                touched: now,
            },
        );
        if fresh {
            l2.index.insert(&key);
        }
        for (gone, _) in &evicted {
            l2.index.remove(gone);
            l1.remove(gone);
        }
        if !evicted.is_empty() {
            Counters::bump(&self.counters.evictions, evicted.len() as u64);
            log::trace!("{} entries evicted from L2 to fit {key}", evicted.len());
        }
    }

    /// Caches a tile at its quantized key.
    pub fn set(&self, tile: &TileCoordinate, data: CachedTileData) {
        self.store(self.tile_key(tile), data);
    }

    pub fn set_full_page(&self, document: DocumentId, page: u32, scale: f32, data: CachedTileData) {
        self.store(self.full_page_key(document, page, scale), data);
    }

    /// Caches a tile after checking it against the scale the caller expected
    /// for that grid position and against the page's tile grid.
    ///
    /// Violations are logged with `call_site`. Under
    /// [`CompliancePolicy::Reject`] the tile is dropped. Returns whether it
    /// was cached.
    pub fn set_validated(
        &self,
        tile: &TileCoordinate,
        data: CachedTileData,
        expected_scale: f32,
        call_site: &str,
    ) -> bool {
        let policy = self.baseline.compliance;
        if policy != CompliancePolicy::Off {
            let page_size = {
                let l3 = self.lock_l3();
                if l3.document == Some(tile.document) {
                    l3.pages.get(&tile.page).map(|m| m.size)
                } else {
                    None
                }
            };
            let violations =
                compliance::check(tile, expected_scale, page_size, self.max_scale_tier());
            if !violations.is_empty() {
                let key = self.tile_key(tile);
                for violation in &violations {
                    warn!("[{call_site}] non-compliant tile {key}: {violation}");
                }
                Counters::bump(
                    &self.counters.compliance_violations,
                    violations.len() as u64,
                );
                if policy == CompliancePolicy::Reject {
                    Counters::bump(&self.counters.rejected_writes, 1);
                    return false;
                }
            }
        }

        self.set(tile, data);
        true
    }

    // Removal primitives shared with the eviction policies

    /// Removes `keys` from every tier; returns how many were present in L2.
    pub(super) fn remove_keys(&self, keys: &[CacheKey]) -> usize {
        let mut l1 = self.lock_l1();
        let mut l2 = self.lock_l2();
        let mut removed = 0;
        for key in keys {
            l1.remove(key);
            if l2.store.remove(key).is_some() {
                l2.index.remove(key);
                removed += 1;
            }
        }
        removed
    }

    /// Removes every entry whose key matches `doomed`; counted as evictions.
    pub(super) fn evict_where(&self, mut doomed: impl FnMut(&CacheKey) -> bool) -> usize {
        let mut l1 = self.lock_l1();
        let mut l2 = self.lock_l2();
        let removed = l2.store.retain(|key, _| !doomed(key));
        for (key, _) in &removed {
            l2.index.remove(key);
            l1.remove(key);
        }
        Counters::bump(&self.counters.evictions, removed.len() as u64);
        removed.len()
    }

    /// Evicts `keys` as a policy decision.
    pub(super) fn evict_keys(&self, keys: &[CacheKey]) -> usize {
        let removed = self.remove_keys(keys);
        Counters::bump(&self.counters.evictions, removed as u64);
        removed
    }

    pub fn evict_tiles_for_page(&self, document: DocumentId, page: u32) -> usize {
        self.evict_where(|key| {
            !key.is_full_page() && key.document() == document && key.page() == page
        })
    }

    pub fn evict_full_pages_for_page(&self, document: DocumentId, page: u32) -> usize {
        self.evict_where(|key| {
            key.is_full_page() && key.document() == document && key.page() == page
        })
    }

    /// Drops every L1/L2 entry of `document`.
    pub fn evict_document(&self, document: DocumentId) -> usize {
        self.evict_where(|key| key.document() == document)
    }

    /// Empties all tiers, including page metadata.
    pub fn clear(&self) {
        let mut l1 = self.lock_l1();
        let mut l2 = self.lock_l2();
        l1.clear();
        l2.store.clear();
        l2.index.clear();
        drop(l2);
        drop(l1);
        self.lock_l3().pages.clear();
    }

    /// L2 fill level in `[0, 1]`
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.lock_l2().store.utilization()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let l1 = self.lock_l1();
        let l2 = self.lock_l2();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let stats = CacheStats {
            l1_entries: l1.len(),
            l1_max_entries: l1.max_entries(),
            l2_entries: l2.store.len(),
            l2_max_entries: l2.store.max_entries(),
            l2_bytes: l2.store.bytes(),
            l2_max_bytes: l2.store.max_bytes().unwrap_or(usize::MAX),
            l3_pages: 0,
            l1_hits: load(&self.counters.l1_hits),
            l2_hits: load(&self.counters.l2_hits),
            fallback_hits: load(&self.counters.fallback_hits),
            full_page_slice_hits: load(&self.counters.full_page_slice_hits),
            misses: load(&self.counters.misses),
            evictions: load(&self.counters.evictions),
            purges: load(&self.counters.purges),
            compliance_violations: load(&self.counters.compliance_violations),
            rejected_writes: load(&self.counters.rejected_writes),
            pressure_level: self.pressure.load(Ordering::Relaxed),
            max_scale_tier: self.max_scale_tier(),
        };
        drop(l2);
        drop(l1);
        CacheStats {
            l3_pages: self.lock_l3().pages.len(),
            ..stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::data::TilePayload;
    use crate::types::PageSize;

    const DOC: DocumentId = DocumentId::new(1);

    fn coord(page: u32, x: u32, y: u32, scale: f32) -> TileCoordinate {
        TileCoordinate {
            document: DOC,
            page,
            tile_x: x,
            tile_y: y,
            scale,
            tile_size: 256,
        }
    }

    fn solid(width: u32, height: u32, value: u8) -> CachedTileData {
        CachedTileData::raw(width, height, vec![value; (width * height * 4) as usize])
    }

    fn small_cache(l1: usize, l2: usize, bytes: usize) -> TileCache {
        TileCache::new(CacheConfig {
            l1_max_entries: l1,
            l2_max_entries: l2,
            l2_max_bytes: bytes,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn jittered_scales_share_a_key() {
        let cache = TileCache::new(CacheConfig::default());
        cache.set(&coord(0, 1, 1, 3.9), solid(256, 256, 9));
        assert!(cache.get(&coord(0, 1, 1, 4.2)).is_some());
        assert!(cache.get(&coord(0, 1, 1, 5.1)).is_none());
    }

    #[test]
    fn reads_promote_into_l1() {
        let cache = TileCache::new(CacheConfig::default());
        cache.set(&coord(0, 0, 0, 1.0), solid(256, 256, 1));
        assert_eq!(cache.stats().l1_entries, 0);

        cache.get(&coord(0, 0, 0, 1.0)).expect("hit");
        cache.get(&coord(0, 0, 0, 1.0)).expect("hit");
        let stats = cache.stats();
        assert_eq!(stats.l1_entries, 1);
        assert_eq!((stats.l2_hits, stats.l1_hits), (1, 1));
    }

    #[test]
    fn l1_stays_subset_of_l2() {
        let cache = small_cache(8, 2, usize::MAX);
        for x in 0..2 {
            cache.set(&coord(0, x, 0, 1.0), solid(4, 4, 0));
            cache.get(&coord(0, x, 0, 1.0)).expect("hit");
        }
        cache.set(&coord(0, 5, 0, 1.0), solid(4, 4, 0));

        let l1 = cache.lock_l1();
        let l2 = cache.lock_l2();
        assert_eq!(l2.store.len(), 2);
        assert!(l1.keys().all(|k| l2.store.contains(k)));
    }

    #[test]
    fn oversized_decode_is_purged() {
        let cache = TileCache::new(CacheConfig::default());
        cache.set(&coord(0, 0, 0, 1.0), solid(600, 10, 0));
        assert!(cache.get(&coord(0, 0, 0, 1.0)).is_none());
        assert!(!cache.contains(&coord(0, 0, 0, 1.0)));
        assert_eq!(cache.stats().purges, 1);
    }

    #[test]
    fn corrupt_entry_is_purged() {
        let cache = TileCache::new(CacheConfig::default());
        let corrupt = CachedTileData {
            payload: TilePayload::Png(vec![0; 16]),
            width: 8,
            height: 8,
            css_fit: None,
        };
        cache.set(&coord(0, 0, 0, 1.0), corrupt);
        assert!(cache.get(&coord(0, 0, 0, 1.0)).is_none());
        assert_eq!(cache.stats().l2_entries, 0);
    }

    #[test]
    fn replacing_a_tile_refreshes_l1() {
        let cache = TileCache::new(CacheConfig::default());
        cache.set(&coord(0, 0, 0, 1.0), solid(2, 2, 1));
        cache.get(&coord(0, 0, 0, 1.0)).expect("hit");
        cache.set(&coord(0, 0, 0, 1.0), solid(2, 2, 2));
        let bitmap = cache.get(&coord(0, 0, 0, 1.0)).expect("hit");
        assert!(bitmap.pixels.iter().all(|&b| b == 2));
        assert_eq!(cache.stats().l2_entries, 1);
    }

    #[test]
    fn fallback_prefers_higher_scale() {
        let cache = TileCache::new(CacheConfig::default());
        cache.set(&coord(0, 0, 0, 1.0), solid(256, 256, 1));
        cache.set(&coord(0, 0, 0, 4.0), solid(256, 256, 4));

        let best = cache.get_best_available(&coord(0, 0, 0, 2.0)).expect("fallback");
        assert_eq!(best.actual_scale, 4.0);
        assert_eq!(best.css_stretch, 0.5);
        assert_eq!(best.fallback_tile().map(|t| (t.tile_x, t.tile_y)), Some((0, 0)));
        // The 4x tile covers the top-left quarter of the 2x request
        assert_eq!(best.dest_rect, PixelRect::new(0.0, 0.0, 128.0, 128.0));
        assert_eq!(best.source_rect, PixelRect::new(0.0, 0.0, 256.0, 256.0));

        // One hit for the served tile; the 1x entry was never read
        let stats = cache.stats();
        assert_eq!((stats.l1_hits, stats.l2_hits), (0, 1));
        assert_eq!(stats.l1_entries, 1);
    }

    #[test]
    fn rejected_candidates_are_not_counted_or_promoted() {
        let cache = TileCache::new(CacheConfig::default());
        // A narrow right-edge tile covering x 0..100 in PDF space
        cache.set(&coord(0, 0, 0, 1.0), solid(100, 256, 1));
        cache.set_full_page(DOC, 0, 1.0, solid(612, 792, 3));

        // At 2x tile (1, 0) starts at x 128, and tile (5, 0) lies past the page
        assert!(cache.get_best_available(&coord(0, 1, 0, 2.0)).is_none());
        assert!(cache.get_best_available_bitmap(&coord(0, 5, 0, 2.0)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.l1_hits + stats.l2_hits, 0);
        assert_eq!(stats.l1_entries, 0);
        assert_eq!(stats.fallback_hits + stats.full_page_slice_hits, 0);
    }

    #[test]
    fn compressed_full_page_is_sliced() {
        let cache = TileCache::new(CacheConfig::default());
        let pixels = vec![6; 612 * 792 * 4];
        let page = CachedTileData::png(612, 792, &pixels).expect("encode");
        cache.set_full_page(DOC, 0, 1.0, page);

        let best = cache
            .get_best_available_bitmap(&coord(0, 1, 1, 2.0))
            .expect("slice");
        assert_eq!(best.source, BestSource::FullPageSlice);
        assert_eq!((best.bitmap.width, best.bitmap.height), (128, 128));
        assert!(best.bitmap.pixels.iter().all(|&b| b == 6));
        assert_eq!(cache.stats().full_page_slice_hits, 1);
    }

    #[test]
    fn fallback_to_lower_scale_maps_coordinates() {
        let cache = TileCache::new(CacheConfig::default());
        // Tile (1, 0) at 1x covers PDF x in [256, 512)
        cache.set(&coord(0, 1, 0, 1.0), solid(256, 256, 1));

        // Tile (3, 1) at 2x covers PDF x in [384, 512), y in [128, 256)
        let best = cache.get_best_available(&coord(0, 3, 1, 2.0)).expect("fallback");
        assert_eq!(best.fallback_tile().map(|t| (t.tile_x, t.tile_y)), Some((1, 0)));
        assert_eq!(best.css_stretch, 2.0);
        assert_eq!(best.source_rect, PixelRect::new(128.0, 128.0, 128.0, 128.0));
        assert_eq!(best.dest_rect, PixelRect::new(0.0, 0.0, 256.0, 256.0));
    }

    #[test]
    fn fallback_ignores_other_tile_sizes() {
        let cache = TileCache::new(CacheConfig::default());
        let mut big = coord(0, 0, 0, 4.0);
        big.tile_size = 512;
        cache.set(&big, solid(512, 512, 0));
        assert!(cache.get_best_available(&coord(0, 0, 0, 2.0)).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn full_page_slice_when_no_tiles() {
        let cache = TileCache::new(CacheConfig::default());
        cache.set_full_page(DOC, 0, 1.0, solid(612, 792, 3));

        assert!(cache.get_best_available(&coord(0, 1, 1, 2.0)).is_none());
        let best = cache
            .get_best_available_bitmap(&coord(0, 1, 1, 2.0))
            .expect("slice");
        assert_eq!(best.source, BestSource::FullPageSlice);
        assert_eq!((best.bitmap.width, best.bitmap.height), (128, 128));
        assert_eq!(best.css_stretch, 2.0);
    }

    #[test]
    fn tiles_and_full_pages_evict_independently() {
        let cache = TileCache::new(CacheConfig::default());
        cache.set(&coord(2, 0, 0, 2.0), solid(4, 4, 0));
        cache.set_full_page(DOC, 2, 2.0, solid(4, 4, 0));

        assert_eq!(cache.evict_tiles_for_page(DOC, 2), 1);
        assert!(cache.contains_full_page(DOC, 2, 2.0));
        assert_eq!(cache.evict_full_pages_for_page(DOC, 2), 1);
        assert_eq!(cache.stats().l2_entries, 0);
    }

    #[test]
    fn document_switch_clears_only_metadata() {
        let cache = TileCache::new(CacheConfig::default());
        assert!(cache.set_document(DOC));
        cache.set_page_metadata(PageMetadata {
            page: 0,
            size: PageSize::new(612.0, 792.0),
            has_text_layer: true,
            classification: None,
        });
        cache.set(&coord(0, 0, 0, 1.0), solid(4, 4, 0));

        assert!(!cache.set_document(DOC));
        assert!(cache.page_metadata(0).is_some());

        assert!(cache.set_document(DocumentId::new(2)));
        assert!(cache.page_metadata(0).is_none());
        assert!(cache.contains(&coord(0, 0, 0, 1.0)));
    }

    #[test]
    fn compliance_log_caches_and_reject_drops() {
        let logging = TileCache::new(CacheConfig::default());
        assert!(logging.set_validated(&coord(0, 0, 0, 2.0), solid(4, 4, 0), 8.0, "test"));
        assert!(logging.contains(&coord(0, 0, 0, 2.0)));
        assert_eq!(logging.stats().compliance_violations, 1);

        let strict = TileCache::new(CacheConfig {
            compliance: CompliancePolicy::Reject,
            ..CacheConfig::default()
        });
        assert!(!strict.set_validated(&coord(0, 0, 0, 2.0), solid(4, 4, 0), 8.0, "test"));
        assert!(!strict.contains(&coord(0, 0, 0, 2.0)));
        assert!(strict.set_validated(&coord(0, 0, 0, 2.0), solid(4, 4, 0), 2.0, "test"));
    }

    #[test]
    fn max_tier_caps_keys() {
        let cache = TileCache::new(CacheConfig::default());
        cache.set_max_scale_tier(10.0);
        assert_eq!(cache.max_scale_tier(), 8.0);
        assert_eq!(cache.tile_key(&coord(0, 0, 0, 30.0)), cache.tile_key(&coord(0, 0, 0, 8.0)));
    }
}
