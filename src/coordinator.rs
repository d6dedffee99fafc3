//! The composition root the compositor talks to
//!
//! [`RenderCoordinator`] owns one tile cache and one render pool. Cache
//! reads never block on workers; a miss goes through
//! [`RenderCoordinator::request_render`], which picks a rendering path for
//! the page, dispatches it, and writes the result back into the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::buffer::{BufferPool, TierStats};
use crate::cache::{
    BestSource, BestTile, Bitmap, CacheStats, CachedTileData, CssFit, Gesture, PageMetadata,
    PixelRect, PixelView, PressureLevel, TileCache, TileCoordinate, slice_full_page,
};
use crate::config::PagetileConfig;
use crate::pool::{PoolError, PoolStats};
use crate::render::{DocumentInfo, EngineModule, RenderPool, RenderedPixels, SearchHit};
use crate::strategy::{self, RenderDecision, RenderMode, StrategyInput, StrategyThresholds};
use crate::types::{DocumentId, PageClassification};

/// Scale differences below this are not worth a CSS fit hint
const CSS_FIT_EPSILON: f32 = 0.01;

/// Everything a telemetry overlay shows
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub buffers: Vec<TierStats>,
    pub buffers_shared: bool,
    pub active_document: Option<DocumentId>,
}

pub struct RenderCoordinator {
    cache: TileCache,
    pool: RenderPool,
    thresholds: StrategyThresholds,
    /// Viewport in CSS pixels, when the compositor has reported one
    viewport: Mutex<Option<(f32, f32)>>,
    /// Last mode used per page, to spot strategy flips
    modes: Mutex<HashMap<(DocumentId, u32), RenderMode>>,
}

impl RenderCoordinator {
    /// Builds the buffer pool, starts the workers and creates an empty cache.
    pub fn create(config: &PagetileConfig, engine: Arc<dyn EngineModule>) -> Result<Self, PoolError> {
        let buffers = BufferPool::new(&config.buffers);
        let pool = RenderPool::create(&config.pool_options(), engine, buffers)?;
        Ok(Self::from_parts(config, pool))
    }

    /// Like [`RenderCoordinator::create`] with exactly `workers` workers.
    pub fn with_workers(
        workers: usize,
        config: &PagetileConfig,
        engine: Arc<dyn EngineModule>,
        buffers: BufferPool,
    ) -> Result<Self, PoolError> {
        let pool = RenderPool::with_workers(workers, &config.pool_options(), engine, buffers)?;
        Ok(Self::from_parts(config, pool))
    }

    fn from_parts(config: &PagetileConfig, pool: RenderPool) -> Self {
        info!(
            "coordinator ready: {} workers, L1 {} / L2 {} entries, shared buffers: {}",
            pool.workers().len(),
            config.cache.l1_max_entries,
            config.cache.l2_max_entries,
            pool.buffers().is_shared()
        );
        Self {
            cache: TileCache::new(config.cache),
            pool,
            thresholds: config.strategy,
            viewport: Mutex::new(None),
            modes: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    #[must_use]
    pub fn pool(&self) -> &RenderPool {
        &self.pool
    }

    // Documents

    /// Loads a document and makes it the active one.
    ///
    /// With `all_workers` every live worker gets a copy, so tiles of the
    /// document can render in parallel.
    pub fn open_document(&self, bytes: &[u8], all_workers: bool) -> Result<DocumentInfo, PoolError> {
        let info = if all_workers {
            self.pool.load_document_on_all_workers(bytes)?
        } else {
            self.pool.load_document(bytes)?
        };
        self.set_document(info.document);
        Ok(info)
    }

    /// Switches the active document; page metadata of the previous one is
    /// dropped.
    pub fn set_document(&self, document: DocumentId) {
        if self.cache.set_document(document) {
            debug!("active document is now {document}");
        }
    }

    /// Unloads a document from the workers and drops its cached entries.
    pub fn close_document(&self, document: DocumentId) -> usize {
        let workers = self.pool.unload_document(document);
        let evicted = self.cache.evict_document(document);
        self.modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(doc, _), _| *doc != document);
        info!("{document} closed on {workers} workers, {evicted} cache entries dropped");
        evicted
    }

    /// Page facts for the active document, asked from a worker once.
    pub fn page_metadata(&self, document: DocumentId, page: u32) -> Result<PageMetadata, PoolError> {
        let active = self.cache.active_document() == Some(document);
        if active {
            if let Some(metadata) = self.cache.page_metadata(page) {
                return Ok(metadata);
            }
        }

        let info = self.pool.page_info(document, page)?.wait()?;
        let metadata = PageMetadata {
            page,
            size: info.size,
            has_text_layer: info.has_text_layer,
            classification: None,
        };
        if active {
            self.cache.set_page_metadata(metadata);
        }
        Ok(metadata)
    }

    fn classification(
        &self,
        document: DocumentId,
        metadata: &PageMetadata,
    ) -> Result<PageClassification, PoolError> {
        if let Some(classification) = metadata.classification {
            return Ok(classification);
        }
        let classification = self.pool.classify_page(document, metadata.page)?.wait()?;
        // L3 is keyed by page alone and only describes the active document
        if self.cache.active_document() == Some(document) {
            self.cache.set_classification(metadata.page, classification);
        }
        trace!(
            "{document} page {} classified as {:?} ({:.2})",
            metadata.page, classification.kind, classification.confidence
        );
        Ok(classification)
    }

    pub fn search(
        &self,
        document: DocumentId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, PoolError> {
        self.pool.search(document, query, limit)?.wait()
    }

    // Cache reads

    /// The exact tile, or `None`.
    #[must_use]
    pub fn get_tile(&self, tile: &TileCoordinate) -> Option<Bitmap> {
        self.cache.get(tile)
    }

    /// Something displayable for `tile`: the exact entry, a tile from a
    /// neighbouring scale, or a slice of a cached whole page.
    #[must_use]
    pub fn get_best_available_tile(&self, tile: &TileCoordinate) -> Option<BestTile> {
        self.cache.get_best_available_bitmap(tile)
    }

    // Miss path

    /// Which rendering path the strategy picks for `tile`'s page.
    pub fn decide(&self, tile: &TileCoordinate) -> Result<RenderDecision, PoolError> {
        let metadata = self.page_metadata(tile.document, tile.page)?;
        Ok(self.decide_with(tile, &metadata))
    }

    fn decide_with(&self, tile: &TileCoordinate, metadata: &PageMetadata) -> RenderDecision {
        let viewport = *self.viewport.lock().unwrap_or_else(PoisonError::into_inner);
        strategy::decide(
            &StrategyInput {
                zoom: tile.scale,
                page_width: metadata.size.width,
                page_height: metadata.size.height,
                viewport,
            },
            &self.thresholds,
        )
    }

    /// Renders `tile`, caches the result and returns it.
    ///
    /// Blocks until the worker answers. Scanned pages with a confident
    /// classification have their embedded image extracted instead of
    /// being rasterized; pages in full-page mode are rendered whole and
    /// the tile is sliced out.
    pub fn request_render(&self, tile: &TileCoordinate) -> Result<BestTile, PoolError> {
        let metadata = self.page_metadata(tile.document, tile.page)?;
        let decision = self.decide_with(tile, &metadata);
        self.on_mode_transition(tile.document, tile.page, decision.mode);

        let classification = self.classification(tile.document, &metadata)?;
        if classification.allows_image_extraction() {
            return self.render_extracted(tile, &metadata);
        }

        match decision.mode {
            RenderMode::Tiled => self.render_tile(tile),
            RenderMode::FullPage => self.render_full_page(tile),
        }
    }

    fn render_tile(&self, tile: &TileCoordinate) -> Result<BestTile, PoolError> {
        let quantized = self.cache.quantize(tile.scale);
        let pixels = self
            .pool
            .render_tile(tile.document, tile.target_at(quantized))?
            .wait()?;
        let bitmap = to_bitmap(&pixels);

        let mut data = self.to_cached(&pixels);
        let factor = tile.scale / quantized;
        if (factor - 1.0).abs() > CSS_FIT_EPSILON {
            data = data.with_css_fit(CssFit {
                css_scale_factor: factor,
                target_width: (pixels.width as f32 * factor).round() as u32,
                target_height: (pixels.height as f32 * factor).round() as u32,
            });
        }
        self.cache
            .set_validated(tile, data, quantized, "request_render");

        let full = PixelRect::new(0.0, 0.0, bitmap.width as f32, bitmap.height as f32);
        Ok(BestTile {
            bitmap,
            actual_scale: quantized,
            css_stretch: 1.0,
            source: BestSource::Exact,
            source_rect: full,
            dest_rect: full,
        })
    }

    fn render_full_page(&self, tile: &TileCoordinate) -> Result<BestTile, PoolError> {
        let quantized = self.cache.quantize(tile.scale);
        let pixels = self
            .pool
            .render_full_page(tile.document, tile.page, quantized)?
            .wait()?;
        self.store_full_page(tile, quantized, &pixels, quantized)
    }

    fn render_extracted(
        &self,
        tile: &TileCoordinate,
        metadata: &PageMetadata,
    ) -> Result<BestTile, PoolError> {
        let pixels = self
            .pool
            .extract_embedded_image(tile.document, tile.page)?
            .wait()?;
        // The embedded image's native resolution decides its scale
        let native = if metadata.size.width > 0.0 {
            pixels.width as f32 / metadata.size.width
        } else {
            1.0
        };
        let page_scale = self.cache.quantize(native);
        debug!(
            "{} page {}: extracted {}x{} image, cached at scale {page_scale}",
            tile.document, tile.page, pixels.width, pixels.height
        );
        self.store_full_page(tile, page_scale, &pixels, self.cache.quantize(tile.scale))
    }

    fn store_full_page(
        &self,
        tile: &TileCoordinate,
        page_scale: f32,
        pixels: &RenderedPixels,
        requested: f32,
    ) -> Result<BestTile, PoolError> {
        self.cache
            .set_full_page(tile.document, tile.page, page_scale, self.to_cached(pixels));
        let page = PixelView {
            width: pixels.width,
            height: pixels.height,
            pixels: pixels.bytes(),
        };
        slice_full_page(page, page_scale, tile, requested).ok_or_else(|| {
            PoolError::Render(format!(
                "tile ({}, {}) lies outside page {}",
                tile.tile_x, tile.tile_y, tile.page
            ))
        })
    }

    /// Renders every tile not already cached, spread over the workers
    /// holding each document. Returns how many tiles were stored.
    pub fn prefetch_tiles(&self, tiles: &[TileCoordinate]) -> Result<usize, PoolError> {
        let mut missing: HashMap<DocumentId, Vec<TileCoordinate>> = HashMap::new();
        for tile in tiles.iter().filter(|tile| !self.cache.contains(tile)) {
            missing.entry(tile.document).or_default().push(*tile);
        }

        let mut stored = 0;
        for (document, tiles) in missing {
            let targets: Vec<_> = tiles
                .iter()
                .map(|tile| tile.target_at(self.cache.quantize(tile.scale)))
                .collect();
            let results = match self.pool.render_batch(document, &targets) {
                Ok(results) => results,
                Err(e) => {
                    warn!("prefetch for {document} skipped: {e}");
                    continue;
                }
            };
            for ((tile, target), result) in tiles.iter().zip(&targets).zip(results) {
                match result {
                    Ok(pixels) => {
                        let data = self.to_cached(&pixels);
                        if self
                            .cache
                            .set_validated(tile, data, target.scale, "prefetch_tiles")
                        {
                            stored += 1;
                        }
                    }
                    Err(e) => warn!(
                        "prefetch of {document} page {} tile ({}, {}) failed: {e}",
                        tile.page, tile.tile_x, tile.tile_y
                    ),
                }
            }
        }
        Ok(stored)
    }

    fn to_cached(&self, pixels: &RenderedPixels) -> CachedTileData {
        if self.cache.config().store_compressed {
            match CachedTileData::png(pixels.width, pixels.height, pixels.bytes()) {
                Ok(data) => return data,
                Err(e) => warn!("PNG encoding failed, caching raw pixels: {e}"),
            }
        }
        CachedTileData::raw(pixels.width, pixels.height, pixels.bytes().to_vec())
    }

    // View-state hooks

    /// Records the mode used for a page; when it flips, the representation
    /// that is no longer used is evicted. Returns how many entries went.
    pub fn on_mode_transition(&self, document: DocumentId, page: u32, mode: RenderMode) -> usize {
        let previous = self
            .modes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((document, page), mode);
        match previous {
            Some(previous) if previous != mode => {
                let evicted = match mode {
                    RenderMode::Tiled => self.cache.evict_full_pages_for_page(document, page),
                    RenderMode::FullPage => self.cache.evict_tiles_for_page(document, page),
                };
                debug!("{document} page {page}: {previous} -> {mode}, evicted {evicted}");
                evicted
            }
            _ => 0,
        }
    }

    /// Runs the gesture-aware sweep for a zoom change on the active document.
    pub fn on_zoom_change(
        &self,
        old_zoom: f32,
        new_zoom: f32,
        focal_page: u32,
        visible: (u32, u32),
    ) -> usize {
        let Some(document) = self.cache.active_document() else {
            return 0;
        };
        let gesture = if new_zoom > old_zoom {
            Gesture::ZoomIn
        } else if new_zoom < old_zoom {
            Gesture::ZoomOut
        } else {
            Gesture::Pan
        };

        let mut evicted = self
            .cache
            .evict_for_gesture(document, gesture, focal_page, visible);
        if gesture == Gesture::ZoomOut {
            evicted += self.cache.evict_scales_above(new_zoom);
        }
        evicted
    }

    pub fn on_pan(&self, first_visible: u32, last_visible: u32) -> usize {
        let Some(document) = self.cache.active_document() else {
            return 0;
        };
        self.cache.evict_for_gesture(
            document,
            Gesture::Pan,
            first_visible,
            (first_visible, last_visible),
        )
    }

    pub fn set_viewport(&self, width: f32, height: f32) {
        *self.viewport.lock().unwrap_or_else(PoisonError::into_inner) = Some((width, height));
    }

    pub fn on_memory_pressure(&self, level: PressureLevel) -> usize {
        self.cache.apply_memory_pressure(level)
    }

    #[must_use]
    pub fn get_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache: self.cache.stats(),
            pool: self.pool.stats(),
            buffers: self.pool.buffers().stats(),
            buffers_shared: self.pool.buffers().is_shared(),
            active_document: self.cache.active_document(),
        }
    }

    /// Stops the workers. Cached tiles stay readable.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        info!("coordinator shut down");
    }
}

fn to_bitmap(pixels: &RenderedPixels) -> Bitmap {
    Bitmap {
        width: pixels.width,
        height: pixels.height,
        pixels: pixels.bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::render::{SyntheticModule, synthetic_document};
    use crate::types::ContentKind;

    fn coordinator(cache: CacheConfig) -> RenderCoordinator {
        let config = PagetileConfig {
            cache,
            ..PagetileConfig::default()
        };
        RenderCoordinator::with_workers(
            2,
            &config,
            Arc::new(SyntheticModule::default()),
            BufferPool::disabled(),
        )
        .unwrap()
    }

    fn tile(document: DocumentId, page: u32, x: u32, y: u32, scale: f32) -> TileCoordinate {
        TileCoordinate {
            document,
            page,
            tile_x: x,
            tile_y: y,
            scale,
            tile_size: 256,
        }
    }

    #[test]
    fn tiled_render_populates_cache() {
        let coordinator = coordinator(CacheConfig::default());
        let doc = coordinator
            .open_document(&synthetic_document(4), false)
            .unwrap()
            .document;

        let wanted = tile(doc, 1, 2, 2, 4.5);
        assert!(coordinator.get_tile(&wanted).is_none());
        let rendered = coordinator.request_render(&wanted).unwrap();
        assert_eq!(rendered.source, BestSource::Exact);
        assert_eq!(rendered.actual_scale, 4.0);

        let cached = coordinator.get_tile(&wanted).unwrap();
        assert_eq!(cached, rendered.bitmap);
        assert!(coordinator.cache().page_metadata(1).is_some());
        coordinator.shutdown();
    }

    #[test]
    fn low_zoom_renders_whole_page() {
        let coordinator = coordinator(CacheConfig::default());
        let doc = coordinator
            .open_document(&synthetic_document(4), false)
            .unwrap()
            .document;

        let best = coordinator.request_render(&tile(doc, 1, 1, 1, 1.0)).unwrap();
        assert_eq!(best.source, BestSource::FullPageSlice);
        assert!(coordinator.cache().contains_full_page(doc, 1, 1.0));
        // Neighbouring tiles are now sliced from the cached page
        let neighbour = coordinator
            .get_best_available_tile(&tile(doc, 1, 0, 0, 1.0))
            .unwrap();
        assert_eq!(neighbour.source, BestSource::FullPageSlice);
        coordinator.shutdown();
    }

    #[test]
    fn scanned_pages_use_extraction() {
        let coordinator = coordinator(CacheConfig::default());
        let doc = coordinator
            .open_document(&synthetic_document(4), false)
            .unwrap()
            .document;

        let best = coordinator.request_render(&tile(doc, 0, 0, 0, 6.0)).unwrap();
        assert_eq!(best.source, BestSource::FullPageSlice);
        assert_eq!(best.actual_scale, 1.0);
        assert_eq!(best.css_stretch, 6.0);
        let metadata = coordinator.cache().page_metadata(0).unwrap();
        assert_eq!(metadata.classification.map(|c| c.kind), Some(ContentKind::Scanned));
        coordinator.shutdown();
    }

    #[test]
    fn compressed_storage_round_trips() {
        let coordinator = coordinator(CacheConfig {
            store_compressed: true,
            ..CacheConfig::default()
        });
        let doc = coordinator
            .open_document(&synthetic_document(2), false)
            .unwrap()
            .document;
        let wanted = tile(doc, 1, 0, 0, 8.0);
        let rendered = coordinator.request_render(&wanted).unwrap();
        assert_eq!(coordinator.get_tile(&wanted).unwrap(), rendered.bitmap);
        coordinator.shutdown();
    }

    #[test]
    fn mode_flip_evicts_other_representation() {
        let coordinator = coordinator(CacheConfig::default());
        let doc = coordinator
            .open_document(&synthetic_document(4), false)
            .unwrap()
            .document;

        coordinator.request_render(&tile(doc, 1, 0, 0, 1.0)).unwrap();
        assert!(coordinator.cache().contains_full_page(doc, 1, 1.0));

        coordinator.request_render(&tile(doc, 1, 0, 0, 6.0)).unwrap();
        assert!(!coordinator.cache().contains_full_page(doc, 1, 1.0));
        assert_eq!(coordinator.on_mode_transition(doc, 1, RenderMode::Tiled), 0);
        coordinator.shutdown();
    }

    #[test]
    fn zoom_out_drops_high_scales() {
        let coordinator = coordinator(CacheConfig::default());
        let doc = coordinator
            .open_document(&synthetic_document(4), false)
            .unwrap()
            .document;
        coordinator.request_render(&tile(doc, 1, 0, 0, 16.0)).unwrap();
        coordinator.request_render(&tile(doc, 1, 0, 0, 6.0)).unwrap();

        coordinator.on_zoom_change(16.0, 2.0, 1, (1, 1));
        assert!(!coordinator.cache().contains(&tile(doc, 1, 0, 0, 16.0)));
        assert!(!coordinator.cache().contains(&tile(doc, 1, 0, 0, 6.0)));
        coordinator.shutdown();
    }

    #[test]
    fn prefetch_and_stats() {
        let coordinator = coordinator(CacheConfig::default());
        let doc = coordinator
            .open_document(&synthetic_document(3), true)
            .unwrap()
            .document;
        let tiles: Vec<_> = (0..4).map(|x| tile(doc, 1, x, 0, 4.0)).collect();
        assert_eq!(coordinator.prefetch_tiles(&tiles).unwrap(), 4);
        assert_eq!(coordinator.prefetch_tiles(&tiles).unwrap(), 0);

        let stats = coordinator.get_stats();
        assert_eq!(stats.cache.l2_entries, 4);
        assert_eq!(stats.active_document, Some(doc));
        assert!(!stats.buffers_shared);
        assert!(serde_json::to_string(&stats).is_ok());

        assert_eq!(coordinator.close_document(doc), 4);
        assert!(!coordinator.pool().has_document(doc));
        coordinator.shutdown();
    }

    fn dispatched(coordinator: &RenderCoordinator) -> u64 {
        coordinator
            .pool()
            .stats()
            .workers
            .iter()
            .map(|w| w.total_requests)
            .sum()
    }

    #[test]
    fn background_document_leaves_active_metadata_alone() {
        let coordinator = coordinator(CacheConfig::default());
        let background = coordinator
            .open_document(&synthetic_document(6), true)
            .unwrap()
            .document;
        let active = coordinator
            .open_document(&synthetic_document(6), true)
            .unwrap()
            .document;
        assert_eq!(coordinator.cache().active_document(), Some(active));

        coordinator.page_metadata(active, 4).unwrap();
        let before = dispatched(&coordinator);
        let rendered = coordinator
            .request_render(&tile(background, 4, 0, 0, 6.0))
            .unwrap();
        assert_eq!(rendered.source, BestSource::Exact);

        // page_info, classify_page and render_tile, each asked once
        assert_eq!(dispatched(&coordinator) - before, 3);
        let metadata = coordinator.cache().page_metadata(4).unwrap();
        assert_eq!(metadata.classification, None);

        // The active document still gets its own classification
        coordinator.request_render(&tile(active, 4, 0, 0, 6.0)).unwrap();
        let metadata = coordinator.cache().page_metadata(4).unwrap();
        assert_eq!(metadata.classification.map(|c| c.kind), Some(ContentKind::Text));
        coordinator.shutdown();
    }

    #[test]
    fn prefetch_skips_documents_without_workers() {
        let coordinator = coordinator(CacheConfig::default());
        let doc = coordinator
            .open_document(&synthetic_document(3), true)
            .unwrap()
            .document;
        let unknown = DocumentId::new(999);
        let tiles = vec![
            tile(unknown, 0, 0, 0, 4.0),
            tile(doc, 1, 0, 0, 4.0),
            tile(unknown, 0, 1, 0, 4.0),
            tile(doc, 1, 1, 0, 4.0),
        ];

        assert_eq!(coordinator.prefetch_tiles(&tiles).unwrap(), 2);
        assert!(coordinator.cache().contains(&tile(doc, 1, 0, 0, 4.0)));
        assert!(coordinator.cache().contains(&tile(doc, 1, 1, 0, 4.0)));
        assert!(!coordinator.cache().contains(&tile(unknown, 0, 0, 0, 4.0)));
        coordinator.shutdown();
    }
}
