//! Eviction policies beyond plain LRU
//!
//! Each policy is a one-shot sweep the caller runs at a meaningful moment
//! (a zoom gesture, a pan, memory pressure). The per-tier LRU keeps running
//! underneath regardless.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use super::key::{CacheKey, ScaleKey};
use super::tile_cache::{L2State, TileCache};
use crate::types::DocumentId;

/// Weight of page distance in [`TileCache::evict_by_distance_and_age`]
pub const DISTANCE_WEIGHT: f64 = 0.7;
/// Weight of age in [`TileCache::evict_by_distance_and_age`]
pub const AGE_WEIGHT: f64 = 0.3;

/// Pages on each side of the focal page kept when zooming in
pub const ZOOM_IN_PAGE_RADIUS: u32 = 1;
/// Most distinct pages kept when zooming out
pub const ZOOM_OUT_MAX_PAGES: usize = 12;
/// Pages beyond the visible range kept when panning
pub const PAN_BUFFER_PAGES: u32 = 2;

/// Relaxed cut-off multiple for [`TileCache::evict_scales_above`]
pub const SCALE_ABOVE_RELAXED: f32 = 2.0;
/// Tight cut-off multiple once the cache is nearly full
pub const SCALE_ABOVE_TIGHT: f32 = 1.5;
/// Utilization beyond which the tight cut-off applies
pub const SCALE_ABOVE_TIGHT_UTILIZATION: f64 = 0.8;

/// Slack in PDF points when comparing tile edges across scales
const COVER_EPSILON: f32 = 1e-3;

/// What the user just did to the view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    ZoomIn,
    ZoomOut,
    Pan,
}

fn normalized(value: f64, max: f64) -> f64 {
    if max > 0.0 { value / max } else { 0.0 }
}

/// Whether tiles cached at `scale` cover the PDF-space `rect` of `lower`
fn covered_at(l2: &L2State, lower: &CacheKey, scale: ScaleKey, rect: (f32, f32, f32, f32)) -> bool {
    let Some((_, _, tile_size)) = lower.tile() else {
        return false;
    };
    let s = scale.as_f32();
    let cell = tile_size as f32 / s;
    let first_x = (rect.0 / cell + COVER_EPSILON).floor() as u32;
    let first_y = (rect.1 / cell + COVER_EPSILON).floor() as u32;
    let last_x = ((rect.2 / cell - COVER_EPSILON).ceil() as u32).saturating_sub(1).max(first_x);
    let last_y = ((rect.3 / cell - COVER_EPSILON).ceil() as u32).saturating_sub(1).max(first_y);

    (first_y..=last_y).all(|tile_y| {
        (first_x..=last_x).all(|tile_x| {
            let key = CacheKey::Tile {
                document: lower.document(),
                page: lower.page(),
                tile_x,
                tile_y,
                scale,
                tile_size,
            };
            // Edge tiles are narrower; they must still reach the region's edge
            l2.store.peek(&key).is_some_and(|entry| {
                let right = tile_x as f32 * cell + entry.data.width as f32 / s;
                let bottom = tile_y as f32 * cell + entry.data.height as f32 / s;
                right + COVER_EPSILON >= rect.2.min((tile_x + 1) as f32 * cell)
                    && bottom + COVER_EPSILON >= rect.3.min((tile_y + 1) as f32 * cell)
            })
        })
    })
}

impl TileCache {
    /// Drops tiles cached below `scale` (quantized).
    pub fn evict_below_scale(&self, scale: f32) -> usize {
        let cut = ScaleKey::from_quantized(self.quantize(scale));
        let evicted = self.evict_where(|key| !key.is_full_page() && key.scale() < cut);
        debug!("evicted {evicted} tiles below scale {cut}");
        evicted
    }

    /// Drops tiles cached well above `target`.
    ///
    /// The cut-off is twice the target, tightened to 1.5x once L2 is more
    /// than 80% full, so small zoom oscillations do not thrash.
    pub fn evict_scales_above(&self, target: f32) -> usize {
        let factor = if self.utilization() > SCALE_ABOVE_TIGHT_UTILIZATION {
            SCALE_ABOVE_TIGHT
        } else {
            SCALE_ABOVE_RELAXED
        };
        let threshold = target * factor;
        let evicted =
            self.evict_where(|key| !key.is_full_page() && key.scale().as_f32() > threshold);
        debug!("evicted {evicted} tiles above scale {threshold}");
        evicted
    }

    /// Drops tiles whose page region is fully covered by cached tiles of
    /// the same size at a higher scale.
    ///
    /// A lower-scale tile is the only content for its region until every
    /// higher-scale tile over it is present, so partial coverage keeps it.
    pub fn evict_intermediate_scales(&self) -> usize {
        let doomed: Vec<CacheKey> = {
            let l2 = self.lock_l2();
            l2.store
                .iter()
                .filter_map(|(key, entry)| {
                    let (x, y, size) = key.tile()?;
                    let scale = key.scale().as_f32();
                    let x0 = x as f32 * size as f32 / scale;
                    let y0 = y as f32 * size as f32 / scale;
                    let rect = (
                        x0,
                        y0,
                        x0 + entry.data.width as f32 / scale,
                        y0 + entry.data.height as f32 / scale,
                    );
                    if rect.2 <= rect.0 || rect.3 <= rect.1 {
                        return None;
                    }
                    l2.index
                        .tile_scales(key.document(), key.page(), size)
                        .into_iter()
                        .filter(|higher| *higher > key.scale())
                        .any(|higher| covered_at(&l2, key, higher, rect))
                        .then_some(*key)
                })
                .collect()
        };

        let evicted = self.evict_keys(&doomed);
        debug!("collapsed intermediate scales, evicted {evicted} covered tiles");
        evicted
    }

    /// Evicts up to `count` tiles of `document`, highest `priority` first.
    ///
    /// `priority(page, tile_x, tile_y)` scores how expendable a tile is,
    /// typically its distance from the focal point.
    pub fn evict_by_priority(
        &self,
        document: DocumentId,
        count: usize,
        priority: impl Fn(u32, u32, u32) -> f64,
    ) -> usize {
        let mut scored: Vec<(f64, CacheKey)> = self
            .lock_l2()
            .store
            .keys()
            .filter(|key| key.document() == document)
            .filter_map(|key| key.tile().map(|(x, y, _)| (priority(key.page(), x, y), *key)))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let doomed: Vec<CacheKey> = scored.into_iter().take(count).map(|(_, key)| key).collect();
        self.evict_keys(&doomed)
    }

    /// Evicts up to `count` entries of `document` by a blend of page
    /// distance from `focal_page` and time since last use.
    ///
    /// Both terms are normalized to `[0, 1]` over the candidates, then
    /// `0.7 * distance + 0.3 * age`; highest score goes first.
    pub fn evict_by_distance_and_age(
        &self,
        document: DocumentId,
        focal_page: u32,
        count: usize,
    ) -> usize {
        let doomed: Vec<CacheKey> = {
            let l2 = self.lock_l2();
            let now = l2.clock;
            let candidates: Vec<(CacheKey, f64, f64)> = l2
                .store
                .iter()
                .filter(|(key, _)| key.document() == document)
                .map(|(key, entry)| {
                    let distance = f64::from(key.page().abs_diff(focal_page));
                    let age = now.saturating_sub(entry.touched) as f64;
                    (*key, distance, age)
                })
                .collect();

            let max_distance = candidates.iter().map(|c| c.1).fold(0.0, f64::max);
            let max_age = candidates.iter().map(|c| c.2).fold(0.0, f64::max);

            let mut scored: Vec<(f64, CacheKey)> = candidates
                .into_iter()
                .map(|(key, distance, age)| {
                    let score = DISTANCE_WEIGHT * normalized(distance, max_distance)
                        + AGE_WEIGHT * normalized(age, max_age);
                    (score, key)
                })
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            scored.into_iter().take(count).map(|(_, key)| key).collect()
        };
        self.evict_keys(&doomed)
    }

    /// Gesture-aware sweep over `document`'s pages.
    ///
    /// Zoom-in keeps only the focal page and its immediate neighbours.
    /// Zoom-out keeps every scale but caps how many pages stay cached,
    /// dropping the farthest first. Pan drops pages entirely outside the
    /// visible range plus a buffer.
    pub fn evict_for_gesture(
        &self,
        document: DocumentId,
        gesture: Gesture,
        focal_page: u32,
        visible: (u32, u32),
    ) -> usize {
        let evicted = match gesture {
            Gesture::ZoomIn => {
                let low = focal_page.saturating_sub(ZOOM_IN_PAGE_RADIUS);
                let high = focal_page.saturating_add(ZOOM_IN_PAGE_RADIUS);
                self.evict_where(|key| {
                    key.document() == document && !(low..=high).contains(&key.page())
                })
            }
            Gesture::ZoomOut => {
                let pages: BTreeMap<u32, u32> = self
                    .lock_l2()
                    .store
                    .keys()
                    .filter(|key| key.document() == document)
                    .map(|key| (key.page(), key.page().abs_diff(focal_page)))
                    .collect();
                if pages.len() <= ZOOM_OUT_MAX_PAGES {
                    0
                } else {
                    let mut by_distance: Vec<(u32, u32)> = pages.into_iter().collect();
                    by_distance.sort_by_key(|&(page, distance)| (distance, page));
                    let dropped: BTreeSet<u32> = by_distance
                        .into_iter()
                        .skip(ZOOM_OUT_MAX_PAGES)
                        .map(|(page, _)| page)
                        .collect();
                    self.evict_where(|key| {
                        key.document() == document && dropped.contains(&key.page())
                    })
                }
            }
            Gesture::Pan => {
                let (first, last) = (visible.0.min(visible.1), visible.0.max(visible.1));
                let low = first.saturating_sub(PAN_BUFFER_PAGES);
                let high = last.saturating_add(PAN_BUFFER_PAGES);
                self.evict_where(|key| {
                    key.document() == document && !(low..=high).contains(&key.page())
                })
            }
        };
        debug!("{gesture:?} around page {focal_page}: evicted {evicted} entries");
        evicted
    }
}
