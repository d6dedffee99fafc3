//! Presence index over cached scales
//!
//! Answers "is anything cached for this page at this scale and tile size"
//! without probing L2 once per tier and size.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::key::{CacheKey, ScaleKey};
use crate::types::DocumentId;

type PageId = (DocumentId, u32);

#[derive(Default)]
pub struct ScaleIndex {
    /// page -> scale -> tile size -> number of cached tiles
    tiles: HashMap<PageId, BTreeMap<ScaleKey, HashMap<u32, usize>>>,
    full_pages: HashMap<PageId, BTreeSet<ScaleKey>>,
}

impl ScaleIndex {
    pub fn insert(&mut self, key: &CacheKey) {
        let page = (key.document(), key.page());
        match key.tile() {
            Some((_, _, tile_size)) => {
                *self
                    .tiles
                    .entry(page)
                    .or_default()
                    .entry(key.scale())
                    .or_default()
                    .entry(tile_size)
                    .or_default() += 1;
            }
            None => {
                self.full_pages.entry(page).or_default().insert(key.scale());
            }
        }
    }

    pub fn remove(&mut self, key: &CacheKey) {
        let page = (key.document(), key.page());
        match key.tile() {
            Some((_, _, tile_size)) => {
                let Some(scales) = self.tiles.get_mut(&page) else {
                    return;
                };
                if let Some(sizes) = scales.get_mut(&key.scale()) {
                    if let Some(count) = sizes.get_mut(&tile_size) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            sizes.remove(&tile_size);
                        }
                    }
                    if sizes.is_empty() {
                        scales.remove(&key.scale());
                    }
                }
                if scales.is_empty() {
                    self.tiles.remove(&page);
                }
            }
            None => {
                if let Some(scales) = self.full_pages.get_mut(&page) {
                    scales.remove(&key.scale());
                    if scales.is_empty() {
                        self.full_pages.remove(&page);
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn has_tiles(&self, document: DocumentId, page: u32, scale: ScaleKey, tile_size: u32) -> bool {
        self.tiles
            .get(&(document, page))
            .and_then(|scales| scales.get(&scale))
            .is_some_and(|sizes| sizes.contains_key(&tile_size))
    }

    /// Scales with at least one tile of `tile_size` cached, ascending
    #[must_use]
    pub fn tile_scales(&self, document: DocumentId, page: u32, tile_size: u32) -> Vec<ScaleKey> {
        self.tiles
            .get(&(document, page))
            .map(|scales| {
                scales
                    .iter()
                    .filter(|(_, sizes)| sizes.contains_key(&tile_size))
                    .map(|(scale, _)| *scale)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Full-page scales cached for the page, ascending
    #[must_use]
    pub fn full_page_scales(&self, document: DocumentId, page: u32) -> Vec<ScaleKey> {
        self.full_pages
            .get(&(document, page))
            .map(|scales| scales.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
        self.full_pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(scale: f32, x: u32, tile_size: u32) -> CacheKey {
        CacheKey::Tile {
            document: DocumentId::new(1),
            page: 0,
            tile_x: x,
            tile_y: 0,
            scale: ScaleKey::from_quantized(scale),
            tile_size,
        }
    }

    #[test]
    fn counts_tiles_per_scale_and_size() {
        let doc = DocumentId::new(1);
        let mut index = ScaleIndex::default();
        index.insert(&tile(2.0, 0, 256));
        index.insert(&tile(2.0, 1, 256));
        index.insert(&tile(8.0, 0, 512));

        let s2 = ScaleKey::from_quantized(2.0);
        assert!(index.has_tiles(doc, 0, s2, 256));
        assert!(!index.has_tiles(doc, 0, s2, 512));
        assert_eq!(index.tile_scales(doc, 0, 256), vec![s2]);
        assert_eq!(index.tile_scales(doc, 0, 512), vec![ScaleKey::from_quantized(8.0)]);

        index.remove(&tile(2.0, 0, 256));
        assert!(index.has_tiles(doc, 0, s2, 256));
        index.remove(&tile(2.0, 1, 256));
        assert!(!index.has_tiles(doc, 0, s2, 256));
        assert!(index.tile_scales(doc, 0, 256).is_empty());
    }

    #[test]
    fn full_pages_are_separate() {
        let doc = DocumentId::new(1);
        let mut index = ScaleIndex::default();
        let full = CacheKey::FullPage {
            document: doc,
            page: 0,
            scale: ScaleKey::from_quantized(4.0),
        };
        index.insert(&full);
        assert_eq!(index.full_page_scales(doc, 0), vec![ScaleKey::from_quantized(4.0)]);
        assert!(index.tile_scales(doc, 0, 256).is_empty());
        index.remove(&full);
        assert!(index.full_page_scales(doc, 0).is_empty());
    }
}
