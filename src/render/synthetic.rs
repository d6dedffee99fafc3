//! Deterministic stand-in engine
//!
//! Documents are the ASCII bytes `synthetic:<pages>`. Every page has the
//! same size and is painted with a gradient that is a pure function of the
//! page number and the PDF-space position of each pixel, so two renders of
//! the same region at the same scale are byte-identical regardless of how
//! the page was tiled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flume::Receiver;
use log::debug;
use rayon::prelude::*;

use super::engine::{
    DocumentInfo, EngineError, EngineModule, PageInfo, RenderEngine, SearchHit, TileTarget,
};
use super::pixels::{BYTES_PER_PIXEL, PixelSink};
use crate::types::{ContentKind, DocumentId, PageClassification, PageSize};

const DOCUMENT_PREFIX: &str = "synthetic:";
const GATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the payload of a synthetic document with `pages` pages.
#[must_use]
pub fn synthetic_document(pages: u32) -> Vec<u8> {
    format!("{DOCUMENT_PREFIX}{pages}").into_bytes()
}

#[derive(Clone)]
struct Behavior {
    page_size: PageSize,
    crash_page: Option<u32>,
    gated_page: Option<(u32, Receiver<()>)>,
    failing_worker: Option<usize>,
}

/// Engine module producing [`SyntheticEngine`] instances
#[derive(Clone)]
pub struct SyntheticModule {
    behavior: Arc<Behavior>,
}

impl Default for SyntheticModule {
    fn default() -> Self {
        Self::new(PageSize::new(612.0, 792.0))
    }
}

impl SyntheticModule {
    #[must_use]
    pub fn new(page_size: PageSize) -> Self {
        Self {
            behavior: Arc::new(Behavior {
                page_size,
                crash_page: None,
                gated_page: None,
                failing_worker: None,
            }),
        }
    }

    fn with(mut self, change: impl FnOnce(&mut Behavior)) -> Self {
        change(Arc::make_mut(&mut self.behavior));
        self
    }

    /// Any render of `page` panics the worker.
    #[must_use]
    pub fn crash_on_page(self, page: u32) -> Self {
        self.with(|b| b.crash_page = Some(page))
    }

    /// Renders of `page` block until the gate yields a message.
    #[must_use]
    pub fn gate_page(self, page: u32, gate: Receiver<()>) -> Self {
        self.with(|b| b.gated_page = Some((page, gate)))
    }

    /// Instantiating the engine for `worker` fails.
    #[must_use]
    pub fn fail_worker(self, worker: usize) -> Self {
        self.with(|b| b.failing_worker = Some(worker))
    }
}

impl EngineModule for SyntheticModule {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn instantiate(&self, worker: usize) -> Result<Box<dyn RenderEngine>, EngineError> {
        if self.behavior.failing_worker == Some(worker) {
            return Err(EngineError::Init(format!(
                "synthetic engine refused worker {worker}"
            )));
        }
        Ok(Box::new(SyntheticEngine {
            worker,
            behavior: Arc::clone(&self.behavior),
            documents: HashMap::new(),
        }))
    }
}

/// One worker's synthetic engine
pub struct SyntheticEngine {
    worker: usize,
    behavior: Arc<Behavior>,
    documents: HashMap<DocumentId, u32>,
}

impl SyntheticEngine {
    fn check_page(&self, document: DocumentId, page: u32) -> Result<(), EngineError> {
        let pages = self
            .documents
            .get(&document)
            .ok_or(EngineError::MissingDocument(document))?;
        if page >= *pages {
            return Err(EngineError::Render(format!(
                "page {page} out of range ({pages} pages)"
            )));
        }
        Ok(())
    }

    fn before_render(&self, page: u32) {
        if self.behavior.crash_page == Some(page) {
            panic!("synthetic engine crashed on page {page}");
        }
        if let Some((gated, gate)) = &self.behavior.gated_page {
            if *gated == page {
                debug!("worker {}: holding page {page} at gate", self.worker);
                let _ = gate.recv_timeout(GATE_TIMEOUT);
            }
        }
    }

    fn is_scanned(page: u32) -> bool {
        page % 3 == 0
    }

    fn page_text(page: u32) -> String {
        format!("synthetic page {}", page + 1)
    }
}

/// Paints the gradient for a `width`x`height` region whose top-left pixel
/// sits at `origin` on the page raster at `scale`.
fn paint(
    buf: &mut [u8],
    width: u32,
    origin: (u32, u32),
    scale: f32,
    page: u32,
    page_size: PageSize,
) {
    let stride = width as usize * BYTES_PER_PIXEL;
    let blue = (page.wrapping_mul(37) % 256) as u8;

    buf.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let pdf_y = (origin.1 as f32 + y as f32 + 0.5) / scale;
        let green = (pdf_y / page_size.height * 255.0).clamp(0.0, 255.0) as u8;
        for (x, px) in row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
            let pdf_x = (origin.0 as f32 + x as f32 + 0.5) / scale;
            let red = (pdf_x / page_size.width * 255.0).clamp(0.0, 255.0) as u8;
            px.copy_from_slice(&[red, green, blue, 255]);
        }
    });
}

impl RenderEngine for SyntheticEngine {
    fn load_document(
        &mut self,
        document: DocumentId,
        bytes: &[u8],
    ) -> Result<DocumentInfo, EngineError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| EngineError::Load("document is not UTF-8".to_string()))?;
        let page_count = text
            .strip_prefix(DOCUMENT_PREFIX)
            .and_then(|n| n.trim().parse::<u32>().ok())
            .filter(|&n| n > 0)
            .ok_or_else(|| EngineError::Load("not a synthetic document".to_string()))?;

        self.documents.insert(document, page_count);
        Ok(DocumentInfo {
            document,
            page_count,
        })
    }

    fn unload_document(&mut self, document: DocumentId) {
        self.documents.remove(&document);
    }

    fn page_info(&mut self, document: DocumentId, page: u32) -> Result<PageInfo, EngineError> {
        self.check_page(document, page)?;
        Ok(PageInfo {
            page,
            size: self.behavior.page_size,
            has_text_layer: !Self::is_scanned(page),
        })
    }

    fn render_tile(
        &mut self,
        document: DocumentId,
        tile: &TileTarget,
        out: &mut PixelSink<'_>,
    ) -> Result<(), EngineError> {
        self.check_page(document, tile.page)?;
        if tile.scale <= 0.0 || tile.tile_size == 0 {
            return Err(EngineError::Render(format!(
                "invalid tile geometry: scale {} size {}",
                tile.scale, tile.tile_size
            )));
        }
        let (width, height) = tile.pixel_size(self.behavior.page_size);
        if width == 0 || height == 0 {
            return Err(EngineError::Render(format!(
                "tile ({}, {}) lies outside page {}",
                tile.tile_x, tile.tile_y, tile.page
            )));
        }
        self.before_render(tile.page);

        let origin = (tile.tile_x * tile.tile_size, tile.tile_y * tile.tile_size);
        let buf = out.allocate(width, height);
        paint(
            buf,
            width,
            origin,
            tile.scale,
            tile.page,
            self.behavior.page_size,
        );
        Ok(())
    }

    fn render_full_page(
        &mut self,
        document: DocumentId,
        page: u32,
        scale: f32,
        out: &mut PixelSink<'_>,
    ) -> Result<(), EngineError> {
        self.check_page(document, page)?;
        if scale <= 0.0 {
            return Err(EngineError::Render(format!("invalid scale {scale}")));
        }
        self.before_render(page);

        let (width, height) = self.behavior.page_size.pixels_at(scale);
        let buf = out.allocate(width, height);
        paint(buf, width, (0, 0), scale, page, self.behavior.page_size);
        Ok(())
    }

    fn classify_page(
        &mut self,
        document: DocumentId,
        page: u32,
    ) -> Result<PageClassification, EngineError> {
        self.check_page(document, page)
            .map_err(|e| EngineError::Classification(e.to_string()))?;
        let classified_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);

        let (kind, confidence) = if Self::is_scanned(page) {
            (ContentKind::Scanned, 0.9)
        } else {
            (ContentKind::Text, 0.8)
        };
        Ok(PageClassification {
            kind,
            confidence,
            has_transparency: false,
            classified_at_ms,
        })
    }

    fn extract_embedded_image(
        &mut self,
        document: DocumentId,
        page: u32,
        out: &mut PixelSink<'_>,
    ) -> Result<(), EngineError> {
        self.check_page(document, page)?;
        if !Self::is_scanned(page) {
            return Err(EngineError::Render(format!(
                "page {page} has no embedded page image"
            )));
        }
        self.before_render(page);

        // Scans are stored at 1 pixel per point
        let (width, height) = self.behavior.page_size.pixels_at(1.0);
        let buf = out.allocate(width, height);
        paint(buf, width, (0, 0), 1.0, page, self.behavior.page_size);
        Ok(())
    }

    fn search(
        &mut self,
        document: DocumentId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let pages = *self
            .documents
            .get(&document)
            .ok_or(EngineError::MissingDocument(document))?;
        if query.trim().is_empty() {
            return Err(EngineError::Search("empty query".to_string()));
        }

        let needle = query.to_lowercase();
        Ok((0..pages)
            .filter(|&page| !Self::is_scanned(page))
            .map(|page| (page, Self::page_text(page)))
            .filter(|(_, text)| text.to_lowercase().contains(&needle))
            .take(limit)
            .map(|(page, snippet)| SearchHit { page, snippet })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn engine() -> Box<dyn RenderEngine> {
        let mut engine = SyntheticModule::default()
            .instantiate(0)
            .expect("engine");
        engine
            .load_document(DocumentId::new(1), &synthetic_document(10))
            .expect("load");
        engine
    }

    fn render(
        engine: &mut dyn RenderEngine,
        f: impl FnOnce(&mut dyn RenderEngine, &mut PixelSink<'_>) -> Result<(), EngineError>,
    ) -> Vec<u8> {
        let buffers = BufferPool::disabled();
        let mut sink = PixelSink::new(&buffers);
        f(engine, &mut sink).expect("render");
        sink.finish().expect("pixels").into_vec()
    }

    #[test]
    fn rejects_foreign_documents() {
        let mut engine = SyntheticModule::default().instantiate(0).expect("engine");
        assert!(matches!(
            engine.load_document(DocumentId::new(1), b"%PDF-1.7"),
            Err(EngineError::Load(_))
        ));
        assert!(matches!(
            engine.load_document(DocumentId::new(1), b"synthetic:0"),
            Err(EngineError::Load(_))
        ));
    }

    #[test]
    fn tiles_match_full_page_region() {
        let mut engine = engine();
        let doc = DocumentId::new(1);
        let tile = TileTarget {
            page: 2,
            tile_x: 1,
            tile_y: 1,
            scale: 1.0,
            tile_size: 64,
        };
        let tile_px = render(engine.as_mut(), |e, s| e.render_tile(doc, &tile, s));
        let page_px = render(engine.as_mut(), |e, s| e.render_full_page(doc, 2, 1.0, s));

        let page_stride = 612 * 4;
        for row in 0..64 {
            let page_start = (64 + row) * page_stride + 64 * 4;
            assert_eq!(
                &tile_px[row * 64 * 4..(row + 1) * 64 * 4],
                &page_px[page_start..page_start + 64 * 4]
            );
        }
    }

    #[test]
    fn classification_and_extraction() {
        let mut engine = engine();
        let doc = DocumentId::new(1);
        let scanned = engine.classify_page(doc, 3).expect("classify");
        assert!(scanned.allows_image_extraction());
        let text = engine.classify_page(doc, 4).expect("classify");
        assert_eq!(text.kind, ContentKind::Text);

        let image = render(engine.as_mut(), |e, s| e.extract_embedded_image(doc, 3, s));
        assert_eq!(image.len(), 612 * 792 * 4);

        let buffers = BufferPool::disabled();
        let mut sink = PixelSink::new(&buffers);
        assert!(engine.extract_embedded_image(doc, 4, &mut sink).is_err());
    }

    #[test]
    fn missing_document_and_page() {
        let mut engine = engine();
        assert!(matches!(
            engine.page_info(DocumentId::new(2), 0),
            Err(EngineError::MissingDocument(_))
        ));
        assert!(engine.page_info(DocumentId::new(1), 10).is_err());
        engine.unload_document(DocumentId::new(1));
        assert!(engine.page_info(DocumentId::new(1), 0).is_err());
    }

    #[test]
    fn search_respects_limit() {
        let mut engine = engine();
        let hits = engine
            .search(DocumentId::new(1), "synthetic page", 2)
            .expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].page, 1);

        let hits = engine
            .search(DocumentId::new(1), "page 5", 10)
            .expect("search");
        assert_eq!(hits, vec![SearchHit {
            page: 4,
            snippet: "synthetic page 5".to_string()
        }]);
    }
}
