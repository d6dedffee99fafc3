//! Render engine seam
//!
//! The native rasterizer is an external collaborator. Each worker owns one
//! [`RenderEngine`] instance, created from a shared [`EngineModule`] that is
//! built once by the application.

use serde::{Deserialize, Serialize};

use super::pixels::PixelSink;
use crate::pool::PoolError;
use crate::types::{DocumentId, PageClassification, PageSize};

/// Result of loading a document into an engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub document: DocumentId,
    pub page_count: u32,
}

/// Per-page facts reported by the engine
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: u32,
    pub size: PageSize,
    pub has_text_layer: bool,
}

/// Text search hit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub page: u32,
    pub snippet: String,
}

/// A tile to rasterize, with indices on the grid of `scale`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileTarget {
    pub page: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub scale: f32,
    pub tile_size: u32,
}

impl TileTarget {
    /// PDF-space origin of the tile in points
    #[must_use]
    pub fn pdf_origin(&self) -> (f32, f32) {
        let extent = self.pdf_extent();
        (self.tile_x as f32 * extent, self.tile_y as f32 * extent)
    }

    /// Edge length of the tile in PDF points
    #[must_use]
    pub fn pdf_extent(&self) -> f32 {
        self.tile_size as f32 / self.scale
    }

    /// Pixel size of this tile on a page of `size`, clipped at the page edge
    #[must_use]
    pub fn pixel_size(&self, size: PageSize) -> (u32, u32) {
        let (page_w, page_h) = size.pixels_at(self.scale);
        let x0 = self.tile_x.saturating_mul(self.tile_size);
        let y0 = self.tile_y.saturating_mul(self.tile_size);
        (
            page_w.saturating_sub(x0).min(self.tile_size),
            page_h.saturating_sub(y0).min(self.tile_size),
        )
    }
}

/// Errors a single engine call can return
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("load: {0}")]
    Load(String),

    #[error("render: {0}")]
    Render(String),

    #[error("search: {0}")]
    Search(String),

    #[error("classification: {0}")]
    Classification(String),

    #[error("{0} is not loaded on this worker")]
    MissingDocument(DocumentId),

    #[error("engine init: {0}")]
    Init(String),
}

/// Which operation produced an engine error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Load,
    Render,
    Search,
    Classify,
}

impl EngineError {
    /// Maps to the caller-facing taxonomy. A missing document is reported
    /// as a failure of whatever operation needed it.
    pub(crate) fn into_pool_error(self, operation: Operation) -> PoolError {
        match self {
            EngineError::Load(detail) => PoolError::Load(detail),
            EngineError::Render(detail) => PoolError::Render(detail),
            EngineError::Search(detail) => PoolError::Search(detail),
            EngineError::Classification(detail) => PoolError::Classification(detail),
            EngineError::Init(detail) => PoolError::Load(detail),
            missing @ EngineError::MissingDocument(_) => {
                let detail = missing.to_string();
                match operation {
                    Operation::Load => PoolError::Load(detail),
                    Operation::Render => PoolError::Render(detail),
                    Operation::Search => PoolError::Search(detail),
                    Operation::Classify => PoolError::Classification(detail),
                }
            }
        }
    }
}

/// One worker's render engine instance
pub trait RenderEngine: Send {
    fn load_document(&mut self, document: DocumentId, bytes: &[u8]) -> Result<DocumentInfo, EngineError>;

    fn unload_document(&mut self, document: DocumentId);

    fn page_info(&mut self, document: DocumentId, page: u32) -> Result<PageInfo, EngineError>;

    /// Rasterizes one tile as RGBA8 into a buffer obtained from `out`.
    fn render_tile(
        &mut self,
        document: DocumentId,
        tile: &TileTarget,
        out: &mut PixelSink<'_>,
    ) -> Result<(), EngineError>;

    /// Rasterizes a whole page at `scale` as RGBA8.
    fn render_full_page(
        &mut self,
        document: DocumentId,
        page: u32,
        scale: f32,
        out: &mut PixelSink<'_>,
    ) -> Result<(), EngineError>;

    fn classify_page(&mut self, document: DocumentId, page: u32) -> Result<PageClassification, EngineError>;

    /// Fast path for scanned pages: the page's embedded raster, as RGBA8.
    fn extract_embedded_image(
        &mut self,
        document: DocumentId,
        page: u32,
        out: &mut PixelSink<'_>,
    ) -> Result<(), EngineError>;

    fn search(&mut self, document: DocumentId, query: &str, limit: usize) -> Result<Vec<SearchHit>, EngineError>;
}

/// Compiled engine module, shared by every worker
pub trait EngineModule: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn instantiate(&self, worker: usize) -> Result<Box<dyn RenderEngine>, EngineError>;
}
