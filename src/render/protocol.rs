//! Closed message schema between the render pool and its workers

use std::sync::Arc;

use log::{debug, trace};

use super::engine::{
    DocumentInfo, EngineError, EngineModule, Operation, PageInfo, RenderEngine, SearchHit,
    TileTarget,
};
use super::pixels::{PixelSink, RenderedPixels};
use crate::buffer::BufferPool;
use crate::pool::{HandlerFactory, PoolError, WorkerHandler};
use crate::types::{DocumentId, PageClassification};

/// Requests a render worker understands
#[derive(Debug, Clone)]
pub enum RenderRequest {
    LoadDocument {
        document: DocumentId,
        bytes: Arc<[u8]>,
    },
    UnloadDocument {
        document: DocumentId,
    },
    RenderTile {
        document: DocumentId,
        tile: TileTarget,
    },
    RenderFullPage {
        document: DocumentId,
        page: u32,
        scale: f32,
    },
    ClassifyPage {
        document: DocumentId,
        page: u32,
    },
    ExtractEmbeddedImage {
        document: DocumentId,
        page: u32,
    },
    PageInfo {
        document: DocumentId,
        page: u32,
    },
    Search {
        document: DocumentId,
        query: String,
        limit: usize,
    },
}

impl RenderRequest {
    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RenderRequest::LoadDocument { .. } => "load_document",
            RenderRequest::UnloadDocument { .. } => "unload_document",
            RenderRequest::RenderTile { .. } => "render_tile",
            RenderRequest::RenderFullPage { .. } => "render_full_page",
            RenderRequest::ClassifyPage { .. } => "classify_page",
            RenderRequest::ExtractEmbeddedImage { .. } => "extract_embedded_image",
            RenderRequest::PageInfo { .. } => "page_info",
            RenderRequest::Search { .. } => "search",
        }
    }

    /// The document this request needs loaded on the worker
    #[must_use]
    pub fn document(&self) -> DocumentId {
        match self {
            RenderRequest::LoadDocument { document, .. }
            | RenderRequest::UnloadDocument { document }
            | RenderRequest::RenderTile { document, .. }
            | RenderRequest::RenderFullPage { document, .. }
            | RenderRequest::ClassifyPage { document, .. }
            | RenderRequest::ExtractEmbeddedImage { document, .. }
            | RenderRequest::PageInfo { document, .. }
            | RenderRequest::Search { document, .. } => *document,
        }
    }
}

/// Replies, one variant per request family
#[derive(Debug)]
pub enum RenderResponse {
    Loaded(DocumentInfo),
    Unloaded(DocumentId),
    Pixels(RenderedPixels),
    Classified(PageClassification),
    PageInfo(PageInfo),
    SearchHits(Vec<SearchHit>),
}

impl RenderResponse {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RenderResponse::Loaded(_) => "loaded",
            RenderResponse::Unloaded(_) => "unloaded",
            RenderResponse::Pixels(_) => "pixels",
            RenderResponse::Classified(_) => "classified",
            RenderResponse::PageInfo(_) => "page_info",
            RenderResponse::SearchHits(_) => "search_hits",
        }
    }
}

/// Worker-side handler: owns one engine instance
pub struct RenderWorker {
    index: usize,
    engine: Box<dyn RenderEngine>,
    buffers: BufferPool,
}

impl RenderWorker {
    fn render_into(
        &mut self,
        render: impl FnOnce(&mut dyn RenderEngine, &mut PixelSink<'_>) -> Result<(), EngineError>,
    ) -> Result<RenderResponse, PoolError> {
        let mut sink = PixelSink::new(&self.buffers);
        render(self.engine.as_mut(), &mut sink)
            .map_err(|e| e.into_pool_error(Operation::Render))?;
        let pixels = sink
            .finish()
            .ok_or_else(|| PoolError::Render("engine produced no pixels".to_string()))?;
        trace!(
            "worker {}: {}x{} pixels, shared={}",
            self.index,
            pixels.width,
            pixels.height,
            pixels.is_shared()
        );
        Ok(RenderResponse::Pixels(pixels))
    }
}

impl WorkerHandler for RenderWorker {
    type Request = RenderRequest;
    type Response = RenderResponse;

    fn handle(&mut self, request: RenderRequest) -> Result<RenderResponse, PoolError> {
        match request {
            RenderRequest::LoadDocument { document, bytes } => {
                let info = self
                    .engine
                    .load_document(document, &bytes)
                    .map_err(|e| e.into_pool_error(Operation::Load))?;
                debug!(
                    "worker {}: loaded {document} ({} pages)",
                    self.index, info.page_count
                );
                Ok(RenderResponse::Loaded(info))
            }
            RenderRequest::UnloadDocument { document } => {
                self.engine.unload_document(document);
                Ok(RenderResponse::Unloaded(document))
            }
            RenderRequest::RenderTile { document, tile } => {
                self.render_into(|engine, sink| engine.render_tile(document, &tile, sink))
            }
            RenderRequest::RenderFullPage {
                document,
                page,
                scale,
            } => self.render_into(|engine, sink| {
                engine.render_full_page(document, page, scale, sink)
            }),
            RenderRequest::ExtractEmbeddedImage { document, page } => self
                .render_into(|engine, sink| engine.extract_embedded_image(document, page, sink)),
            RenderRequest::ClassifyPage { document, page } => self
                .engine
                .classify_page(document, page)
                .map(RenderResponse::Classified)
                .map_err(|e| e.into_pool_error(Operation::Classify)),
            RenderRequest::PageInfo { document, page } => self
                .engine
                .page_info(document, page)
                .map(RenderResponse::PageInfo)
                .map_err(|e| e.into_pool_error(Operation::Load)),
            RenderRequest::Search {
                document,
                query,
                limit,
            } => self
                .engine
                .search(document, &query, limit)
                .map(RenderResponse::SearchHits)
                .map_err(|e| e.into_pool_error(Operation::Search)),
        }
    }
}

/// Factory shared by every worker: the compiled engine module plus the
/// buffer pool workers render into
pub struct RenderModule {
    engine: Arc<dyn EngineModule>,
    buffers: BufferPool,
}

impl RenderModule {
    #[must_use]
    pub fn new(engine: Arc<dyn EngineModule>, buffers: BufferPool) -> Self {
        Self { engine, buffers }
    }

    #[must_use]
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }
}

impl HandlerFactory for RenderModule {
    type Handler = RenderWorker;

    fn instantiate(&self, worker: usize) -> Result<RenderWorker, PoolError> {
        let engine = self
            .engine
            .instantiate(worker)
            .map_err(|e| PoolError::Init {
                worker,
                detail: e.to_string(),
            })?;
        debug!("worker {worker}: {} engine instantiated", self.engine.name());
        Ok(RenderWorker {
            index: worker,
            engine,
            buffers: self.buffers.clone(),
        })
    }
}
