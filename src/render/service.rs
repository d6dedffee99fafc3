//! Render pool service: typed calls over the generic worker pool

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use super::engine::{DocumentInfo, EngineModule, PageInfo, SearchHit, TileTarget};
use super::pixels::RenderedPixels;
use super::protocol::{RenderModule, RenderRequest, RenderResponse, RenderWorker};
use crate::buffer::BufferPool;
use crate::pool::{PendingReply, PoolError, PoolOptions, PoolStats, RequestId, WorkerPool};
use crate::types::{DocumentId, PageClassification};

/// A dispatched request whose response is narrowed to one variant
pub struct PendingRender<T> {
    reply: PendingReply<RenderResponse>,
    extract: fn(RenderResponse) -> Result<T, PoolError>,
}

impl<T> PendingRender<T> {
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.reply.id()
    }

    #[must_use]
    pub fn worker(&self) -> usize {
        self.reply.worker()
    }

    /// Blocks until the worker answers.
    pub fn wait(self) -> Result<T, PoolError> {
        self.reply.wait().and_then(self.extract)
    }

    pub async fn recv_async(self) -> Result<T, PoolError> {
        self.reply.recv_async().await.and_then(self.extract)
    }
}

fn pixels(response: RenderResponse) -> Result<RenderedPixels, PoolError> {
    match response {
        RenderResponse::Pixels(pixels) => Ok(pixels),
        other => Err(PoolError::UnexpectedResponse(other.kind())),
    }
}

fn classification(response: RenderResponse) -> Result<PageClassification, PoolError> {
    match response {
        RenderResponse::Classified(classification) => Ok(classification),
        other => Err(PoolError::UnexpectedResponse(other.kind())),
    }
}

fn page_info(response: RenderResponse) -> Result<PageInfo, PoolError> {
    match response {
        RenderResponse::PageInfo(info) => Ok(info),
        other => Err(PoolError::UnexpectedResponse(other.kind())),
    }
}

fn search_hits(response: RenderResponse) -> Result<Vec<SearchHit>, PoolError> {
    match response {
        RenderResponse::SearchHits(hits) => Ok(hits),
        other => Err(PoolError::UnexpectedResponse(other.kind())),
    }
}

fn loaded(response: RenderResponse) -> Result<DocumentInfo, PoolError> {
    match response {
        RenderResponse::Loaded(info) => Ok(info),
        other => Err(PoolError::UnexpectedResponse(other.kind())),
    }
}

/// Pool of render workers plus document bookkeeping.
///
/// Constructed explicitly and owned by the application; any number of
/// independent instances may exist.
pub struct RenderPool {
    pool: WorkerPool<RenderWorker>,
    buffers: BufferPool,
    documents: Mutex<HashMap<DocumentId, DocumentInfo>>,
    next_document: AtomicU64,
}

impl RenderPool {
    /// Starts the workers. `engine` is compiled once by the caller and
    /// shared by every worker.
    pub fn create(
        options: &PoolOptions,
        engine: Arc<dyn EngineModule>,
        buffers: BufferPool,
    ) -> Result<Self, PoolError> {
        let module = Arc::new(RenderModule::new(engine, buffers.clone()));
        let pool = WorkerPool::create(options, module)?;
        Ok(Self::from_pool(pool, buffers))
    }

    /// Starts exactly `workers` workers, bypassing auto-sizing.
    pub fn with_workers(
        workers: usize,
        options: &PoolOptions,
        engine: Arc<dyn EngineModule>,
        buffers: BufferPool,
    ) -> Result<Self, PoolError> {
        let module = Arc::new(RenderModule::new(engine, buffers.clone()));
        let pool = WorkerPool::with_workers(workers, options.balancing, module)?;
        Ok(Self::from_pool(pool, buffers))
    }

    fn from_pool(pool: WorkerPool<RenderWorker>, buffers: BufferPool) -> Self {
        Self {
            pool,
            buffers,
            documents: Mutex::new(HashMap::new()),
            next_document: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn workers(&self) -> &WorkerPool<RenderWorker> {
        &self.pool
    }

    #[must_use]
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Sends a raw request, routed among the workers holding its document.
    pub fn dispatch(&self, request: RenderRequest) -> Result<PendingReply<RenderResponse>, PoolError> {
        let document = request.document();
        self.pool.dispatch_for_document(request, document)
    }

    fn allocate_document(&self) -> DocumentId {
        DocumentId::new(self.next_document.fetch_add(1, Ordering::Relaxed))
    }

    fn remember(&self, info: &DocumentInfo) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.document, info.clone());
    }

    /// Loads a document into one worker, chosen by the balancing policy.
    pub fn load_document(&self, bytes: &[u8]) -> Result<DocumentInfo, PoolError> {
        let document = self.allocate_document();
        let reply = self.pool.dispatch(
            RenderRequest::LoadDocument {
                document,
                bytes: Arc::from(bytes),
            },
            None,
        )?;
        let worker = reply.worker();
        let info = reply.wait().and_then(loaded)?;

        self.pool.mark_document_loaded(worker, document);
        self.remember(&info);
        info!(
            "{document} loaded on worker {worker} ({} pages)",
            info.page_count
        );
        Ok(info)
    }

    /// Loads a document into every live worker for maximum parallelism.
    ///
    /// The payload is snapshotted once before any worker sees it. Workers
    /// that loaded successfully keep the document even if another failed;
    /// the first failure is returned.
    pub fn load_document_on_all_workers(&self, bytes: &[u8]) -> Result<DocumentInfo, PoolError> {
        let document = self.allocate_document();
        let snapshot: Arc<[u8]> = Arc::from(bytes);

        let replies: Vec<_> = self
            .pool
            .live_workers()
            .into_iter()
            .map(|worker| {
                let request = RenderRequest::LoadDocument {
                    document,
                    bytes: Arc::clone(&snapshot),
                };
                (worker, self.pool.dispatch_to(worker, request))
            })
            .collect();
        if replies.is_empty() {
            return Err(PoolError::PoolTerminated);
        }

        let mut first_error = None;
        let mut info = None;
        for (worker, reply) in replies {
            match reply.and_then(|r| r.wait()).and_then(loaded) {
                Ok(loaded) => {
                    self.pool.mark_document_loaded(worker, document);
                    info.get_or_insert(loaded);
                }
                Err(e) => {
                    warn!("{document} failed to load on worker {worker}: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(info) = &info {
            self.remember(info);
        }
        match (first_error, info) {
            (Some(e), _) => Err(e),
            (None, Some(info)) => {
                debug!(
                    "{document} loaded on workers {:?}",
                    self.pool.workers_with_document(document)
                );
                Ok(info)
            }
            (None, None) => Err(PoolError::PoolTerminated),
        }
    }

    /// Drops a document from every worker holding it.
    ///
    /// Affinity bookkeeping is cleared immediately; requests already queued
    /// on a worker still run before the unload. Returns how many workers
    /// were told to unload.
    pub fn unload_document(&self, document: DocumentId) -> usize {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document);

        let holders = self.pool.workers_with_document(document);
        for &worker in &holders {
            self.pool.mark_document_unloaded(worker, document);
            if let Err(e) = self
                .pool
                .dispatch_to(worker, RenderRequest::UnloadDocument { document })
            {
                warn!("unload of {document} on worker {worker} failed: {e}");
            }
        }
        holders.len()
    }

    #[must_use]
    pub fn has_document(&self, document: DocumentId) -> bool {
        !self.pool.workers_with_document(document).is_empty()
    }

    /// Documents still held by at least one live worker, by id
    #[must_use]
    pub fn loaded_documents(&self) -> Vec<DocumentInfo> {
        let mut documents: Vec<DocumentInfo> = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|info| self.has_document(info.document))
            .cloned()
            .collect();
        documents.sort_by_key(|info| info.document);
        documents
    }

    fn send<T>(
        &self,
        request: RenderRequest,
        extract: fn(RenderResponse) -> Result<T, PoolError>,
    ) -> Result<PendingRender<T>, PoolError> {
        Ok(PendingRender {
            reply: self.dispatch(request)?,
            extract,
        })
    }

    pub fn render_tile(
        &self,
        document: DocumentId,
        tile: TileTarget,
    ) -> Result<PendingRender<RenderedPixels>, PoolError> {
        self.send(RenderRequest::RenderTile { document, tile }, pixels)
    }

    pub fn render_full_page(
        &self,
        document: DocumentId,
        page: u32,
        scale: f32,
    ) -> Result<PendingRender<RenderedPixels>, PoolError> {
        self.send(
            RenderRequest::RenderFullPage {
                document,
                page,
                scale,
            },
            pixels,
        )
    }

    pub fn classify_page(
        &self,
        document: DocumentId,
        page: u32,
    ) -> Result<PendingRender<PageClassification>, PoolError> {
        self.send(RenderRequest::ClassifyPage { document, page }, classification)
    }

    pub fn extract_embedded_image(
        &self,
        document: DocumentId,
        page: u32,
    ) -> Result<PendingRender<RenderedPixels>, PoolError> {
        self.send(RenderRequest::ExtractEmbeddedImage { document, page }, pixels)
    }

    pub fn page_info(
        &self,
        document: DocumentId,
        page: u32,
    ) -> Result<PendingRender<PageInfo>, PoolError> {
        self.send(RenderRequest::PageInfo { document, page }, page_info)
    }

    pub fn search(
        &self,
        document: DocumentId,
        query: &str,
        limit: usize,
    ) -> Result<PendingRender<Vec<SearchHit>>, PoolError> {
        self.send(
            RenderRequest::Search {
                document,
                query: query.to_string(),
                limit,
            },
            search_hits,
        )
    }

    /// Renders many tiles of one document.
    ///
    /// Tiles are dealt round-robin across exactly the workers holding the
    /// document and run concurrently. Each tile gets its own result, in
    /// input order; one failure never aborts the rest.
    pub fn render_batch(
        &self,
        document: DocumentId,
        tiles: &[TileTarget],
    ) -> Result<Vec<Result<RenderedPixels, PoolError>>, PoolError> {
        let holders = self.pool.workers_with_document(document);
        if holders.is_empty() {
            return Err(PoolError::NoDocumentWorkers(document));
        }

        let pending: Vec<_> = tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| {
                let worker = holders[i % holders.len()];
                self.pool.dispatch_to(
                    worker,
                    RenderRequest::RenderTile {
                        document,
                        tile: *tile,
                    },
                )
            })
            .collect();
        debug!(
            "batch of {} tiles for {document} across workers {holders:?}",
            tiles.len()
        );

        Ok(pending
            .into_iter()
            .map(|reply| reply.and_then(|r| r.wait()).and_then(pixels))
            .collect())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stops every worker; outstanding requests fail with
    /// [`PoolError::PoolTerminated`].
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BalancingPolicy;
    use crate::render::synthetic::{SyntheticModule, synthetic_document};

    fn render_pool(workers: usize) -> RenderPool {
        RenderPool::with_workers(
            workers,
            &PoolOptions::default(),
            Arc::new(SyntheticModule::default()),
            BufferPool::disabled(),
        )
        .expect("pool")
    }

    fn tile(page: u32, x: u32, y: u32) -> TileTarget {
        TileTarget {
            page,
            tile_x: x,
            tile_y: y,
            scale: 2.0,
            tile_size: 256,
        }
    }

    #[test]
    fn load_and_render() {
        let pool = render_pool(2);
        let info = pool.load_document(&synthetic_document(5)).expect("load");
        assert_eq!(info.page_count, 5);
        assert!(pool.has_document(info.document));

        let pixels = pool
            .render_tile(info.document, tile(1, 0, 0))
            .expect("dispatch")
            .wait()
            .expect("render");
        assert_eq!((pixels.width, pixels.height), (256, 256));
        assert_eq!(pixels.bytes().len(), 256 * 256 * 4);
    }

    #[test]
    fn load_failure_is_reported() {
        let pool = render_pool(1);
        assert!(matches!(
            pool.load_document(b"not a document"),
            Err(PoolError::Load(_))
        ));
        assert!(pool.loaded_documents().is_empty());
    }

    #[test]
    fn unknown_document_has_no_workers() {
        let pool = render_pool(1);
        let doc = DocumentId::new(77);
        assert!(matches!(
            pool.render_tile(doc, tile(0, 0, 0)),
            Err(PoolError::NoDocumentWorkers(d)) if d == doc
        ));
        assert!(matches!(
            pool.render_batch(doc, &[tile(0, 0, 0)]),
            Err(PoolError::NoDocumentWorkers(_))
        ));
    }

    #[test]
    fn unload_clears_affinity() {
        let pool = render_pool(2);
        let info = pool
            .load_document_on_all_workers(&synthetic_document(3))
            .expect("load");
        assert_eq!(pool.workers().workers_with_document(info.document), vec![0, 1]);

        assert_eq!(pool.unload_document(info.document), 2);
        assert!(!pool.has_document(info.document));
        assert!(pool.loaded_documents().is_empty());
    }

    #[test]
    fn typed_calls() {
        let pool = render_pool(1);
        let doc = pool.load_document(&synthetic_document(4)).expect("load").document;

        let info = pool.page_info(doc, 1).expect("dispatch").wait().expect("info");
        assert!(info.has_text_layer);
        let class = pool.classify_page(doc, 0).expect("dispatch").wait().expect("class");
        assert!(class.allows_image_extraction());
        let hits = pool.search(doc, "page 2", 5).expect("dispatch").wait().expect("hits");
        assert_eq!(hits.len(), 1);
        assert!(matches!(
            pool.search(doc, " ", 5).expect("dispatch").wait(),
            Err(PoolError::Search(_))
        ));
    }

    #[test]
    fn round_robin_policy_is_honored() {
        let pool = RenderPool::with_workers(
            2,
            &PoolOptions {
                balancing: BalancingPolicy::RoundRobin,
                ..PoolOptions::default()
            },
            Arc::new(SyntheticModule::default()),
            BufferPool::disabled(),
        )
        .expect("pool");
        assert_eq!(pool.workers().policy(), BalancingPolicy::RoundRobin);
    }
}
