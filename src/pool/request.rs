//! Request identifiers, pool errors and pending replies

use std::fmt;

use flume::{Receiver, TryRecvError};

use crate::types::DocumentId;

/// Unique identifier for requests dispatched to the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Errors surfaced to callers awaiting a pool request
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("document load failed: {0}")]
    Load(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("page classification failed: {0}")]
    Classification(String),

    /// The worker died while the request was outstanding
    #[error("worker {worker} faulted: {detail}")]
    WorkerFault { worker: usize, detail: String },

    #[error("worker pool has been shut down")]
    PoolTerminated,

    #[error("no live worker has {0} loaded")]
    NoDocumentWorkers(DocumentId),

    #[error("worker {worker} failed to initialize: {detail}")]
    Init { worker: usize, detail: String },

    #[error("unexpected response to {0} request")]
    UnexpectedResponse(&'static str),
}

impl PoolError {
    /// Whether the error was caused by the worker itself rather than the request
    #[must_use]
    pub fn is_worker_fault(&self) -> bool {
        matches!(self, Self::WorkerFault { .. })
    }
}

/// Reply slot for one dispatched request.
///
/// Resolves exactly once: with the worker's response, with the worker's
/// error, or with a fault/termination error if the worker goes away first.
#[derive(Debug)]
pub struct PendingReply<R> {
    id: RequestId,
    worker: usize,
    rx: Receiver<Result<R, PoolError>>,
}

impl<R> PendingReply<R> {
    pub(crate) fn new(id: RequestId, worker: usize, rx: Receiver<Result<R, PoolError>>) -> Self {
        Self { id, worker, rx }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Index of the worker the request was routed to
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Blocks until the request resolves.
    pub fn wait(self) -> Result<R, PoolError> {
        self.rx.recv().unwrap_or(Err(PoolError::PoolTerminated))
    }

    /// Awaits the request from async code.
    pub async fn recv_async(self) -> Result<R, PoolError> {
        self.rx
            .recv_async()
            .await
            .unwrap_or(Err(PoolError::PoolTerminated))
    }

    /// Returns the result if it has already arrived.
    pub fn try_take(&self) -> Option<Result<R, PoolError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(PoolError::PoolTerminated)),
        }
    }
}
