//! Worker execution contexts - one dedicated thread per pool member

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use flume::{Receiver, Sender};
use log::{debug, info, warn};
use serde::Serialize;

use super::request::{PoolError, RequestId};
use crate::types::DocumentId;

/// The per-worker half of a pool protocol.
///
/// One handler lives on each worker thread and owns that worker's engine
/// state (loaded documents, caches). It sees requests in dequeue order.
pub trait WorkerHandler: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn handle(&mut self, request: Self::Request) -> Result<Self::Response, PoolError>;
}

/// Shared, once-built module every worker instantiates its handler from
pub trait HandlerFactory: Send + Sync + 'static {
    type Handler: WorkerHandler;

    fn instantiate(&self, worker: usize) -> Result<Self::Handler, PoolError>;
}

/// Messages sent from the coordinator to a worker
pub(crate) enum WorkerMessage<Req> {
    Request { id: RequestId, request: Req },
    Shutdown,
}

/// Messages sent from workers to the response router
pub(crate) enum WorkerEvent<Resp> {
    Reply {
        worker: usize,
        id: RequestId,
        result: Result<Resp, PoolError>,
    },
    Fault {
        worker: usize,
        detail: String,
    },
    Stop,
}

/// Lifecycle of a pool member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Idle,
    Busy,
    /// Final; entered on fault or pool shutdown
    Terminated,
}

pub(crate) struct PendingEntry<Resp> {
    pub reply: Sender<Result<Resp, PoolError>>,
    pub dispatched_at: Instant,
}

/// Coordinator-side bookkeeping for one worker
pub(crate) struct WorkerState<Resp> {
    pub index: usize,
    pub ready: bool,
    pub terminated: bool,
    pub total_requests: u64,
    pub documents: HashSet<DocumentId>,
    pub pending: HashMap<RequestId, PendingEntry<Resp>>,
    latency_total_us: u64,
    latency_samples: u64,
}

impl<Resp> WorkerState<Resp> {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ready: false,
            terminated: false,
            total_requests: 0,
            documents: HashSet::new(),
            pending: HashMap::new(),
            latency_total_us: 0,
            latency_samples: 0,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        if self.terminated {
            WorkerStatus::Terminated
        } else if !self.ready {
            WorkerStatus::Initializing
        } else if self.pending.is_empty() {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        }
    }

    pub fn is_live(&self) -> bool {
        self.ready && !self.terminated
    }

    /// Completes a pending request. Replies for unknown ids (already
    /// rejected by shutdown) are dropped.
    pub fn resolve(&mut self, id: RequestId, result: Result<Resp, PoolError>) {
        let Some(entry) = self.pending.remove(&id) else {
            debug!("worker {}: dropping reply for unknown {id}", self.index);
            return;
        };

        let elapsed = entry.dispatched_at.elapsed();
        self.latency_total_us += elapsed.as_micros() as u64;
        self.latency_samples += 1;
        log::trace!(
            "worker {}: {id} completed in {:.2}ms",
            self.index,
            elapsed.as_secs_f64() * 1000.0
        );

        // The caller may have dropped its reply handle; that is fine.
        let _ = entry.reply.send(result);
    }

    /// Marks the worker terminated and rejects every pending request.
    pub fn terminate(&mut self, error: &PoolError) -> usize {
        self.terminated = true;
        self.documents.clear();
        let rejected = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry.reply.send(Err(error.clone()));
        }
        rejected
    }

    pub fn stats(&self) -> WorkerStats {
        let mut documents: Vec<DocumentId> = self.documents.iter().copied().collect();
        documents.sort();
        WorkerStats {
            index: self.index,
            status: self.status(),
            pending: self.pending.len(),
            total_requests: self.total_requests,
            documents,
            mean_latency_us: if self.latency_samples == 0 {
                None
            } else {
                Some(self.latency_total_us / self.latency_samples)
            },
        }
    }
}

/// Telemetry snapshot of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub index: usize,
    pub status: WorkerStatus,
    pub pending: usize,
    pub total_requests: u64,
    pub documents: Vec<DocumentId>,
    pub mean_latency_us: Option<u64>,
}

/// Main worker function - runs in a dedicated thread
#[expect(
    clippy::needless_pass_by_value,
    reason = "Values moved into thread, need ownership"
)]
pub(crate) fn run_worker<F: HandlerFactory>(
    index: usize,
    factory: Arc<F>,
    requests: Receiver<WorkerMessage<<F::Handler as WorkerHandler>::Request>>,
    events: Sender<WorkerEvent<<F::Handler as WorkerHandler>::Response>>,
    ready: Sender<(usize, Result<(), PoolError>)>,
) {
    let instantiated = panic::catch_unwind(AssertUnwindSafe(|| factory.instantiate(index)))
        .unwrap_or_else(|payload| {
            Err(PoolError::Init {
                worker: index,
                detail: panic_message(payload.as_ref()),
            })
        });

    let mut handler = match instantiated {
        Ok(handler) => {
            let _ = ready.send((index, Ok(())));
            handler
        }
        Err(e) => {
            let _ = ready.send((index, Err(e)));
            return;
        }
    };
    drop(ready);

    for message in requests {
        match message {
            WorkerMessage::Request { id, request } => {
                match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
                    Ok(result) => {
                        let _ = events.send(WorkerEvent::Reply {
                            worker: index,
                            id,
                            result,
                        });
                    }
                    Err(payload) => {
                        let detail = panic_message(payload.as_ref());
                        warn!("worker {index} crashed while handling {id}: {detail}");
                        let _ = events.send(WorkerEvent::Fault {
                            worker: index,
                            detail,
                        });
                        return;
                    }
                }
            }
            WorkerMessage::Shutdown => break,
        }
    }

    info!("worker {index} stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
