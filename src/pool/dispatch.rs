//! The worker pool: startup, routing, response correlation and shutdown

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use flume::{Receiver, Sender};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::balance::{self, BalancingPolicy, Candidate};
use super::request::{PendingReply, PoolError, RequestId};
use super::sizing::{HostCapabilities, WorkerCount};
use super::worker::{
    HandlerFactory, PendingEntry, WorkerEvent, WorkerHandler, WorkerMessage, WorkerState,
    WorkerStats, WorkerStatus, run_worker,
};
use crate::types::DocumentId;

/// Pool construction options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub workers: WorkerCount,
    pub balancing: BalancingPolicy,
}

/// Telemetry snapshot of the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub policy: BalancingPolicy,
    pub terminated: bool,
    pub workers: Vec<WorkerStats>,
}

impl PoolStats {
    /// Fraction of live workers with at least one pending request
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let live: Vec<_> = self
            .workers
            .iter()
            .filter(|w| w.status != WorkerStatus::Terminated)
            .collect();
        if live.is_empty() {
            return 0.0;
        }
        live.iter().filter(|w| w.pending > 0).count() as f64 / live.len() as f64
    }
}

type Slots<Resp> = Arc<Vec<Mutex<WorkerState<Resp>>>>;

/// Pool of stateful workers, generic over the message schema.
///
/// Each worker runs on its own thread and sees only its own request queue,
/// so requests routed to the same worker are handled in dispatch order.
/// Replies from all workers flow through one router thread, which completes
/// the matching pending entry by request id.
pub struct WorkerPool<H: WorkerHandler> {
    slots: Slots<H::Response>,
    senders: Vec<Sender<WorkerMessage<H::Request>>>,
    events: Sender<WorkerEvent<H::Response>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    policy: BalancingPolicy,
    next_request_id: AtomicU64,
    rotation: AtomicUsize,
    terminated: AtomicBool,
}

impl<H: WorkerHandler> WorkerPool<H> {
    /// Starts the pool and waits until every worker reports ready.
    ///
    /// All workers are spawned before any readiness is awaited, so startup
    /// cost does not grow with the worker count. `factory` is built once by
    /// the caller and shared by every worker.
    pub fn create<F>(options: &PoolOptions, factory: Arc<F>) -> Result<Self, PoolError>
    where
        F: HandlerFactory<Handler = H>,
    {
        let count = options.workers.resolve(&HostCapabilities::detect());
        Self::with_workers(count, options.balancing, factory)
    }

    /// Starts a pool with exactly `count` workers.
    pub fn with_workers<F>(
        count: usize,
        policy: BalancingPolicy,
        factory: Arc<F>,
    ) -> Result<Self, PoolError>
    where
        F: HandlerFactory<Handler = H>,
    {
        let count = count.max(1);
        let started = Instant::now();

        let slots: Slots<H::Response> =
            Arc::new((0..count).map(|i| Mutex::new(WorkerState::new(i))).collect());
        let (events_tx, events_rx) = flume::unbounded();
        let (ready_tx, ready_rx) = flume::bounded(count);

        let mut senders = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = flume::unbounded();
            let factory = Arc::clone(&factory);
            let events = events_tx.clone();
            let ready = ready_tx.clone();

            let handle = thread::Builder::new()
                .name(format!("render-worker-{index}"))
                .spawn(move || run_worker(index, factory, rx, events, ready))
                .map_err(|e| PoolError::Init {
                    worker: index,
                    detail: e.to_string(),
                })?;

            senders.push(tx);
            threads.push(handle);
        }
        drop(ready_tx);

        let router = {
            let slots = Arc::clone(&slots);
            thread::Builder::new()
                .name("render-router".to_string())
                .spawn(move || route_events(&slots, &events_rx))
                .map_err(|e| PoolError::Init {
                    worker: count,
                    detail: e.to_string(),
                })?
        };

        let pool = Self {
            slots,
            senders,
            events: events_tx,
            threads: Mutex::new(threads),
            router: Mutex::new(Some(router)),
            policy,
            next_request_id: AtomicU64::new(1),
            rotation: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        };

        pool.await_ready(count, &ready_rx)?;

        info!(
            "worker pool ready: {count} workers, policy={}, startup {:.1}ms",
            policy.as_str(),
            started.elapsed().as_secs_f64() * 1000.0
        );

        Ok(pool)
    }

    fn await_ready(
        &self,
        count: usize,
        ready: &Receiver<(usize, Result<(), PoolError>)>,
    ) -> Result<(), PoolError> {
        for _ in 0..count {
            let Ok((index, outcome)) = ready.recv() else {
                self.shutdown();
                return Err(PoolError::Init {
                    worker: count,
                    detail: "worker exited before reporting readiness".to_string(),
                });
            };

            if let Err(e) = outcome {
                error!("worker {index} failed to start: {e}");
                self.shutdown();
                return Err(e);
            }

            self.lock(index).ready = true;
            debug!("worker {index} ready");
        }
        Ok(())
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, WorkerState<H::Response>> {
        self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of pool members, live or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn policy(&self) -> BalancingPolicy {
        self.policy
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Indices of workers that can still accept requests
    #[must_use]
    pub fn live_workers(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.lock(i).is_live())
            .collect()
    }

    /// Routes `request` by the configured policy.
    ///
    /// `affinity` names the document the request needs; it only matters to
    /// the document-affinity policy.
    pub fn dispatch(
        &self,
        request: H::Request,
        affinity: Option<DocumentId>,
    ) -> Result<PendingReply<H::Response>, PoolError> {
        if self.is_terminated() {
            return Err(PoolError::PoolTerminated);
        }

        let candidates = self.candidates(affinity, false);
        let rotation = self.rotation.fetch_add(1, Ordering::Relaxed);
        let Some(worker) = balance::select(self.policy, &candidates, rotation) else {
            return Err(PoolError::PoolTerminated);
        };

        self.dispatch_to(worker, request)
    }

    /// Routes `request` among the live workers holding `document` only.
    ///
    /// The configured policy still picks between holders. Fails with
    /// [`PoolError::NoDocumentWorkers`] when no live worker has it loaded.
    pub fn dispatch_for_document(
        &self,
        request: H::Request,
        document: DocumentId,
    ) -> Result<PendingReply<H::Response>, PoolError> {
        if self.is_terminated() {
            return Err(PoolError::PoolTerminated);
        }

        let candidates = self.candidates(Some(document), true);
        let rotation = self.rotation.fetch_add(1, Ordering::Relaxed);
        let Some(worker) = balance::select(self.policy, &candidates, rotation) else {
            return Err(PoolError::NoDocumentWorkers(document));
        };

        self.dispatch_to(worker, request)
    }

    fn candidates(&self, affinity: Option<DocumentId>, holders_only: bool) -> Vec<Candidate> {
        (0..self.slots.len())
            .filter_map(|index| {
                let state = self.lock(index);
                let has_document = affinity.is_some_and(|doc| state.documents.contains(&doc));
                (state.is_live() && (has_document || !holders_only)).then(|| Candidate {
                    index,
                    pending: state.pending.len(),
                    has_document,
                })
            })
            .collect()
    }

    /// Sends `request` to a specific worker.
    pub fn dispatch_to(
        &self,
        worker: usize,
        request: H::Request,
    ) -> Result<PendingReply<H::Response>, PoolError> {
        if self.is_terminated() {
            return Err(PoolError::PoolTerminated);
        }
        if worker >= self.slots.len() {
            return Err(PoolError::WorkerFault {
                worker,
                detail: "no such worker".to_string(),
            });
        }

        let mut state = self.lock(worker);
        if !state.is_live() {
            return Err(PoolError::WorkerFault {
                worker,
                detail: "worker is terminated".to_string(),
            });
        }

        let id = RequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (reply_tx, reply_rx) = flume::bounded(1);
        state.pending.insert(
            id,
            PendingEntry {
                reply: reply_tx,
                dispatched_at: Instant::now(),
            },
        );
        state.total_requests += 1;

        // Sent while holding the slot lock so the router cannot observe the
        // reply before the pending entry exists.
        if self.senders[worker]
            .send(WorkerMessage::Request { id, request })
            .is_err()
        {
            state.pending.remove(&id);
            let fault = PoolError::WorkerFault {
                worker,
                detail: "worker channel closed".to_string(),
            };
            state.terminate(&fault);
            return Err(fault);
        }

        log::trace!("dispatched {id} to worker {worker}");
        Ok(PendingReply::new(id, worker, reply_rx))
    }

    /// Records that `worker` now holds `document`.
    pub fn mark_document_loaded(&self, worker: usize, document: DocumentId) {
        if let Some(slot) = self.slots.get(worker) {
            let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_live() {
                state.documents.insert(document);
            }
        }
    }

    /// Forgets that `worker` holds `document`.
    pub fn mark_document_unloaded(&self, worker: usize, document: DocumentId) {
        if let Some(slot) = self.slots.get(worker) {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .documents
                .remove(&document);
        }
    }

    /// Live workers that have `document` loaded, in index order
    #[must_use]
    pub fn workers_with_document(&self, document: DocumentId) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| {
                let state = self.lock(i);
                state.is_live() && state.documents.contains(&document)
            })
            .collect()
    }

    /// Total outstanding requests across the pool
    #[must_use]
    pub fn pending_count(&self) -> usize {
        (0..self.slots.len()).map(|i| self.lock(i).pending.len()).sum()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            policy: self.policy,
            terminated: self.is_terminated(),
            workers: (0..self.slots.len()).map(|i| self.lock(i).stats()).collect(),
        }
    }

    /// Stops every worker and rejects all outstanding requests with
    /// [`PoolError::PoolTerminated`]. Idempotent.
    pub fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut rejected = 0;
        for index in 0..self.slots.len() {
            rejected += self.lock(index).terminate(&PoolError::PoolTerminated);
        }

        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Shutdown);
        }

        let threads = std::mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in threads {
            if handle.join().is_err() {
                warn!("worker thread exited with a panic");
            }
        }

        let _ = self.events.send(WorkerEvent::Stop);
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(router) = router {
            if router.join().is_err() {
                warn!("router thread exited with a panic");
            }
        }

        info!("worker pool shut down, {rejected} pending requests rejected");
    }
}

impl<H: WorkerHandler> Drop for WorkerPool<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn route_events<Resp>(
    slots: &[Mutex<WorkerState<Resp>>],
    events: &Receiver<WorkerEvent<Resp>>,
) {
    for event in events.iter() {
        match event {
            WorkerEvent::Reply { worker, id, result } => {
                if let Some(slot) = slots.get(worker) {
                    slot.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .resolve(id, result);
                }
            }
            WorkerEvent::Fault { worker, detail } => {
                if let Some(slot) = slots.get(worker) {
                    let fault = PoolError::WorkerFault {
                        worker,
                        detail: detail.clone(),
                    };
                    let rejected = slot
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .terminate(&fault);
                    warn!("worker {worker} terminated ({detail}), {rejected} pending requests rejected");
                }
            }
            WorkerEvent::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Echoes numbers back; `u32::MAX` panics, a value in `block` waits on the gate
    struct Echo {
        gate: Option<Receiver<()>>,
    }

    impl WorkerHandler for Echo {
        type Request = u32;
        type Response = u32;

        fn handle(&mut self, request: u32) -> Result<u32, PoolError> {
            match request {
                u32::MAX => panic!("echo crash"),
                0 => Err(PoolError::Render("zero".into())),
                1000 => {
                    if let Some(gate) = &self.gate {
                        let _ = gate.recv_timeout(Duration::from_secs(5));
                    }
                    Ok(request)
                }
                n => Ok(n * 2),
            }
        }
    }

    struct EchoFactory {
        gate: Option<Receiver<()>>,
        fail_worker: Option<usize>,
    }

    impl HandlerFactory for EchoFactory {
        type Handler = Echo;

        fn instantiate(&self, worker: usize) -> Result<Echo, PoolError> {
            if self.fail_worker == Some(worker) {
                return Err(PoolError::Init {
                    worker,
                    detail: "refused".into(),
                });
            }
            Ok(Echo {
                gate: self.gate.clone(),
            })
        }
    }

    fn pool(count: usize, policy: BalancingPolicy) -> WorkerPool<Echo> {
        WorkerPool::with_workers(
            count,
            policy,
            Arc::new(EchoFactory {
                gate: None,
                fail_worker: None,
            }),
        )
        .expect("pool starts")
    }

    #[test]
    fn round_trip() {
        let pool = pool(2, BalancingPolicy::LeastLoaded);
        let reply = pool.dispatch(21, None).expect("dispatch");
        assert_eq!(reply.wait(), Ok(42));
    }

    #[test]
    fn handler_errors_reach_only_their_caller() {
        let pool = pool(1, BalancingPolicy::LeastLoaded);
        let bad = pool.dispatch(0, None).expect("dispatch");
        let good = pool.dispatch(5, None).expect("dispatch");
        assert_eq!(bad.wait(), Err(PoolError::Render("zero".into())));
        assert_eq!(good.wait(), Ok(10));
    }

    #[test]
    fn request_ids_are_unique() {
        let pool = pool(3, BalancingPolicy::RoundRobin);
        let replies: Vec<_> = (1..=9)
            .map(|n| pool.dispatch(n, None).expect("dispatch"))
            .collect();
        let mut ids: Vec<_> = replies.iter().map(PendingReply::id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 9);

        let workers: Vec<_> = replies.iter().map(PendingReply::worker).collect();
        assert_eq!(&workers[..3], &[0, 1, 2]);

        for (n, reply) in (1..=9).zip(replies) {
            assert_eq!(reply.wait(), Ok(n * 2));
        }
    }

    #[test]
    fn crash_is_contained_to_one_worker() {
        let (gate_tx, gate_rx) = flume::unbounded();
        let pool = WorkerPool::with_workers(
            2,
            BalancingPolicy::LeastLoaded,
            Arc::new(EchoFactory {
                gate: Some(gate_rx),
                fail_worker: None,
            }),
        )
        .expect("pool starts");

        // Hold worker 0 busy, then queue a crash behind the hold
        let held = pool.dispatch_to(0, 1000).expect("dispatch");
        let crash = pool.dispatch_to(0, u32::MAX).expect("dispatch");
        let queued = pool.dispatch_to(0, 3).expect("dispatch");
        let other = pool.dispatch_to(1, 4).expect("dispatch");

        gate_tx.send(()).expect("open gate");
        assert_eq!(held.wait(), Ok(1000));
        assert!(crash.wait().is_err_and(|e| e.is_worker_fault()));
        assert!(queued.wait().is_err_and(|e| e.is_worker_fault()));
        assert_eq!(other.wait(), Ok(8));

        assert_eq!(pool.live_workers(), vec![1]);
        assert_eq!(pool.dispatch(6, None).expect("dispatch").wait(), Ok(12));
        assert!(pool.dispatch_to(0, 6).is_err());
    }

    #[test]
    fn failed_startup_reports_init_error() {
        let result = WorkerPool::with_workers(
            3,
            BalancingPolicy::LeastLoaded,
            Arc::new(EchoFactory {
                gate: None,
                fail_worker: Some(1),
            }),
        );
        assert!(matches!(result, Err(PoolError::Init { worker: 1, .. })));
    }

    #[test]
    fn shutdown_rejects_pending_and_new_requests() {
        let (gate_tx, gate_rx) = flume::unbounded();
        let pool = WorkerPool::with_workers(
            1,
            BalancingPolicy::LeastLoaded,
            Arc::new(EchoFactory {
                gate: Some(gate_rx),
                fail_worker: None,
            }),
        )
        .expect("pool starts");

        let held = pool.dispatch(1000, None).expect("dispatch");
        let queued = pool.dispatch(2, None).expect("dispatch");

        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let _ = gate_tx.send(());
        });
        pool.shutdown();
        opener.join().expect("opener");

        assert_eq!(held.wait(), Err(PoolError::PoolTerminated));
        assert_eq!(queued.wait(), Err(PoolError::PoolTerminated));
        assert!(matches!(
            pool.dispatch(1, None),
            Err(PoolError::PoolTerminated)
        ));
        assert!(pool.stats().terminated);
    }

    #[test]
    fn document_bookkeeping() {
        let pool = pool(3, BalancingPolicy::DocumentAffinity);
        let doc = DocumentId::new(9);
        pool.mark_document_loaded(2, doc);
        assert_eq!(pool.workers_with_document(doc), vec![2]);

        for _ in 0..5 {
            let reply = pool.dispatch(1, Some(doc)).expect("dispatch");
            assert_eq!(reply.worker(), 2);
            reply.wait().expect("reply");
        }

        pool.mark_document_unloaded(2, doc);
        assert!(pool.workers_with_document(doc).is_empty());
    }

    #[test]
    fn document_dispatch_stays_on_holders() {
        let pool = pool(3, BalancingPolicy::RoundRobin);
        let doc = DocumentId::new(1);
        assert_eq!(
            pool.dispatch_for_document(1, doc).map(|r| r.worker()),
            Err(PoolError::NoDocumentWorkers(doc))
        );

        pool.mark_document_loaded(0, doc);
        pool.mark_document_loaded(2, doc);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let reply = pool.dispatch_for_document(1, doc).expect("dispatch");
                let worker = reply.worker();
                reply.wait().expect("reply");
                worker
            })
            .collect();
        assert!(workers.iter().all(|w| *w != 1));
        assert!(workers.contains(&0) && workers.contains(&2));
    }
}
