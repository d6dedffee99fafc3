//! Pool of stateful render workers with request/response correlation
//!
//! Workers communicate with the coordinator only through messages. Every
//! dispatched request gets a [`RequestId`] and a pending entry on the worker
//! it was routed to; the entry resolves when the matching reply arrives, or
//! is rejected if the worker dies or the pool shuts down.

mod balance;
mod dispatch;
mod request;
mod sizing;
mod worker;

pub use balance::BalancingPolicy;
pub use dispatch::{PoolOptions, PoolStats, WorkerPool};
pub use request::{PendingReply, PoolError, RequestId};
pub use sizing::{HostCapabilities, MAX_WORKERS, WorkerCount};
pub use worker::{HandlerFactory, WorkerHandler, WorkerStats, WorkerStatus};
