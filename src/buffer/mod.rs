//! Pre-allocated pixel buffers handed from render workers to the coordinator
//! without copying

mod pool;
mod region;

pub use pool::{BufferError, BufferLease, BufferPool, BufferPoolConfig, TierConfig, TierStats};
