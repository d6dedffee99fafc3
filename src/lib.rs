//! Tiled page rendering: a pool of stateful render workers feeding a
//! scale-quantized multi-tier tile cache.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod pool;
pub mod render;
pub mod strategy;
pub mod types;

pub use cache::{BestTile, Bitmap, CacheConfig, TileCache, TileCoordinate};
pub use config::{ConfigError, PagetileConfig};
pub use coordinator::{CoordinatorStats, RenderCoordinator};
pub use pool::{BalancingPolicy, PoolError, WorkerCount};
pub use render::{EngineModule, RenderEngine, RenderPool};
pub use types::{ContentKind, DocumentId, PageClassification, PageSize};
