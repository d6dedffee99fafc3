//! Rendering over the worker pool
//!
//! The pool itself knows nothing about documents or pixels. This module
//! supplies the message schema, the per-worker handler that drives a
//! [`RenderEngine`], and [`RenderPool`], the typed service the coordinator
//! talks to.

pub mod engine;
pub mod pixels;
pub mod protocol;
pub mod service;
pub mod synthetic;

pub use engine::{
    DocumentInfo, EngineError, EngineModule, PageInfo, RenderEngine, SearchHit, TileTarget,
};
pub use pixels::{BYTES_PER_PIXEL, PixelPayload, PixelSink, RenderedPixels};
pub use protocol::{RenderModule, RenderRequest, RenderResponse, RenderWorker};
pub use service::{PendingRender, RenderPool};
pub use synthetic::{SyntheticEngine, SyntheticModule, synthetic_document};
