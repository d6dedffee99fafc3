//! Core types shared by the worker pool and the tile cache

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque handle of a document loaded into one or more render workers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub u64);

impl DocumentId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc{}", self.0)
    }
}

/// What kind of content dominates a page
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Mostly vector text
    Text,
    /// Vector drawings and text mixed
    Vector,
    /// A single embedded raster image covering the page (scanned documents)
    Scanned,
    /// Mixed raster and vector content
    Mixed,
}

/// Page classification used to pick rendering fast paths
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageClassification {
    pub kind: ContentKind,
    /// Classifier confidence in `[0, 1]`
    pub confidence: f32,
    /// Whether the page has transparent regions
    pub has_transparency: bool,
    /// Milliseconds since the Unix epoch when the page was classified
    pub classified_at_ms: u64,
}

impl PageClassification {
    /// Minimum confidence before a scanned page skips rasterization
    pub const SCANNED_FAST_PATH_CONFIDENCE: f32 = 0.8;

    /// Whether the embedded image can be extracted instead of rendering
    #[must_use]
    pub fn allows_image_extraction(&self) -> bool {
        self.kind == ContentKind::Scanned
            && self.confidence >= Self::SCANNED_FAST_PATH_CONFIDENCE
            && !self.has_transparency
    }
}

/// Page dimensions in PDF points
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    #[must_use]
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// Pixel dimensions of the page rendered at `scale`
    #[must_use]
    pub fn pixels_at(&self, scale: f32) -> (u32, u32) {
        (
            (self.width * scale).ceil().max(1.0) as u32,
            (self.height * scale).ceil().max(1.0) as u32,
        )
    }
}
