//! Cached payloads and the bitmaps materialized from them

use std::io::Cursor;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, GenericImageView, ImageBuffer, ImageEncoder, Rgba};
use serde::{Deserialize, Serialize};

use super::tier::Weighted;
use crate::render::BYTES_PER_PIXEL;
use crate::types::{PageClassification, PageSize};

/// Sizing hint for tiles rendered at one scale and displayed at another
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CssFit {
    pub css_scale_factor: f32,
    pub target_width: u32,
    pub target_height: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TilePayload {
    /// PNG-compressed RGBA8
    Png(Vec<u8>),
    /// Raw RGBA8, row-major, no padding
    Raw(Vec<u8>),
}

/// What the cache stores for one key
#[derive(Clone, Debug, PartialEq)]
pub struct CachedTileData {
    pub payload: TilePayload,
    pub width: u32,
    pub height: u32,
    pub css_fit: Option<CssFit>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("image codec: {0}")]
    Image(#[from] image::ImageError),

    #[error("expected {expected} bytes of pixels, found {actual}")]
    Length { expected: usize, actual: usize },

    #[error("decoded {width}x{height}, recorded {recorded_width}x{recorded_height}")]
    Dimensions {
        width: u32,
        height: u32,
        recorded_width: u32,
        recorded_height: u32,
    },
}

impl CachedTileData {
    /// Stores raw RGBA8 pixels.
    #[must_use]
    pub fn raw(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            payload: TilePayload::Raw(pixels),
            width,
            height,
            css_fit: None,
        }
    }

    /// Compresses RGBA8 pixels to PNG.
    pub fn png(width: u32, height: u32, pixels: &[u8]) -> Result<Self, image::ImageError> {
        let mut encoded = Vec::new();
        PngEncoder::new(Cursor::new(&mut encoded)).write_image(
            pixels,
            width,
            height,
            ExtendedColorType::Rgba8,
        )?;
        Ok(Self {
            payload: TilePayload::Png(encoded),
            width,
            height,
            css_fit: None,
        })
    }

    #[must_use]
    pub fn with_css_fit(mut self, fit: CssFit) -> Self {
        self.css_fit = Some(fit);
        self
    }

    /// Bytes charged against the L2 budget
    #[must_use]
    pub fn byte_size(&self) -> usize {
        match &self.payload {
            TilePayload::Png(data) | TilePayload::Raw(data) => data.len(),
        }
    }

    /// Borrows raw pixels without copying; `None` for PNG or a payload of
    /// the wrong length.
    #[must_use]
    pub fn raw_view(&self) -> Option<PixelView<'_>> {
        match &self.payload {
            TilePayload::Raw(data)
                if data.len() == self.width as usize * self.height as usize * BYTES_PER_PIXEL =>
            {
                Some(PixelView {
                    width: self.width,
                    height: self.height,
                    pixels: data,
                })
            }
            _ => None,
        }
    }

    /// Materializes a fresh, caller-owned bitmap.
    pub fn decode(&self) -> Result<Bitmap, DecodeError> {
        let pixels = match &self.payload {
            TilePayload::Raw(data) => {
                let expected = self.width as usize * self.height as usize * BYTES_PER_PIXEL;
                if data.len() != expected {
                    return Err(DecodeError::Length {
                        expected,
                        actual: data.len(),
                    });
                }
                data.clone()
            }
            TilePayload::Png(data) => {
                let image = image::load_from_memory(data)?.into_rgba8();
                if image.dimensions() != (self.width, self.height) {
                    return Err(DecodeError::Dimensions {
                        width: image.width(),
                        height: image.height(),
                        recorded_width: self.width,
                        recorded_height: self.height,
                    });
                }
                image.into_raw()
            }
        };
        Ok(Bitmap {
            width: self.width,
            height: self.height,
            pixels,
        })
    }
}

impl Weighted for CachedTileData {
    fn weight(&self) -> usize {
        self.byte_size()
    }
}

/// Caller-owned RGBA8 pixels; dropping it never touches the cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Bitmap {
    #[must_use]
    pub fn view(&self) -> PixelView<'_> {
        PixelView {
            width: self.width,
            height: self.height,
            pixels: &self.pixels,
        }
    }

    /// Copies out the sub-rectangle at `(x, y)` of `width` x `height`,
    /// clipped to the bitmap.
    #[must_use]
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Option<Bitmap> {
        self.view().crop(x, y, width, height)
    }
}

/// Borrowed RGBA8 pixels, row-major, no padding
#[derive(Clone, Copy, Debug)]
pub struct PixelView<'a> {
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u8],
}

impl PixelView<'_> {
    /// Copies only the clipped sub-rectangle; the source is never cloned.
    #[must_use]
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Option<Bitmap> {
        let image = ImageBuffer::<Rgba<u8>, &[u8]>::from_raw(self.width, self.height, self.pixels)?;
        let x = x.min(self.width);
        let y = y.min(self.height);
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);
        if width == 0 || height == 0 {
            return None;
        }
        let sub = image::imageops::crop_imm(&image, x, y, width, height);
        let cropped = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_fn(width, height, |px, py| {
            sub.get_pixel(px, py)
        });
        Some(Bitmap {
            width,
            height,
            pixels: cropped.into_raw(),
        })
    }
}

/// Axis-aligned rectangle in pixels, fractional where scales do not divide
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PixelRect {
    #[must_use]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Per-page facts kept for the life of the active document
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page: u32,
    pub size: PageSize,
    pub has_text_layer: bool,
    pub classification: Option<PageClassification>,
}
