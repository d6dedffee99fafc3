//! Pixel output from a render engine
//!
//! Engines never allocate their own output. They ask a [`PixelSink`] for a
//! buffer of the right size, which hands out a buffer-pool slot when one is
//! free (zero-copy) and an owned vector otherwise.

use log::trace;

use crate::buffer::{BufferLease, BufferPool};

/// Bytes per RGBA8 pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Where rendered pixels live
#[derive(Debug)]
pub enum PixelPayload {
    /// Written in place into a buffer-pool slot
    Shared(BufferLease),
    /// Copying fallback when no slot was free
    Owned(Vec<u8>),
}

/// RGBA8 pixels produced by one render call
#[derive(Debug)]
pub struct RenderedPixels {
    pub width: u32,
    pub height: u32,
    pub payload: PixelPayload,
}

impl RenderedPixels {
    #[must_use]
    pub fn owned(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            payload: PixelPayload::Owned(data),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match &self.payload {
            PixelPayload::Shared(lease) => lease.data(),
            PixelPayload::Owned(data) => data,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.payload {
            PixelPayload::Shared(lease) => lease.as_mut_slice(),
            PixelPayload::Owned(data) => data,
        }
    }

    /// Whether the pixels sit in a pool slot rather than a private vector
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self.payload, PixelPayload::Shared(_))
    }

    /// Takes the pixels as an owned vector, releasing any pool slot.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        match self.payload {
            PixelPayload::Shared(lease) => lease.data().to_vec(),
            PixelPayload::Owned(data) => data,
        }
    }
}

/// Output target handed to an engine for one render call
pub struct PixelSink<'a> {
    buffers: &'a BufferPool,
    output: Option<RenderedPixels>,
}

impl<'a> PixelSink<'a> {
    #[must_use]
    pub fn new(buffers: &'a BufferPool) -> Self {
        Self {
            buffers,
            output: None,
        }
    }

    /// Returns a zeroed-or-stale RGBA8 buffer of `width * height` pixels for
    /// the engine to fill. Calling it again replaces the previous buffer.
    pub fn allocate(&mut self, width: u32, height: u32) -> &mut [u8] {
        let len = width as usize * height as usize * BYTES_PER_PIXEL;

        let payload = match self.buffers.acquire(len) {
            Some(mut lease) => match lease.writable(len) {
                Ok(_) => PixelPayload::Shared(lease),
                Err(_) => PixelPayload::Owned(vec![0; len]),
            },
            None => {
                trace!("no buffer slot for {width}x{height}, rendering into owned memory");
                PixelPayload::Owned(vec![0; len])
            }
        };

        self.output
            .insert(RenderedPixels {
                width,
                height,
                payload,
            })
            .bytes_mut()
    }

    /// Stores pixels the engine already has in hand.
    pub fn put(&mut self, width: u32, height: u32, data: &[u8]) {
        self.allocate(width, height).copy_from_slice(data);
    }

    pub(crate) fn finish(self) -> Option<RenderedPixels> {
        self.output
    }
}
