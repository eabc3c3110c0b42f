//! Exclusively-owned RGBA pixel storage.

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// Bytes per RGBA pixel.
pub const CHANNELS: usize = 4;

/// A row-major RGBA8 buffer.
///
/// The type is deliberately not `Clone`: handing a buffer to the worker is a
/// move, and the only way to get it back is through the worker's result.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelBuffer(Vec<u8>);

impl PixelBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Number of whole pixels in the buffer.
    pub fn pixel_count(&self) -> usize {
        self.0.len() / CHANNELS
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for PixelBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<image::RgbaImage> for PixelBuffer {
    fn from(img: image::RgbaImage) -> Self {
        Self(img.into_raw())
    }
}

/// Reads the pixel at `index` from a raw RGBA slice.
#[inline(always)]
pub(crate) fn pixel_at(bytes: &[u8], index: usize) -> [u8; 4] {
    let i = index * CHANNELS;
    [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]
}

/// Checks that `len` bytes describe exactly `width * height` RGBA pixels and
/// returns the pixel count.
pub(crate) fn validate_dimensions(len: usize, width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(ClusterError::ZeroDimension);
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(CHANNELS));
    match expected {
        Some(expected) if expected == len => Ok(len / CHANNELS),
        _ => Err(ClusterError::DimensionMismatch { len, width, height }),
    }
}
