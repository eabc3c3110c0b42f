//! Sources of initial centroid positions.

use crate::error::{ClusterError, Result};

/// Picks pixel indices used to seed the initial centroids.
pub trait PixelSampler {
    /// Return an index in `0..len`. `len` is always at least 1.
    fn sample(&mut self, len: usize) -> Result<usize>;
}

/// Uniform sampling backed by the operating system (or `crypto.getRandomValues`
/// in the browser).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSampler;

impl PixelSampler for OsSampler {
    fn sample(&mut self, len: usize) -> Result<usize> {
        let mut bytes = [0u8; 8];
        getrandom::fill(&mut bytes).map_err(ClusterError::Entropy)?;
        // Modulo bias is below 2^-40 for any realistic image size.
        Ok((u64::from_le_bytes(bytes) % len as u64) as usize)
    }
}

/// Replays a fixed list of indices, wrapping around when exhausted.
///
/// Indices past the end of the image are reduced modulo the pixel count.
#[derive(Debug, Clone)]
pub struct SequenceSampler {
    indices: Vec<usize>,
    pos: usize,
}

impl SequenceSampler {
    pub fn new(indices: impl Into<Vec<usize>>) -> Self {
        Self {
            indices: indices.into(),
            pos: 0,
        }
    }
}

impl PixelSampler for SequenceSampler {
    fn sample(&mut self, len: usize) -> Result<usize> {
        if self.indices.is_empty() {
            return Ok(0);
        }
        let idx = self.indices[self.pos % self.indices.len()];
        self.pos += 1;
        Ok(idx % len)
    }
}

impl<S: PixelSampler + ?Sized> PixelSampler for &mut S {
    fn sample(&mut self, len: usize) -> Result<usize> {
        (**self).sample(len)
    }
}

impl<S: PixelSampler + ?Sized> PixelSampler for Box<S> {
    fn sample(&mut self, len: usize) -> Result<usize> {
        (**self).sample(len)
    }
}
