//! Lloyd's k-means over RGBA pixels.
//!
//! Every pixel is a point in 4-dimensional channel space. Centroids are seeded
//! from randomly chosen pixels, then refined for a fixed number of
//! assignment/update rounds. There is no convergence check: the iteration
//! count is the only stopping rule apart from cancellation.

use palette::Srgba;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::{CHANNELS, pixel_at, validate_dimensions};
use crate::cancel::CancellationToken;
use crate::error::{ClusterError, Result};
use crate::sampling::{OsSampler, PixelSampler};

/// One cluster: how many pixels it holds and their mean color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Centroid {
    pub count: usize,
    pub value: [u8; 4],
}

impl Centroid {
    fn seed(value: [u8; 4]) -> Self {
        Self { count: 0, value }
    }

    /// The centroid as an sRGB color with alpha.
    pub fn color(&self) -> Srgba<u8> {
        let [r, g, b, a] = self.value;
        Srgba::new(r, g, b, a)
    }

    /// `RRGGBB` hex string, alpha dropped.
    pub fn hex(&self) -> String {
        let c = self.color();
        format!("{:02X}{:02X}{:02X}", c.red, c.green, c.blue)
    }
}

/// Distance between a pixel and a centroid value.
pub trait ColorMetric {
    fn distance(&self, pixel: [u8; 4], centroid: [u8; 4]) -> u32;
}

/// Sum of squared channel differences, alpha included.
#[derive(Debug, Default, Clone, Copy)]
pub struct SquaredEuclidean;

impl ColorMetric for SquaredEuclidean {
    #[inline(always)]
    fn distance(&self, pixel: [u8; 4], centroid: [u8; 4]) -> u32 {
        pixel
            .iter()
            .zip(centroid.iter())
            .map(|(&p, &c)| {
                let d = p as i32 - c as i32;
                (d * d) as u32
            })
            .sum()
    }
}

impl<M: ColorMetric + ?Sized> ColorMetric for &M {
    fn distance(&self, pixel: [u8; 4], centroid: [u8; 4]) -> u32 {
        (**self).distance(pixel, centroid)
    }
}

/// A configured k-means run.
///
/// The sampler and metric are pluggable so that runs can be made
/// reproducible. Each call to [`KMeans::run`] allocates its own centroid and
/// label storage, so a `KMeans` can be reused after a cancelled run.
#[derive(Debug, Clone)]
pub struct KMeans<S = OsSampler, M = SquaredEuclidean> {
    k: usize,
    iterations: u32,
    sampler: S,
    metric: M,
}

impl KMeans {
    pub fn new(k: usize, iterations: u32) -> Self {
        Self {
            k,
            iterations,
            sampler: OsSampler,
            metric: SquaredEuclidean,
        }
    }
}

impl<S: PixelSampler, M: ColorMetric> KMeans<S, M> {
    pub fn with_sampler<T: PixelSampler>(self, sampler: T) -> KMeans<T, M> {
        KMeans {
            k: self.k,
            iterations: self.iterations,
            sampler,
            metric: self.metric,
        }
    }

    pub fn with_metric<N: ColorMetric>(self, metric: N) -> KMeans<S, N> {
        KMeans {
            k: self.k,
            iterations: self.iterations,
            sampler: self.sampler,
            metric,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Cluster `pixels` (RGBA8, `width * height` pixels).
    ///
    /// Returns `Ok(None)` if `token` is cancelled at any checkpoint: before
    /// seeding, before every iteration, and before every pixel assignment.
    /// Otherwise returns all `k` centroids, sorted by descending count with
    /// ties kept in seeding order.
    pub fn run(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        token: &CancellationToken,
    ) -> Result<Option<Vec<Centroid>>> {
        if self.k == 0 {
            return Err(ClusterError::InvalidK(self.k));
        }
        let n = validate_dimensions(pixels.len(), width, height)?;

        if token.is_cancelled() {
            debug!("k-means cancelled before seeding");
            return Ok(None);
        }

        let mut centroids = Vec::new();
        reserve(&mut centroids, self.k, "centroids")?;
        for _ in 0..self.k {
            let idx = self.sampler.sample(n)?;
            centroids.push(Centroid::seed(pixel_at(pixels, idx)));
        }

        let mut labels = zeroed(n, 0usize, "pixel labels")?;
        let mut scratch = Scratch::new(self.k)?;

        for iteration in 0..self.iterations {
            if token.is_cancelled() {
                debug!(iteration, "k-means cancelled between iterations");
                return Ok(None);
            }

            for (px, label) in pixels.chunks_exact(CHANNELS).zip(labels.iter_mut()) {
                if token.is_cancelled() {
                    debug!(iteration, "k-means cancelled during assignment");
                    return Ok(None);
                }
                *label = nearest(&centroids, [px[0], px[1], px[2], px[3]], &self.metric);
            }

            update(&mut centroids, pixels, &labels, &mut scratch);
        }

        // `sort_by` is stable, so equal counts keep their seeding order.
        centroids.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(Some(centroids))
    }
}

/// Index of the closest centroid; the first one wins on ties.
#[inline(always)]
fn nearest<M: ColorMetric>(centroids: &[Centroid], px: [u8; 4], metric: &M) -> usize {
    let mut best_idx = 0;
    let mut best_dist = u32::MAX;
    for (idx, c) in centroids.iter().enumerate() {
        let d = metric.distance(px, c.value);
        if d < best_dist {
            best_dist = d;
            best_idx = idx;
        }
    }
    best_idx
}

fn reserve<T>(v: &mut Vec<T>, len: usize, what: &'static str) -> Result<()> {
    v.try_reserve_exact(len)
        .map_err(|_| ClusterError::Allocation { what, len })
}

fn zeroed<T: Clone>(len: usize, value: T, what: &'static str) -> Result<Vec<T>> {
    let mut v = Vec::new();
    reserve(&mut v, len, what)?;
    v.resize(len, value);
    Ok(v)
}

/// Per-centroid accumulators, allocated once per run.
struct Scratch {
    sums: Vec<[u64; 4]>,
    counts: Vec<usize>,
}

impl Scratch {
    fn new(k: usize) -> Result<Self> {
        Ok(Self {
            sums: zeroed(k, [0u64; 4], "centroid sums")?,
            counts: zeroed(k, 0usize, "centroid counts")?,
        })
    }
}

/// Recompute every centroid as the rounded mean of its members.
///
/// A centroid with no members keeps its previous value and reports a count
/// of zero.
fn update(centroids: &mut [Centroid], pixels: &[u8], labels: &[usize], scratch: &mut Scratch) {
    let Scratch { sums, counts } = scratch;
    sums.fill([0; 4]);
    counts.fill(0);

    for (px, &label) in pixels.chunks_exact(CHANNELS).zip(labels) {
        let sum = &mut sums[label];
        for ch in 0..CHANNELS {
            sum[ch] += px[ch] as u64;
        }
        counts[label] += 1;
    }

    for ((centroid, sum), &count) in centroids.iter_mut().zip(sums.iter()).zip(counts.iter()) {
        centroid.count = count;
        if count == 0 {
            continue;
        }
        let n = count as f64;
        for ch in 0..CHANNELS {
            centroid.value[ch] = (sum[ch] as f64 / n).round() as u8;
        }
    }
}
