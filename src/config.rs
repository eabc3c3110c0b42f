/// Default number of palette colors.
pub const DEFAULT_K: usize = 8;

/// Default number of assignment/update rounds.
pub const DEFAULT_ITERATIONS: u32 = 20;

/// Parameters for a palette extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Number of centroids to produce (at least 1).
    pub k: usize,
    /// Number of k-means rounds. Zero returns the random seeds unrefined.
    pub iterations: u32,
    /// Downscale decoded images so the longest side equals this many pixels
    /// before clustering. Only applies to the image-decoding entry points.
    pub downscale: Option<u32>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            iterations: DEFAULT_ITERATIONS,
            downscale: None,
        }
    }
}

impl ClusterConfig {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ..Default::default()
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_downscale(mut self, longest_side: Option<u32>) -> Self {
        self.downscale = longest_side;
        self
    }
}
