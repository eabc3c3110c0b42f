use wasm_bindgen::prelude::*;
use image::{GenericImageView, imageops::FilterType};
use js_sys::{Array, Object, Reflect};

use crate::sampling::OsSampler;

pub mod buffer;
pub mod cancel;
pub mod config;
#[cfg(not(target_arch = "wasm32"))]
pub mod coordinator;
pub mod error;
pub mod kmeans;
pub mod protocol;
pub mod sampling;
mod timing;
pub mod worker;

pub use buffer::PixelBuffer;
pub use cancel::CancellationToken;
pub use config::ClusterConfig;
#[cfg(not(target_arch = "wasm32"))]
pub use coordinator::{ClusterCoordinator, Phase, Submission};
pub use error::ClusterError;
pub use kmeans::{Centroid, KMeans};
pub use protocol::{ClusterRequest, ClusterResult, WorkerMessage};
#[cfg(not(target_arch = "wasm32"))]
pub use worker::ClusterWorker;

fn to_js(e: ClusterError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// `RRGGBB` strings for each centroid, in the given order.
pub fn palette_hex(centroids: &[Centroid]) -> Vec<String> {
    centroids.iter().map(Centroid::hex).collect()
}

/// Decode an encoded image to RGBA8, optionally shrinking it so the longest
/// side is at most `downscale` pixels (nearest-neighbour).
pub fn decode_rgba(
    input: &[u8],
    downscale: Option<u32>,
) -> error::Result<(PixelBuffer, u32, u32)> {
    let img = image::load_from_memory(input)?;
    let (orig_w, orig_h) = img.dimensions();

    let rgba = match downscale {
        Some(scale) if scale > 0 && orig_w.max(orig_h) > scale => {
            let max_side = orig_w.max(orig_h) as f32;
            let ratio = scale as f32 / max_side;
            let w = ((orig_w as f32) * ratio).round().max(1.0) as u32;
            let h = ((orig_h as f32) * ratio).round().max(1.0) as u32;
            image::imageops::resize(&img, w, h, FilterType::Nearest)
        }
        _ => img.to_rgba8(),
    };

    let (w, h) = rgba.dimensions();
    Ok((PixelBuffer::from(rgba), w, h))
}

/// Extract the dominant colors of an encoded image (e.g. an album cover).
///
/// Runs inline on the calling thread. The returned object holds `palette`
/// (hex strings) and `counts` (pixels per color), both sorted by count.
#[wasm_bindgen]
pub fn extract_palette(
    input: Vec<u8>,
    n_colors: usize,
    iterations: u32,
    downscale: Option<u32>,
) -> Result<Object, JsValue> {
    let (buffer, width, height) = decode_rgba(&input, downscale).map_err(to_js)?;

    let centroids = KMeans::new(n_colors, iterations)
        .run(buffer.as_bytes(), width, height, &CancellationToken::new())
        .map_err(to_js)?
        .ok_or_else(|| to_js(ClusterError::Cancelled))?;

    let palette_js = Array::new();
    let counts_js = Array::new();
    for c in &centroids {
        palette_js.push(&JsValue::from_str(&c.hex()));
        counts_js.push(&JsValue::from_f64(c.count as f64));
    }

    let result = Object::new();
    Reflect::set(&result, &JsValue::from_str("palette"), &palette_js)?;
    Reflect::set(&result, &JsValue::from_str("counts"), &counts_js)?;

    Ok(result)
}

/// Cluster raw RGBA pixels and return the serialized `worker-result` message,
/// ready to be posted back to the host.
#[wasm_bindgen]
pub fn cluster_rgba(
    data: Vec<u8>,
    width: u32,
    height: u32,
    k: usize,
    iterations: u32,
) -> Result<String, JsValue> {
    let request = ClusterRequest {
        buffer: PixelBuffer::new(data),
        width,
        height,
        k,
        iterations,
    };
    worker::process_run(request, &CancellationToken::new(), &mut OsSampler)
        .to_json()
        .map_err(to_js)
}

/// Decode an image and extract its palette through a background worker.
#[cfg(not(target_arch = "wasm32"))]
pub fn extract_palette_bytes(input: &[u8], config: &ClusterConfig) -> error::Result<Vec<Centroid>> {
    let (buffer, width, height) = decode_rgba(input, config.downscale)?;

    let mut coordinator = ClusterCoordinator::new()?;
    if let Submission::Busy(_) = coordinator.submit(ClusterRequest::new(buffer, width, height, config))? {
        return Err(ClusterError::Worker("coordinator busy".into()));
    }

    let result = coordinator.wait()?.ok_or(ClusterError::Cancelled)?;
    if let Some(e) = result.error {
        return Err(ClusterError::Worker(e));
    }
    result.clusters.ok_or(ClusterError::Cancelled)
}
