//! Millisecond stopwatch that also works inside a browser worker, where
//! `std::time::Instant` is unavailable.

#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Stopwatch {
    #[cfg(not(target_arch = "wasm32"))]
    start: Instant,
    #[cfg(target_arch = "wasm32")]
    start_ms: f64,
}

impl Stopwatch {
    #[cfg(not(target_arch = "wasm32"))]
    pub(crate) fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[cfg(target_arch = "wasm32")]
    pub(crate) fn start() -> Self {
        Self {
            start_ms: js_sys::Date::now(),
        }
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub(crate) fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    #[cfg(target_arch = "wasm32")]
    pub(crate) fn elapsed_ms(&self) -> f64 {
        js_sys::Date::now() - self.start_ms
    }
}
