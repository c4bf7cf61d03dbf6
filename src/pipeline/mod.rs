//! Primary pipeline stages.
//!
//! Each submodule implements one transformation step and can be tested on
//! its own.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ encode ──▶ compress ──▶ decode ──▶ postprocess
//! (pdfium)  (tensor)   (ratio)      (prompt)   (cleanup)
//! ```
//!
//! 1. [`render`]   rasterise pages lazily; pdfium runs in `spawn_blocking`
//! 2. [`encode`]   pick a mode, normalise, encode under a resource guard
//! 3. [`compress`] host retry on accelerator OOM; classify the ratio
//! 4. [`decode`]   fixed prompt per format, whole or incremental
//! 5. [`postprocess`] deterministic text cleanup shared with fallback engines

pub mod compress;
pub mod decode;
pub mod encode;
pub mod postprocess;
pub mod render;
