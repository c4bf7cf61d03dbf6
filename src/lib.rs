//! # edgequake-ocr
//!
//! Memory-aware OCR control plane around a visual-compression document model.
//!
//! ## Why this crate?
//!
//! Visual-compression models read a page by squeezing it into a few hundred
//! visual tokens and decoding text from those. That is fast and cheap when it
//! works, but two things go wrong in production: the accelerator runs out of
//! memory, and dense pages get compressed past the point where the decoded
//! text can be trusted. This crate wraps the model in a control plane that
//! picks a compression mode from free memory and document complexity,
//! downgrades placement and precision when memory runs out, measures every
//! page's compression ratio, and hands documents to classical OCR engines
//! when the primary path is unsafe or unavailable.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Render    rasterise pages via pdfium (spawn_blocking, one page in flight)
//!  ├─ 2. Encode    normalise + encode to visual tokens under a resource guard
//!  ├─ 3. Compress  OOM → host retry at half precision; ratio check per page
//!  ├─ 4. Decode    fixed prompt per output format; optional incremental stream
//!  ├─ 5. Polish    deterministic cleanup (fences, tables, whitespace)
//!  └─ 6. Fallback  unsafe ratio or failure → vision LLM → Tesseract
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr::{OutputFormat, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .memory_limit_gb(8.0)
//!         .enable_quantization(true)
//!         .build()?;
//!     let pipeline = Pipeline::new(config);
//!     pipeline.initialize().await?;
//!
//!     let output = pipeline
//!         .process_file("scan.pdf", OutputFormat::Markdown, None, false)
//!         .await?;
//!     println!("{}", output.text);
//!     eprintln!("engine: {} ({} chars)", output.engine, output.length);
//!
//!     pipeline.cleanup();
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocrpipe` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! ## Compression Modes
//!
//! | Mode  | Resolution | Visual tokens | Text ceiling | Min memory |
//! |-------|-----------:|--------------:|-------------:|-----------:|
//! | tiny  | 512        | 64            | 600          | 2 GB       |
//! | small | 640        | 100           | 900          | 4 GB       |
//! | base  | 1024       | 256           | 2500         | 8 GB       |
//! | large | 1280       | 400           | 4000         | 12 GB      |
//!
//! `large` is never chosen automatically; request it with an explicit mode.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod fallback;
pub mod model;
pub mod modes;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod resources;
pub mod service;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{EngineError, ModelError, OcrError, StatusClass};
pub use fallback::{EngineAvailability, EngineKind, FallbackRouter, OcrEngine, RouteOutcome};
pub use model::{
    CompressedTokens, DocumentModel, ImageTensor, LoadRequest, ModelInfo, ModelLoader,
    ModelProvider, Placement,
};
pub use modes::{CompressionMode, ModeId};
pub use output::{BenchmarkResult, PipelineState, ProcessOutput, SystemInfo};
pub use pipeline::compress::{CompressionRatioReport, RatioClass};
pub use pipeline::decode::OutputFormat;
pub use progress::{NoopObserver, ProcessingObserver};
pub use resources::{DeviceMemory, MemoryStats, ResourceGuard};
pub use service::Pipeline;
