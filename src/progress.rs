//! Observer trait for per-page processing events.
//!
//! Inject an [`Arc<dyn ProcessingObserver>`] via
//! [`crate::config::PipelineConfigBuilder::observer`] to receive events as
//! the controller works through a document. The CLI uses it to drive a
//! spinner; a request layer could forward events to a WebSocket.
//!
//! # Example
//!
//! ```rust
//! use edgequake_ocr::{ProcessingObserver, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct PageCounter(AtomicUsize);
//!
//! impl ProcessingObserver for PageCounter {
//!     fn on_page_decoded(&self, page_num: usize, text_len: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {} done ({} bytes)", page_num, text_len);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .observer(Arc::new(PageCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::fallback::EngineKind;
use crate::modes::ModeId;
use crate::pipeline::compress::CompressionRatioReport;
use std::path::Path;
use std::sync::Arc;

/// Called by the controller while it processes a document.
///
/// All methods default to no-ops. Calls for one document arrive in order
/// from whichever thread runs that stage, so implementations must be
/// `Send + Sync`.
pub trait ProcessingObserver: Send + Sync {
    /// Called once per document after the mode has been chosen.
    ///
    /// `mode` is `None` when the document goes straight to the router.
    fn on_document_start(&self, path: &Path, mode: Option<ModeId>) {
        let _ = (path, mode);
    }

    /// Called after a page has been compressed and its ratio checked.
    ///
    /// `page_num` is 1-indexed.
    fn on_page_encoded(&self, page_num: usize, report: &CompressionRatioReport) {
        let _ = (page_num, report);
    }

    /// Called after a page's text has been produced by the primary pipeline.
    fn on_page_decoded(&self, page_num: usize, text_len: usize) {
        let _ = (page_num, text_len);
    }

    /// Called when the primary pipeline is abandoned for the fallback router.
    fn on_fallback(&self, reason: &str) {
        let _ = reason;
    }

    /// Called once when a document finishes successfully.
    fn on_document_complete(&self, engine: EngineKind, pages: usize) {
        let _ = (engine, pages);
    }
}

/// Observer that ignores every event. Used when none is configured.
pub struct NoopObserver;

impl ProcessingObserver for NoopObserver {}

/// Shared observer handle as stored in [`crate::config::PipelineConfig`].
pub type ObserverHandle = Arc<dyn ProcessingObserver>;
