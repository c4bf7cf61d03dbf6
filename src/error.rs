//! Error types for the edgequake-ocr library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`OcrError`]: **Fatal for the request**: the document cannot be
//!   processed at all (missing file, corrupt document, every engine failed).
//!   Returned as `Err(OcrError)` from the [`crate::service::Pipeline`] API.
//!
//! * [`ModelError`]: raised by the opaque model capability. The
//!   `OutOfResource` variant is matched explicitly by the compressor and the
//!   encoder to drive precision, placement and mode downgrades; everything
//!   else is a backend failure that propagates.
//!
//! * [`EngineError`]: **Non-fatal**: one OCR engine failed but the router
//!   moves on to the next one. Stored in the router's attempt log so callers
//!   can see the whole fallback path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-ocr library.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("File not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The document exists but cannot be decoded (corrupt PDF, bad image).
    #[error("Failed to render '{path}': {detail}")]
    Render { path: PathBuf, detail: String },

    /// Output format is not one of the enumerated prompt templates.
    #[error("Unsupported output format '{format}' (expected text, markdown, html or grounding)")]
    UnsupportedFormat { format: String },

    /// Compression mode name is not in the mode table.
    #[error("Unknown compression mode '{mode}' (expected tiny, small, base or large)")]
    UnknownMode { mode: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The model could not be retrieved or instantiated.
    #[error("Failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    /// The accelerator could not satisfy an allocation and no local
    /// recovery was left.
    #[error("Out of accelerator memory during {stage} ({mode} mode): {detail}")]
    OutOfResource {
        stage: &'static str,
        mode: String,
        detail: String,
    },

    /// The model backend failed for a reason other than memory exhaustion.
    #[error("Model failure during {stage}: {detail}")]
    Model { stage: &'static str, detail: String },

    /// The encoder produced zero compressed tokens for a page.
    #[error("Page {page}: invalid compression: {detail}")]
    Compression { page: usize, detail: String },

    // ── Routing errors ────────────────────────────────────────────────────
    /// Every engine in the fallback chain failed.
    #[error("All OCR engines failed: {}", summarize_attempts(.attempts))]
    AllEnginesFailed { attempts: Vec<EngineError> },

    // ── Lifecycle errors ──────────────────────────────────────────────────
    /// Operation requires a state the pipeline is not in.
    #[error("Pipeline is not ready (state: {state})")]
    NotReady { state: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn summarize_attempts(attempts: &[EngineError]) -> String {
    if attempts.is_empty() {
        return "no engine was available".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// HTTP-style status class a request layer should report for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    /// Bad input: 4xx.
    ClientError,
    /// The pipeline is not initialised: 503.
    ServiceUnavailable,
    /// Processing failed: 5xx.
    ServerError,
}

impl OcrError {
    /// Classify this error for the calling layer.
    pub fn status_class(&self) -> StatusClass {
        match self {
            OcrError::FileNotFound { .. }
            | OcrError::Render { .. }
            | OcrError::UnsupportedFormat { .. }
            | OcrError::UnknownMode { .. }
            | OcrError::InvalidConfig(_) => StatusClass::ClientError,
            OcrError::NotReady { .. } => StatusClass::ServiceUnavailable,
            _ => StatusClass::ServerError,
        }
    }

    /// True when the error is accelerator memory exhaustion.
    pub fn is_out_of_resource(&self) -> bool {
        matches!(self, OcrError::OutOfResource { .. })
    }

    /// True for errors that make the request itself invalid. These are never
    /// retried on another engine.
    pub fn is_fatal_for_request(&self) -> bool {
        matches!(
            self,
            OcrError::FileNotFound { .. }
                | OcrError::Render { .. }
                | OcrError::UnsupportedFormat { .. }
                | OcrError::UnknownMode { .. }
        )
    }

    pub(crate) fn from_model(err: ModelError, stage: &'static str, mode: impl fmt::Display) -> Self {
        match err {
            ModelError::OutOfResource { detail } => OcrError::OutOfResource {
                stage,
                mode: mode.to_string(),
                detail,
            },
            ModelError::Backend { detail } => OcrError::Model { stage, detail },
        }
    }
}

/// Errors raised by a [`crate::model::DocumentModel`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// The accelerator cannot satisfy an allocation.
    #[error("out of accelerator memory: {detail}")]
    OutOfResource { detail: String },

    /// Any other backend failure.
    #[error("{detail}")]
    Backend { detail: String },
}

impl ModelError {
    pub fn oom(detail: impl Into<String>) -> Self {
        ModelError::OutOfResource {
            detail: detail.into(),
        }
    }

    pub fn backend(detail: impl Into<String>) -> Self {
        ModelError::Backend {
            detail: detail.into(),
        }
    }
}

/// A non-fatal failure of one OCR engine.
///
/// The router records one of these per failed attempt and keeps going.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{engine}: {detail}")]
pub struct EngineError {
    /// Engine name, e.g. `"visual-compression"`, `"vlm"`, `"tesseract"`.
    pub engine: String,
    /// Stage that failed, e.g. `"encode"`, `"chat"`, `"spawn"`.
    pub stage: String,
    /// Human-readable failure description.
    pub detail: String,
}

impl EngineError {
    pub fn new(engine: impl Into<String>, stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            stage: stage.into(),
            detail: detail.into(),
        }
    }
}
