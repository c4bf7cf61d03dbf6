//! Output types returned by the pipeline.

use crate::error::EngineError;
use crate::fallback::{EngineAvailability, EngineKind};
use crate::model::ModelInfo;
use crate::modes::ModeId;
use crate::pipeline::compress::CompressionRatioReport;
use crate::resources::MemoryStats;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a [`crate::Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Uninitialized,
    Initializing,
    /// Model loaded; primary pipeline first, router on failure.
    Ready,
    /// Model load failed; every request goes to the router.
    Degraded,
    Unloaded,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Initializing => "initializing",
            PipelineState::Ready => "ready",
            PipelineState::Degraded => "degraded",
            PipelineState::Unloaded => "unloaded",
        }
    }

    /// True when documents can be accepted.
    pub fn accepts_requests(self) -> bool {
        matches!(self, PipelineState::Ready | PipelineState::Degraded)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of processing one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Extracted text in the requested format.
    pub text: String,
    /// Length of `text` in characters.
    pub length: usize,
    pub status: String,
    /// Tier that produced `text`.
    pub engine: EngineKind,
    pub engine_name: String,
    /// Mode used by the primary pipeline; `None` when it did not produce the text.
    pub mode: Option<ModeId>,
    /// Pages decoded by the primary pipeline.
    pub pages: usize,
    /// Per-page ratio reports from the primary pipeline, including an
    /// abandoned attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<CompressionRatioReport>,
    /// Why the primary pipeline was abandoned, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Router attempts that failed before the successful one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_attempts: Vec<EngineError>,
    pub elapsed_ms: u64,
}

impl ProcessOutput {
    pub(crate) fn new(text: String, engine: EngineKind, engine_name: impl Into<String>) -> Self {
        Self {
            length: text.chars().count(),
            text,
            status: "success".to_string(),
            engine,
            engine_name: engine_name.into(),
            mode: None,
            pages: 0,
            reports: Vec::new(),
            fallback_reason: None,
            failed_attempts: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// True when a fallback engine produced the text.
    pub fn used_fallback(&self) -> bool {
        self.engine != EngineKind::Primary
    }
}

/// Timing for one `{resolution → mode}` benchmark probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub resolution: u32,
    pub mode: ModeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision_tokens: Option<usize>,
    /// Allocated accelerator memory after the probe; absent without one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BenchmarkResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Read-only snapshot for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub state: PipelineState,
    pub quantization: bool,
    pub memory_limit_gb: f64,
    pub engines: EngineAvailability,
    pub available_engines: Vec<EngineKind>,
    pub model: ModelInfo,
    pub memory: MemoryStats,
}
