//! Fallback OCR routing across the primary pipeline and classical engines.
//!
//! Three engine tiers exist, each behind the [`OcrEngine`] trait:
//!
//! | Tier      | Engine | Strength |
//! |-----------|--------|----------|
//! | primary   | the visual-compression pipeline | fast on short, clean pages |
//! | secondary | a vision LLM ([`vlm::VlmEngine`]) | mid-length, messy layouts |
//! | tertiary  | Tesseract ([`tesseract::TesseractEngine`]) | long documents, no accelerator |
//!
//! Which tiers exist is decided once, by [`FallbackRouter::negotiate`], into
//! a typed [`EngineAvailability`]. Routing then picks a tier from estimated
//! complexity; if the chosen engine fails, the whole chain is walked in
//! fixed order and the first success wins. Each attempt is isolated: an
//! error or a panic inside one engine is recorded and the next one runs.

pub mod tesseract;
pub mod vlm;

use crate::error::{EngineError, OcrError};
use crate::pipeline::decode::OutputFormat;
use crate::pipeline::render::DocumentRenderer;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Tier of an OCR engine in the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Primary,
    Secondary,
    Tertiary,
}

impl EngineKind {
    /// Fixed fallback order.
    pub const CHAIN: [EngineKind; 3] = [
        EngineKind::Primary,
        EngineKind::Secondary,
        EngineKind::Tertiary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Primary => "primary",
            EngineKind::Secondary => "secondary",
            EngineKind::Tertiary => "tertiary",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "deepseek" => Ok(EngineKind::Primary),
            "secondary" | "vlm" => Ok(EngineKind::Secondary),
            "tertiary" | "tesseract" => Ok(EngineKind::Tertiary),
            other => Err(OcrError::InvalidConfig(format!(
                "unknown engine '{}' (expected primary, secondary or tertiary)",
                other
            ))),
        }
    }
}

/// A document-level OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Short name used in logs and attempt records.
    fn name(&self) -> &str;

    /// Check at startup that the engine can run; returns a description.
    async fn probe(&self) -> Result<String, EngineError> {
        Ok(self.name().to_string())
    }

    /// Extract the text of every page of `path`.
    async fn process(&self, path: &Path, format: OutputFormat) -> Result<String, EngineError>;
}

/// Which engine tiers can run in this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineAvailability {
    pub primary: bool,
    pub secondary: bool,
    pub tertiary: bool,
}

impl EngineAvailability {
    pub fn is_available(&self, kind: EngineKind) -> bool {
        match kind {
            EngineKind::Primary => self.primary,
            EngineKind::Secondary => self.secondary,
            EngineKind::Tertiary => self.tertiary,
        }
    }

    /// Available tiers in chain order.
    pub fn engines(&self) -> Vec<EngineKind> {
        EngineKind::CHAIN
            .into_iter()
            .filter(|k| self.is_available(*k))
            .collect()
    }
}

/// Result of routing one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOutcome {
    pub text: String,
    pub engine: EngineKind,
    pub engine_name: String,
    /// Failed attempts before the successful one, in order.
    pub attempts: Vec<EngineError>,
}

/// Complexity thresholds that pick an engine tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingThresholds {
    /// Below this, the primary pipeline is preferred.
    pub low: usize,
    /// Below this, the secondary engine is preferred.
    pub mid: usize,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            low: 1000,
            mid: 2000,
        }
    }
}

/// Routes documents across engine tiers.
pub struct FallbackRouter {
    secondary: Option<Arc<dyn OcrEngine>>,
    tertiary: Option<Arc<dyn OcrEngine>>,
    availability: EngineAvailability,
    thresholds: RoutingThresholds,
    renderer: DocumentRenderer,
}

impl fmt::Debug for FallbackRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackRouter")
            .field("secondary", &self.secondary.as_ref().map(|e| e.name().to_string()))
            .field("tertiary", &self.tertiary.as_ref().map(|e| e.name().to_string()))
            .field("availability", &self.availability)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

impl FallbackRouter {
    /// Router over the given secondary and tertiary engines.
    ///
    /// Nothing is available until [`negotiate`](Self::negotiate) runs.
    pub fn new(
        secondary: Option<Arc<dyn OcrEngine>>,
        tertiary: Option<Arc<dyn OcrEngine>>,
        thresholds: RoutingThresholds,
    ) -> Self {
        Self {
            secondary,
            tertiary,
            availability: EngineAvailability::default(),
            thresholds,
            renderer: DocumentRenderer::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: DocumentRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Probe every configured engine and fix the availability set.
    ///
    /// `primary_capable` is decided by the caller from model and memory
    /// state. A failed secondary probe disables that tier; the tertiary
    /// tier stays available once configured and its probe is only logged.
    pub async fn negotiate(&mut self, primary_capable: bool) -> EngineAvailability {
        let secondary = match &self.secondary {
            Some(engine) => match engine.probe().await {
                Ok(desc) => {
                    info!("Secondary OCR engine ready: {}", desc);
                    true
                }
                Err(e) => {
                    warn!("Secondary OCR engine unavailable: {}", e);
                    false
                }
            },
            None => false,
        };

        let tertiary = match &self.tertiary {
            Some(engine) => {
                match engine.probe().await {
                    Ok(desc) => info!("Tertiary OCR engine ready: {}", desc),
                    Err(e) => warn!("Tertiary OCR engine probe failed: {}", e),
                }
                true
            }
            None => false,
        };

        self.availability = EngineAvailability {
            primary: primary_capable,
            secondary,
            tertiary,
        };
        info!("Available OCR engines: {:?}", self.availability.engines());
        self.availability
    }

    pub fn availability(&self) -> EngineAvailability {
        self.availability
    }

    /// Available tiers in chain order.
    pub fn available_engines(&self) -> Vec<EngineKind> {
        self.availability.engines()
    }

    /// Choose a tier from complexity.
    ///
    /// `primary_available` is whether the caller can supply a primary engine
    /// right now; it is combined with the negotiated capability.
    pub fn select_engine(&self, complexity: usize, primary_available: bool) -> EngineKind {
        if primary_available && self.availability.primary && complexity < self.thresholds.low {
            EngineKind::Primary
        } else if self.availability.secondary && complexity < self.thresholds.mid {
            EngineKind::Secondary
        } else {
            EngineKind::Tertiary
        }
    }

    /// Extract text from `path`, walking the fallback chain on failure.
    ///
    /// `force` bypasses selection but still falls back if that engine fails
    /// or is unavailable.
    pub async fn process_document(
        &self,
        path: &Path,
        format: OutputFormat,
        primary: Option<&dyn OcrEngine>,
        force: Option<EngineKind>,
    ) -> Result<RouteOutcome, OcrError> {
        let complexity = self.renderer.estimate_complexity(path)?;
        let selected = force.unwrap_or_else(|| self.select_engine(complexity, primary.is_some()));
        info!(
            "Using OCR engine: {} for {} (complexity {})",
            selected,
            path.display(),
            complexity
        );

        let mut attempts = Vec::new();

        match self.engine_for(selected, primary) {
            Some(engine) => match run_guarded(engine, path, format).await {
                Ok(text) => return Ok(outcome(engine, text, attempts)),
                Err(e) => {
                    warn!("{} engine failed: {}", selected, e);
                    attempts.push(e);
                }
            },
            None => warn!(
                "Requested engine '{}' not available, trying fallbacks",
                selected
            ),
        }

        for kind in EngineKind::CHAIN {
            let Some(engine) = self.engine_for(kind, primary) else {
                continue;
            };
            match run_guarded(engine, path, format).await {
                Ok(text) => {
                    info!("Fallback chain succeeded with {} engine", kind);
                    return Ok(outcome(engine, text, attempts));
                }
                Err(e) => {
                    warn!("{} engine failed: {}", kind, e);
                    attempts.push(e);
                }
            }
        }

        Err(OcrError::AllEnginesFailed { attempts })
    }

    fn engine_for<'a>(
        &'a self,
        kind: EngineKind,
        primary: Option<&'a dyn OcrEngine>,
    ) -> Option<&'a dyn OcrEngine> {
        if !self.availability.is_available(kind) {
            return None;
        }
        match kind {
            EngineKind::Primary => primary,
            EngineKind::Secondary => self.secondary.as_deref(),
            EngineKind::Tertiary => self.tertiary.as_deref(),
        }
    }
}

fn outcome(engine: &dyn OcrEngine, text: String, attempts: Vec<EngineError>) -> RouteOutcome {
    RouteOutcome {
        text,
        engine: engine.kind(),
        engine_name: engine.name().to_string(),
        attempts,
    }
}

/// Run one engine, turning a panic into an [`EngineError`].
async fn run_guarded(
    engine: &dyn OcrEngine,
    path: &Path,
    format: OutputFormat,
) -> Result<String, EngineError> {
    match AssertUnwindSafe(engine.process(path, format))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "engine panicked".to_string());
            Err(EngineError::new(engine.name(), "panic", detail))
        }
    }
}
