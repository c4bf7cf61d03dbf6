//! Compression with host fallback, and compression-ratio safety checks.
//!
//! Accelerator exhaustion is recovered as close to the failure as possible:
//! an out-of-memory encode is retried once with the model moved to host
//! memory, and the resulting tokens are stored at half precision. Any other
//! failure propagates unchanged.
//!
//! The ratio check has two tiers. Each mode has its own safe ratio (its
//! `max_text_tokens / vision_tokens`) above which the result is merely a
//! `caution`; above [`UNSAFE_RATIO`] the result is a `warning` whatever the
//! mode, and the controller abandons the primary pipeline for the document.

use crate::error::OcrError;
use crate::model::{CompressedTokens, DocumentModel, Placement};
use crate::modes::ModeId;
use crate::pipeline::encode::Encoder;
use crate::resources::ResourceGuard;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Ratio above which accuracy is considered at risk in every mode.
pub const UNSAFE_RATIO: f64 = 10.0;

const PIXELS_PER_TEXT_TOKEN: u64 = 5000;
const MIN_TEXT_TOKENS: usize = 100;
const MAX_TEXT_TOKENS: usize = 5000;

/// Safety classification of a realised compression ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatioClass {
    Ok,
    Caution,
    Warning,
    Error,
}

impl fmt::Display for RatioClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RatioClass::Ok => "ok",
            RatioClass::Caution => "caution",
            RatioClass::Warning => "warning",
            RatioClass::Error => "error",
        })
    }
}

/// Per-page ratio report. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionRatioReport {
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub mode: ModeId,
    /// Rounded to two decimals; 0 when no tokens were produced.
    pub ratio: f64,
    pub safe_ratio: f64,
    pub status: RatioClass,
    /// `ratio <= UNSAFE_RATIO` and tokens were produced.
    pub safe: bool,
    pub message: String,
}

/// Runs encodes with the out-of-memory host fallback.
#[derive(Debug, Clone)]
pub struct Compressor {
    guard: ResourceGuard,
}

impl Compressor {
    pub fn new(guard: ResourceGuard) -> Self {
        Self { guard }
    }

    /// Encode on the accelerator; on OOM only, clear and retry on the host.
    ///
    /// Without an accelerator the host path is taken directly.
    pub fn compress_with_fallback(
        &self,
        encoder: &Encoder,
        model: &mut dyn DocumentModel,
        image: &DynamicImage,
        mode: ModeId,
    ) -> Result<CompressedTokens, OcrError> {
        if self.guard.has_accelerator() {
            match encoder.encode(model, image, mode) {
                Ok(tokens) => return Ok(tokens),
                Err(e) if e.is_out_of_resource() => {
                    warn!("GPU OOM - falling back to CPU compression");
                    self.guard.clear_cache();
                }
                Err(e) => return Err(e),
            }
        }
        self.cpu_compress(encoder, model, image, mode)
    }

    /// [`compress_with_fallback`](Self::compress_with_fallback), then one
    /// more attempt at the floor mode if the host retry also ran out of
    /// memory.
    ///
    /// Returns the tokens and the mode that produced them.
    pub fn compress_with_downgrade(
        &self,
        encoder: &Encoder,
        model: &mut dyn DocumentModel,
        image: &DynamicImage,
        mode: ModeId,
    ) -> Result<(CompressedTokens, ModeId), OcrError> {
        match self.compress_with_fallback(encoder, model, image, mode) {
            Ok(tokens) => Ok((tokens, mode)),
            Err(e) if e.is_out_of_resource() && mode != ModeId::FLOOR => {
                warn!("{}; retrying at {} mode", e, ModeId::FLOOR);
                self.guard.clear_cache();
                let tokens =
                    self.compress_with_fallback(encoder, model, image, ModeId::FLOOR)?;
                Ok((tokens, ModeId::FLOOR))
            }
            Err(e) => Err(e),
        }
    }

    /// Encode with the model on the host, returning half-precision tokens.
    ///
    /// The model is moved back to where it was afterwards.
    pub fn cpu_compress(
        &self,
        encoder: &Encoder,
        model: &mut dyn DocumentModel,
        image: &DynamicImage,
        mode: ModeId,
    ) -> Result<CompressedTokens, OcrError> {
        let original = model.placement();
        if original != Placement::Host {
            info!("Moving model to host for compression");
            model
                .move_to(Placement::Host)
                .map_err(|e| OcrError::from_model(e, "offload", mode))?;
        }

        let result = encoder
            .encode(model, image, mode)
            .map(|tokens| tokens.to_half_precision().to_host());

        if original != Placement::Host {
            if let Err(e) = model.move_to(original) {
                warn!("Failed to move model back to {}: {}", original, e);
                return Err(OcrError::from_model(e, "restore", mode));
            }
        }
        result
    }
}

/// Classify `original_tokens / compressed_tokens` for `mode`.
pub fn monitor_ratio(
    original_tokens: usize,
    compressed_tokens: usize,
    mode: ModeId,
) -> CompressionRatioReport {
    let safe_ratio = mode.config().safe_ratio;

    if compressed_tokens == 0 {
        return CompressionRatioReport {
            original_tokens,
            compressed_tokens,
            mode,
            ratio: 0.0,
            safe_ratio,
            status: RatioClass::Error,
            safe: false,
            message: "Invalid compression: zero tokens".into(),
        };
    }

    let ratio = original_tokens as f64 / compressed_tokens as f64;
    let (status, message) = if ratio > UNSAFE_RATIO {
        let msg = format!(
            "Compression ratio {:.1}x exceeds safe threshold ({:.0}x). Accuracy may degrade; \
             use a higher resolution mode or OCR fallback.",
            ratio, UNSAFE_RATIO
        );
        warn!("{}", msg);
        (RatioClass::Warning, msg)
    } else if ratio > safe_ratio {
        let msg = format!(
            "Compression ratio {:.1}x exceeds optimal threshold for {} mode ({:.1}x). \
             Consider upgrading to next mode.",
            ratio, mode, safe_ratio
        );
        info!("{}", msg);
        (RatioClass::Caution, msg)
    } else {
        let msg = format!("Compression ratio {:.1}x is within safe limits.", ratio);
        debug!("{}", msg);
        (RatioClass::Ok, msg)
    };

    CompressionRatioReport {
        original_tokens,
        compressed_tokens,
        mode,
        ratio: (ratio * 100.0).round() / 100.0,
        safe_ratio,
        status,
        safe: ratio <= UNSAFE_RATIO,
        message,
    }
}

/// Rough text-token estimate from pixel area, clamped to [100, 5000].
pub fn estimate_text_tokens(image: &DynamicImage) -> usize {
    let pixels = image.width() as u64 * image.height() as u64;
    ((pixels / PIXELS_PER_TEXT_TOKEN) as usize).clamp(MIN_TEXT_TOKENS, MAX_TEXT_TOKENS)
}

/// Smallest mode whose ceiling covers `estimated_text_tokens`.
pub fn recommended_mode(estimated_text_tokens: usize) -> ModeId {
    ModeId::ALL
        .into_iter()
        .find(|m| estimated_text_tokens <= m.config().max_text_tokens)
        .unwrap_or(ModeId::Large)
}
