//! Visual-token encoding: page image → [`CompressedTokens`] at a chosen mode.
//!
//! The encoder never owns the model. Each call borrows it for the duration of
//! one encode, inside a [`ResourceGuard`] scope that clears the accelerator
//! cache before and after.
//!
//! ## Mode selection
//!
//! [`Encoder::auto_select_mode`] is a fixed decision table biased towards the
//! cheaper mode:
//!
//! | Free memory | Complexity | Mode  |
//! |-------------|------------|-------|
//! | ≥ 8 GB      | < 2500     | base  |
//! | ≥ 4 GB      | < 900      | small |
//! | otherwise   |            | tiny  |
//!
//! `tiny` is the floor and is returned even when less than its 2 GB nominal
//! requirement is free; there is nothing cheaper to fall back to.

use crate::error::OcrError;
use crate::model::{CompressedTokens, DocumentModel, ImageTensor, Placement};
use crate::modes::{CompressionMode, ModeId};
use crate::resources::ResourceGuard;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::{debug, error, info, warn};

/// Per-channel normalisation mean (RGB).
pub const NORMALIZE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel normalisation standard deviation (RGB).
pub const NORMALIZE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Encodes page images into visual tokens.
#[derive(Debug, Clone)]
pub struct Encoder {
    guard: ResourceGuard,
}

impl Encoder {
    pub fn new(guard: ResourceGuard) -> Self {
        Self { guard }
    }

    /// Pick a mode from free accelerator memory and estimated complexity.
    pub fn auto_select_mode(&self, complexity: usize) -> ModeId {
        let free = self.guard.free_gb();
        let base = ModeId::Base.config();
        let small = ModeId::Small.config();

        let selected = if free >= base.min_memory_gb && complexity < base.max_text_tokens {
            ModeId::Base
        } else if free >= small.min_memory_gb && complexity < small.max_text_tokens {
            ModeId::Small
        } else {
            ModeId::FLOOR
        };

        info!(
            "Auto-selected mode: {} (free_memory: {:.1}GB, complexity: {} tokens)",
            selected, free, complexity
        );
        selected
    }

    /// Resize to the exact square resolution and normalise into CHW layout.
    ///
    /// The tensor is placed on the accelerator when one is present, memory
    /// is not critical and the model itself lives there.
    pub fn prepare_tensor(
        &self,
        image: &DynamicImage,
        resolution: u32,
        model_placement: Placement,
    ) -> ImageTensor {
        let rgb = if image.width() == resolution && image.height() == resolution {
            image.to_rgb8()
        } else {
            image
                .resize_exact(resolution, resolution, FilterType::Lanczos3)
                .to_rgb8()
        };

        let side = resolution as usize;
        let plane = side * side;
        let mut data = vec![0f32; 3 * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                let v = pixel.0[c] as f32 / 255.0;
                data[c * plane + i] = (v - NORMALIZE_MEAN[c]) / NORMALIZE_STD[c];
            }
        }

        let placement = if self.guard.has_accelerator()
            && !self.guard.is_critical()
            && model_placement == Placement::Accelerator
        {
            Placement::Accelerator
        } else {
            Placement::Host
        };

        ImageTensor::new(data, [1, 3, side, side], placement)
    }

    /// Encode one image at `mode`.
    ///
    /// Accelerator exhaustion surfaces as [`OcrError::OutOfResource`] so the
    /// compressor can retry on the host.
    pub fn encode(
        &self,
        model: &mut dyn DocumentModel,
        image: &DynamicImage,
        mode: ModeId,
    ) -> Result<CompressedTokens, OcrError> {
        let config = mode.config();
        let tensor = self.prepare_tensor(image, config.resolution, model.placement());

        let _scope = self.guard.acquire("encode");
        let tokens = model.encode_images(&tensor, mode).map_err(|e| {
            let err = OcrError::from_model(e, "encode", mode);
            if err.is_out_of_resource() {
                warn!("GPU OOM during encoding in {} mode", mode);
            }
            err
        })?;

        debug!(
            "Encoded image to {} vision tokens (mode: {})",
            tokens.token_count(),
            mode
        );
        Ok(tokens)
    }

    /// Encode a batch one image at a time.
    ///
    /// Completed buffers move to host memory once usage turns critical. An
    /// OOM on a non-floor mode is retried for that image alone at `tiny`.
    pub fn encode_chunked(
        &self,
        model: &mut dyn DocumentModel,
        images: &[DynamicImage],
        mode: ModeId,
    ) -> Result<Vec<CompressedTokens>, OcrError> {
        let mut encoded = Vec::with_capacity(images.len());

        for (idx, image) in images.iter().enumerate() {
            self.guard.clear_cache();

            match self.encode(model, image, mode) {
                Ok(tokens) => {
                    let tokens = if self.guard.is_critical() {
                        warn!(
                            "Memory critical after encoding image {}/{}, offloading to host",
                            idx + 1,
                            images.len()
                        );
                        tokens.to_host()
                    } else {
                        tokens
                    };
                    encoded.push(tokens);
                }
                Err(e) if e.is_out_of_resource() && mode != ModeId::FLOOR => {
                    error!(
                        "Failed to encode image {}/{} due to OOM",
                        idx + 1,
                        images.len()
                    );
                    info!("Falling back to {} mode", ModeId::FLOOR);
                    let tokens = self.encode(model, image, ModeId::FLOOR)?;
                    encoded.push(tokens.to_host());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(encoded)
    }
}

/// Configuration of `mode`.
pub fn mode_info(mode: ModeId) -> &'static CompressionMode {
    mode.config()
}

/// `text_tokens / vision_tokens`, or 0 when there are no vision tokens.
pub fn compression_ratio(text_tokens: usize, vision_tokens: usize) -> f64 {
    if vision_tokens == 0 {
        return 0.0;
    }
    text_tokens as f64 / vision_tokens as f64
}
