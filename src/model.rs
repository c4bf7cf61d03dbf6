//! The opaque document model and its loader.
//!
//! The pipeline never looks inside the model. The [`DocumentModel`] trait
//! covers what it needs: encoding a normalised page tensor into visual
//! tokens, generating text from those tokens, and moving the weights between
//! accelerator and host. Backends (a quantised
//! transformer runtime, a remote inference server, a test double) plug in
//! through [`ModelProvider`].
//!
//! [`ModelLoader`] owns the loaded model exclusively. The encoder and decoder
//! only ever receive `&mut dyn DocumentModel` for the duration of one call,
//! so the loader's lock is the single-flight gate for accelerator work.

use crate::error::{ModelError, OcrError};
use crate::modes::ModeId;
use crate::resources::{MemoryStats, ResourceGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Where a tensor or the model weights live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Accelerator,
    Host,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Placement::Accelerator => "accelerator",
            Placement::Host => "host",
        })
    }
}

/// Numeric precision of a buffer or of the model's compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F16,
    Bf16,
    Int8,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Precision::F32 => "float32",
            Precision::F16 => "float16",
            Precision::Bf16 => "bfloat16",
            Precision::Int8 => "int8",
        })
    }
}

/// A normalised `[1, 3, H, W]` page tensor ready for the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    shape: [usize; 4],
    placement: Placement,
}

impl ImageTensor {
    /// Panics in debug builds when `data` does not match `shape`.
    pub fn new(data: Vec<f32>, shape: [usize; 4], placement: Placement) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self {
            data,
            shape,
            placement,
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// `(width, height)` of the tensor.
    pub fn resolution(&self) -> (usize, usize) {
        (self.shape[3], self.shape[2])
    }

    pub fn to(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }
}

/// Visual tokens produced by the encoder for one page at one mode.
///
/// Consumed exactly once by the decoder. Location and precision are runtime
/// attributes; relocating a buffer does not change what it represents.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedTokens {
    data: Vec<f32>,
    shape: Vec<usize>,
    mode: ModeId,
    placement: Placement,
    precision: Precision,
}

impl CompressedTokens {
    /// `shape` is `[batch, tokens, hidden]` for transformer encoders.
    pub fn new(data: Vec<f32>, shape: Vec<usize>, mode: ModeId, placement: Placement) -> Self {
        Self {
            data,
            shape,
            mode,
            placement,
            precision: Precision::F32,
        }
    }

    /// Number of visual tokens: the second-to-last dimension.
    pub fn token_count(&self) -> usize {
        if self.data.is_empty() {
            return 0;
        }
        match self.shape.len() {
            0 => 0,
            1 => self.shape[0],
            n => self.shape[n - 2],
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn mode(&self) -> ModeId {
        self.mode
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Relocate to host memory.
    pub fn to_host(mut self) -> Self {
        self.placement = Placement::Host;
        self
    }

    /// Round every value to the nearest IEEE half.
    pub fn to_half_precision(mut self) -> Self {
        for v in &mut self.data {
            *v = half::f16::from_f32(*v).to_f32();
        }
        self.precision = Precision::F16;
        self
    }
}

/// Greedy decoding options passed to [`DocumentModel::generate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 4096,
            do_sample: false,
            temperature: 1.0,
            top_p: 1.0,
        }
    }
}

/// Incremental text units from a generation in progress.
pub type TextUnits<'a> = Box<dyn Iterator<Item = Result<String, ModelError>> + Send + 'a>;

/// What a backend reports about itself once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub device: String,
    pub dtype: String,
}

/// The document encoding/decoding capability.
///
/// Implementations are not re-entrant; the pipeline never calls two methods
/// concurrently on the same instance.
pub trait DocumentModel: Send {
    fn descriptor(&self) -> ModelDescriptor;

    /// Where the weights currently live.
    fn placement(&self) -> Placement;

    /// Move the weights. Used by the host-only retry after accelerator OOM.
    fn move_to(&mut self, placement: Placement) -> Result<(), ModelError>;

    /// Encode one normalised page tensor into visual tokens.
    fn encode_images(
        &mut self,
        input: &ImageTensor,
        mode: ModeId,
    ) -> Result<CompressedTokens, ModelError>;

    /// Generate the complete text for `tokens` in one call.
    fn generate(
        &mut self,
        tokens: &CompressedTokens,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, ModelError>;

    /// Generate text one unit at a time.
    ///
    /// The default runs [`generate`](Self::generate) and yields the result
    /// character by character, for backends without incremental decoding.
    fn generate_stream<'a>(
        &'a mut self,
        tokens: &'a CompressedTokens,
        prompt: &'a str,
        options: &GenerateOptions,
    ) -> Result<TextUnits<'a>, ModelError> {
        let text = self.generate(tokens, prompt, options)?;
        let units: Vec<Result<String, ModelError>> =
            text.chars().map(|c| Ok(c.to_string())).collect();
        Ok(Box::new(units.into_iter()))
    }
}

/// 8-bit weight quantisation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub load_in_8bit: bool,
    pub compute_dtype: Precision,
    pub double_quant: bool,
}

impl QuantizationConfig {
    /// INT8 weights, f16 compute, double quantisation.
    pub fn int8() -> Self {
        Self {
            load_in_8bit: true,
            compute_dtype: Precision::F16,
            double_quant: true,
        }
    }
}

/// Per-device memory ceilings for weight placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryBudget {
    pub accelerator_gb: f64,
    pub host_gb: f64,
}

/// Everything a [`ModelProvider`] needs to instantiate a model.
///
/// Providers place weights automatically: accelerator first up to
/// `max_memory.accelerator_gb`, then host up to `max_memory.host_gb`, then
/// `offload_dir` on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadRequest {
    pub model_name: String,
    pub quantization: Option<QuantizationConfig>,
    pub max_memory: MemoryBudget,
    pub offload_dir: PathBuf,
    pub low_cpu_mem_usage: bool,
}

/// Factory for a concrete model backend.
pub trait ModelProvider: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn DocumentModel>, ModelError>;
}

/// Model metadata for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelInfo {
    NotLoaded,
    Loaded {
        model_name: String,
        quantized: bool,
        device: String,
        dtype: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        gpu_memory_allocated_gb: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        gpu_memory_reserved_gb: Option<f64>,
    },
}

/// Loads, owns and unloads the document model.
pub struct ModelLoader {
    model_name: String,
    use_quantization: bool,
    provider: Option<Arc<dyn ModelProvider>>,
    guard: ResourceGuard,
    model: Option<Box<dyn DocumentModel>>,
}

impl fmt::Debug for ModelLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLoader")
            .field("model_name", &self.model_name)
            .field("use_quantization", &self.use_quantization)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn ModelProvider>"))
            .field("loaded", &self.model.is_some())
            .finish()
    }
}

impl ModelLoader {
    pub fn new(
        model_name: impl Into<String>,
        use_quantization: bool,
        provider: Option<Arc<dyn ModelProvider>>,
        guard: ResourceGuard,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            use_quantization,
            provider,
            guard,
            model: None,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn quantization_config(&self) -> Option<QuantizationConfig> {
        self.use_quantization.then(QuantizationConfig::int8)
    }

    /// Load the model under `budget`, returning the handle.
    ///
    /// Already-loaded models are returned as is. Failures are not retried:
    /// the caller decides whether to continue without a model.
    pub fn load(
        &mut self,
        budget: MemoryBudget,
        offload_dir: &Path,
    ) -> Result<&mut (dyn DocumentModel + 'static), OcrError> {
        if self.model.is_none() {
            let model = self.instantiate(budget, offload_dir).map_err(|reason| {
                error!("Failed to load model {}: {}", self.model_name, reason);
                OcrError::ModelLoad {
                    model: self.model_name.clone(),
                    reason,
                }
            })?;
            self.model = Some(model);
            info!("Model loaded successfully");
            self.log_memory_stats();
        }

        self.model
            .as_deref_mut()
            .ok_or_else(|| OcrError::Internal("model slot empty after load".into()))
    }

    fn instantiate(
        &self,
        budget: MemoryBudget,
        offload_dir: &Path,
    ) -> Result<Box<dyn DocumentModel>, String> {
        info!("Loading model: {}", self.model_name);
        info!(
            "Quantization: {}",
            if self.use_quantization {
                "Enabled (INT8)"
            } else {
                "Disabled (BF16)"
            }
        );

        std::fs::create_dir_all(offload_dir).map_err(|e| {
            format!(
                "cannot create offload directory '{}': {}",
                offload_dir.display(),
                e
            )
        })?;

        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| "no model backend is configured".to_string())?;

        let request = LoadRequest {
            model_name: self.model_name.clone(),
            quantization: self.quantization_config(),
            max_memory: budget,
            offload_dir: offload_dir.to_path_buf(),
            low_cpu_mem_usage: true,
        };

        provider.load(&request).map_err(|e| e.to_string())
    }

    fn log_memory_stats(&self) {
        match self.guard.memory_stats() {
            MemoryStats::Available {
                allocated_gb,
                reserved_gb,
                ..
            } => info!(
                "GPU Memory - Allocated: {:.2}GB, Reserved: {:.2}GB",
                allocated_gb, reserved_gb
            ),
            MemoryStats::NoAccelerator => info!("Running on CPU - No GPU memory tracking"),
        }
    }

    /// Drop the model and clear the cache. Returns whether a model was loaded.
    pub fn unload(&mut self) -> bool {
        if self.model.take().is_some() {
            self.guard.clear_cache();
            info!("Model unloaded from memory");
            true
        } else {
            false
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Borrow the loaded model for one accelerator operation.
    pub fn model_mut(&mut self) -> Option<&mut (dyn DocumentModel + 'static)> {
        self.model.as_deref_mut()
    }

    pub fn info(&self) -> ModelInfo {
        let Some(model) = self.model.as_ref() else {
            return ModelInfo::NotLoaded;
        };
        let descriptor = model.descriptor();
        let stats = self.guard.memory_stats();
        let (allocated, reserved) = match stats {
            MemoryStats::Available {
                allocated_gb,
                reserved_gb,
                ..
            } => (Some(allocated_gb), Some(reserved_gb)),
            MemoryStats::NoAccelerator => (None, None),
        };
        ModelInfo::Loaded {
            model_name: self.model_name.clone(),
            quantized: self.use_quantization,
            device: descriptor.device,
            dtype: descriptor.dtype,
            gpu_memory_allocated_gb: allocated,
            gpu_memory_reserved_gb: reserved,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_model {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted model: encode results are popped from a queue; when empty,
    /// returns `tokens` visual tokens of width 4.
    pub struct ScriptedModel {
        pub placement: Placement,
        pub tokens: usize,
        pub encode_script: VecDeque<Result<usize, ModelError>>,
        pub text: String,
        pub encode_calls: Arc<AtomicUsize>,
        pub seen_placements: Arc<Mutex<Vec<(ModeId, Placement, Placement)>>>,
    }

    impl ScriptedModel {
        pub fn new(tokens: usize, text: &str) -> Self {
            Self {
                placement: Placement::Accelerator,
                tokens,
                encode_script: VecDeque::new(),
                text: text.to_string(),
                encode_calls: Arc::new(AtomicUsize::new(0)),
                seen_placements: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl DocumentModel for ScriptedModel {
        fn descriptor(&self) -> ModelDescriptor {
            ModelDescriptor {
                device: self.placement.to_string(),
                dtype: "int8".into(),
            }
        }

        fn placement(&self) -> Placement {
            self.placement
        }

        fn move_to(&mut self, placement: Placement) -> Result<(), ModelError> {
            self.placement = placement;
            Ok(())
        }

        fn encode_images(
            &mut self,
            input: &ImageTensor,
            mode: ModeId,
        ) -> Result<CompressedTokens, ModelError> {
            self.encode_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_placements
                .lock()
                .unwrap()
                .push((mode, input.placement(), self.placement));
            let n = match self.encode_script.pop_front() {
                Some(r) => r?,
                None => self.tokens,
            };
            Ok(CompressedTokens::new(
                vec![0.5; n * 4],
                vec![1, n, 4],
                mode,
                input.placement(),
            ))
        }

        fn generate(
            &mut self,
            _tokens: &CompressedTokens,
            prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<String, ModelError> {
            if prompt.is_empty() {
                return Err(ModelError::backend("empty prompt"));
            }
            Ok(self.text.clone())
        }
    }

    pub struct ScriptedProvider {
        pub tokens: usize,
        pub fail_with: Option<ModelError>,
    }

    impl ModelProvider for ScriptedProvider {
        fn load(&self, _request: &LoadRequest) -> Result<Box<dyn DocumentModel>, ModelError> {
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(Box::new(ScriptedModel::new(self.tokens, "hello"))),
            }
        }
    }
}
