//! Configuration for the OCR pipeline.
//!
//! Everything the controller needs is in [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. The collaborators that cannot be expressed as
//! plain values (the model backend, the accelerator accounting interface,
//! a pre-built vision-LLM provider, a progress observer) are injected here
//! too, so a test can swap any of them without touching the controller.

use crate::error::OcrError;
use crate::model::ModelProvider;
use crate::progress::ProcessingObserver;
use crate::resources::DeviceMemory;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Model identifier loaded when none is configured.
pub const DEFAULT_MODEL_NAME: &str = "deepseek-ai/DeepSeek-OCR";

/// Files above this many bytes (10 MB) always decode incrementally.
pub const DEFAULT_STREAMING_THRESHOLD_BYTES: u64 = 10_000_000;

/// Upper bound on vision-LLM retries per page.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Configuration for a [`crate::Pipeline`].
///
/// # Example
/// ```rust
/// use edgequake_ocr::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .memory_limit_gb(6.0)
///     .enable_quantization(true)
///     .enable_vlm(false)
///     .build()
///     .unwrap();
/// assert_eq!(config.memory_limit_gb, 6.0);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Model identifier handed to the [`ModelProvider`].
    pub model_name: String,

    /// Accelerator memory budget for weight placement, in GB. Default: 8.
    pub memory_limit_gb: f64,

    /// Host memory budget for weight placement, in GB. Default: 16.
    pub host_memory_gb: f64,

    /// Load weights as INT8 with f16 compute. Default: true.
    pub enable_quantization: bool,

    /// Directory for weights that fit neither budget. Default: `offload`.
    pub offload_dir: PathBuf,

    /// PDF rasterisation DPI. Range: 72–400. Default: 150.
    pub target_dpi: u32,

    /// Files larger than this take the streaming decode path. Default: 10 MB.
    pub streaming_threshold_bytes: u64,

    /// Upper bound on generated tokens per page. Default: 4096.
    pub max_new_tokens: usize,

    /// Streaming decode clears the cache every this many units. Default: 100.
    pub cache_clear_every: usize,

    /// Maximum pages rendered per PDF. Default: all.
    pub max_pages: Option<usize>,

    /// `check_threshold` clears when allocated/reserved exceeds this percent. Default: 90.
    pub guard_threshold_percent: f64,

    /// Allocated/reserved ratio above which memory is critical. Default: 0.9.
    pub critical_usage_ratio: f64,

    /// Router sends documents below this complexity to the primary engine. Default: 1000.
    pub low_complexity_threshold: usize,

    /// Router sends documents below this complexity to the secondary engine. Default: 2000.
    pub mid_complexity_threshold: usize,

    /// Primary engine needs more free accelerator memory than this, in GB. Default: 4.
    pub primary_min_free_gb: f64,

    /// Fallback engines render pages at this size. Default: 1280.
    pub fallback_render_size: u32,

    /// Enable the vision-LLM secondary engine. Default: true.
    pub enable_vlm: bool,

    /// Vision-LLM provider name (e.g. "openai", "ollama"). Default: auto-detect.
    pub vlm_provider: Option<String>,

    /// Vision-LLM model identifier. Default: provider default.
    pub vlm_model: Option<String>,

    /// Replacement system prompt for the vision-LLM engine.
    pub vlm_system_prompt: Option<String>,

    /// Enable the Tesseract tertiary engine. Default: true.
    pub enable_tesseract: bool,

    /// Tesseract executable. Default: `tesseract`.
    pub tesseract_cmd: String,

    /// Tesseract language pack(s), e.g. `eng+deu`. Default: `eng`.
    pub tesseract_lang: String,

    /// Retries per vision-LLM call. Default: 3.
    pub max_retries: u32,

    /// First retry delay in ms; doubles each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call timeout for fallback engines, in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Model backend. Without one the pipeline starts degraded.
    pub model_provider: Option<Arc<dyn ModelProvider>>,

    /// Accelerator accounting. Without one the pipeline runs host-only.
    pub device: Option<Arc<dyn DeviceMemory>>,

    /// Pre-built vision-LLM provider; takes precedence over `vlm_provider`.
    pub llm_provider: Option<Arc<dyn LLMProvider>>,

    /// Receives per-page progress events.
    pub observer: Option<Arc<dyn ProcessingObserver>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            memory_limit_gb: 8.0,
            host_memory_gb: 16.0,
            enable_quantization: true,
            offload_dir: PathBuf::from("offload"),
            target_dpi: 150,
            streaming_threshold_bytes: DEFAULT_STREAMING_THRESHOLD_BYTES,
            max_new_tokens: 4096,
            cache_clear_every: 100,
            max_pages: None,
            guard_threshold_percent: 90.0,
            critical_usage_ratio: 0.9,
            low_complexity_threshold: 1000,
            mid_complexity_threshold: 2000,
            primary_min_free_gb: 4.0,
            fallback_render_size: 1280,
            enable_vlm: true,
            vlm_provider: None,
            vlm_model: None,
            vlm_system_prompt: None,
            enable_tesseract: true,
            tesseract_cmd: "tesseract".to_string(),
            tesseract_lang: "eng".to_string(),
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 60,
            model_provider: None,
            device: None,
            llm_provider: None,
            observer: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("model_name", &self.model_name)
            .field("memory_limit_gb", &self.memory_limit_gb)
            .field("enable_quantization", &self.enable_quantization)
            .field("offload_dir", &self.offload_dir)
            .field("target_dpi", &self.target_dpi)
            .field("streaming_threshold_bytes", &self.streaming_threshold_bytes)
            .field("max_new_tokens", &self.max_new_tokens)
            .field("max_pages", &self.max_pages)
            .field("low_complexity_threshold", &self.low_complexity_threshold)
            .field("mid_complexity_threshold", &self.mid_complexity_threshold)
            .field("enable_vlm", &self.enable_vlm)
            .field("vlm_provider", &self.vlm_provider)
            .field("vlm_model", &self.vlm_model)
            .field("enable_tesseract", &self.enable_tesseract)
            .field("tesseract_cmd", &self.tesseract_cmd)
            .field(
                "model_provider",
                &self.model_provider.as_ref().map(|_| "<dyn ModelProvider>"),
            )
            .field("device", &self.device.as_ref().map(|_| "<dyn DeviceMemory>"))
            .field(
                "llm_provider",
                &self.llm_provider.as_ref().map(|_| "<dyn LLMProvider>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.config.model_name = name.into();
        self
    }

    pub fn memory_limit_gb(mut self, gb: f64) -> Self {
        self.config.memory_limit_gb = gb;
        self
    }

    pub fn host_memory_gb(mut self, gb: f64) -> Self {
        self.config.host_memory_gb = gb;
        self
    }

    pub fn enable_quantization(mut self, v: bool) -> Self {
        self.config.enable_quantization = v;
        self
    }

    pub fn offload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.offload_dir = dir.into();
        self
    }

    pub fn target_dpi(mut self, dpi: u32) -> Self {
        self.config.target_dpi = dpi.clamp(72, 400);
        self
    }

    pub fn streaming_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.streaming_threshold_bytes = bytes;
        self
    }

    pub fn max_new_tokens(mut self, n: usize) -> Self {
        self.config.max_new_tokens = n;
        self
    }

    pub fn cache_clear_every(mut self, units: usize) -> Self {
        self.config.cache_clear_every = units;
        self
    }

    pub fn max_pages(mut self, pages: usize) -> Self {
        self.config.max_pages = Some(pages);
        self
    }

    pub fn guard_threshold_percent(mut self, percent: f64) -> Self {
        self.config.guard_threshold_percent = percent;
        self
    }

    pub fn critical_usage_ratio(mut self, ratio: f64) -> Self {
        self.config.critical_usage_ratio = ratio;
        self
    }

    pub fn low_complexity_threshold(mut self, tokens: usize) -> Self {
        self.config.low_complexity_threshold = tokens;
        self
    }

    pub fn mid_complexity_threshold(mut self, tokens: usize) -> Self {
        self.config.mid_complexity_threshold = tokens;
        self
    }

    pub fn primary_min_free_gb(mut self, gb: f64) -> Self {
        self.config.primary_min_free_gb = gb;
        self
    }

    pub fn fallback_render_size(mut self, px: u32) -> Self {
        self.config.fallback_render_size = px;
        self
    }

    pub fn enable_vlm(mut self, v: bool) -> Self {
        self.config.enable_vlm = v;
        self
    }

    pub fn vlm_provider(mut self, name: impl Into<String>) -> Self {
        self.config.vlm_provider = Some(name.into());
        self
    }

    pub fn vlm_model(mut self, model: impl Into<String>) -> Self {
        self.config.vlm_model = Some(model.into());
        self
    }

    pub fn vlm_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.vlm_system_prompt = Some(prompt.into());
        self
    }

    pub fn enable_tesseract(mut self, v: bool) -> Self {
        self.config.enable_tesseract = v;
        self
    }

    pub fn tesseract_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.config.tesseract_cmd = cmd.into();
        self
    }

    pub fn tesseract_lang(mut self, lang: impl Into<String>) -> Self {
        self.config.tesseract_lang = lang.into();
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn model_provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.config.model_provider = Some(provider);
        self
    }

    pub fn device(mut self, device: Arc<dyn DeviceMemory>) -> Self {
        self.config.device = Some(device);
        self
    }

    pub fn llm_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.llm_provider = Some(provider);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProcessingObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, OcrError> {
        let c = &self.config;
        if c.memory_limit_gb.is_nan() || c.memory_limit_gb <= 0.0 {
            return Err(OcrError::InvalidConfig(format!(
                "memory limit must be positive, got {}GB",
                c.memory_limit_gb
            )));
        }
        if c.host_memory_gb < 0.0 {
            return Err(OcrError::InvalidConfig(format!(
                "host memory budget must not be negative, got {}GB",
                c.host_memory_gb
            )));
        }
        if c.low_complexity_threshold > c.mid_complexity_threshold {
            return Err(OcrError::InvalidConfig(format!(
                "low complexity threshold ({}) exceeds mid threshold ({})",
                c.low_complexity_threshold, c.mid_complexity_threshold
            )));
        }
        if c.cache_clear_every == 0 {
            return Err(OcrError::InvalidConfig(
                "cache_clear_every must be ≥ 1".into(),
            ));
        }
        if c.max_new_tokens == 0 {
            return Err(OcrError::InvalidConfig("max_new_tokens must be ≥ 1".into()));
        }
        if !(0.0..=100.0).contains(&c.guard_threshold_percent) {
            return Err(OcrError::InvalidConfig(format!(
                "guard threshold must be 0–100%, got {}",
                c.guard_threshold_percent
            )));
        }
        if !(0.0..=1.0).contains(&c.critical_usage_ratio) {
            return Err(OcrError::InvalidConfig(format!(
                "critical usage ratio must be 0–1, got {}",
                c.critical_usage_ratio
            )));
        }
        if c.max_retries > MAX_RETRIES_LIMIT {
            return Err(OcrError::InvalidConfig(format!(
                "max_retries must be ≤ {}, got {}",
                MAX_RETRIES_LIMIT, c.max_retries
            )));
        }
        if c.max_pages == Some(0) {
            return Err(OcrError::InvalidConfig("max_pages must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}
