//! Pipeline controller: lifecycle, primary pipeline and fallback routing.
//!
//! ```text
//!  uninitialized ──initialize()──▶ initializing ──▶ ready ─────┐
//!        ▲                                      └──▶ degraded ──┤
//!        │                                                      ▼
//!        └───────────── initialize() ◀──────────────────── unloaded ◀── cleanup()
//! ```
//!
//! A [`Pipeline`] is a cheap-to-clone handle around shared state, built once
//! at process start and passed to whatever serves requests. The loaded model
//! sits behind a mutex inside the loader: every encode and decode takes that
//! lock on a blocking thread, which is the single-flight discipline for the
//! accelerator. Rendering and text cleanup run outside the lock.
//!
//! In the `ready` state a document goes through the primary pipeline page by
//! page: compress, check the ratio, decode. A `warning` ratio on any page
//! abandons the primary attempt for the whole document and hands it to the
//! [`FallbackRouter`]; so does any non-fatal primary failure. In the
//! `degraded` state every document goes straight to the router.

use crate::config::PipelineConfig;
use crate::error::{EngineError, OcrError};
use crate::fallback::tesseract::TesseractEngine;
use crate::fallback::vlm::VlmEngine;
use crate::fallback::{EngineKind, FallbackRouter, OcrEngine, RouteOutcome, RoutingThresholds};
use crate::model::{MemoryBudget, ModelInfo, ModelLoader};
use crate::modes::ModeId;
use crate::output::{BenchmarkResult, PipelineState, ProcessOutput, SystemInfo};
use crate::pipeline::compress::{
    estimate_text_tokens, monitor_ratio, CompressionRatioReport, Compressor, RatioClass,
};
use crate::pipeline::decode::{Decoder, OutputFormat};
use crate::pipeline::encode::Encoder;
use crate::pipeline::postprocess::{clean_output, join_pages};
use crate::pipeline::render::{DocumentRenderer, PageImage};
use crate::progress::{NoopObserver, ProcessingObserver};
use crate::resources::{MemoryStats, ResourceGuard};
use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Name reported for the primary engine.
pub const PRIMARY_ENGINE_NAME: &str = "visual-compression";

/// `{resolution → mode}` pairs probed by [`Pipeline::benchmark`].
pub const BENCHMARK_PAIRS: [(u32, ModeId); 3] = [
    (512, ModeId::Tiny),
    (640, ModeId::Small),
    (1024, ModeId::Base),
];

/// Handle to the OCR pipeline. Clones share state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    config: PipelineConfig,
    guard: ResourceGuard,
    renderer: DocumentRenderer,
    encoder: Encoder,
    compressor: Compressor,
    decoder: Decoder,
    loader: Mutex<ModelLoader>,
    /// Snapshot of the loaded model, readable while the loader is busy.
    model_info: RwLock<ModelInfo>,
    state: RwLock<PipelineState>,
    router: tokio::sync::RwLock<FallbackRouter>,
    observer: Arc<dyn ProcessingObserver>,
}

/// How the primary attempt on one document ended.
enum PrimaryOutcome {
    Completed {
        text: String,
        mode: ModeId,
        pages: usize,
        reports: Vec<CompressionRatioReport>,
    },
    /// A page's ratio crossed the unsafe threshold.
    Unsafe {
        page: usize,
        reports: Vec<CompressionRatioReport>,
    },
}

/// One page through compress, ratio check and decode.
enum PageOutcome {
    Decoded {
        text: String,
        report: CompressionRatioReport,
    },
    Unsafe {
        report: CompressionRatioReport,
    },
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline with the fallback engines described by `config`.
    ///
    /// Nothing is loaded until [`initialize`](Self::initialize).
    pub fn new(config: PipelineConfig) -> Self {
        let secondary: Option<Arc<dyn OcrEngine>> = if config.enable_vlm {
            match VlmEngine::from_config(&config) {
                Ok(engine) => Some(Arc::new(engine)),
                Err(e) => {
                    warn!("Vision-LLM engine not available: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let tertiary: Option<Arc<dyn OcrEngine>> = config
            .enable_tesseract
            .then(|| Arc::new(TesseractEngine::from_config(&config)) as Arc<dyn OcrEngine>);

        Self::with_engines(config, secondary, tertiary)
    }

    /// Build a pipeline around caller-supplied fallback engines.
    pub fn with_engines(
        config: PipelineConfig,
        secondary: Option<Arc<dyn OcrEngine>>,
        tertiary: Option<Arc<dyn OcrEngine>>,
    ) -> Self {
        let guard = match &config.device {
            Some(device) => ResourceGuard::new(Arc::clone(device)),
            None => ResourceGuard::host_only(),
        }
        .with_threshold_percent(config.guard_threshold_percent)
        .with_critical_ratio(config.critical_usage_ratio);

        let renderer = DocumentRenderer::new(config.target_dpi);
        let router = FallbackRouter::new(
            secondary,
            tertiary,
            RoutingThresholds {
                low: config.low_complexity_threshold,
                mid: config.mid_complexity_threshold,
            },
        )
        .with_renderer(renderer);

        let loader = ModelLoader::new(
            config.model_name.clone(),
            config.enable_quantization,
            config.model_provider.clone(),
            guard.clone(),
        );
        let observer: Arc<dyn ProcessingObserver> = config
            .observer
            .clone()
            .unwrap_or_else(|| Arc::new(NoopObserver));

        Self {
            inner: Arc::new(Inner {
                encoder: Encoder::new(guard.clone()),
                compressor: Compressor::new(guard.clone()),
                decoder: Decoder::new(guard.clone(), config.max_new_tokens)
                    .with_cache_clear_every(config.cache_clear_every),
                loader: Mutex::new(loader),
                model_info: RwLock::new(ModelInfo::NotLoaded),
                state: RwLock::new(PipelineState::Uninitialized),
                router: tokio::sync::RwLock::new(router),
                renderer,
                guard,
                observer,
                config,
            }),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.inner.state()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Load the model and negotiate fallback engines.
    ///
    /// A model load failure is not an error: the pipeline enters
    /// [`PipelineState::Degraded`] and serves requests through the router.
    /// Calling this on a ready or degraded pipeline is a no-op.
    pub async fn initialize(&self) -> Result<PipelineState, OcrError> {
        {
            let mut state = self.inner.write_state();
            match *state {
                PipelineState::Ready | PipelineState::Degraded => return Ok(*state),
                PipelineState::Initializing => {
                    return Err(OcrError::NotReady {
                        state: state.to_string(),
                    })
                }
                PipelineState::Uninitialized | PipelineState::Unloaded => {
                    *state = PipelineState::Initializing;
                }
            }
        }

        info!("Initializing OCR pipeline");
        info!("{}", self.inner.guard.memory_stats());

        let inner = Arc::clone(&self.inner);
        let loaded = tokio::task::spawn_blocking(move || {
            let budget = MemoryBudget {
                accelerator_gb: inner.config.memory_limit_gb,
                host_gb: inner.config.host_memory_gb,
            };
            let mut loader = inner.lock_loader();
            loader.load(budget, &inner.config.offload_dir)?;
            Ok(loader.info())
        })
        .await
        .map_err(|e| OcrError::Internal(format!("model load task failed: {}", e)))
        .and_then(|r| r);

        let (next, info) = match loaded {
            Ok(info) => (PipelineState::Ready, info),
            Err(e) => {
                warn!("Model unavailable, continuing with fallback engines only: {}", e);
                (PipelineState::Degraded, ModelInfo::NotLoaded)
            }
        };

        let primary_capable = next == PipelineState::Ready
            && self.inner.guard.has_accelerator()
            && self.inner.guard.free_gb() > self.inner.config.primary_min_free_gb;
        self.inner.router.write().await.negotiate(primary_capable).await;

        {
            let mut state = self.inner.write_state();
            if *state == PipelineState::Initializing {
                *self.inner.write_model_info() = info;
                *state = next;
                info!("OCR pipeline {}", next);
                return Ok(next);
            }
        }

        // cleanup() ran while the model was loading
        let current = self.state();
        warn!("Pipeline became {} during initialization, discarding model", current);
        if next == PipelineState::Ready {
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.lock_loader().unload())
                .await
                .map_err(|e| OcrError::Internal(format!("model unload task failed: {}", e)))?;
        }
        Ok(current)
    }

    /// Extract text from the document at `path`.
    ///
    /// `mode` overrides automatic selection. Files above the streaming
    /// threshold always decode incrementally.
    pub async fn process_file(
        &self,
        path: impl AsRef<Path>,
        format: OutputFormat,
        mode: Option<ModeId>,
        stream: bool,
    ) -> Result<ProcessOutput, OcrError> {
        let path = path.as_ref();
        let start = Instant::now();

        let metadata = std::fs::metadata(path).map_err(|_| OcrError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        if !metadata.is_file() {
            return Err(OcrError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let stream = if metadata.len() > self.inner.config.streaming_threshold_bytes {
            info!(
                "Large file detected ({:.1} MB), using streaming decode",
                metadata.len() as f64 / (1024.0 * 1024.0)
            );
            true
        } else {
            stream
        };

        let mut output = match self.state() {
            PipelineState::Ready => self.process_ready(path, format, mode, stream).await?,
            PipelineState::Degraded => {
                self.inner.observer.on_document_start(path, None);
                self.inner.observer.on_fallback("model not loaded");
                let mut out = self.route(path, format, None, None).await?;
                out.fallback_reason = Some("model not loaded".to_string());
                out
            }
            other => {
                return Err(OcrError::NotReady {
                    state: other.to_string(),
                })
            }
        };

        output.elapsed_ms = start.elapsed().as_millis() as u64;
        self.inner
            .observer
            .on_document_complete(output.engine, output.pages);
        info!(
            "Processed {} with {} engine in {}ms ({} chars)",
            path.display(),
            output.engine,
            output.elapsed_ms,
            output.length
        );
        Ok(output)
    }

    /// Write `bytes` to a managed temporary file and process it.
    ///
    /// The file name's extension is kept so the document type is detected
    /// the same way as for [`process_file`](Self::process_file).
    pub async fn process_bytes(
        &self,
        bytes: &[u8],
        filename: &str,
        format: OutputFormat,
        mode: Option<ModeId>,
        stream: bool,
    ) -> Result<ProcessOutput, OcrError> {
        let suffix = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();

        let file = tempfile::Builder::new()
            .prefix("ocr-upload-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| OcrError::Internal(format!("cannot create temp file: {}", e)))?;
        tokio::fs::write(file.path(), bytes)
            .await
            .map_err(|e| OcrError::Internal(format!("cannot write temp file: {}", e)))?;

        debug!("Staged upload '{}' at {}", filename, file.path().display());
        self.process_file(file.path(), format, mode, stream).await
    }

    /// Run `path` through the router with `engine` forced.
    ///
    /// The primary pipeline takes part when the model is loaded; a failure
    /// of the forced engine still walks the full chain.
    pub async fn process_with_engine(
        &self,
        path: impl AsRef<Path>,
        format: OutputFormat,
        engine: EngineKind,
    ) -> Result<ProcessOutput, OcrError> {
        let path = path.as_ref();
        let start = Instant::now();
        let state = self.state();
        if !state.accepts_requests() {
            return Err(OcrError::NotReady {
                state: state.to_string(),
            });
        }

        let primary = PrimaryEngine {
            pipeline: self.clone(),
        };
        let primary_ref = (state == PipelineState::Ready).then_some(&primary as &dyn OcrEngine);
        let mut output = self.route(path, format, primary_ref, Some(engine)).await?;
        output.elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(output)
    }

    /// Time compression at each benchmark resolution on a synthetic page.
    ///
    /// A failing mode is reported in its own result and does not stop the
    /// others.
    pub async fn benchmark(&self) -> Result<Vec<BenchmarkResult>, OcrError> {
        let state = self.state();
        if state != PipelineState::Ready {
            return Err(OcrError::NotReady {
                state: state.to_string(),
            });
        }

        let mut results = Vec::with_capacity(BENCHMARK_PAIRS.len());
        for (resolution, mode) in BENCHMARK_PAIRS {
            info!("Benchmarking {}x{} ({} mode)", resolution, resolution, mode);
            let inner = Arc::clone(&self.inner);
            let result = tokio::task::spawn_blocking(move || inner.benchmark_one(resolution, mode))
                .await
                .unwrap_or_else(|e| BenchmarkResult {
                    resolution,
                    mode,
                    compression_time_ms: None,
                    vision_tokens: None,
                    memory_used_gb: None,
                    error: Some(format!("benchmark task failed: {}", e)),
                });
            if let Some(ref e) = result.error {
                error!("Benchmark failed for {} mode: {}", mode, e);
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Read-only status snapshot.
    pub async fn system_info(&self) -> SystemInfo {
        let engines = self.inner.router.read().await.availability();
        SystemInfo {
            state: self.state(),
            quantization: self.inner.config.enable_quantization,
            memory_limit_gb: self.inner.config.memory_limit_gb,
            available_engines: engines.engines(),
            engines,
            model: self.model_info(),
            memory: self.memory_stats(),
        }
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner.guard.memory_stats()
    }

    /// Model metadata with current accelerator usage. Never waits on the model.
    pub fn model_info(&self) -> ModelInfo {
        let mut info = self
            .inner
            .model_info
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let ModelInfo::Loaded {
            gpu_memory_allocated_gb,
            gpu_memory_reserved_gb,
            ..
        } = &mut info
        {
            let (allocated, reserved) = match self.memory_stats() {
                MemoryStats::Available {
                    allocated_gb,
                    reserved_gb,
                    ..
                } => (Some(allocated_gb), Some(reserved_gb)),
                MemoryStats::NoAccelerator => (None, None),
            };
            *gpu_memory_allocated_gb = allocated;
            *gpu_memory_reserved_gb = reserved;
        }
        info
    }

    /// Unload the model and force a cache clear. Safe to call repeatedly.
    ///
    /// Waits for any page currently holding the model to finish.
    pub async fn cleanup(&self) {
        let inner = Arc::clone(&self.inner);
        if let Err(e) = tokio::task::spawn_blocking(move || inner.unload()).await {
            error!("Cleanup task failed: {}", e);
        }
    }

    async fn process_ready(
        &self,
        path: &Path,
        format: OutputFormat,
        mode: Option<ModeId>,
        stream: bool,
    ) -> Result<ProcessOutput, OcrError> {
        let (reason, reports) = match self.run_primary(path, format, mode, stream).await {
            Ok(PrimaryOutcome::Completed {
                text,
                mode,
                pages,
                reports,
            }) => {
                let mut out = ProcessOutput::new(text, EngineKind::Primary, PRIMARY_ENGINE_NAME);
                out.mode = Some(mode);
                out.pages = pages;
                out.reports = reports;
                return Ok(out);
            }
            Ok(PrimaryOutcome::Unsafe { page, reports }) => {
                let ratio = reports.last().map(|r| r.ratio).unwrap_or_default();
                let reason = format!(
                    "unsafe compression ratio {:.1}x on page {}, using OCR fallback",
                    ratio, page
                );
                warn!("{}", reason);
                (reason, reports)
            }
            Err(e) if e.is_fatal_for_request() => return Err(e),
            Err(e) => {
                let reason = format!("primary pipeline failed: {}", e);
                error!("{}, falling back to OCR engines", reason);
                (reason, Vec::new())
            }
        };

        self.inner.observer.on_fallback(&reason);
        let mut out = self.route(path, format, None, None).await?;
        out.fallback_reason = Some(reason);
        out.reports = reports;
        Ok(out)
    }

    async fn run_primary(
        &self,
        path: &Path,
        format: OutputFormat,
        mode: Option<ModeId>,
        stream: bool,
    ) -> Result<PrimaryOutcome, OcrError> {
        let mode = match mode {
            Some(m) => m,
            None => {
                let complexity = self.inner.renderer.estimate_complexity(path)?;
                self.inner.encoder.auto_select_mode(complexity)
            }
        };
        self.inner.observer.on_document_start(path, Some(mode));

        let mut pages =
            self.inner
                .renderer
                .render_document(path, self.inner.config.max_pages, mode.config().resolution)?;

        let mut texts = Vec::new();
        let mut reports = Vec::new();
        while let Some(page) = pages.next_page().await {
            let page = page?;
            let page_num = page.index + 1;
            let inner = Arc::clone(&self.inner);
            let outcome =
                tokio::task::spawn_blocking(move || inner.process_page(page, mode, format, stream))
                    .await
                    .map_err(|e| OcrError::Internal(format!("page {} task failed: {}", page_num, e)))??;

            match outcome {
                PageOutcome::Decoded { text, report } => {
                    self.inner.observer.on_page_decoded(page_num, text.len());
                    texts.push(text);
                    reports.push(report);
                }
                PageOutcome::Unsafe { report } => {
                    reports.push(report);
                    return Ok(PrimaryOutcome::Unsafe {
                        page: page_num,
                        reports,
                    });
                }
            }
        }

        if texts.is_empty() {
            return Err(OcrError::Render {
                path: path.to_path_buf(),
                detail: "document has no pages".to_string(),
            });
        }

        Ok(PrimaryOutcome::Completed {
            pages: texts.len(),
            text: join_pages(&texts),
            mode,
            reports,
        })
    }

    async fn route(
        &self,
        path: &Path,
        format: OutputFormat,
        primary: Option<&dyn OcrEngine>,
        force: Option<EngineKind>,
    ) -> Result<ProcessOutput, OcrError> {
        let RouteOutcome {
            text,
            engine,
            engine_name,
            attempts,
        } = self
            .inner
            .router
            .read()
            .await
            .process_document(path, format, primary, force)
            .await?;

        let mut out = ProcessOutput::new(text, engine, engine_name);
        out.failed_attempts = attempts;
        Ok(out)
    }
}

impl Inner {
    fn state(&self) -> PipelineState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, PipelineState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    fn write_model_info(&self) -> std::sync::RwLockWriteGuard<'_, ModelInfo> {
        self.model_info.write().unwrap_or_else(|p| p.into_inner())
    }

    fn unload(&self) {
        let mut loader = self.lock_loader();
        let unloaded = loader.unload();
        self.guard.force_clear_cache();
        let mut state = self.write_state();
        *self.write_model_info() = ModelInfo::NotLoaded;
        *state = PipelineState::Unloaded;
        if unloaded {
            info!("Pipeline cleaned up");
        } else {
            debug!("Cleanup: no model was loaded");
        }
    }

    fn lock_loader(&self) -> MutexGuard<'_, ModelLoader> {
        self.loader.lock().unwrap_or_else(|p| {
            warn!("Model lock poisoned by an earlier panic, recovering");
            p.into_inner()
        })
    }

    /// Compress, check and decode one page while holding the model lock.
    fn process_page(
        &self,
        page: PageImage,
        mode: ModeId,
        format: OutputFormat,
        stream: bool,
    ) -> Result<PageOutcome, OcrError> {
        let page_num = page.index + 1;
        let mut loader = self.lock_loader();
        let model = loader.model_mut().ok_or_else(|| OcrError::NotReady {
            state: "model not loaded".to_string(),
        })?;

        let (tokens, used_mode) = self
            .compressor
            .compress_with_downgrade(&self.encoder, model, &page.image, mode)?;

        let report = monitor_ratio(
            estimate_text_tokens(&page.image),
            tokens.token_count(),
            used_mode,
        );
        self.observer.on_page_encoded(page_num, &report);

        match report.status {
            RatioClass::Error => {
                return Err(OcrError::Compression {
                    page: page_num,
                    detail: report.message,
                })
            }
            RatioClass::Warning => return Ok(PageOutcome::Unsafe { report }),
            RatioClass::Ok | RatioClass::Caution => {}
        }

        let raw = self.decoder.decode(model, &tokens, format, stream)?;
        drop(tokens);
        self.guard.check_threshold();

        debug!("Page {}: decoded {} chars", page_num, raw.len());
        Ok(PageOutcome::Decoded {
            text: clean_output(&raw, format),
            report,
        })
    }

    fn benchmark_one(&self, resolution: u32, mode: ModeId) -> BenchmarkResult {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            resolution,
            resolution,
            Rgb([255, 255, 255]),
        ));
        let mut result = BenchmarkResult {
            resolution,
            mode,
            compression_time_ms: None,
            vision_tokens: None,
            memory_used_gb: None,
            error: None,
        };

        let mut loader = self.lock_loader();
        let Some(model) = loader.model_mut() else {
            result.error = Some("model not loaded".to_string());
            return result;
        };

        let start = Instant::now();
        match self
            .compressor
            .compress_with_fallback(&self.encoder, model, &image, mode)
        {
            Ok(tokens) => {
                result.compression_time_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
                result.vision_tokens = Some(tokens.token_count());
                if let MemoryStats::Available { allocated_gb, .. } = self.guard.memory_stats() {
                    result.memory_used_gb = Some(allocated_gb);
                }
            }
            Err(e) => result.error = Some(e.to_string()),
        }
        self.guard.clear_cache();
        result
    }
}

/// The primary pipeline as a router engine.
///
/// Only used when a caller forces an engine: the controller's own fallback
/// after a primary failure never re-enters the primary pipeline.
struct PrimaryEngine {
    pipeline: Pipeline,
}

#[async_trait]
impl OcrEngine for PrimaryEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Primary
    }

    fn name(&self) -> &str {
        PRIMARY_ENGINE_NAME
    }

    async fn process(&self, path: &Path, format: OutputFormat) -> Result<String, EngineError> {
        match self.pipeline.run_primary(path, format, None, false).await {
            Ok(PrimaryOutcome::Completed { text, .. }) => Ok(text),
            Ok(PrimaryOutcome::Unsafe { page, .. }) => Err(EngineError::new(
                PRIMARY_ENGINE_NAME,
                "ratio",
                format!("unsafe compression ratio on page {}", page),
            )),
            Err(e) => Err(EngineError::new(PRIMARY_ENGINE_NAME, stage_of(&e), e.to_string())),
        }
    }
}

fn stage_of(err: &OcrError) -> String {
    match err {
        OcrError::OutOfResource { stage, .. } | OcrError::Model { stage, .. } => stage.to_string(),
        OcrError::Compression { .. } => "compress".to_string(),
        OcrError::Render { .. } | OcrError::FileNotFound { .. } => "render".to_string(),
        _ => "process".to_string(),
    }
}
