//! Fakes shared by the integration tests.
//!
//! Each integration test binary compiles this module separately, so not
//! every helper is used everywhere.
#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_ocr::model::{GenerateOptions, ModelDescriptor};
use edgequake_ocr::{
    CompressedTokens, CompressionRatioReport, DeviceMemory, DocumentModel, EngineError,
    EngineKind, ImageTensor, LoadRequest, ModeId, ModelError, ModelProvider, OcrEngine,
    OutputFormat, PipelineConfig, Placement, ProcessingObserver,
};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Accelerator ──────────────────────────────────────────────────────────────

/// Accelerator with a fixed amount of free memory.
pub struct FakeDevice {
    pub free: AtomicU64,
    pub allocated: AtomicU64,
    pub reserved: AtomicU64,
    pub clears: AtomicUsize,
}

impl FakeDevice {
    pub fn with_free_gb(gb: f64) -> Arc<Self> {
        Arc::new(Self {
            free: AtomicU64::new((gb * 1e9) as u64),
            allocated: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            clears: AtomicUsize::new(0),
        })
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl DeviceMemory for FakeDevice {
    fn device_name(&self) -> Option<String> {
        Some("Test GPU".into())
    }
    fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }
    fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }
    fn mem_info(&self) -> (u64, u64) {
        (self.free.load(Ordering::SeqCst), 16_000_000_000)
    }
    fn empty_cache(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Model ────────────────────────────────────────────────────────────────────

/// How the fake model's encoder behaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodeBehaviour {
    /// Always return this many visual tokens.
    Tokens(usize),
    /// OOM while the weights are on the accelerator, `n` tokens on the host.
    OomOnAccelerator(usize),
    /// Backend failure in `base` mode only, `n` tokens otherwise.
    FailInBase(usize),
    /// OOM on every placement unless encoding at the floor mode.
    OomAboveFloor(usize),
    /// `first` tokens for the first encode, `rest` for every later one.
    SafeThenUnsafe { first: usize, rest: usize },
}

#[derive(Default)]
pub struct ModelLog {
    pub encodes: Mutex<Vec<(ModeId, Placement)>>,
    pub prompts: Mutex<Vec<String>>,
}

pub struct FakeModel {
    placement: Placement,
    behaviour: EncodeBehaviour,
    text: String,
    log: Arc<ModelLog>,
}

impl DocumentModel for FakeModel {
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
        let encodes = {
            let mut log = self.log.encodes.lock().unwrap();
            log.push((mode, self.placement));
            log.len()
        };
        let n = match self.behaviour {
            EncodeBehaviour::Tokens(n) => n,
            EncodeBehaviour::OomOnAccelerator(n) => {
                if self.placement == Placement::Accelerator {
                    return Err(ModelError::oom("tried to allocate 2.00 GiB"));
                }
                n
            }
            EncodeBehaviour::FailInBase(n) => {
                if mode == ModeId::Base {
                    return Err(ModelError::backend("kernel launch failed"));
                }
                n
            }
            EncodeBehaviour::OomAboveFloor(n) => {
                if mode != ModeId::FLOOR {
                    return Err(ModelError::oom("tried to allocate 6.00 GiB"));
                }
                n
            }
            EncodeBehaviour::SafeThenUnsafe { first, rest } => {
                if encodes == 1 {
                    first
                } else {
                    rest
                }
            }
        };
        Ok(CompressedTokens::new(
            vec![0.25; n * 8],
            vec![1, n, 8],
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
        self.log.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.text.clone())
    }
}

/// Provider that builds a [`FakeModel`], or fails to.
pub struct FakeProvider {
    pub behaviour: EncodeBehaviour,
    pub text: String,
    pub fail: bool,
    pub log: Arc<ModelLog>,
    pub loads: AtomicUsize,
    pub load_delay: Option<Duration>,
}

impl FakeProvider {
    pub fn new(behaviour: EncodeBehaviour, text: &str) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            text: text.to_string(),
            fail: false,
            log: Arc::new(ModelLog::default()),
            loads: AtomicUsize::new(0),
            load_delay: None,
        })
    }

    /// Like [`FakeProvider::new`], but each load blocks for `delay`.
    pub fn slow(behaviour: EncodeBehaviour, text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            text: text.to_string(),
            fail: false,
            log: Arc::new(ModelLog::default()),
            loads: AtomicUsize::new(0),
            load_delay: Some(delay),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            behaviour: EncodeBehaviour::Tokens(64),
            text: String::new(),
            fail: true,
            log: Arc::new(ModelLog::default()),
            loads: AtomicUsize::new(0),
            load_delay: None,
        })
    }
}

impl ModelProvider for FakeProvider {
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn DocumentModel>, ModelError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            return Err(ModelError::backend(format!(
                "could not download {}",
                request.model_name
            )));
        }
        Ok(Box::new(FakeModel {
            placement: Placement::Accelerator,
            behaviour: self.behaviour,
            text: self.text.clone(),
            log: Arc::clone(&self.log),
        }))
    }
}

// ── Fallback engines ─────────────────────────────────────────────────────────

/// Engine that returns fixed text or a fixed failure.
pub struct ScriptedEngine {
    kind: EngineKind,
    result: Result<String, String>,
    pub calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn ok(kind: EngineKind, text: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(kind: EngineKind, detail: &str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result: Err(detail.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn process(&self, _path: &Path, _format: OutputFormat) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
            .clone()
            .map_err(|detail| EngineError::new(self.name(), "process", detail))
    }
}

// ── Observer ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingObserver {
    pub reports: Mutex<Vec<CompressionRatioReport>>,
    pub decoded: AtomicUsize,
    pub fallbacks: Mutex<Vec<String>>,
    pub completed: Mutex<Vec<EngineKind>>,
}

impl ProcessingObserver for RecordingObserver {
    fn on_page_encoded(&self, _page_num: usize, report: &CompressionRatioReport) {
        self.reports.lock().unwrap().push(report.clone());
    }

    fn on_page_decoded(&self, _page_num: usize, _text_len: usize) {
        self.decoded.fetch_add(1, Ordering::SeqCst);
    }

    fn on_fallback(&self, reason: &str) {
        self.fallbacks.lock().unwrap().push(reason.to_string());
    }

    fn on_document_complete(&self, engine: EngineKind, _pages: usize) {
        self.completed.lock().unwrap().push(engine);
    }
}

// ── Documents and config ─────────────────────────────────────────────────────

/// Write a white PNG of `w`×`h` to a temp file.
pub fn png(w: u32, h: u32) -> tempfile::NamedTempFile {
    let f = tempfile::Builder::new()
        .prefix("page-")
        .suffix(".png")
        .tempfile()
        .unwrap();
    DynamicImage::new_rgb8(w, h).save(f.path()).unwrap();
    f
}

/// Write a PDF of `pages` blank A4 pages, or `None` when pdfium cannot be bound.
pub fn blank_pdf(pages: usize) -> Option<tempfile::NamedTempFile> {
    let pdfium = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(lib) => Pdfium::bind_to_library(lib).ok()?,
        Err(_) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())
            .ok()?,
    };
    let pdfium = Pdfium::new(pdfium);
    let mut document = pdfium.create_new_pdf().ok()?;
    for _ in 0..pages {
        document
            .pages_mut()
            .create_page_at_end(PdfPagePaperSize::a4())
            .ok()?;
    }
    let f = tempfile::Builder::new()
        .prefix("doc-")
        .suffix(".pdf")
        .tempfile()
        .ok()?;
    document.save_to_file(f.path()).ok()?;
    Some(f)
}

pub fn offload_dir() -> PathBuf {
    std::env::temp_dir().join("edgequake-ocr-it-offload")
}

/// Config with the given model provider and an 8 GB accelerator.
pub fn config_with(
    provider: Arc<dyn ModelProvider>,
    device: Arc<FakeDevice>,
) -> edgequake_ocr::PipelineConfigBuilder {
    PipelineConfig::builder()
        .offload_dir(offload_dir())
        .model_provider(provider)
        .device(device)
        .enable_vlm(false)
}
