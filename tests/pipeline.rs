//! Controller integration tests with a fake model and fake fallback engines.
//!
//! Run with:
//!   cargo test --test pipeline -- --nocapture

mod common;

use common::*;
use edgequake_ocr::pipeline::compress::estimate_text_tokens;
use edgequake_ocr::prompts::MARKDOWN_PROMPT;
use edgequake_ocr::{
    EngineKind, ModeId, ModelInfo, OcrError, OutputFormat, Pipeline, PipelineState, RatioClass,
    StatusClass,
};
use image::{DynamicImage, Rgb, RgbImage};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Test helpers ─────────────────────────────────────────────────────────────

struct Harness {
    pipeline: Pipeline,
    provider: Arc<FakeProvider>,
    device: Arc<FakeDevice>,
    tertiary: Arc<ScriptedEngine>,
    observer: Arc<RecordingObserver>,
}

fn harness_with(
    provider: Arc<FakeProvider>,
    customise: impl FnOnce(edgequake_ocr::PipelineConfigBuilder) -> edgequake_ocr::PipelineConfigBuilder,
) -> Harness {
    let device = FakeDevice::with_free_gb(8.0);
    let observer = Arc::new(RecordingObserver::default());
    let config = customise(
        config_with(provider.clone(), device.clone()).observer(observer.clone()),
    )
    .build()
    .unwrap();
    let tertiary = ScriptedEngine::ok(EngineKind::Tertiary, "tertiary text");
    let pipeline = Pipeline::with_engines(config, None, Some(tertiary.clone()));
    Harness {
        pipeline,
        provider,
        device,
        tertiary,
        observer,
    }
}

fn harness(behaviour: EncodeBehaviour, text: &str) -> Harness {
    harness_with(FakeProvider::new(behaviour, text), |b| b)
}

// ── Primary path ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ready_pipeline_extracts_with_primary_engine() {
    let h = harness(EncodeBehaviour::Tokens(256), "Invoice 42");
    assert_eq!(h.pipeline.initialize().await.unwrap(), PipelineState::Ready);

    let doc = png(200, 100);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap();

    assert_eq!(out.engine, EngineKind::Primary);
    assert_eq!(out.text, "Invoice 42");
    assert_eq!(out.length, 10);
    assert_eq!(out.status, "success");
    assert_eq!(out.mode, Some(ModeId::Base));
    assert_eq!(out.pages, 1);
    assert_eq!(out.reports[0].status, RatioClass::Ok);
    assert!(out.fallback_reason.is_none());
    assert_eq!(h.tertiary.calls(), 0);
    assert_eq!(h.observer.completed.lock().unwrap().as_slice(), &[EngineKind::Primary]);
}

#[tokio::test]
async fn test_format_selects_decoder_prompt() {
    let h = harness(EncodeBehaviour::Tokens(256), "# Title");
    h.pipeline.initialize().await.unwrap();
    let doc = png(300, 300);
    h.pipeline
        .process_file(doc.path(), OutputFormat::Markdown, None, false)
        .await
        .unwrap();
    assert_eq!(h.provider.log.prompts.lock().unwrap()[0], MARKDOWN_PROMPT);
}

#[tokio::test]
async fn test_explicit_mode_overrides_selection() {
    let h = harness(EncodeBehaviour::Tokens(64), "small page");
    h.pipeline.initialize().await.unwrap();
    let doc = png(400, 300);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, Some(ModeId::Tiny), false)
        .await
        .unwrap();
    assert_eq!(out.mode, Some(ModeId::Tiny));
    assert!(h
        .provider
        .log
        .encodes
        .lock()
        .unwrap()
        .iter()
        .all(|(mode, _)| *mode == ModeId::Tiny));
}

#[tokio::test]
async fn test_accelerator_oom_recovers_on_host() {
    let h = harness(EncodeBehaviour::OomOnAccelerator(256), "recovered");
    h.pipeline.initialize().await.unwrap();
    let doc = png(200, 200);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap();

    assert_eq!(out.engine, EngineKind::Primary);
    assert_eq!(out.text, "recovered");
    let encodes = h.provider.log.encodes.lock().unwrap().clone();
    assert_eq!(
        encodes,
        vec![
            (ModeId::Base, edgequake_ocr::Placement::Accelerator),
            (ModeId::Base, edgequake_ocr::Placement::Host),
        ]
    );
}

#[tokio::test]
async fn test_oom_on_host_downgrades_to_tiny_mode() {
    let h = harness(EncodeBehaviour::OomAboveFloor(64), "downgraded");
    h.pipeline.initialize().await.unwrap();
    // 1024x1024 after rendering in base mode: 209 estimated text tokens
    let doc = png(1024, 1024);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, Some(ModeId::Base), false)
        .await
        .unwrap();

    assert_eq!(out.engine, EngineKind::Primary);
    assert_eq!(out.text, "downgraded");
    let encodes = h.provider.log.encodes.lock().unwrap().clone();
    assert_eq!(
        encodes,
        vec![
            (ModeId::Base, edgequake_ocr::Placement::Accelerator),
            (ModeId::Base, edgequake_ocr::Placement::Host),
            (ModeId::Tiny, edgequake_ocr::Placement::Accelerator),
        ]
    );
    // ratio judged against the mode that produced the tokens
    assert_eq!(out.reports[0].mode, ModeId::Tiny);
    assert_ne!(out.reports[0].status, RatioClass::Warning);
    assert_eq!(h.tertiary.calls(), 0);
}

#[tokio::test]
async fn test_large_files_take_streaming_decode() {
    let h = harness_with(FakeProvider::new(EncodeBehaviour::Tokens(256), "streamed text"), |b| {
        b.streaming_threshold_bytes(1).cache_clear_every(2)
    });
    h.pipeline.initialize().await.unwrap();
    let before = h.device.clear_count();
    let doc = png(200, 200);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap();
    assert_eq!(out.text, "streamed text");
    // one clear per two streamed characters on top of the guard clears
    assert!(h.device.clear_count() - before >= "streamed text".len() / 2);
}

#[tokio::test]
async fn test_process_bytes_keeps_extension() {
    let h = harness(EncodeBehaviour::Tokens(256), "from upload");
    h.pipeline.initialize().await.unwrap();
    let doc = png(120, 80);
    let bytes = std::fs::read(doc.path()).unwrap();
    let out = h
        .pipeline
        .process_bytes(&bytes, "upload.png", OutputFormat::Text, None, false)
        .await
        .unwrap();
    assert_eq!(out.text, "from upload");
}

// ── Rerouting ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_warning_ratio_reroutes_whole_document() {
    let h = harness(EncodeBehaviour::Tokens(8), "must never be returned");
    h.pipeline.initialize().await.unwrap();
    let doc = png(200, 200);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap();

    assert_eq!(out.engine, EngineKind::Tertiary);
    assert_eq!(out.text, "tertiary text");
    assert_eq!(out.mode, None);
    let last = out.reports.last().unwrap();
    assert_eq!(last.status, RatioClass::Warning);
    assert!(last.ratio > 10.0);
    assert!(out
        .fallback_reason
        .as_deref()
        .unwrap()
        .contains("unsafe compression ratio"));
    assert!(h.provider.log.prompts.lock().unwrap().is_empty());
    assert_eq!(h.observer.fallbacks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unsafe_second_page_discards_first_page_text() {
    let Some(doc) = blank_pdf(2) else {
        println!("SKIP: pdfium not available");
        return;
    };
    let h = harness(
        EncodeBehaviour::SafeThenUnsafe {
            first: 256,
            rest: 8,
        },
        "page one text",
    );
    h.pipeline.initialize().await.unwrap();
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, Some(ModeId::Base), false)
        .await
        .unwrap();

    assert_eq!(out.engine, EngineKind::Tertiary);
    assert_eq!(out.text, "tertiary text");
    assert!(!out.text.contains("page one"));
    assert_eq!(out.reports.len(), 2);
    assert_eq!(out.reports[0].status, RatioClass::Ok);
    assert_eq!(out.reports[1].status, RatioClass::Warning);
    assert_eq!(h.observer.decoded.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(h.tertiary.calls(), 1);
}

#[tokio::test]
async fn test_zero_tokens_is_a_distinct_error_then_falls_back() {
    let h = harness(EncodeBehaviour::Tokens(0), "unused");
    h.pipeline.initialize().await.unwrap();
    let doc = png(200, 200);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap();

    assert_eq!(out.engine, EngineKind::Tertiary);
    assert!(out
        .fallback_reason
        .as_deref()
        .unwrap()
        .contains("invalid compression"));
    let reports = h.observer.reports.lock().unwrap();
    assert_eq!(reports[0].status, RatioClass::Error);
    assert_eq!(reports[0].ratio, 0.0);
}

#[tokio::test]
async fn test_load_failure_enters_degraded_mode() {
    let h = harness_with(FakeProvider::failing(), |b| b);
    assert_eq!(h.pipeline.initialize().await.unwrap(), PipelineState::Degraded);

    let doc = png(200, 200);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap();
    assert_eq!(out.engine, EngineKind::Tertiary);
    assert!(out.used_fallback());
    assert_eq!(
        h.provider.loads.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn test_forced_engine_goes_through_router() {
    let h = harness(EncodeBehaviour::Tokens(256), "primary text");
    h.pipeline.initialize().await.unwrap();
    let doc = png(200, 200);

    let out = h
        .pipeline
        .process_with_engine(doc.path(), OutputFormat::Text, EngineKind::Tertiary)
        .await
        .unwrap();
    assert_eq!(out.engine, EngineKind::Tertiary);

    let out = h
        .pipeline
        .process_with_engine(doc.path(), OutputFormat::Text, EngineKind::Primary)
        .await
        .unwrap();
    assert_eq!(out.engine, EngineKind::Primary);
    assert_eq!(out.text, "primary text");
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_file_is_client_error() {
    let h = harness(EncodeBehaviour::Tokens(256), "x");
    h.pipeline.initialize().await.unwrap();
    let err = h
        .pipeline
        .process_file("/definitely/not/here.pdf", OutputFormat::Text, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::FileNotFound { .. }));
    assert_eq!(err.status_class(), StatusClass::ClientError);
    assert_eq!(h.tertiary.calls(), 0);
}

#[tokio::test]
async fn test_corrupt_image_is_not_rerouted() {
    let h = harness(EncodeBehaviour::Tokens(256), "x");
    h.pipeline.initialize().await.unwrap();
    let bad = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
    std::fs::write(bad.path(), b"not a png at all").unwrap();
    let err = h
        .pipeline
        .process_file(bad.path(), OutputFormat::Text, Some(ModeId::Tiny), false)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::Render { .. }), "got {err:?}");
    assert_eq!(h.tertiary.calls(), 0);
}

#[test]
fn test_unknown_format_fails_closed() {
    let err = "docx".parse::<OutputFormat>().unwrap_err();
    assert!(matches!(err, OcrError::UnsupportedFormat { .. }));
    assert_eq!(err.status_class(), StatusClass::ClientError);
}

#[tokio::test]
async fn test_uninitialised_pipeline_is_service_unavailable() {
    let h = harness(EncodeBehaviour::Tokens(256), "x");
    let doc = png(10, 10);
    let err = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap_err();
    assert_eq!(err.status_class(), StatusClass::ServiceUnavailable);
}

// ── Lifecycle, status and benchmark ──────────────────────────────────────────

#[tokio::test]
async fn test_cleanup_twice_leaves_unloaded() {
    let h = harness(EncodeBehaviour::Tokens(256), "x");
    h.pipeline.initialize().await.unwrap();
    h.pipeline.cleanup().await;
    h.pipeline.cleanup().await;
    assert_eq!(h.pipeline.state(), PipelineState::Unloaded);
    assert_eq!(h.pipeline.model_info(), ModelInfo::NotLoaded);

    let doc = png(10, 10);
    let err = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::NotReady { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cleanup_during_initialize_wins() {
    let provider = FakeProvider::slow(EncodeBehaviour::Tokens(256), "x", Duration::from_millis(400));
    let h = harness_with(provider, |b| b);

    let pipeline = h.pipeline.clone();
    let init = tokio::spawn(async move { pipeline.initialize().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.pipeline.state(), PipelineState::Initializing);

    h.pipeline.cleanup().await;
    init.await.unwrap().unwrap();

    assert_eq!(h.pipeline.state(), PipelineState::Unloaded);
    assert_eq!(h.pipeline.model_info(), ModelInfo::NotLoaded);
    let doc = png(10, 10);
    let err = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, OcrError::NotReady { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_does_not_wait_for_model_load() {
    let provider = FakeProvider::slow(EncodeBehaviour::Tokens(256), "x", Duration::from_millis(400));
    let h = harness_with(provider, |b| b);

    let pipeline = h.pipeline.clone();
    let init = tokio::spawn(async move { pipeline.initialize().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    assert_eq!(h.pipeline.model_info(), ModelInfo::NotLoaded);
    let info = tokio::time::timeout(Duration::from_millis(250), h.pipeline.system_info())
        .await
        .expect("system_info blocked on the model load");
    assert_eq!(info.state, PipelineState::Initializing);
    assert!(start.elapsed() < Duration::from_millis(250));

    assert_eq!(init.await.unwrap().unwrap(), PipelineState::Ready);
    assert!(matches!(h.pipeline.model_info(), ModelInfo::Loaded { .. }));
}

#[tokio::test]
async fn test_system_info_reports_engines_and_model() {
    let h = harness(EncodeBehaviour::Tokens(256), "x");
    h.pipeline.initialize().await.unwrap();
    let info = h.pipeline.system_info().await;

    assert_eq!(info.state, PipelineState::Ready);
    assert!(info.quantization);
    assert_eq!(info.available_engines, vec![EngineKind::Primary, EngineKind::Tertiary]);
    assert!(matches!(info.model, ModelInfo::Loaded { quantized: true, .. }));
    assert!(info.memory.is_available());

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["state"], "ready");
    assert_eq!(json["model"]["status"], "loaded");
}

#[tokio::test]
async fn test_benchmark_tolerates_per_mode_failure() {
    let h = harness(EncodeBehaviour::FailInBase(64), "x");
    h.pipeline.initialize().await.unwrap();
    let results = h.pipeline.benchmark().await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(
        results.iter().map(|r| (r.resolution, r.mode)).collect::<Vec<_>>(),
        vec![(512, ModeId::Tiny), (640, ModeId::Small), (1024, ModeId::Base)]
    );
    assert!(results[0].is_ok());
    assert_eq!(results[0].vision_tokens, Some(64));
    assert!(results[1].is_ok());
    assert!(!results[2].is_ok());
}

#[tokio::test]
async fn test_benchmark_requires_loaded_model() {
    let h = harness_with(FakeProvider::failing(), |b| b);
    h.pipeline.initialize().await.unwrap();
    let err = h.pipeline.benchmark().await.unwrap_err();
    assert_eq!(err.status_class(), StatusClass::ServiceUnavailable);
}

// ── Ratio heuristic ──────────────────────────────────────────────────────────
//
// The text-token estimate looks only at pixel area, so it can send a blank
// page to the fallback engines and wave a dense page through.

#[tokio::test]
async fn test_heuristic_can_reroute_a_blank_page() {
    let h = harness(EncodeBehaviour::Tokens(8), "blank");
    h.pipeline.initialize().await.unwrap();
    let doc = png(64, 64);
    let out = h
        .pipeline
        .process_file(doc.path(), OutputFormat::Text, Some(ModeId::Tiny), false)
        .await
        .unwrap();
    assert_eq!(out.engine, EngineKind::Tertiary);
}

#[test]
fn test_heuristic_ignores_page_content() {
    let blank = DynamicImage::new_rgb8(800, 800);
    let mut dense = RgbImage::new(800, 800);
    for (x, y, p) in dense.enumerate_pixels_mut() {
        *p = if (x / 3 + y / 5) % 2 == 0 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        };
    }
    assert_eq!(
        estimate_text_tokens(&blank),
        estimate_text_tokens(&DynamicImage::ImageRgb8(dense))
    );
}
