//! Tertiary engine: the Tesseract command-line OCR tool.
//!
//! Pages are rendered at the fallback size, written as temporary PNGs and
//! passed to `tesseract <png> stdout -l <lang>`. The engine works without an
//! accelerator and without network access, so it is the last link of the
//! fallback chain.

use crate::config::PipelineConfig;
use crate::error::EngineError;
use crate::fallback::{EngineKind, OcrEngine};
use crate::pipeline::decode::OutputFormat;
use crate::pipeline::postprocess::{clean_output, join_pages};
use crate::pipeline::render::DocumentRenderer;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

const ENGINE_NAME: &str = "tesseract";

/// Tesseract OCR engine.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    cmd: String,
    lang: String,
    renderer: DocumentRenderer,
    render_size: u32,
    max_pages: Option<usize>,
    call_timeout: Duration,
}

impl TesseractEngine {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            cmd: config.tesseract_cmd.clone(),
            lang: config.tesseract_lang.clone(),
            renderer: DocumentRenderer::new(config.target_dpi),
            render_size: config.fallback_render_size,
            max_pages: config.max_pages,
            call_timeout: Duration::from_secs(config.api_timeout_secs.max(1)),
        }
    }

    async fn run(&self, args: &[&str], stage: &str) -> Result<String, EngineError> {
        let child = Command::new(&self.cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.call_timeout, child)
            .await
            .map_err(|_| {
                EngineError::new(
                    ENGINE_NAME,
                    stage,
                    format!("timed out after {:?}", self.call_timeout),
                )
            })?
            .map_err(|e| EngineError::new(ENGINE_NAME, "spawn", format!("{}: {}", self.cmd, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::new(
                ENGINE_NAME,
                stage,
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn recognise_page(
        &self,
        image: &image::DynamicImage,
        format: OutputFormat,
    ) -> Result<String, EngineError> {
        let file = tempfile::Builder::new()
            .prefix("ocr-page-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| EngineError::new(ENGINE_NAME, "tempfile", e.to_string()))?;
        image
            .save_with_format(file.path(), image::ImageFormat::Png)
            .map_err(|e| EngineError::new(ENGINE_NAME, "tempfile", e.to_string()))?;

        let page_path = file.path().to_string_lossy().into_owned();
        let raw = self
            .run(&[&page_path, "stdout", "-l", &self.lang], "recognise")
            .await?;
        Ok(clean_output(&raw, format))
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Tertiary
    }

    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn probe(&self) -> Result<String, EngineError> {
        let out = self.run(&["--version"], "probe").await?;
        Ok(out.lines().next().unwrap_or(ENGINE_NAME).trim().to_string())
    }

    async fn process(&self, path: &Path, format: OutputFormat) -> Result<String, EngineError> {
        let mut pages = self
            .renderer
            .render_document(path, self.max_pages, self.render_size)
            .map_err(|e| EngineError::new(ENGINE_NAME, "render", e.to_string()))?;

        let mut texts = Vec::new();
        while let Some(page) = pages.next_page().await {
            let page = page.map_err(|e| EngineError::new(ENGINE_NAME, "render", e.to_string()))?;
            debug!("{}: page {}", ENGINE_NAME, page.index + 1);
            texts.push(self.recognise_page(&page.image, format).await?);
        }
        info!("{}: recognised {} page(s)", ENGINE_NAME, texts.len());
        Ok(join_pages(&texts))
    }
}
