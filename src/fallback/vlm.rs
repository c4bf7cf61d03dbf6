//! Secondary engine: page images sent to a vision LLM.
//!
//! Each page is rasterised at the fallback size, PNG-encoded to base64 and
//! sent as one chat turn. Calls are retried with exponential backoff
//! (`retry_backoff_ms * 2^attempt`) and bounded by a per-call timeout, so a
//! stalled provider turns into an [`EngineError`] instead of a hung request.

use crate::config::PipelineConfig;
use crate::error::{EngineError, OcrError};
use crate::fallback::{EngineKind, OcrEngine};
use crate::pipeline::decode::OutputFormat;
use crate::pipeline::postprocess::{clean_output, join_pages};
use crate::pipeline::render::DocumentRenderer;
use crate::prompts::{continuation_context, vlm_format_instruction, VLM_SYSTEM_PROMPT};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

const ENGINE_NAME: &str = "vlm";
const DEFAULT_VLM_MODEL: &str = "gpt-4.1-nano";

/// Vision-LLM OCR engine.
pub struct VlmEngine {
    provider: Arc<dyn LLMProvider>,
    renderer: DocumentRenderer,
    render_size: u32,
    max_pages: Option<usize>,
    system_prompt: String,
    max_retries: u32,
    retry_backoff_ms: u64,
    call_timeout: Duration,
}

impl VlmEngine {
    /// Build the engine from config, resolving a provider.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, OcrError> {
        let provider = resolve_provider(config)?;
        Ok(Self::with_provider(provider, config))
    }

    /// Build the engine around an existing provider.
    pub fn with_provider(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            renderer: DocumentRenderer::new(config.target_dpi),
            render_size: config.fallback_render_size,
            max_pages: config.max_pages,
            system_prompt: config
                .vlm_system_prompt
                .clone()
                .unwrap_or_else(|| VLM_SYSTEM_PROMPT.to_string()),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            call_timeout: Duration::from_secs(config.api_timeout_secs.max(1)),
        }
    }

    async fn transcribe_page(
        &self,
        page_num: usize,
        total_pages: usize,
        image: &DynamicImage,
        format: OutputFormat,
    ) -> Result<String, EngineError> {
        let image_data = encode_page(image)
            .map_err(|e| EngineError::new(ENGINE_NAME, "encode", e))?;
        let messages = build_messages(&self.system_prompt, page_num, total_pages, format, image_data);
        let options = build_options();

        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_delay(self.retry_backoff_ms, attempt);
                warn!(
                    "Page {}: retry {}/{} after {:?}",
                    page_num, attempt, self.max_retries, backoff
                );
                sleep(backoff).await;
            }

            match timeout(self.call_timeout, self.provider.chat(&messages, Some(&options))).await {
                Ok(Ok(response)) => {
                    debug!(
                        "Page {}: {} input tokens, {} output tokens",
                        page_num, response.prompt_tokens, response.completion_tokens
                    );
                    return Ok(clean_output(&response.content, format));
                }
                Ok(Err(e)) => {
                    warn!("Page {}: attempt {} failed: {}", page_num, attempt + 1, e);
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    warn!(
                        "Page {}: attempt {} timed out after {:?}",
                        page_num,
                        attempt + 1,
                        self.call_timeout
                    );
                    last_err = Some(format!("timed out after {:?}", self.call_timeout));
                }
            }
        }

        Err(EngineError::new(
            ENGINE_NAME,
            "chat",
            format!(
                "page {} failed after {} retries: {}",
                page_num,
                self.max_retries,
                last_err.unwrap_or_else(|| "unknown error".to_string())
            ),
        ))
    }
}

#[async_trait]
impl OcrEngine for VlmEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Secondary
    }

    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn probe(&self) -> Result<String, EngineError> {
        Ok(format!("{} ({})", self.provider.name(), self.provider.model()))
    }

    async fn process(&self, path: &Path, format: OutputFormat) -> Result<String, EngineError> {
        // counted before the render thread opens the document
        let total = self
            .renderer
            .page_count(path, self.max_pages)
            .map_err(|e| EngineError::new(ENGINE_NAME, "render", e.to_string()))?;

        let mut pages = self
            .renderer
            .render_document(path, self.max_pages, self.render_size)
            .map_err(|e| EngineError::new(ENGINE_NAME, "render", e.to_string()))?;

        let mut texts = Vec::with_capacity(total);
        while let Some(page) = pages.next_page().await {
            let page = page.map_err(|e| EngineError::new(ENGINE_NAME, "render", e.to_string()))?;
            texts.push(
                self.transcribe_page(page.index + 1, total, &page.image, format)
                    .await?,
            );
        }
        info!("{}: transcribed {} page(s)", ENGINE_NAME, texts.len());
        Ok(join_pages(&texts))
    }
}

/// Delay before retry `attempt` (1-based): `base_ms * 2^(attempt - 1)`,
/// saturating instead of overflowing.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// PNG-encode a page for a vision message.
fn encode_page(image: &DynamicImage) -> Result<ImageData, String> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| format!("PNG encoding failed: {}", e))?;
    let b64 = STANDARD.encode(buf.into_inner());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

fn build_messages(
    system_prompt: &str,
    page_num: usize,
    total_pages: usize,
    format: OutputFormat,
    image: ImageData,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    if total_pages > 1 {
        messages.push(ChatMessage::system(continuation_context(page_num, total_pages)));
    }
    messages.push(ChatMessage::user_with_images(
        vlm_format_instruction(format),
        vec![image],
    ));
    messages
}

fn build_options() -> CompletionOptions {
    CompletionOptions {
        temperature: Some(0.1),
        max_tokens: Some(4096),
        ..Default::default()
    }
}

/// Resolve the vision-LLM provider, from most-specific to least-specific.
///
/// 1. Pre-built provider (`config.llm_provider`)
/// 2. Named provider (`config.vlm_provider`) with `config.vlm_model`
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set
/// 4. OpenAI when `OPENAI_API_KEY` is set
/// 5. Whatever [`ProviderFactory::from_env`] detects
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, OcrError> {
    if let Some(ref provider) = config.llm_provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.vlm_provider {
        let model = config.vlm_model.as_deref().unwrap_or(DEFAULT_VLM_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.vlm_model.as_deref().unwrap_or(DEFAULT_VLM_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
        OcrError::InvalidConfig(format!(
            "no vision-LLM provider could be auto-detected from environment \
             (set OPENAI_API_KEY, ANTHROPIC_API_KEY, or EDGEQUAKE_LLM_PROVIDER): {}",
            e
        ))
    })?;
    Ok(llm_provider)
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, OcrError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        OcrError::InvalidConfig(format!(
            "vision-LLM provider '{}' not configured: {}",
            provider_name, e
        ))
    })
}
