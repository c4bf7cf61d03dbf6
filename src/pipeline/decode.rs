//! Decoding: [`CompressedTokens`] → text in the requested output format.
//!
//! Two paths share one prompt table. [`Decoder::decode`] without streaming
//! performs one generation call. [`Decoder::decode_stream`] returns a
//! [`DecodeStream`] iterator that yields text units as the model produces
//! them and clears the accelerator cache every `cache_clear_every` units.
//! Consumers cancel by dropping the iterator; nothing else needs cleaning up.

use crate::error::OcrError;
use crate::model::{CompressedTokens, DocumentModel, GenerateOptions, TextUnits};
use crate::modes::ModeId;
use crate::prompts;
use crate::resources::ResourceGuard;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Decode units between proactive cache clears.
pub const DEFAULT_CACHE_CLEAR_EVERY: usize = 100;

/// Requested shape of the extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Markdown,
    Html,
    Grounding,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Text,
        OutputFormat::Markdown,
        OutputFormat::Html,
        OutputFormat::Grounding,
    ];

    /// Fixed decoder prompt for this format.
    pub fn prompt(self) -> &'static str {
        match self {
            OutputFormat::Text => prompts::TEXT_PROMPT,
            OutputFormat::Markdown => prompts::MARKDOWN_PROMPT,
            OutputFormat::Html => prompts::HTML_PROMPT,
            OutputFormat::Grounding => prompts::GROUNDING_PROMPT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Markdown => "markdown",
            OutputFormat::Html => "html",
            OutputFormat::Grounding => "grounding",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "html" => Ok(OutputFormat::Html),
            "grounding" => Ok(OutputFormat::Grounding),
            _ => Err(OcrError::UnsupportedFormat {
                format: s.to_string(),
            }),
        }
    }
}

/// Turns compressed tokens into text.
#[derive(Debug, Clone)]
pub struct Decoder {
    guard: ResourceGuard,
    options: GenerateOptions,
    cache_clear_every: usize,
}

impl Decoder {
    pub fn new(guard: ResourceGuard, max_new_tokens: usize) -> Self {
        Self {
            guard,
            options: GenerateOptions {
                max_new_tokens,
                ..GenerateOptions::default()
            },
            cache_clear_every: DEFAULT_CACHE_CLEAR_EVERY,
        }
    }

    /// Change the streaming cache-clear cadence (minimum 1).
    pub fn with_cache_clear_every(mut self, units: usize) -> Self {
        self.cache_clear_every = units.max(1);
        self
    }

    pub fn set_max_new_tokens(&mut self, max_tokens: usize) {
        self.options.max_new_tokens = max_tokens;
        debug!("Set max_new_tokens to {}", max_tokens);
    }

    pub fn options(&self) -> &GenerateOptions {
        &self.options
    }

    /// Decode `tokens` to completion.
    ///
    /// With `stream` set, the text is assembled from [`decode_stream`]
    /// so the cache-clear cadence applies.
    ///
    /// [`decode_stream`]: Self::decode_stream
    pub fn decode(
        &self,
        model: &mut dyn DocumentModel,
        tokens: &CompressedTokens,
        format: OutputFormat,
        stream: bool,
    ) -> Result<String, OcrError> {
        if stream {
            return self.decode_stream(model, tokens, format)?.collect();
        }

        let _scope = self.guard.acquire("decode");
        model
            .generate(tokens, format.prompt(), &self.options)
            .map_err(|e| OcrError::from_model(e, "decode", tokens.mode()))
    }

    /// Start an incremental decode.
    pub fn decode_stream<'a>(
        &'a self,
        model: &'a mut dyn DocumentModel,
        tokens: &'a CompressedTokens,
        format: OutputFormat,
    ) -> Result<DecodeStream<'a>, OcrError> {
        let units = model
            .generate_stream(tokens, format.prompt(), &self.options)
            .map_err(|e| OcrError::from_model(e, "decode", tokens.mode()))?;
        Ok(DecodeStream {
            units,
            guard: &self.guard,
            every: self.cache_clear_every,
            emitted: 0,
            mode: tokens.mode(),
        })
    }
}

/// Lazy, finite, non-restartable sequence of decoded text units.
pub struct DecodeStream<'a> {
    units: TextUnits<'a>,
    guard: &'a ResourceGuard,
    every: usize,
    emitted: usize,
    mode: ModeId,
}

impl DecodeStream<'_> {
    /// Units yielded so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

impl Iterator for DecodeStream<'_> {
    type Item = Result<String, OcrError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.units.next()? {
            Ok(unit) => {
                self.emitted += 1;
                if self.emitted % self.every == 0 {
                    self.guard.clear_cache();
                    debug!("Generated {} units, cleared cache", self.emitted);
                }
                Some(Ok(unit))
            }
            Err(e) => Some(Err(OcrError::from_model(e, "decode", self.mode))),
        }
    }
}
