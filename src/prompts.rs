//! Prompt templates.
//!
//! The decoder's templates are a closed table keyed by
//! [`crate::pipeline::decode::OutputFormat`]; the model was trained on these
//! exact strings, so they are not configurable. The vision-LLM fallback
//! engine gets a conventional system prompt plus a per-format instruction;
//! callers can replace the system prompt via
//! [`crate::config::PipelineConfigBuilder::vlm_system_prompt`].

/// Plain text transcription.
pub const TEXT_PROMPT: &str = "<image>\nFree OCR.";

/// Markdown with layout grounding.
pub const MARKDOWN_PROMPT: &str = "<image>\n<|grounding|>Convert the document to markdown.";

/// Tables as HTML.
pub const HTML_PROMPT: &str = "<image>\nParse as HTML table.";

/// Text with bounding boxes.
pub const GROUNDING_PROMPT: &str = "<image>\n<|grounding|>Extract text with bounding boxes.";

/// Default system prompt for the vision-LLM fallback engine.
pub const VLM_SYSTEM_PROMPT: &str = r#"You are an OCR engine. Transcribe the text in the page image exactly.

Follow these rules precisely:

1. TEXT PRESERVATION
   - Preserve ALL text content completely and accurately
   - Keep the reading order a human would use
   - Do not translate, summarise or correct the text

2. WHAT TO IGNORE
   - Decorative borders and lines that carry no content meaning

3. OUTPUT
   - Output ONLY the transcription
   - Do NOT add commentary or explanations
   - Do NOT wrap the output in code fences"#;

/// Per-format instruction sent with each page to the vision-LLM engine.
pub fn vlm_format_instruction(format: crate::pipeline::decode::OutputFormat) -> &'static str {
    use crate::pipeline::decode::OutputFormat;
    match format {
        OutputFormat::Text => "Return plain text only. Separate paragraphs with a blank line.",
        OutputFormat::Markdown => {
            "Return GitHub-flavoured Markdown: # headings, - lists, pipe tables."
        }
        OutputFormat::Html => "Return tables as HTML <table> markup and other text as <p> elements.",
        OutputFormat::Grounding => {
            "Return one line per text block as: [x1, y1, x2, y2] text, with coordinates \
             normalised to 0-1000."
        }
    }
}

/// Instruction for a page that continues a multi-page document.
pub fn continuation_context(page_num: usize, total_pages: usize) -> String {
    format!(
        "This is page {} of {}. Transcribe only this page.",
        page_num, total_pages
    )
}
