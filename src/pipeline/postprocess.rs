//! Post-processing: deterministic cleanup of engine output.
//!
//! Every engine (the compressed-token decoder, the vision LLM, Tesseract)
//! leaves its own artefacts: CRLF line endings, form feeds between pages,
//! trailing spaces, zero-width characters, or an outer code fence the
//! model was told not to write. These rules run on the host after decoding
//! and never touch the accelerator, so they may overlap with another
//! request's model work.
//!
//! Rules are pure `&str → String` passes run in a fixed order: fences are
//! stripped before line endings are normalised so the fence regex sees the
//! raw output, and blank-line collapsing runs last.

use crate::pipeline::decode::OutputFormat;
use once_cell::sync::Lazy;
use regex::Regex;

/// Clean one page of engine output for `format`.
///
/// Rules (applied in order):
/// 1. Strip an outer code fence (any language tag)
/// 2. Normalise line endings (CRLF/CR → LF) and drop form feeds
/// 3. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 4. Trim trailing whitespace per line
/// 5. Markdown only: insert missing table separator rows and drop
///    separators inside table bodies
/// 6. Collapse 3+ consecutive blank lines to 2 and trim the ends
pub fn clean_output(input: &str, format: OutputFormat) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = if format == OutputFormat::Markdown {
        let s = fix_broken_tables(&s);
        remove_mid_table_separators(&s)
    } else {
        s
    };
    collapse_blank_lines(&s).trim_matches('\n').to_string()
}

/// Join cleaned pages into one document.
pub fn join_pages<S: AsRef<str>>(pages: &[S]) -> String {
    pages
        .iter()
        .map(|p| p.as_ref())
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ── Rule 1: Strip outer fences ───────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Line endings ─────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{000C}', "\n")
}

// ── Rule 3: Invisible characters ─────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Trailing whitespace ──────────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Markdown tables ──────────────────────────────────────────────────

fn fix_broken_tables(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut result = Vec::with_capacity(lines.len() + 4);
    let mut prev_is_row = false;

    for (i, line) in lines.iter().enumerate() {
        result.push(line.to_string());
        let is_header = is_table_row(line) && !is_separator_row(line) && !prev_is_row;
        prev_is_row = is_table_row(line);

        if is_header {
            let next = lines.get(i + 1).copied().unwrap_or("");
            if is_table_row(next) && !is_separator_row(next) {
                let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
                let sep: String = std::iter::once("|")
                    .chain(std::iter::repeat_n(" --- |", cols))
                    .collect();
                result.push(sep);
            }
        }
    }

    result.join("\n")
}

fn remove_mid_table_separators(input: &str) -> String {
    let mut result: Vec<&str> = Vec::new();
    let mut row = 0usize;

    for line in input.lines() {
        if is_table_row(line) {
            row += 1;
            if is_separator_row(line) && row != 2 {
                continue;
            }
        } else {
            row = 0;
        }
        result.push(line);
    }

    result.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

// ── Rule 6: Blank lines ──────────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").into_owned()
}
