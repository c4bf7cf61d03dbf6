//! CLI binary for edgequake-ocr.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgequake_ocr::{
    CompressionRatioReport, EngineKind, ModeId, OutputFormat, Pipeline, PipelineConfig,
    ProcessingObserver, RatioClass,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress observer using indicatif ───────────────────────────────────

/// Terminal observer: a spinner plus one log line per page.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("OCR");
        bar.set_message("Preparing…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ProcessingObserver for CliObserver {
    fn on_document_start(&self, path: &Path, mode: Option<ModeId>) {
        let mode = mode.map(|m| m.to_string()).unwrap_or_else(|| "fallback".into());
        self.bar
            .set_message(format!("{} ({} mode)", path.display(), mode));
    }

    fn on_page_encoded(&self, page_num: usize, report: &CompressionRatioReport) {
        let status = match report.status {
            RatioClass::Ok => green(&report.status.to_string()),
            RatioClass::Caution => yellow(&report.status.to_string()),
            RatioClass::Warning | RatioClass::Error => red(&report.status.to_string()),
        };
        self.bar.println(format!(
            "  Page {:>3}  {:>4} tokens  ratio {:>5.2}x  {}",
            page_num, report.compressed_tokens, report.ratio, status
        ));
    }

    fn on_page_decoded(&self, page_num: usize, text_len: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            green("✓"),
            page_num,
            dim(&format!("{text_len:>5} chars"))
        ));
    }

    fn on_fallback(&self, reason: &str) {
        self.bar.println(format!("  {} {}", yellow("⚠"), reason));
        self.bar.set_message("Running fallback OCR…");
    }

    fn on_document_complete(&self, engine: EngineKind, _pages: usize) {
        self.bar.finish_and_clear();
        eprintln!("{} done with {} engine", green("✔"), bold(engine.as_str()));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract plain text (stdout)
  ocrpipe process scan.png

  # Markdown to a file, forcing small mode
  ocrpipe process --format markdown --mode small report.pdf -o report.md

  # Force the Tesseract engine
  ocrpipe process --engine tesseract receipt.jpg

  # JSON output with per-page ratio reports
  ocrpipe process --json report.pdf > out.json

  # Status, memory snapshot, compression benchmark
  ocrpipe status
  ocrpipe memory
  ocrpipe benchmark

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          API key for the vision-LLM fallback engine
  EDGEQUAKE_LLM_PROVIDER  Vision-LLM provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Vision-LLM model ID
  PDFIUM_LIB_PATH         Path to libpdfium
  RUST_LOG                Log filter, e.g. edgequake_ocr=debug
"#;

/// Memory-aware OCR with visual compression and classical fallbacks.
#[derive(Parser, Debug)]
#[command(
    name = "ocrpipe",
    version,
    about = "Memory-aware OCR with visual compression and classical fallbacks",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Accelerator memory budget in GB.
    #[arg(long, global = true, env = "OCRPIPE_MAX_MEMORY", default_value_t = 8.0)]
    max_memory: f64,

    /// Load full-precision weights instead of INT8.
    #[arg(long, global = true, env = "OCRPIPE_NO_QUANTIZATION")]
    no_quantization: bool,

    /// Disable the vision-LLM fallback engine.
    #[arg(long, global = true, env = "OCRPIPE_NO_VLM")]
    no_vlm: bool,

    /// Vision-LLM provider: openai, anthropic, gemini, ollama.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Vision-LLM model ID.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Tesseract language pack(s), e.g. eng+deu.
    #[arg(long, global = true, env = "OCRPIPE_TESSERACT_LANG", default_value = "eng")]
    lang: String,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "OCRPIPE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "OCRPIPE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract text from an image or PDF.
    Process {
        /// Input file.
        input: PathBuf,

        /// Compression mode: tiny, small, base, large. Default: automatic.
        #[arg(long)]
        mode: Option<String>,

        /// Output format: text, markdown, html, grounding.
        #[arg(long, default_value = "text")]
        format: String,

        /// Force an engine: primary, vlm, tesseract.
        #[arg(long)]
        engine: Option<String>,

        /// Decode incrementally.
        #[arg(long)]
        stream: bool,

        /// Maximum pages to process.
        #[arg(long)]
        max_pages: Option<usize>,

        /// Output structured JSON instead of text.
        #[arg(long)]
        json: bool,

        /// Write the text to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show pipeline state, engines and model information.
    Status,
    /// Time compression at each benchmark resolution.
    Benchmark,
    /// Show the accelerator memory snapshot.
    Memory,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet
        && !cli.verbose
        && matches!(cli.command, Command::Process { json: false, .. });
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let observer = show_progress.then(CliObserver::new);
    let config = build_config(&cli, observer.clone())?;

    let pipeline = Pipeline::new(config);
    if !matches!(cli.command, Command::Memory) {
        pipeline
            .initialize()
            .await
            .context("Failed to initialize pipeline")?;
    }

    let result = run(&cli, &pipeline).await;
    pipeline.cleanup().await;
    if result.is_err() {
        if let Some(obs) = observer {
            obs.bar.finish_and_clear();
        }
    }
    result
}

async fn run(cli: &Cli, pipeline: &Pipeline) -> Result<()> {
    match &cli.command {
        Command::Process {
            input,
            mode,
            format,
            engine,
            stream,
            json,
            output,
            ..
        } => {
            let format: OutputFormat = format.parse()?;
            let mode = mode.as_deref().map(str::parse::<ModeId>).transpose()?;

            let result = match engine.as_deref() {
                Some(name) => {
                    let engine: EngineKind = name.parse()?;
                    pipeline.process_with_engine(input, format, engine).await
                }
                None => pipeline.process_file(input, format, mode, *stream).await,
            }
            .with_context(|| format!("Failed to process {}", input.display()))?;

            if *json {
                let json =
                    serde_json::to_string_pretty(&result).context("Failed to serialise output")?;
                println!("{json}");
            } else if let Some(path) = output {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                tokio::fs::write(path, &result.text)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                if !cli.quiet {
                    eprintln!(
                        "{}  {} chars  {}ms  →  {}",
                        green("✔"),
                        result.length,
                        result.elapsed_ms,
                        bold(&path.display().to_string())
                    );
                }
            } else {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                handle
                    .write_all(result.text.as_bytes())
                    .context("Failed to write to stdout")?;
                if !result.text.ends_with('\n') {
                    handle.write_all(b"\n").ok();
                }
            }

            if !cli.quiet && !*json {
                if let Some(ref reason) = result.fallback_reason {
                    eprintln!("   {} {}", yellow("fallback:"), dim(reason));
                }
                for attempt in &result.failed_attempts {
                    eprintln!("   {} {}", red("✗"), dim(&attempt.to_string()));
                }
            }
        }
        Command::Status => {
            let info = pipeline.system_info().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&info).context("Failed to serialise status")?
            );
        }
        Command::Benchmark => {
            let results = pipeline.benchmark().await.context("Benchmark failed")?;
            for r in &results {
                match (&r.error, r.compression_time_ms) {
                    (None, Some(ms)) => println!(
                        "{} {:>5}px  {:<5}  {:>8.1}ms  {:>4} tokens{}",
                        green("✓"),
                        r.resolution,
                        r.mode,
                        ms,
                        r.vision_tokens.unwrap_or(0),
                        r.memory_used_gb
                            .map(|gb| format!("  {gb:.2}GB"))
                            .unwrap_or_default()
                    ),
                    (err, _) => println!(
                        "{} {:>5}px  {:<5}  {}",
                        red("✗"),
                        r.resolution,
                        r.mode,
                        err.as_deref().unwrap_or("no timing recorded")
                    ),
                }
            }
        }
        Command::Memory => {
            let stats = pipeline.memory_stats();
            if cli.quiet {
                println!("{}", serde_json::to_string(&stats)?);
            } else {
                println!("{stats}");
            }
        }
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, observer: Option<Arc<CliObserver>>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .memory_limit_gb(cli.max_memory)
        .enable_quantization(!cli.no_quantization)
        .enable_vlm(!cli.no_vlm)
        .tesseract_lang(cli.lang.clone());

    if let Some(ref provider) = cli.provider {
        builder = builder.vlm_provider(provider.clone());
    }
    if let Some(ref model) = cli.model {
        builder = builder.vlm_model(model.clone());
    }
    if let Command::Process {
        max_pages: Some(n), ..
    } = cli.command
    {
        builder = builder.max_pages(n);
    }
    if let Some(obs) = observer {
        builder = builder.observer(obs);
    }

    builder.build().context("Invalid configuration")
}
