//! CLI binary for docparse.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ParserConfig`, runs one pipeline and prints or exports the result.

use anyhow::{Context, Result};
use clap::Parser;
use docparse::{
    render_markdown, resolve_source, DocParserService, DocumentExport, PageSeparator,
    ParserConfig, PipelineKind, PipelineProgressCallback, ProgressCallback, Status,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
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
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over stages; failed pages are logged above it as they settle.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:32.green/238}] {pos}/{len} stages  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Parsing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_pipeline_start(&self, pipeline: &str, stage_count: usize) {
        self.bar.set_length(stage_count as u64);
        self.bar.set_prefix(pipeline.to_string());
    }

    fn on_stage_start(&self, stage: &str) {
        self.bar.set_message(stage.to_string());
    }

    fn on_stage_complete(&self, stage: &str, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<22} {}",
            green("✓"),
            stage,
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0))
        ));
        self.bar.inc(1);
    }

    fn on_page_complete(&self, stage: &str, page_index: usize, status: Status) {
        if status == Status::Failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
            self.bar.println(format!(
                "  {} page {:>3} failed in {}",
                red("✗"),
                page_index + 1,
                stage
            ));
        }
    }

    fn on_pipeline_complete(&self, _pipeline: &str, total_ms: u64) {
        self.bar.finish_and_clear();
        let failed = self.failed.load(Ordering::SeqCst);
        eprintln!(
            "{} done in {}ms{}",
            if failed == 0 { green("✔") } else { red("⚠") },
            bold(&total_ms.to_string()),
            if failed == 0 {
                String::new()
            } else {
                format!("  ({} page failures)", failed)
            }
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full pipeline, markdown on stdout
  docparse report.pdf

  # Export report.json + report.md
  docparse report.pdf --out-dir out/

  # Spreadsheet (auto picks the extract pipeline)
  docparse figures.xlsx --json

  # OCR a scanned PDF only
  docparse scan.pdf --pipeline ocr --json

  # Fine-tuned figure interpreter, quantized formatter
  docparse paper.pdf --figure-variant ft --formatter-variant quantized

PIPELINES:
  auto      extract for spreadsheets, full otherwise
  ocr       OCR
  split     Split
  extract   Split, Extract Elements, Extract Images, Format Extracted Text
  full      extract + Format Markdown

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  RUST_LOG                Log filter, e.g. docparse=debug
"#;

/// Parse PDFs, images and spreadsheets into markdown and a JSON element list.
#[derive(Parser, Debug)]
#[command(
    name = "docparse",
    version,
    about = "Parse PDFs, images and spreadsheets into structured markdown",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Source document: PDF, image, or csv/tsv/xlsx/xls/ods.
    source: PathBuf,

    /// Pipeline: auto, ocr, split, extract, full.
    #[arg(long, env = "DOCPARSE_PIPELINE", default_value = "auto")]
    pipeline: String,

    /// Write <stem>.json and <stem>.md here instead of printing.
    #[arg(short, long, env = "DOCPARSE_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// Print the JSON export instead of markdown.
    #[arg(long, env = "DOCPARSE_JSON")]
    json: bool,

    /// Figure interpreter variant (base, ft, quantized).
    #[arg(long, env = "DOCPARSE_FIGURE_VARIANT", default_value = "base")]
    figure_variant: String,

    /// Page formatter variant (base, ft, quantized).
    #[arg(long, env = "DOCPARSE_FORMATTER_VARIANT", default_value = "base")]
    formatter_variant: String,

    /// LLM provider: openai, anthropic, gemini, ollama.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Per-stage page fan-out.
    #[arg(short, long, env = "DOCPARSE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Rendering DPI (72–400).
    #[arg(long, env = "DOCPARSE_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Page separator: none, hr, comment, or custom string.
    #[arg(long, env = "DOCPARSE_SEPARATOR", default_value = "hr")]
    separator: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "DOCPARSE_PASSWORD")]
    password: Option<String>,

    /// Root for per-request scratch directories.
    #[arg(long, env = "DOCPARSE_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, env = "DOCPARSE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCPARSE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCPARSE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress;
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

    // ── Build config and service ─────────────────────────────────────────
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress)?;
    let separator = config.page_separator.clone();
    let service = DocParserService::new(config);

    let resolved = resolve_source(&cli.source).context("Cannot read source")?;
    let kind = match cli.pipeline.as_str() {
        "auto" => PipelineKind::for_source(resolved.kind),
        other => other.parse().context("Invalid --pipeline")?,
    };

    // ── Run ──────────────────────────────────────────────────────────────
    if let Some(ref out_dir) = cli.out_dir {
        let paths = service
            .parse_to_dir(&resolved.path, Some(kind), out_dir)
            .await
            .context("Parsing failed")?;
        if !cli.quiet {
            eprintln!(
                "{}  →  {}, {}",
                green("✔"),
                bold(&paths.json.display().to_string()),
                bold(&paths.markdown.display().to_string())
            );
        }
        return Ok(());
    }

    let ctx = service
        .parse(&resolved.path, kind)
        .await
        .context("Parsing failed")?;

    if cli.json {
        let json = DocumentExport::from_context(&ctx, kind.name())
            .to_json()
            .context("Failed to serialise output")?;
        println!("{json}");
    } else {
        let markdown = render_markdown(&ctx, &separator);
        io::stdout()
            .lock()
            .write_all(markdown.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !cli.quiet && !show_progress {
        eprintln!(
            "Parsed {} pages ({} failed) in {}ms",
            ctx.pages.len(),
            ctx.failed_pages(),
            ctx.processing_time_ms
        );
    }
    Ok(())
}

/// Map CLI args to `ParserConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ParserConfig> {
    let mut builder = ParserConfig::builder()
        .dpi(cli.dpi)
        .concurrency(cli.concurrency)
        .figure_variant(&cli.figure_variant)
        .formatter_variant(&cli.formatter_variant)
        .page_separator(parse_separator(&cli.separator));

    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p);
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd);
    }
    if let Some(ref dir) = cli.work_dir {
        builder = builder.work_dir(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" | "---" => PageSeparator::HorizontalRule,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
