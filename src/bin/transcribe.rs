//! CLI binary for edgequake-transcribe.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `TranscribeConfig`, runs one of the two commands and prints a per-page
//! summary.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_transcribe::{
    transcribe, translate, write_combined, DocumentReport, PageSelection, PageSeparator,
    PageStatus, ProgressCallback, TranscribeConfig, TranscribeConfigBuilder, TranscribeOutput,
    TranscribeProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

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
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished page. Pages finish out
/// of order when several run at once.
struct CliProgressCallback {
    bar: ProgressBar,
    verb: &'static str,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new(verb: &'static str) -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rendering pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            verb,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut t| t.remove(&page_num))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl TranscribeProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_pages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix(self.verb);
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{} {total_pages} pages…", self.verb))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        if let Ok(mut t) = self.start_times.lock() {
            t.insert(page_num, Instant::now());
        }
    }

    fn on_stage(&self, page_num: usize, stage: &str) {
        self.bar.set_message(format!("page {page_num}: {stage}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, output_len: usize) {
        let secs = self.elapsed_secs(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{output_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, _total_pages: usize, _success_count: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Transcribe every page into ./data/report/markdowns/
  transcribe run report.pdf

  # Two feedback rounds plus an image-only alternate reading
  transcribe run --feedback-iterations 2 --alternate-reading scan.pdf

  # Also write one combined file
  transcribe run --combined report.md --separator hr report.pdf

  # Translate previously transcribed pages
  transcribe translate --language French report.pdf

  # Another provider through edgequake-llm
  transcribe run --provider anthropic --model claude-sonnet-4-20250514 scan.pdf

OUTPUT LAYOUT:
  <output-dir>/<document>/markdowns/page_<n>.md
  <output-dir>/<document>/translations/<language>/page_<n>.md

ENVIRONMENT VARIABLES:
  GROQ_API_KEY              API key for the OpenAI-compatible endpoint
  TRANSCRIBE_BASE_URL       Endpoint (default: https://api.groq.com/openai/v1)
  TRANSCRIBE_MODEL          Model ID
  TRANSCRIBE_PROVIDER       edgequake-llm provider name (reads its own key)
  TRANSCRIBE_OUTPUT_DIR     Artifact root (default: ./data)
  RUST_LOG                  Log filter, overrides -v/-q

REQUIREMENTS:
  tesseract must be on PATH unless --no-ocr is given.
"#;

/// Transcribe scanned documents to Markdown and translate them.
#[derive(Parser, Debug)]
#[command(
    name = "transcribe",
    version,
    about = "Transcribe scanned documents to Markdown with OCR and multi-stage LLM refinement",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "TRANSCRIBE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "TRANSCRIBE_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "TRANSCRIBE_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// OCR and refine every selected page into Markdown.
    Run(RunArgs),
    /// Translate previously transcribed pages.
    Translate(TranslateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Critique-and-revise rounds per page (0 disables the feedback stage).
    #[arg(long, env = "TRANSCRIBE_FEEDBACK_ITERATIONS", default_value_t = 1)]
    feedback_iterations: usize,

    /// Add an image-only reading per page and reconcile it with the refined one.
    #[arg(long, env = "TRANSCRIBE_ALTERNATE_READING")]
    alternate_reading: bool,

    /// Skip OCR; convert from the page image alone.
    #[arg(long, env = "TRANSCRIBE_NO_OCR")]
    no_ocr: bool,

    /// Tesseract language(s), e.g. eng or eng+fra.
    #[arg(long, env = "TRANSCRIBE_OCR_LANGUAGE", default_value = "eng")]
    ocr_language: String,
}

#[derive(Args, Debug)]
struct TranslateArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Target language, e.g. French.
    #[arg(short, long, env = "TRANSCRIBE_LANGUAGE")]
    language: String,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Root directory for per-page artifacts.
    #[arg(short, long, env = "TRANSCRIBE_OUTPUT_DIR", default_value = "./data")]
    output_dir: PathBuf,

    /// Document id used in the output layout (default: input file stem).
    #[arg(long, env = "TRANSCRIBE_DOCUMENT_ID")]
    document_id: Option<String>,

    /// Also write all pages joined into this file.
    #[arg(long)]
    combined: Option<PathBuf>,

    /// Separator for --combined: none, hr, comment, or custom string.
    #[arg(long, env = "TRANSCRIBE_SEPARATOR", default_value = "none")]
    separator: String,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "TRANSCRIBE_PAGES", default_value = "all")]
    pages: String,

    /// Pages processed at once.
    #[arg(short, long, env = "TRANSCRIBE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Longest rendered edge in pixels.
    #[arg(long, env = "TRANSCRIBE_MAX_PIXELS", default_value_t = 2000)]
    max_pixels: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "TRANSCRIBE_PASSWORD")]
    password: Option<String>,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "TRANSCRIBE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Args, Debug)]
struct BackendArgs {
    /// edgequake-llm provider: openai, anthropic, gemini, ollama, azure, …
    #[arg(long, env = "TRANSCRIBE_PROVIDER")]
    provider: Option<String>,

    /// OpenAI-compatible endpoint used when no --provider is given.
    #[arg(long, env = "TRANSCRIBE_BASE_URL", default_value = "https://api.groq.com/openai/v1")]
    base_url: String,

    /// API key for the OpenAI-compatible endpoint.
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model ID.
    #[arg(long, env = "TRANSCRIBE_MODEL")]
    model: Option<String>,

    /// Max generated tokens per call.
    #[arg(long, env = "TRANSCRIBE_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "TRANSCRIBE_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per call on rate limits and timeouts.
    #[arg(long, env = "TRANSCRIBE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call timeout in seconds.
    #[arg(long, env = "TRANSCRIBE_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json = match &cli.command {
        Command::Run(a) => a.common.json,
        Command::Translate(a) => a.common.json,
    };

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; -v brings them back.
    let show_progress = !cli.quiet && !cli.no_progress && !json;
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

    let (output, common, language, separator) = match &cli.command {
        Command::Run(args) => {
            let progress = show_progress.then(|| CliProgressCallback::new("Transcribing"));
            let config = config_builder(&args.common, progress.map(|p| p as ProgressCallback))?
                .feedback_iterations(args.feedback_iterations)
                .alternate_reading(args.alternate_reading)
                .ocr(!args.no_ocr)
                .ocr_language(args.ocr_language.clone())
                .build()
                .context("Invalid configuration")?;
            let output = transcribe(&args.common.input, &config)
                .await
                .context("Transcription failed")?;
            (output, &args.common, None, config.page_separator.clone())
        }
        Command::Translate(args) => {
            let progress = show_progress.then(|| CliProgressCallback::new("Translating"));
            let config = config_builder(&args.common, progress.map(|p| p as ProgressCallback))?
                .build()
                .context("Invalid configuration")?;
            let output = translate(&args.common.input, &args.language, &config)
                .await
                .context("Translation failed")?;
            (output, &args.common, Some(args.language.as_str()), config.page_separator.clone())
        }
    };

    if let Some(path) = &common.combined {
        let text = match language {
            Some(lang) => output.document.assemble_translation(lang, &separator),
            None => output.document.assemble(&separator),
        };
        write_combined(path, &text)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    if json {
        let report =
            serde_json::to_string_pretty(&output.report).context("Failed to serialise report")?;
        println!("{report}");
    }
    if !cli.quiet {
        print_summary(&output, common);
    }

    let stats = &output.report.stats;
    if stats.succeeded == 0 {
        anyhow::bail!(
            "No page succeeded ({} failed, {} skipped)",
            stats.failed,
            stats.skipped
        );
    }
    Ok(())
}

/// Map the shared CLI args onto a `TranscribeConfig` builder.
fn config_builder(
    common: &CommonArgs,
    progress: Option<ProgressCallback>,
) -> Result<TranscribeConfigBuilder> {
    let backend = &common.backend;
    let mut builder = TranscribeConfig::builder()
        .output_dir(common.output_dir.clone())
        .pages(common.pages.parse::<PageSelection>().context("Invalid --pages")?)
        .page_separator(common.separator.parse::<PageSeparator>().unwrap_or_default())
        .concurrency(common.concurrency)
        .max_rendered_pixels(common.max_pixels)
        .download_timeout_secs(common.download_timeout)
        .base_url(backend.base_url.clone())
        .max_tokens(backend.max_tokens)
        .temperature(backend.temperature)
        .max_retries(backend.max_retries)
        .api_timeout_secs(backend.api_timeout);

    if let Some(id) = &common.document_id {
        builder = builder.document_id(id.clone());
    }
    if let Some(pwd) = &common.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(model) = &backend.model {
        builder = builder.model(model.clone());
    }
    if let Some(provider) = &backend.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(key) = &backend.api_key {
        builder = builder.api_key(key.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    Ok(builder)
}

fn print_summary(output: &TranscribeOutput, common: &CommonArgs) {
    let report: &DocumentReport = &output.report;
    let stats = &report.stats;

    for page in report.pages.iter().filter(|p| !p.is_success()) {
        let detail = page
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        let mark = match page.status {
            PageStatus::Skipped => yellow("–"),
            _ => red("✗"),
        };
        eprintln!("  {mark} {}", dim(&detail));
    }

    let icon = if stats.failed == 0 && stats.skipped == 0 {
        green("✔")
    } else if stats.succeeded == 0 {
        red("✘")
    } else {
        cyan("⚠")
    };
    let what = match &report.language {
        Some(lang) => format!("translated to {lang}"),
        None => "transcribed".to_string(),
    };
    eprintln!(
        "{icon} {}/{} pages {what}  ({} failed, {} skipped)  {}ms",
        bold(&stats.succeeded.to_string()),
        stats.total_pages,
        stats.failed,
        stats.skipped,
        stats.duration_ms,
    );
    eprintln!(
        "   {} calls  {} tokens in  /  {} tokens out  →  {}",
        dim(&stats.completion_calls.to_string()),
        dim(&stats.total_input_tokens.to_string()),
        dim(&stats.total_output_tokens.to_string()),
        bold(&common.output_dir.join(&report.document_id).display().to_string()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_translate() {
        let cli = Cli::try_parse_from([
            "transcribe",
            "translate",
            "doc.pdf",
            "--language",
            "French",
            "--api-key",
            "k",
        ])
        .expect("parses");
        match cli.command {
            Command::Translate(args) => {
                assert_eq!(args.language, "French");
                assert_eq!(args.common.input, "doc.pdf");
            }
            Command::Run(_) => panic!("expected translate"),
        }
    }

    #[test]
    fn run_flags_map_to_config() {
        let cli = Cli::try_parse_from([
            "transcribe",
            "run",
            "scan.pdf",
            "--pages",
            "2-4",
            "--separator",
            "comment",
            "--feedback-iterations",
            "0",
            "--api-key",
            "k",
        ])
        .expect("parses");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = config_builder(&args.common, None)
            .expect("valid flags")
            .feedback_iterations(args.feedback_iterations)
            .build()
            .expect("valid config");
        assert_eq!(config.pages, PageSelection::Range(2, 4));
        assert_eq!(config.page_separator, PageSeparator::Comment);
        assert_eq!(config.feedback_iterations, 0);
        assert_eq!(config.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn bad_pages_flag_is_rejected() {
        let cli = Cli::try_parse_from(["transcribe", "run", "scan.pdf", "--pages", "0"])
            .expect("parses");
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(config_builder(&args.common, None).is_err());
    }
}
