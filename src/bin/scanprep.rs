//! CLI binary for edgequake-scanprep.
//!
//! A thin shim over the library crate that maps CLI flags and an optional
//! TOML file to `PipelineConfig`, runs one document and prints the result.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_scanprep::pipeline::input::resolve_input;
use edgequake_scanprep::session::{Session, SessionStore};
use edgequake_scanprep::stage::{StageOutcomeKind, PROGRESS_TARGET};
use edgequake_scanprep::{
    PipelineConfig, PipelineOrchestrator, PipelineProgressCallback, Ports, ProgressCallback,
    StageId,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
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
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: a spinner naming the current stage, turned into a
/// counted bar once Stage 7 knows how many groups it will extract.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening session…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_document_start(&self, document_id: &str, session_id: &str) {
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(&format!("Processing {document_id}")),
            dim(session_id)
        ));
    }

    fn on_stage_start(&self, stage: StageId) {
        self.bar.set_prefix(stage.label());
        self.bar.set_message(stage.dir());
    }

    fn on_stage_complete(&self, stage: StageId, outcome: StageOutcomeKind) {
        let mark = match outcome {
            StageOutcomeKind::Completed => green("✓"),
            StageOutcomeKind::Skipped => dim("–"),
            StageOutcomeKind::Failed => red("✗"),
        };
        self.bar.println(format!("  {} {:<6} {}", mark, stage.label(), dim(stage.dir())));
    }

    fn on_extraction_start(&self, total_groups: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} groups  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_groups as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn on_group_start(&self, page_index: u32, group_id: u32) {
        self.bar.set_message(format!("page {page_index} group {group_id}"));
    }

    fn on_group_complete(&self, page_index: u32, group_id: u32, attempts: u32) {
        let retries = if attempts > 1 {
            dim(&format!("  {attempts} attempts"))
        } else {
            String::new()
        };
        self.bar.println(format!(
            "  {} Page {:>3} group {:<2}{}",
            green("✓"),
            page_index,
            group_id,
            retries
        ));
        self.bar.inc(1);
    }

    fn on_group_error(&self, page_index: u32, group_id: u32, error: &str) {
        // Truncate very long error messages to keep output tidy.
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3} group {:<2}  {}",
            red("✗"),
            page_index,
            group_id,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_document_complete(&self, succeeded: usize, failed: usize) {
        self.bar.finish_and_clear();
        let total = succeeded + failed;
        if failed == 0 {
            eprintln!("{} {} groups extracted", green("✔"), bold(&succeeded.to_string()));
        } else {
            eprintln!(
                "{} {}/{} groups extracted  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # First PDF in ./pdf, artifacts under ./data/output/<doc>_<timestamp>/
  scanprep

  # A specific scan, text on stdout
  scanprep ledger.pdf > ledger.txt

  # From a URL, with a fixed session id and a config file
  scanprep https://example.org/scan.pdf --session-id scan-42 --config scanprep.toml

  # Faster, cheaper: no dewarping, no upscaling
  scanprep --skip-dewarping --skip-super-resolution book.pdf

  # Full report (stages, per-group status, text) as JSON
  scanprep --json book.pdf > report.json

PIPELINE:
  Step0  session           open <output-dir>/<session-id>/
  Step1  converted_images  rasterise every page at a per-page DPI
  Step2  corrected_images  judge distortion → re-rasterise / dewarp
  Step3  rotated_images    judge orientation → rotate
  Step4  page_split        judge page count → split side-by-side pages
  Step5  split_bands       overlapping horizontal bands per page
  Step6  super_resolved    upscale every band (--skip-super-resolution)
  Step7  extraction        concurrent multi-image extraction → document.txt

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download
  PDFIUM_AUTO_CACHE_DIR   Override the default pdfium cache directory
  RUST_LOG                Override the log filter entirely

  PDFium (~30 MB) is downloaded automatically on first run and cached.
"#;

/// Prepare scanned PDFs for text extraction with vision-model judgments.
#[derive(Parser, Debug)]
#[command(
    name = "scanprep",
    version,
    about = "Judge, correct, band and extract scanned PDFs with Vision LLMs",
    long_about = "Run a scanned PDF through a staged pipeline: rasterise, judge and fix \
distortion, orientation and page count with a vision model, cut each page into overlapping \
bands, upscale them and extract the text. Every stage keeps its artifacts on disk.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF path or HTTP/HTTPS URL. Default: first PDF in --input-dir.
    input: Option<String>,

    /// TOML configuration file; flags override it.
    #[arg(long, env = "SCANPREP_CONFIG")]
    config: Option<PathBuf>,

    /// Directory searched when INPUT is omitted.
    #[arg(long, env = "SCANPREP_INPUT_DIR")]
    input_dir: Option<PathBuf>,

    /// Root of the session directories.
    #[arg(long, env = "SCANPREP_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Explicit session id instead of <document>_<timestamp>.
    #[arg(long)]
    session_id: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Concurrent extraction calls.
    #[arg(short, long, env = "SCANPREP_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Attempts per extraction group, including the first.
    #[arg(long, env = "SCANPREP_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Record distortion verdicts but never dewarp.
    #[arg(long)]
    skip_dewarping: bool,

    /// Skip Step6; extraction reads the Step5 bands.
    #[arg(long)]
    skip_super_resolution: bool,

    /// Remove the session directory of a failed run (kept by default).
    #[arg(long)]
    cleanup_failed: bool,

    /// Print the full DocumentReport as JSON instead of the text.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SCANPREP_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SCANPREP_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and step completion lines.
    #[arg(short, long, env = "SCANPREP_QUIET", conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Step completion lines are always on; the progress bar replaces the
    // rest of the INFO output when it is active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let filter = format!("{level},{PROGRESS_TARGET}=info");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Ensure PDFium engine is available ───────────────────────────────────
    // On the very first run the library (~30 MB) is downloaded from
    // bblanchon/pdfium-binaries and cached; later startups only check a path.
    if !pdfium_auto::is_pdfium_cached() {
        if !cli.quiet {
            let dl_bar = ProgressBar::new(0);
            dl_bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} {prefix:.bold}  \
                     [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  ")
                .tick_strings(TICKS),
            );
            dl_bar.set_prefix("PDF engine");
            dl_bar.set_message("Connecting…");
            dl_bar.enable_steady_tick(Duration::from_millis(80));

            let bar = dl_bar.clone();
            // block_in_place keeps the reference lifetime valid (no 'static
            // requirement) while still offloading the blocking download from
            // the async executor's hot path.
            tokio::task::block_in_place(|| {
                pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                    if let Some(t) = total {
                        if bar.length().unwrap_or(0) != t {
                            bar.set_length(t);
                        }
                    }
                    bar.set_position(downloaded);
                }))
            })
            .context("Failed to download PDFium engine")?;

            dl_bar.finish_with_message("ready ✓");
        } else {
            tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
                .context("Failed to download PDFium engine")?;
        }
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Resolve input ────────────────────────────────────────────────────
    let input = resolve_input(
        cli.input.as_deref(),
        &config.paths.input_dir,
        Duration::from_secs(config.paths.download_timeout_secs),
    )
    .await
    .context("Failed to resolve input")?;

    // ── Run pipeline ─────────────────────────────────────────────────────
    let ports = Ports::from_config(&config).context("Failed to set up the vision model")?;
    let pipeline = PipelineOrchestrator::new(config, ports);

    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} interrupted, finishing in-flight work…", cyan("⚠"));
            token.cancel();
        }
    });

    let session = pipeline
        .open_session(input.path(), cli.session_id.as_deref())
        .context("Failed to open session")?;
    let report = match pipeline.run_session(&session, input.path()).await {
        Ok(report) => report,
        Err(e) => {
            dispose_failed_session(pipeline.store(), &session, cli.cleanup_failed);
            return Err(e).context("Pipeline failed");
        }
    };

    // ── Output ───────────────────────────────────────────────────────────
    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(report.aggregate.text.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !cli.quiet && !cli.json {
        eprintln!(
            "   {} tokens in  /  {} tokens out  ·  {}ms total",
            dim(&report.aggregate.total_input_tokens.to_string()),
            dim(&report.aggregate.total_output_tokens.to_string()),
            report.duration_ms,
        );
        eprintln!("   artifacts: {}", bold(&report.session_root.display().to_string()));
    }

    if report.aggregate.total_groups > 0 && report.aggregate.succeeded == 0 {
        anyhow::bail!(
            "all {} extraction groups failed; see {}",
            report.aggregate.total_groups,
            report.session_root.display()
        );
    }

    Ok(())
}

/// Point at a failed run's artifacts, or remove them when asked to.
fn dispose_failed_session(store: &SessionStore, session: &Session, cleanup: bool) {
    if !cleanup {
        eprintln!("   artifacts kept: {}", bold(&session.root.display().to_string()));
        return;
    }
    match store.cleanup(session) {
        Ok(()) => eprintln!("   removed failed session {}", session.session_id),
        Err(e) => warn!("Could not remove failed session {}: {}", session.session_id, e),
    }
}

/// Map the config file and CLI flags to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let base = match cli.config {
        Some(ref path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let mut builder = base.to_builder();
    if let Some(ref dir) = cli.input_dir {
        builder = builder.input_dir(dir);
    }
    if let Some(ref dir) = cli.output_dir {
        builder = builder.output_dir(dir);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(n) = cli.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(n) = cli.max_attempts {
        builder = builder.max_attempts(n);
    }
    if cli.skip_dewarping {
        builder = builder.dewarping(false);
    }
    if cli.skip_super_resolution {
        builder = builder.super_resolution(false);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
