//! CLI binary for edgequake-ocr.
//!
//! `ocr-server` (or `ocr-server serve`) runs the HTTP service;
//! `ocr-server extract <input>` recognises one document and prints the text.
//! Both map their flags onto `OcrConfig` the same way.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_ocr::{
    serve, DocumentStatus, EngineKind, OcrConfig, OcrEngine, OcrProgressCallback, PageError,
    PageSelection, PageSeparator, PreprocessOptions, ProgressCallback, ServerConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

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

/// Progress bar for `extract`. Pages may finish out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    total: AtomicUsize,
}

impl CliProgressCallback {
    /// Spinner until the page count is known.
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rasterising…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.total.store(total, Ordering::SeqCst);
        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Recognising");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl OcrProgressCallback for CliProgressCallback {
    fn on_document_start(&self, _document_id: Uuid, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Recognising {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, index: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(index, Instant::now());
        self.bar.set_message(format!("page {}", index + 1));
    }

    fn on_page_complete(&self, index: usize, total: usize, text_len: usize) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            index + 1,
            total,
            dim(&format!("{text_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, index: usize, total: usize, error: &PageError) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            index + 1,
            total,
            red(error.kind()),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_document_complete(&self, _document_id: Uuid, status: DocumentStatus, success_count: usize) {
        let total = self.total.load(Ordering::SeqCst);
        let failed = total.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 && status == DocumentStatus::Done {
            eprintln!(
                "{} {} pages recognised",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages recognised  ({} failed, {})",
                if status == DocumentStatus::Done {
                    cyan("⚠")
                } else {
                    red("✘")
                },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
                status,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the HTTP service on port 7860
  ocr-server

  # Recognise a scan (stdout)
  ocr-server extract scan.png

  # German and English, pages 2-4 of a PDF, to a file
  ocr-server extract --languages deu,eng --pages 2-4 letter.pdf -o letter.txt

  # Full JSON result with per-page confidence
  ocr-server extract --json https://example.com/invoice.pdf > invoice.json

  # Vision-LLM recognizer instead of tesseract
  ocr-server extract --engine vision --model gpt-4.1-nano receipt.jpg

HTTP API:
  GET    /health
  POST   /v1/ocr                    multipart: file, languages, pages
  POST   /v1/documents              same, returns 202 {id, status}
  GET    /v1/documents/:id
  GET    /v1/documents/:id/result
  DELETE /v1/documents/:id

ENVIRONMENT VARIABLES:
  Every flag has an OCR_* variable (see --help on each flag).
  OCR_PDFIUM_LIB_PATH     Directory containing libpdfium
  OPENAI_API_KEY, ANTHROPIC_API_KEY, GEMINI_API_KEY
                          Credentials for --engine vision
  RUST_LOG                Overrides the log filter
"#;

/// Document OCR service and command-line extractor.
#[derive(Parser, Debug)]
#[command(
    name = "ocr-server",
    version,
    about = "Recognise text in PDFs and scanned images",
    long_about = "Rasterise PDF, PNG, JPEG and TIFF documents, clean up each page \
(grayscale, denoise, deskew, binarize) and recognise its text with tesseract or a \
vision LLM. Runs as an HTTP service or as a one-shot extractor.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    engine: EngineArgs,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "OCR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "OCR_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default).
    Serve {
        /// Listen address.
        #[arg(long, env = "OCR_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Listen port.
        #[arg(short, long, env = "OCR_PORT", default_value_t = 7860)]
        port: u16,
    },

    /// Recognise one document and print its text.
    Extract {
        /// Local file path or HTTP/HTTPS URL.
        input: String,

        /// Write the text to this file instead of stdout.
        #[arg(short, long, env = "OCR_OUTPUT")]
        output: Option<PathBuf>,

        /// Print the full result as JSON.
        #[arg(long, env = "OCR_JSON")]
        json: bool,

        /// Disable the progress bar.
        #[arg(long, env = "OCR_NO_PROGRESS")]
        no_progress: bool,
    },
}

/// Engine options shared by both commands.
#[derive(Args, Debug)]
struct EngineArgs {
    /// Recognizer: tesseract or vision.
    #[arg(long, global = true, env = "OCR_ENGINE", value_enum, default_value = "tesseract")]
    engine: EngineArg,

    /// Language hints, comma-separated tesseract codes (eng, deu, fra, ...).
    #[arg(long, global = true, env = "OCR_LANGUAGES", default_value = "eng")]
    languages: String,

    /// Rendering DPI for PDF pages (72–600).
    #[arg(long, global = true, env = "OCR_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, global = true, env = "OCR_PAGES", default_value = "all")]
    pages: String,

    /// Page separator: none, ff, marker, or a custom string.
    #[arg(long, global = true, env = "OCR_SEPARATOR", default_value = "none")]
    separator: String,

    /// Pages recognised concurrently within one document.
    #[arg(short, long, global = true, env = "OCR_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Documents processed at once by the server.
    #[arg(long, global = true, env = "OCR_MAX_ACTIVE", default_value_t = 2)]
    max_active: usize,

    /// Documents waiting for a slot before submissions are refused.
    #[arg(long, global = true, env = "OCR_MAX_QUEUED", default_value_t = 16)]
    max_queued: usize,

    /// Upload size limit in bytes.
    #[arg(long, global = true, env = "OCR_MAX_INPUT_BYTES", default_value_t = 10 * 1024 * 1024)]
    max_input_bytes: usize,

    /// Pixel ceiling per page (width × height).
    #[arg(long, global = true, env = "OCR_MAX_IMAGE_PIXELS", default_value_t = 12_000_000)]
    max_image_pixels: u64,

    /// First recognition attempt timeout in seconds.
    #[arg(long, global = true, env = "OCR_PAGE_TIMEOUT", default_value_t = 60)]
    page_timeout: u64,

    /// Retry timeout in seconds (capped at half the page timeout).
    #[arg(long, global = true, env = "OCR_RETRY_TIMEOUT", default_value_t = 30)]
    retry_timeout: u64,

    /// HTTP download timeout for URL inputs, in seconds.
    #[arg(long, global = true, env = "OCR_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Always OCR PDF pages, even when they carry a text layer.
    #[arg(long, global = true, env = "OCR_IGNORE_TEXT_LAYER")]
    ignore_text_layer: bool,

    /// Skip the median denoise step.
    #[arg(long, global = true, env = "OCR_NO_DENOISE")]
    no_denoise: bool,

    /// Skip deskewing.
    #[arg(long, global = true, env = "OCR_NO_DESKEW")]
    no_deskew: bool,

    /// Skip Otsu binarisation.
    #[arg(long, global = true, env = "OCR_NO_BINARIZE")]
    no_binarize: bool,

    /// Include word bounding boxes in JSON results.
    #[arg(long, global = true, env = "OCR_WORDS")]
    words: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, global = true, env = "OCR_PASSWORD")]
    password: Option<String>,

    /// Directory containing the pdfium shared library.
    #[arg(long, global = true, env = "OCR_PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// tesseract executable.
    #[arg(long, global = true, env = "OCR_TESSERACT_BIN", default_value = "tesseract")]
    tesseract_bin: PathBuf,

    /// tesseract page segmentation mode.
    #[arg(long, global = true, env = "OCR_TESSERACT_PSM", default_value_t = 3)]
    psm: u8,

    /// Vision model ID (with --engine vision).
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Vision provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Seconds a finished document's result is kept for retrieval.
    #[arg(long, global = true, env = "OCR_RESULT_TTL", default_value_t = 600)]
    result_ttl: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EngineArg {
    Tesseract,
    Vision,
}

impl From<EngineArg> for EngineKind {
    fn from(v: EngineArg) -> Self {
        match v {
            EngineArg::Tesseract => EngineKind::Tesseract,
            EngineArg::Vision => EngineKind::Vision,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let show_progress = match &cli.command {
        Some(Command::Extract {
            json, no_progress, ..
        }) => !cli.quiet && !*no_progress && !*json,
        _ => false,
    };

    // ── Logging setup ────────────────────────────────────────────────────
    // Library INFO logs are hidden behind the progress bar.
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

    let config = build_config(&cli.engine)?;
    let engine = OcrEngine::from_config(config).context("Failed to initialise OCR engine")?;

    match cli.command {
        None => run_server(ServerConfig::default(), engine).await,
        Some(Command::Serve { host, port }) => run_server(ServerConfig { host, port }, engine).await,
        Some(Command::Extract {
            input,
            output,
            json,
            ..
        }) => {
            run_extract(
                engine,
                &input,
                output,
                json,
                cli.quiet,
                show_progress,
            )
            .await
        }
    }
}

async fn run_server(server: ServerConfig, engine: OcrEngine) -> Result<()> {
    if !engine.is_available().await {
        tracing::warn!(
            "Recognizer '{}' is not available; requests will fail until it is installed",
            engine.recognizer_name()
        );
    }
    serve(server, engine).await.context("Server failed")
}

async fn run_extract(
    engine: OcrEngine,
    input: &str,
    output_path: Option<PathBuf>,
    json: bool,
    quiet: bool,
    show_progress: bool,
) -> Result<()> {
    if !engine.is_available().await {
        anyhow::bail!(
            "Recognizer '{}' is not available. Install tesseract (e.g. `apt install tesseract-ocr`) \
             or choose --engine vision with a provider API key.",
            engine.recognizer_name()
        );
    }

    let submission = engine
        .load(input)
        .await
        .with_context(|| format!("Failed to load {input}"))?;

    let job = engine
        .prepare(submission)
        .context("Document rejected")?;
    let job = if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new_dynamic();
        job.with_progress(cb)
    } else {
        job
    };
    let ticket = engine.try_admit().context("Engine is busy")?;
    let output = engine.run(job, ticket).await.context("Recognition failed")?;

    let rendered = if json {
        serde_json::to_string_pretty(&output).context("Failed to serialise output")?
    } else {
        output.text.clone()
    };

    if let Some(ref path) = output_path {
        tokio::fs::write(path, rendered.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(rendered.as_bytes())
            .context("Failed to write to stdout")?;
        if !rendered.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    if !quiet && !show_progress {
        eprintln!(
            "Recognised {}/{} pages in {}ms (mean confidence {:.2})",
            output.stats.total_pages - output.stats.failed_pages,
            output.stats.total_pages,
            output.stats.total_duration_ms,
            output.stats.mean_confidence,
        );
    }
    if let Some(ref path) = output_path {
        if !quiet {
            eprintln!("   →  {}", bold(&path.display().to_string()));
        }
    }

    if output.status == DocumentStatus::Failed {
        anyhow::bail!("No page of {input} could be recognised");
    }
    Ok(())
}

/// Map CLI args to `OcrConfig`.
fn build_config(args: &EngineArgs) -> Result<OcrConfig> {
    let pages = PageSelection::parse(&args.pages).context("Invalid --pages")?;
    let languages = edgequake_ocr::parse_languages(&args.languages);

    let preprocess = PreprocessOptions {
        denoise: !args.no_denoise,
        deskew: !args.no_deskew,
        binarize: !args.no_binarize,
        ..PreprocessOptions::default()
    };

    let mut builder = OcrConfig::builder()
        .engine(args.engine.into())
        .languages(languages)
        .dpi(args.dpi)
        .pages(pages)
        .page_separator(PageSeparator::parse(&args.separator))
        .page_concurrency(args.concurrency)
        .max_active_documents(args.max_active)
        .max_queued_documents(args.max_queued)
        .max_input_bytes(args.max_input_bytes)
        .max_image_pixels(args.max_image_pixels)
        .page_timeout(Duration::from_secs(args.page_timeout))
        .retry_timeout(Duration::from_secs(args.retry_timeout))
        .download_timeout_secs(args.download_timeout)
        .prefer_embedded_text(!args.ignore_text_layer)
        .preprocess(preprocess)
        .include_words(args.words)
        .tesseract_bin(args.tesseract_bin.clone())
        .tesseract_psm(args.psm)
        .result_ttl_secs(args.result_ttl);

    if let Some(ref pwd) = args.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(ref dir) = args.pdfium_lib_path {
        builder = builder.pdfium_lib_path(dir.clone());
    }
    if let Some(ref model) = args.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider.clone());
    }

    builder.build().context("Invalid configuration")
}
