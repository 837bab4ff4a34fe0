//! # edgequake-ocr
//!
//! Recognise text in PDFs and scanned images, page by page.
//!
//! Documents arrive as bytes (or a path / URL through [`load_input`]), are
//! rasterised into page images, cleaned up for recognition and passed to a
//! [`Recognizer`]: the local `tesseract` binary by default, or a vision LLM
//! through `edgequake-llm`. Per-page results are merged back into one
//! ordered [`OcrOutput`]. A page that fails keeps its slot with a
//! placeholder; the document still completes.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes
//!  │
//!  ├─ 1. Input       detect PDF / PNG / JPEG / TIFF
//!  ├─ 2. Rasterize   pages → images via pdfium, image, tiff (spawn_blocking)
//!  ├─ 3. Preprocess  grayscale, denoise, deskew, binarize
//!  ├─ 4. Recognize   tesseract or vision LLM, timeout with one retry
//!  ├─ 5. Clean       whitespace and invisible-character rules
//!  └─ 6. Aggregate   ordered text + per-page confidence and stats
//! ```
//!
//! [`OcrEngine`] owns the configuration, the recognizer and the admission
//! limits; [`DocumentRegistry`] adds asynchronous submission with polling;
//! [`server`] exposes both over HTTP.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_ocr::{OcrConfig, OcrEngine, Submission};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = OcrConfig::builder().languages(["eng", "deu"]).build()?;
//!     let engine = OcrEngine::from_config(config)?;
//!
//!     let bytes = std::fs::read("scan.png")?;
//!     let output = engine.recognize(Submission::new(bytes)).await?;
//!     println!("{}", output.text);
//!     eprintln!("mean confidence: {:.2}", output.stats.mean_confidence);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ocr-server` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-ocr = { version = "0.1", default-features = false }
//! ```
//!
//! ## Runtime Requirements
//!
//! PDF input needs a pdfium shared library (system-wide or in the directory
//! given by `pdfium_lib_path`). The default recognizer needs `tesseract` and
//! its language data on `PATH`.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod registry;
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    EngineKind, OcrConfig, OcrConfigBuilder, PageSelection, PageSeparator, PreprocessOptions,
};
pub use engine::{AdmissionTicket, CancelFlag, Job, OcrEngine, Submission};
pub use error::{OcrError, PageError, RecognizeError};
pub use output::{
    DocumentMetadata, DocumentStatus, OcrOutput, OcrStats, PageResult, PageSource, WordBox,
};
pub use pipeline::input::{load_input, InputDocument, MediaType};
pub use pipeline::recognize::{parse_languages, Recognition, Recognizer};
pub use pipeline::tesseract::TesseractRecognizer;
pub use pipeline::vision::VisionRecognizer;
pub use progress::{NoopProgressCallback, OcrProgressCallback, ProgressCallback};
pub use registry::{DocumentRegistry, DocumentSummary};
pub use server::{router, serve, AppState, ServerConfig};
