//! Configuration types for document OCR.
//!
//! All engine behaviour is controlled through [`OcrConfig`], built via its
//! [`OcrConfigBuilder`]. One struct holds every knob so the same config can
//! be shared by the HTTP server, the one-shot CLI and tests, and logged in
//! full at startup.

use crate::error::OcrError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for an [`crate::engine::OcrEngine`].
///
/// Built via [`OcrConfig::builder()`] or using [`OcrConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_ocr::OcrConfig;
///
/// let config = OcrConfig::builder()
///     .dpi(300)
///     .languages(["eng", "deu"])
///     .page_concurrency(8)
///     .build()
///     .unwrap();
/// assert_eq!(config.languages, vec!["eng", "deu"]);
/// ```
#[derive(Clone)]
pub struct OcrConfig {
    /// Which recognizer to run. Default: [`EngineKind::Tesseract`].
    pub engine: EngineKind,

    /// Language hints passed to the recognizer. Default: `["eng"]`.
    ///
    /// Tesseract language codes (ISO 639-2 plus script packs such as
    /// `chi_sim`). Multiple hints are combined (`eng+deu`).
    pub languages: Vec<String>,

    /// Rendering DPI used when rasterising PDF pages. Range: 72–600. Default: 200.
    ///
    /// Tesseract is tuned for roughly 300 DPI body text; 200 keeps page
    /// bitmaps around 1700×2200 px for Letter/A4 while still reading 9 pt
    /// type reliably.
    pub dpi: u32,

    /// Maximum accepted document size in bytes. Default: 10 MiB.
    pub max_input_bytes: usize,

    /// Pixel ceiling (width × height) for a single page. Default: 12 000 000.
    ///
    /// Pages above the ceiling are recorded as `ImageTooLarge` instead of
    /// being rendered or decoded, so one poster-sized page cannot exhaust
    /// memory for every other document in flight.
    pub max_image_pixels: u64,

    /// Maximum width or height of a single page in pixels. Default: 10 000.
    pub max_image_dimension: u32,

    /// Image normalisation steps applied before recognition.
    pub preprocess: PreprocessOptions,

    /// Pages of one document recognised concurrently. Default: 4.
    pub page_concurrency: usize,

    /// Documents processed concurrently. Default: 2.
    pub max_active_documents: usize,

    /// Documents allowed to wait for a free slot. Default: 16.
    ///
    /// Submissions beyond `max_active_documents + max_queued_documents` are
    /// rejected with [`OcrError::QueueFull`].
    pub max_queued_documents: usize,

    /// Deadline for the first recognition attempt of a page, in ms. Default: 60 000.
    pub page_timeout_ms: u64,

    /// Deadline for the single retry after a timeout, in ms. Default: 30 000.
    ///
    /// Capped at half of `page_timeout_ms`; see [`OcrConfig::retry_timeout`].
    pub retry_timeout_ms: u64,

    /// Use a PDF page's embedded text layer instead of OCR when it is dense
    /// enough. Default: true.
    pub prefer_embedded_text: bool,

    /// Minimum non-whitespace characters in the text layer for
    /// `prefer_embedded_text` to apply. Default: 50.
    pub embedded_text_min_chars: usize,

    /// Keep per-word bounding boxes in [`crate::output::PageResult`]. Default: false.
    pub include_words: bool,

    /// Page selection. Default: All pages.
    pub pages: PageSelection,

    /// Separator between pages in the assembled text. Default: blank line.
    pub page_separator: PageSeparator,

    /// Text standing in for a failed page. `{page}` is replaced with the
    /// 1-indexed page number, `{kind}` with the error kind.
    /// Default: `[page {page} unavailable: {kind}]`.
    pub placeholder_template: String,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Directory containing libpdfium. If None, the system library is used.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Tesseract executable. Default: `tesseract` (resolved via `PATH`).
    pub tesseract_bin: PathBuf,

    /// Tesseract page segmentation mode. Default: 3 (fully automatic).
    pub tesseract_psm: u8,

    /// Vision model identifier for [`EngineKind::Vision`].
    pub model: Option<String>,

    /// Vision provider name (e.g. "openai", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed vision provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// How long finished documents stay in the registry, in seconds. Default: 600.
    pub result_ttl_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

pub const DEFAULT_PLACEHOLDER: &str = "[page {page} unavailable: {kind}]";

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            languages: vec!["eng".to_string()],
            dpi: 200,
            max_input_bytes: 10 * 1024 * 1024,
            max_image_pixels: 12_000_000,
            max_image_dimension: 10_000,
            preprocess: PreprocessOptions::default(),
            page_concurrency: 4,
            max_active_documents: 2,
            max_queued_documents: 16,
            page_timeout_ms: 60_000,
            retry_timeout_ms: 30_000,
            prefer_embedded_text: true,
            embedded_text_min_chars: 50,
            include_words: false,
            pages: PageSelection::default(),
            page_separator: PageSeparator::default(),
            placeholder_template: DEFAULT_PLACEHOLDER.to_string(),
            password: None,
            pdfium_lib_path: None,
            tesseract_bin: PathBuf::from("tesseract"),
            tesseract_psm: 3,
            model: None,
            provider_name: None,
            provider: None,
            result_ttl_secs: 600,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for OcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcrConfig")
            .field("engine", &self.engine)
            .field("languages", &self.languages)
            .field("dpi", &self.dpi)
            .field("max_input_bytes", &self.max_input_bytes)
            .field("max_image_pixels", &self.max_image_pixels)
            .field("max_image_dimension", &self.max_image_dimension)
            .field("preprocess", &self.preprocess)
            .field("page_concurrency", &self.page_concurrency)
            .field("max_active_documents", &self.max_active_documents)
            .field("max_queued_documents", &self.max_queued_documents)
            .field("page_timeout_ms", &self.page_timeout_ms)
            .field("retry_timeout_ms", &self.retry_timeout_ms)
            .field("prefer_embedded_text", &self.prefer_embedded_text)
            .field("pages", &self.pages)
            .field("page_separator", &self.page_separator)
            .field("tesseract_bin", &self.tesseract_bin)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .finish()
    }
}

impl OcrConfig {
    /// Create a new builder for `OcrConfig`.
    pub fn builder() -> OcrConfigBuilder {
        OcrConfigBuilder {
            config: Self::default(),
        }
    }

    /// Deadline of the first recognition attempt.
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    /// Deadline of the retry attempt. Always shorter than the first deadline:
    /// at most half of it.
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms.min(self.page_timeout_ms / 2))
    }

    /// Total documents that may be active or waiting at once.
    pub fn admission_capacity(&self) -> usize {
        self.max_active_documents + self.max_queued_documents
    }

    /// How long finished documents stay in the registry.
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// Builder for [`OcrConfig`].
#[derive(Debug)]
pub struct OcrConfigBuilder {
    config: OcrConfig,
}

impl OcrConfigBuilder {
    pub fn engine(mut self, engine: EngineKind) -> Self {
        self.config.engine = engine;
        self
    }

    pub fn languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_input_bytes(mut self, n: usize) -> Self {
        self.config.max_input_bytes = n;
        self
    }

    pub fn max_image_pixels(mut self, px: u64) -> Self {
        self.config.max_image_pixels = px;
        self
    }

    pub fn max_image_dimension(mut self, px: u32) -> Self {
        self.config.max_image_dimension = px;
        self
    }

    pub fn preprocess(mut self, options: PreprocessOptions) -> Self {
        self.config.preprocess = options;
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    pub fn max_active_documents(mut self, n: usize) -> Self {
        self.config.max_active_documents = n.max(1);
        self
    }

    pub fn max_queued_documents(mut self, n: usize) -> Self {
        self.config.max_queued_documents = n;
        self
    }

    pub fn page_timeout(mut self, timeout: Duration) -> Self {
        self.config.page_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn prefer_embedded_text(mut self, v: bool) -> Self {
        self.config.prefer_embedded_text = v;
        self
    }

    pub fn embedded_text_min_chars(mut self, n: usize) -> Self {
        self.config.embedded_text_min_chars = n;
        self
    }

    pub fn include_words(mut self, v: bool) -> Self {
        self.config.include_words = v;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn placeholder_template(mut self, template: impl Into<String>) -> Self {
        self.config.placeholder_template = template.into();
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn tesseract_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tesseract_bin = path.into();
        self
    }

    pub fn tesseract_psm(mut self, psm: u8) -> Self {
        self.config.tesseract_psm = psm.min(13);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn result_ttl_secs(mut self, secs: u64) -> Self {
        self.config.result_ttl_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<OcrConfig, OcrError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(OcrError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.page_concurrency == 0 || c.max_active_documents == 0 {
            return Err(OcrError::InvalidConfig(
                "Concurrency limits must be ≥ 1".into(),
            ));
        }
        if c.page_timeout_ms < 2 {
            return Err(OcrError::InvalidConfig(
                "Page timeout must be at least 2 ms".into(),
            ));
        }
        if c.retry_timeout_ms == 0 {
            return Err(OcrError::InvalidConfig(
                "Retry timeout must be greater than zero".into(),
            ));
        }
        if c.max_image_pixels == 0 || c.max_image_dimension == 0 {
            return Err(OcrError::InvalidConfig(
                "Image limits must be greater than zero".into(),
            ));
        }
        if c.languages.is_empty() {
            return Err(OcrError::InvalidConfig(
                "At least one language is required".into(),
            ));
        }
        crate::pipeline::recognize::validate_languages(&c.languages)
            .map_err(|e| OcrError::InvalidConfig(e.to_string()))?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// OCR backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Local `tesseract` binary. (default)
    #[default]
    Tesseract,
    /// Vision-LLM transcription through `edgequake-llm`.
    Vision,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Tesseract => f.write_str("tesseract"),
            EngineKind::Vision => f.write_str("vision"),
        }
    }
}

/// Normalisation steps run by [`crate::pipeline::preprocess`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessOptions {
    /// 3×3 median filter against scanner speckle. Default: true.
    pub denoise: bool,
    /// Rotate the page so text lines are horizontal. Default: true.
    pub deskew: bool,
    /// Otsu threshold to pure black and white. Default: true.
    pub binarize: bool,
    /// Largest skew angle searched, in degrees. Default: 5.0.
    pub max_skew_degrees: f32,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            denoise: true,
            deskew: true,
            binarize: true,
            max_skew_degrees: 5.0,
        }
    }
}

impl PreprocessOptions {
    /// Grayscale conversion only.
    pub fn none() -> Self {
        Self {
            denoise: false,
            deskew: false,
            binarize: false,
            max_skew_degrees: 0.0,
        }
    }
}

/// Specifies which pages of a document to recognise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum PageSelection {
    /// All pages (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// True if the 0-indexed page is selected. Usable before the page count is known.
    pub fn includes(&self, index: usize) -> bool {
        let page = index + 1;
        match self {
            PageSelection::All => true,
            PageSelection::Single(p) => *p == page,
            PageSelection::Range(start, end) => *start <= page && page <= *end,
            PageSelection::Set(pages) => pages.contains(&page),
        }
    }

    /// Parse `all`, `5`, `3-15` or `1,3,5`.
    pub fn parse(s: &str) -> Result<Self, OcrError> {
        let s = s.trim().to_lowercase();
        let invalid = |msg: String| OcrError::InvalidRequest(msg);

        if s.is_empty() || s == "all" {
            return Ok(PageSelection::All);
        }

        if let Some((start, end)) = s.split_once('-') {
            let start: usize = start
                .trim()
                .parse()
                .map_err(|_| invalid(format!("Invalid start page in range '{s}'")))?;
            let end: usize = end
                .trim()
                .parse()
                .map_err(|_| invalid(format!("Invalid end page in range '{s}'")))?;
            if start < 1 || start > end {
                return Err(invalid(format!(
                    "Invalid page range '{start}-{end}': pages are 1-indexed and start must be <= end"
                )));
            }
            return Ok(PageSelection::Range(start, end));
        }

        if s.contains(',') {
            let pages = s
                .split(',')
                .map(|p| {
                    p.trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|&n| n >= 1)
                        .ok_or_else(|| invalid(format!("Invalid page number: '{}'", p.trim())))
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(PageSelection::Set(pages));
        }

        match s.parse::<usize>() {
            Ok(page) if page >= 1 => Ok(PageSelection::Single(page)),
            _ => Err(invalid(format!("Invalid page number: '{s}'"))),
        }
    }
}

/// How to separate pages in the assembled text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// Blank line between pages. (default)
    #[default]
    None,
    /// Form feed on its own line, the convention of `tesseract` and `pdftotext`.
    FormFeed,
    /// Marker line with the page number: "--- page N ---".
    Marker,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before the given page (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::FormFeed => "\n\u{000C}\n".to_string(),
            PageSeparator::Marker => format!("\n\n--- page {} ---\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }

    /// Parse `none`, `ff`, `marker`, or any other string as a custom separator.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" | "" => PageSeparator::None,
            "ff" | "form-feed" | "formfeed" => PageSeparator::FormFeed,
            "marker" | "page" => PageSeparator::Marker,
            _ => PageSeparator::Custom(s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_service_limits() {
        let c = OcrConfig::default();
        assert_eq!(c.dpi, 200);
        assert_eq!(c.max_image_pixels, 12_000_000);
        assert_eq!(c.max_input_bytes, 10 * 1024 * 1024);
        assert_eq!(c.admission_capacity(), 18);
        assert_eq!(c.languages, vec!["eng"]);
    }

    #[test]
    fn builder_clamps_values() {
        let c = OcrConfig::builder()
            .dpi(10)
            .page_concurrency(0)
            .max_active_documents(0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 72);
        assert_eq!(c.page_concurrency, 1);
        assert_eq!(c.max_active_documents, 1);
    }

    #[test]
    fn retry_timeout_is_always_shorter_than_page_timeout() {
        let c = OcrConfig::builder()
            .page_timeout(Duration::from_secs(5))
            .retry_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        assert_eq!(c.retry_timeout(), Duration::from_millis(2_500));

        // Equal deadlines would make the retry no shorter than the first try.
        let c = OcrConfig::builder()
            .page_timeout(Duration::from_secs(20))
            .retry_timeout(Duration::from_secs(20))
            .build()
            .unwrap();
        assert!(c.retry_timeout() < c.page_timeout());

        let c = OcrConfig::default();
        assert_eq!(c.retry_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn build_rejects_zero_retry_timeout() {
        let err = OcrConfig::builder()
            .retry_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Retry timeout"));
    }

    #[test]
    fn build_rejects_bad_languages() {
        let err = OcrConfig::builder()
            .languages(["eng", "--oem"])
            .build()
            .unwrap_err();
        assert!(matches!(err, OcrError::InvalidConfig(_)));

        let err = OcrConfig::builder()
            .languages(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, OcrError::InvalidConfig(_)));
    }

    #[test]
    fn build_rejects_zero_timeout() {
        let err = OcrConfig::builder()
            .page_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(5), vec![0, 1, 2, 3, 4]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 4).to_indices(5), vec![1, 2, 3]);
        assert_eq!(
            PageSelection::Set(vec![3, 1, 3]).to_indices(5),
            vec![0, 2] // deduplicated and sorted
        );
    }

    #[test]
    fn page_selection_includes_matches_to_indices() {
        let selections = [
            PageSelection::All,
            PageSelection::Single(2),
            PageSelection::Range(2, 3),
            PageSelection::Set(vec![1, 4]),
        ];
        for sel in selections {
            let from_includes: Vec<usize> = (0..5).filter(|&i| sel.includes(i)).collect();
            assert_eq!(from_includes, sel.to_indices(5), "{sel:?}");
        }
    }

    #[test]
    fn page_selection_parse() {
        assert_eq!(PageSelection::parse("all").unwrap(), PageSelection::All);
        assert_eq!(PageSelection::parse("").unwrap(), PageSelection::All);
        assert_eq!(PageSelection::parse("4").unwrap(), PageSelection::Single(4));
        assert_eq!(
            PageSelection::parse("2-7").unwrap(),
            PageSelection::Range(2, 7)
        );
        assert_eq!(
            PageSelection::parse("1, 3,5").unwrap(),
            PageSelection::Set(vec![1, 3, 5])
        );
        assert!(PageSelection::parse("0").is_err());
        assert!(PageSelection::parse("5-2").is_err());
        assert!(PageSelection::parse("1,x").is_err());
    }

    #[test]
    fn separator_render_and_parse() {
        assert_eq!(PageSeparator::None.render(2), "\n\n");
        assert_eq!(PageSeparator::Marker.render(3), "\n\n--- page 3 ---\n\n");
        assert_eq!(PageSeparator::parse("ff"), PageSeparator::FormFeed);
        assert_eq!(
            PageSeparator::parse("#####"),
            PageSeparator::Custom("#####".into())
        );
    }
}
