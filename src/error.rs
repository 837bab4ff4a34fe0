//! Error types for the edgequake-ocr library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`OcrError`]: **Fatal** for a document or a request: the submission
//!   is rejected (unsupported format, queue full, bad language hint) or the
//!   document container cannot be opened at all. Returned as
//!   `Err(OcrError)` from the engine and registry entry points.
//!
//! * [`PageError`]: **Non-fatal**: a single page failed (oversized image,
//!   recognition timeout) but every other page is fine. Stored inside
//!   [`crate::output::PageResult`] so the document still completes and the
//!   failed page keeps its slot in the output.
//!
//! Both types expose a stable snake_case [`OcrError::kind`] /
//! [`PageError::kind`] used in HTTP error bodies and page placeholders.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-ocr library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::output::PageResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum OcrError {
    // ── Submission errors ────────────────────────────────────────────────
    /// Media type is not PDF, PNG, JPEG or TIFF.
    #[error("Unsupported format '{media_type}': expected PDF, PNG, JPEG or TIFF")]
    UnsupportedFormat { media_type: String },

    /// The document container could not be decoded.
    #[error("Corrupt {media_type} input: {detail}")]
    CorruptInput { media_type: String, detail: String },

    /// Admission capacity (active + queued documents) is exhausted.
    #[error("OCR queue is full ({capacity} documents in flight); retry later")]
    QueueFull { capacity: usize },

    /// Uploaded document exceeds the configured byte limit.
    #[error("Input is {size} bytes, the limit is {limit} bytes")]
    InputTooLarge { size: usize, limit: usize },

    /// Malformed request (empty body, bad language hint, bad page selection).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Page selection matched no page of the document.
    #[error("Page selection matches no page (document has {total} pages)")]
    PageOutOfRange { total: usize },

    // ── Registry errors ──────────────────────────────────────────────────
    /// No document with this identifier (never submitted, or evicted).
    #[error("Document '{id}' not found")]
    NotFound { id: String },

    /// The document is still queued or running.
    #[error("Document '{id}' is still {status}")]
    NotReady { id: String, status: String },

    // ── Input resolution errors ──────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Engine errors ────────────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Install libpdfium or set OCR_PDFIUM_LIB_PATH to the directory containing it."
    )]
    PdfiumBindingFailed(String),

    /// The configured recognizer cannot run (binary missing, provider not configured).
    #[error("OCR engine '{engine}' is unavailable: {hint}")]
    EngineUnavailable { engine: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every page failed; returned by [`crate::output::OcrOutput::into_result`].
    #[error("All {total} pages failed.\nFirst error: {first_error}")]
    AllPagesFailed { total: usize, first_error: String },

    // ── Catch-all ────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OcrError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat { .. } => "unsupported_format",
            Self::CorruptInput { .. } => "corrupt_input",
            Self::QueueFull { .. } => "queue_full",
            Self::InputTooLarge { .. } => "input_too_large",
            Self::InvalidRequest(_) => "invalid_request",
            Self::PageOutOfRange { .. } => "page_out_of_range",
            Self::NotFound { .. } => "not_found",
            Self::NotReady { .. } => "not_ready",
            Self::FileNotFound { .. } => "file_not_found",
            Self::DownloadFailed { .. } => "download_failed",
            Self::DownloadTimeout { .. } => "download_timeout",
            Self::PdfiumBindingFailed(_) => "pdfium_unavailable",
            Self::EngineUnavailable { .. } => "engine_unavailable",
            Self::InvalidConfig(_) => "invalid_config",
            Self::AllPagesFailed { .. } => "all_pages_failed",
            Self::Internal(_) => "internal",
        }
    }

    /// True for errors raised while validating a submission, before any work
    /// is queued.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat { .. }
                | Self::QueueFull { .. }
                | Self::InputTooLarge { .. }
                | Self::InvalidRequest(_)
        )
    }
}

/// A non-fatal error for a single page.
///
/// Stored alongside [`crate::output::PageResult`] when a page fails. Page
/// numbers are 0-based indices, matching `PageResult::index`.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// The page could not be rendered or decoded.
    #[error("Page {page}: corrupt page: {detail}")]
    CorruptPage { page: usize, detail: String },

    /// The page image exceeds the configured pixel ceiling.
    #[error("Page {page}: image {width}x{height} exceeds the limit of {limit} pixels")]
    ImageTooLarge {
        page: usize,
        width: u32,
        height: u32,
        limit: u64,
    },

    /// Recognition exceeded its deadline on every attempt.
    #[error("Page {page}: recognition timed out after {attempts} attempts (last deadline {last_timeout_ms}ms)")]
    RecognitionTimeout {
        page: usize,
        attempts: u8,
        last_timeout_ms: u64,
    },

    /// The OCR engine returned an error.
    #[error("Page {page}: recognition failed: {detail}")]
    RecognitionFailed { page: usize, detail: String },

    /// The document was cancelled before this page started.
    #[error("Page {page}: cancelled")]
    Cancelled { page: usize },
}

impl PageError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CorruptPage { .. } => "corrupt_page",
            Self::ImageTooLarge { .. } => "image_too_large",
            Self::RecognitionTimeout { .. } => "recognition_timeout",
            Self::RecognitionFailed { .. } => "recognition_failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// 0-based index of the failed page.
    pub fn page(&self) -> usize {
        match self {
            Self::CorruptPage { page, .. }
            | Self::ImageTooLarge { page, .. }
            | Self::RecognitionTimeout { page, .. }
            | Self::RecognitionFailed { page, .. }
            | Self::Cancelled { page } => *page,
        }
    }
}

/// Error returned by a [`crate::pipeline::recognize::Recognizer`] for one call.
///
/// Timeouts are not represented here: the deadline is enforced around the
/// call by [`crate::pipeline::recognize::recognize_page`].
#[derive(Debug, Error)]
pub enum RecognizeError {
    /// The engine could not be started at all.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// The engine ran but reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The engine produced output that could not be parsed.
    #[error("unparseable engine output: {0}")]
    InvalidOutput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_display() {
        let e = OcrError::QueueFull { capacity: 18 };
        let msg = e.to_string();
        assert!(msg.contains("18"), "got: {msg}");
        assert_eq!(e.kind(), "queue_full");
        assert!(e.is_submission_error());
    }

    #[test]
    fn corrupt_input_is_not_a_submission_error() {
        let e = OcrError::CorruptInput {
            media_type: "application/pdf".into(),
            detail: "bad xref".into(),
        };
        assert!(!e.is_submission_error());
        assert!(e.to_string().contains("bad xref"));
    }

    #[test]
    fn image_too_large_display() {
        let e = PageError::ImageTooLarge {
            page: 2,
            width: 5000,
            height: 4000,
            limit: 12_000_000,
        };
        assert!(e.to_string().contains("5000x4000"));
        assert_eq!(e.kind(), "image_too_large");
        assert_eq!(e.page(), 2);
    }

    #[test]
    fn page_error_serialises_with_kind_tag() {
        let e = PageError::RecognitionTimeout {
            page: 1,
            attempts: 2,
            last_timeout_ms: 30_000,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "recognition_timeout");
        assert_eq!(json["attempts"], 2);

        let back: PageError = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn cancelled_display() {
        let e = PageError::Cancelled { page: 4 };
        assert_eq!(e.to_string(), "Page 4: cancelled");
    }
}
