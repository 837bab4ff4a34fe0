//! Output types: the per-page record and the aggregated document result.

use crate::error::{OcrError, PageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a submitted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Admitted, waiting for a processing slot.
    Pending,
    /// Pages are being rasterised or recognised.
    Processing,
    /// At least one page produced text.
    Done,
    /// No page produced text, or the container could not be opened.
    Failed,
    /// Cancelled before every page ran.
    Cancelled,
}

impl DocumentStatus {
    /// Done, failed and cancelled documents never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Where a page's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    /// Recognised from the page image.
    Ocr,
    /// Copied from the PDF's digital text layer.
    EmbeddedText,
    /// The page failed; the text is a placeholder.
    Placeholder,
}

/// One recognised word with its bounding box in preprocessed-image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordBox {
    pub text: String,
    /// Word confidence in [0, 1].
    pub confidence: f32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Result for a single page, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index within the document.
    pub index: usize,
    /// Recognised text, or the placeholder when `error` is set.
    pub text: String,
    /// Recognition confidence in [0, 1]; 0 for failed pages.
    pub confidence: f32,
    pub source: PageSource,
    /// Word boxes, when requested and supported by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordBox>>,
    /// Size of the page image fed to the recognizer (0 if none).
    pub width: u32,
    pub height: u32,
    /// Skew corrected by the preprocessor, in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skew_degrees: Option<f32>,
    /// Recognition attempts made (0 when OCR did not run).
    pub attempts: u8,
    pub duration_ms: u64,
    /// Set when the page failed; `text` then holds the placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
}

impl PageResult {
    /// A failed page with its error marker. The aggregator fills in the
    /// placeholder text.
    pub fn failed(index: usize, error: PageError, duration_ms: u64) -> Self {
        Self {
            index,
            text: String::new(),
            confidence: 0.0,
            source: PageSource::Placeholder,
            words: None,
            width: 0,
            height: 0,
            skew_degrees: None,
            attempts: 0,
            duration_ms,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Document properties gathered while rasterising.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub media_type: String,
    /// Pages in the container, before page selection.
    pub page_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_version: Option<String>,
}

/// Counters and timings for one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrStats {
    /// Pages in the result (equals the rasterised page count).
    pub total_pages: usize,
    pub recognized_pages: usize,
    pub embedded_text_pages: usize,
    pub failed_pages: usize,
    /// Mean confidence over successful pages.
    pub mean_confidence: f32,
    pub total_duration_ms: u64,
    /// Time the rasterizer ran. It works alongside recognition, so this
    /// overlaps `recognize_duration_ms`.
    pub rasterize_duration_ms: u64,
    pub recognize_duration_ms: u64,
}

/// The aggregated, immutable result of one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutput {
    pub document_id: Uuid,
    pub status: DocumentStatus,
    /// Page texts in index order, joined with the configured separator.
    pub text: String,
    pub pages: Vec<PageResult>,
    pub metadata: DocumentMetadata,
    pub stats: OcrStats,
}

impl OcrOutput {
    /// Treat a document with no successful page as an error.
    pub fn into_result(self) -> Result<Self, OcrError> {
        if self.status == DocumentStatus::Failed {
            let first_error = self
                .pages
                .iter()
                .find_map(|p| p.error.as_ref())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(OcrError::AllPagesFailed {
                total: self.pages.len(),
                first_error,
            });
        }
        Ok(self)
    }

    pub fn failed_pages(&self) -> impl Iterator<Item = &PageResult> {
        self.pages.iter().filter(|p| !p.is_success())
    }
}
