//! Aggregation: merge per-page results into one ordered document result.
//!
//! Pages finish in any order under `buffer_unordered`; this is the only place
//! order is restored. Failed pages keep their slot with a placeholder text.

use crate::config::{OcrConfig, PageSeparator};
use crate::error::PageError;
use crate::output::{DocumentMetadata, DocumentStatus, OcrOutput, OcrStats, PageResult, PageSource};
use uuid::Uuid;

/// Durations measured by the engine, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub rasterize_ms: u64,
    pub recognize_ms: u64,
    pub total_ms: u64,
}

/// Assembly settings taken from [`OcrConfig`].
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub separator: PageSeparator,
    pub placeholder_template: String,
}

impl AggregateOptions {
    pub fn from_config(config: &OcrConfig) -> Self {
        Self {
            separator: config.page_separator.clone(),
            placeholder_template: config.placeholder_template.clone(),
        }
    }
}

/// Build the immutable document result.
///
/// `cancelled` is whether the document's cancel flag was raised; the status
/// only becomes `cancelled` if that actually skipped a page.
pub fn aggregate(
    document_id: Uuid,
    mut pages: Vec<PageResult>,
    metadata: DocumentMetadata,
    options: &AggregateOptions,
    cancelled: bool,
    timings: Timings,
) -> OcrOutput {
    pages.sort_by_key(|p| p.index);

    for page in pages.iter_mut() {
        if let Some(ref err) = page.error {
            page.text = render_placeholder(&options.placeholder_template, page.index, err);
        }
    }

    let skipped = pages
        .iter()
        .any(|p| matches!(p.error, Some(PageError::Cancelled { .. })));
    let succeeded = pages.iter().filter(|p| p.is_success()).count();
    let status = if cancelled && skipped {
        DocumentStatus::Cancelled
    } else if succeeded > 0 {
        DocumentStatus::Done
    } else {
        DocumentStatus::Failed
    };

    let mut text = String::new();
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            text.push_str(&options.separator.render(page.index + 1));
        }
        text.push_str(&page.text);
    }

    let stats = compute_stats(&pages, timings);
    OcrOutput {
        document_id,
        status,
        text,
        pages,
        metadata,
        stats,
    }
}

/// Fill `{page}` (1-indexed) and `{kind}` into the placeholder template.
pub fn render_placeholder(template: &str, index: usize, error: &PageError) -> String {
    template
        .replace("{page}", &(index + 1).to_string())
        .replace("{kind}", error.kind())
}

fn compute_stats(pages: &[PageResult], timings: Timings) -> OcrStats {
    let successful: Vec<&PageResult> = pages.iter().filter(|p| p.is_success()).collect();
    let mean_confidence = if successful.is_empty() {
        0.0
    } else {
        successful.iter().map(|p| p.confidence).sum::<f32>() / successful.len() as f32
    };

    OcrStats {
        total_pages: pages.len(),
        recognized_pages: successful
            .iter()
            .filter(|p| p.source == PageSource::Ocr)
            .count(),
        embedded_text_pages: successful
            .iter()
            .filter(|p| p.source == PageSource::EmbeddedText)
            .count(),
        failed_pages: pages.len() - successful.len(),
        mean_confidence,
        total_duration_ms: timings.total_ms,
        rasterize_duration_ms: timings.rasterize_ms,
        recognize_duration_ms: timings.recognize_ms,
    }
}
