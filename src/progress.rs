//! Progress-callback trait for per-document OCR events.
//!
//! Attach an [`Arc<dyn OcrProgressCallback>`] to a job with
//! [`crate::engine::Job::with_progress`] to receive events as the engine
//! works through a document. The registry uses one to expose live progress on
//! `GET /v1/documents/{id}`; the CLI drives an indicatif bar with another.
//!
//! # Example
//!
//! ```rust
//! use edgequake_ocr::OcrProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl OcrProgressCallback for Counter {
//!     fn on_page_complete(&self, _index: usize, _total_pages: usize, _text_len: usize) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//! ```

use crate::error::PageError;
use crate::output::DocumentStatus;
use std::sync::Arc;
use uuid::Uuid;

/// Called by the engine as it processes a document.
///
/// Page events may arrive concurrently from different tasks (pages run
/// under `buffer_unordered`), so implementations must synchronise their own
/// state. All methods default to no-ops. Page positions are 0-based indices.
pub trait OcrProgressCallback: Send + Sync {
    /// Called when the document leaves the queue and takes a processing slot.
    /// Admission itself (`try_admit`) happens earlier and reports nothing.
    fn on_document_processing(&self, document_id: Uuid) {
        let _ = document_id;
    }

    /// Called once rasterisation has produced the page list.
    fn on_document_start(&self, document_id: Uuid, total_pages: usize) {
        let _ = (document_id, total_pages);
    }

    /// Called before a page is preprocessed and recognised.
    fn on_page_start(&self, index: usize, total_pages: usize) {
        let _ = (index, total_pages);
    }

    /// Called when a page produced text.
    fn on_page_complete(&self, index: usize, total_pages: usize, text_len: usize) {
        let _ = (index, total_pages, text_len);
    }

    /// Called when a page failed, including pages skipped by cancellation.
    fn on_page_error(&self, index: usize, total_pages: usize, error: &PageError) {
        let _ = (index, total_pages, error);
    }

    /// Called once after aggregation.
    fn on_document_complete(&self, document_id: Uuid, status: DocumentStatus, success_count: usize) {
        let _ = (document_id, status, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl OcrProgressCallback for NoopProgressCallback {}

/// Shared callback handle as stored in a [`crate::engine::Job`].
pub type ProgressCallback = Arc<dyn OcrProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: Mutex<Vec<&'static str>>,
        final_status: Mutex<Option<DocumentStatus>>,
    }

    impl OcrProgressCallback for Recorder {
        fn on_page_start(&self, _index: usize, _total_pages: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _index: usize, _total_pages: usize, _text_len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _index: usize, _total_pages: usize, error: &PageError) {
            self.errors.lock().unwrap().push(error.kind());
        }

        fn on_document_complete(&self, _id: Uuid, status: DocumentStatus, _ok: usize) {
            *self.final_status.lock().unwrap() = Some(status);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_document_processing(Uuid::nil());
        cb.on_document_start(Uuid::nil(), 2);
        cb.on_page_start(0, 2);
        cb.on_page_complete(0, 2, 10);
        cb.on_page_error(1, 2, &PageError::Cancelled { page: 1 });
        cb.on_document_complete(Uuid::nil(), DocumentStatus::Cancelled, 1);
    }

    #[test]
    fn recorder_receives_events_through_arc_dyn() {
        let recorder = Arc::new(Recorder::default());
        let cb: ProgressCallback = recorder.clone();

        cb.on_page_start(0, 2);
        cb.on_page_complete(0, 2, 5);
        cb.on_page_start(1, 2);
        cb.on_page_error(
            1,
            2,
            &PageError::RecognitionTimeout {
                page: 1,
                attempts: 2,
                last_timeout_ms: 5,
            },
        );
        cb.on_document_complete(Uuid::nil(), DocumentStatus::Done, 1);

        assert_eq!(recorder.starts.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.completes.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.errors.lock().unwrap(), vec!["recognition_timeout"]);
        assert_eq!(*recorder.final_status.lock().unwrap(), Some(DocumentStatus::Done));
    }
}
