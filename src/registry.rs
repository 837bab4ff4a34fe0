//! In-memory document registry for asynchronous submissions.
//!
//! [`DocumentRegistry::submit`] validates and admits a document, spawns its
//! processing task and returns at once. Status is polled by id; the result is
//! handed out exactly once and the entry is evicted. Finished entries that
//! are never collected expire after `result_ttl`.
//!
//! Nothing is persisted: a restart forgets every document.

use crate::engine::{CancelFlag, Job, OcrEngine, Submission};
use crate::error::{OcrError, PageError};
use crate::output::{DocumentStatus, OcrOutput};
use crate::progress::OcrProgressCallback;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Machine-readable error as shown to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&OcrError> for ErrorInfo {
    fn from(e: &OcrError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// Snapshot of one document's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub status: DocumentStatus,
    pub name: String,
    pub media_type: String,
    /// Pages selected for recognition; unknown until rasterised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
    pub completed_pages: usize,
    pub failed_pages: usize,
    pub cancel_requested: bool,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the document failed as a whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

struct RecordState {
    status: DocumentStatus,
    total_pages: Option<usize>,
    outcome: Option<Result<OcrOutput, OcrError>>,
    error: Option<ErrorInfo>,
    finished_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
}

/// One registered document. Also the progress sink of its job.
struct DocumentRecord {
    id: Uuid,
    name: String,
    media_type: String,
    submitted_at: DateTime<Utc>,
    cancel: CancelFlag,
    completed: AtomicUsize,
    failed: AtomicUsize,
    state: Mutex<RecordState>,
}

impl DocumentRecord {
    fn new(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            media_type: job.media.as_mime().to_string(),
            submitted_at: Utc::now(),
            cancel: job.cancel.clone(),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            state: Mutex::new(RecordState {
                status: DocumentStatus::Pending,
                total_pages: None,
                outcome: None,
                error: None,
                finished_at: None,
                finished: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status(&self) -> DocumentStatus {
        self.state().status
    }

    fn finish(&self, result: Result<OcrOutput, OcrError>) {
        let mut state = self.state();
        match &result {
            Ok(output) => {
                state.status = output.status;
                state.total_pages.get_or_insert(output.pages.len());
            }
            Err(e) => {
                state.status = DocumentStatus::Failed;
                state.error = Some(ErrorInfo::from(e));
            }
        }
        state.outcome = Some(result);
        state.finished_at = Some(Utc::now());
        state.finished = Some(Instant::now());
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        let state = self.state();
        state.status.is_terminal() && state.finished.is_some_and(|t| t.elapsed() >= ttl)
    }

    fn summary(&self) -> DocumentSummary {
        let state = self.state();
        DocumentSummary {
            id: self.id,
            status: state.status,
            name: self.name.clone(),
            media_type: self.media_type.clone(),
            total_pages: state.total_pages,
            completed_pages: self.completed.load(Ordering::Acquire),
            failed_pages: self.failed.load(Ordering::Acquire),
            cancel_requested: self.cancel.is_cancelled(),
            submitted_at: self.submitted_at,
            finished_at: state.finished_at,
            error: state.error.clone(),
        }
    }
}

impl OcrProgressCallback for DocumentRecord {
    fn on_document_processing(&self, _document_id: Uuid) {
        let mut state = self.state();
        if state.status == DocumentStatus::Pending {
            state.status = DocumentStatus::Processing;
        }
    }

    fn on_document_start(&self, _document_id: Uuid, total_pages: usize) {
        self.state().total_pages = Some(total_pages);
    }

    fn on_page_complete(&self, _index: usize, _total_pages: usize, _text_len: usize) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    fn on_page_error(&self, _index: usize, _total_pages: usize, _error: &PageError) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Registry of submitted documents, backed by an [`OcrEngine`].
#[derive(Clone)]
pub struct DocumentRegistry {
    engine: OcrEngine,
    documents: Arc<DashMap<Uuid, Arc<DocumentRecord>>>,
    ttl: Duration,
}

impl DocumentRegistry {
    pub fn new(engine: OcrEngine) -> Self {
        let ttl = engine.config().result_ttl();
        Self {
            engine,
            documents: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn engine(&self) -> &OcrEngine {
        &self.engine
    }

    /// Number of registered documents, finished ones included.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Validate, admit and start a document. Must be called from within a
    /// Tokio runtime.
    ///
    /// Submission errors (`UnsupportedFormat`, `QueueFull`, ...) are returned
    /// here and nothing is registered.
    pub fn submit(&self, submission: Submission) -> Result<DocumentSummary, OcrError> {
        let job = self.engine.prepare(submission)?;
        let ticket = self.engine.try_admit()?;

        let record = Arc::new(DocumentRecord::new(&job));
        let job = job.with_progress(record.clone());
        self.documents.insert(record.id, Arc::clone(&record));
        info!("Registered document {} ({})", record.id, record.name);

        let engine = self.engine.clone();
        let task_record = Arc::clone(&record);
        tokio::spawn(async move {
            let result = engine.run(job, ticket).await;
            if let Err(ref e) = result {
                info!("Document {} failed: {}", task_record.id, e);
            }
            task_record.finish(result);
        });

        Ok(record.summary())
    }

    fn get(&self, id: Uuid) -> Result<Arc<DocumentRecord>, OcrError> {
        self.documents
            .get(&id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| OcrError::NotFound { id: id.to_string() })
    }

    pub fn status(&self, id: Uuid) -> Result<DocumentSummary, OcrError> {
        Ok(self.get(id)?.summary())
    }

    /// Hand out the result of a finished document and evict it.
    ///
    /// `NotReady` while the document is pending or processing. A document
    /// that failed as a whole returns its error.
    pub fn take_result(&self, id: Uuid) -> Result<OcrOutput, OcrError> {
        let removed = self
            .documents
            .remove_if(&id, |_, record| record.status().is_terminal());

        let Some((_, record)) = removed else {
            let record = self.get(id)?;
            return Err(OcrError::NotReady {
                id: id.to_string(),
                status: record.status().to_string(),
            });
        };

        debug!("Evicted document {}", id);
        let outcome = record.state().outcome.take();
        outcome.unwrap_or_else(|| Err(OcrError::NotFound { id: id.to_string() }))
    }

    /// Request cancellation. Pages not yet started are skipped; a finished
    /// document is left as it is.
    pub fn cancel(&self, id: Uuid) -> Result<DocumentSummary, OcrError> {
        let record = self.get(id)?;
        if !record.status().is_terminal() {
            record.cancel.cancel();
            info!("Cancellation requested for document {}", id);
        }
        Ok(record.summary())
    }

    /// Drop finished documents older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.documents.len();
        let ttl = self.ttl;
        self.documents.retain(|_, record| !record.is_expired(ttl));
        let removed = before.saturating_sub(self.documents.len());
        if removed > 0 {
            debug!("Swept {} expired documents", removed);
        }
        removed
    }

    /// Run [`Self::sweep_expired`] every `interval` on a background task.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        })
    }
}
