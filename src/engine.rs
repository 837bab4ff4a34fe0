//! The OCR engine: an explicitly owned context for the whole pipeline.
//!
//! [`OcrEngine`] holds the configuration, the recognizer and the admission
//! state. Cloning is cheap (`Arc` inside) and every clone shares the same
//! limits. Separate engines share only the process-wide pdfium lock, so
//! tests can run several side by side.
//!
//! ## Admission
//!
//! A document passes two gates:
//!
//! 1. [`OcrEngine::try_admit`]: a non-blocking atomic counter of documents in
//!    flight (running + waiting). At `max_active_documents +
//!    max_queued_documents` the submission fails with
//!    [`OcrError::QueueFull`] immediately.
//! 2. [`OcrEngine::run`]: waits on a semaphore with `max_active_documents`
//!    permits before any work starts.
//!
//! The [`AdmissionTicket`] returned by the first gate releases its slot when
//! dropped, whatever way the document ends.
//!
//! ## Per-document flow
//!
//! ```text
//! bytes ─▶ rasterize ──mpsc(READ_AHEAD)──▶ ┬─ page ─▶ preprocess ─▶ recognize ─┐
//!          (blocking,                      ├─ page ─▶ ...                      ├─▶ aggregate
//!           one page at a time)            └─ page ─▶ ...                      ┘
//!                                           buffer_unordered(page_concurrency)
//! ```
//!
//! Rasterization and recognition overlap. A document holds at most
//! `page_concurrency + READ_AHEAD + 1` page images at once (workers, channel
//! slots, the page being rendered), independent of its page count.

use crate::config::{EngineKind, OcrConfig, PageSelection};
use crate::error::{OcrError, PageError};
use crate::output::{DocumentMetadata, DocumentStatus, OcrOutput, OcrStats, PageResult, PageSource};
use crate::pipeline::aggregate::{aggregate, AggregateOptions, Timings};
use crate::pipeline::input::{load_input, resolve_media_type, InputDocument, MediaType};
use crate::pipeline::postprocess::clean_text;
use crate::pipeline::preprocess::{preprocess, ImageLimits};
use crate::pipeline::rasterize::{rasterize, PageContent, RasterOptions, RasterPage};
use crate::pipeline::recognize::{recognize_page, validate_languages, Recognizer, RetryPolicy};
use crate::pipeline::tesseract::TesseractRecognizer;
use crate::pipeline::vision::VisionRecognizer;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use futures::stream::{Stream, StreamExt};
use image::DynamicImage;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared cancellation flag of one document.
///
/// Checked before the document takes its processing slot and before each
/// page starts. Pages already running finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A document as handed to the engine, before validation.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub bytes: Vec<u8>,
    /// Declared MIME type; `None` or `application/octet-stream` means "detect".
    pub declared_type: Option<String>,
    /// Language hints; the engine default when `None`.
    pub languages: Option<Vec<String>>,
    /// Page selection; the engine default when `None`.
    pub pages: Option<PageSelection>,
    /// File name or URL, for logs.
    pub name: Option<String>,
}

impl Submission {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            ..Default::default()
        }
    }

    pub fn with_declared_type(mut self, mime: impl Into<String>) -> Self {
        self.declared_type = Some(mime.into());
        self
    }

    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = Some(languages);
        self
    }

    pub fn with_pages(mut self, pages: PageSelection) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl From<InputDocument> for Submission {
    fn from(doc: InputDocument) -> Self {
        Self {
            bytes: doc.bytes,
            declared_type: doc.declared_type,
            languages: None,
            pages: None,
            name: Some(doc.name),
        }
    }
}

/// A validated submission, ready to run.
pub struct Job {
    pub id: Uuid,
    pub bytes: Vec<u8>,
    pub media: MediaType,
    pub languages: Vec<String>,
    pub pages: PageSelection,
    pub name: String,
    pub cancel: CancelFlag,
    pub progress: ProgressCallback,
}

impl Job {
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }
}

struct Admission {
    in_flight: AtomicUsize,
    capacity: usize,
    active: Arc<Semaphore>,
}

/// One admitted document's slot. Dropping it frees the slot.
pub struct AdmissionTicket {
    admission: Arc<Admission>,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.admission.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct EngineInner {
    config: OcrConfig,
    recognizer: Arc<dyn Recognizer>,
    admission: Arc<Admission>,
}

/// Owned pipeline context. See the module docs.
#[derive(Clone)]
pub struct OcrEngine {
    inner: Arc<EngineInner>,
}

impl OcrEngine {
    /// Create an engine around an existing recognizer.
    pub fn new(config: OcrConfig, recognizer: Arc<dyn Recognizer>) -> Self {
        let admission = Arc::new(Admission {
            in_flight: AtomicUsize::new(0),
            capacity: config.admission_capacity(),
            active: Arc::new(Semaphore::new(config.max_active_documents)),
        });
        Self {
            inner: Arc::new(EngineInner {
                config,
                recognizer,
                admission,
            }),
        }
    }

    /// Create an engine with the recognizer selected by `config.engine`.
    pub fn from_config(config: OcrConfig) -> Result<Self, OcrError> {
        let recognizer: Arc<dyn Recognizer> = match config.engine {
            EngineKind::Tesseract => Arc::new(TesseractRecognizer::from_config(&config)),
            EngineKind::Vision => Arc::new(VisionRecognizer::from_config(&config)?),
        };
        info!("OCR engine: {} ({:?})", recognizer.name(), config.languages);
        Ok(Self::new(config, recognizer))
    }

    pub fn config(&self) -> &OcrConfig {
        &self.inner.config
    }

    pub fn recognizer_name(&self) -> &str {
        self.inner.recognizer.name()
    }

    /// Whether the recognizer can run.
    pub async fn is_available(&self) -> bool {
        self.inner.recognizer.is_available().await
    }

    /// Documents currently admitted (running or waiting).
    pub fn in_flight(&self) -> usize {
        self.inner.admission.in_flight.load(Ordering::Acquire)
    }

    /// Documents that may be admitted at once.
    pub fn capacity(&self) -> usize {
        self.inner.admission.capacity
    }

    /// Read a local path or download a URL as a submission, using the
    /// configured download timeout.
    pub async fn load(&self, input: &str) -> Result<Submission, OcrError> {
        let document = load_input(input, self.inner.config.download_timeout_secs).await?;
        Ok(Submission::from(document))
    }

    /// Validate a submission. Nothing is queued and no slot is taken.
    pub fn prepare(&self, submission: Submission) -> Result<Job, OcrError> {
        let config = &self.inner.config;

        if submission.bytes.is_empty() {
            return Err(OcrError::InvalidRequest("document is empty".into()));
        }
        if submission.bytes.len() > config.max_input_bytes {
            return Err(OcrError::InputTooLarge {
                size: submission.bytes.len(),
                limit: config.max_input_bytes,
            });
        }

        let media = resolve_media_type(submission.declared_type.as_deref(), &submission.bytes)?;

        let languages = submission
            .languages
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| config.languages.clone());
        validate_languages(&languages).map_err(|e| OcrError::InvalidRequest(e.to_string()))?;

        Ok(Job {
            id: Uuid::new_v4(),
            bytes: submission.bytes,
            media,
            languages,
            pages: submission.pages.unwrap_or_else(|| config.pages.clone()),
            name: submission.name.unwrap_or_else(|| "upload".to_string()),
            cancel: CancelFlag::new(),
            progress: Arc::new(NoopProgressCallback),
        })
    }

    /// Take an admission slot without waiting.
    pub fn try_admit(&self) -> Result<AdmissionTicket, OcrError> {
        let admission = &self.inner.admission;
        let capacity = admission.capacity;
        admission
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| OcrError::QueueFull { capacity })?;
        Ok(AdmissionTicket {
            admission: Arc::clone(admission),
        })
    }

    /// Validate, admit and run a submission, waiting for the result.
    pub async fn recognize(&self, submission: Submission) -> Result<OcrOutput, OcrError> {
        let job = self.prepare(submission)?;
        let ticket = self.try_admit()?;
        self.run(job, ticket).await
    }

    /// Run an admitted job to completion.
    ///
    /// `Err` only for document-level failures (corrupt container, empty page
    /// selection). Page failures are inside the returned output.
    pub async fn run(&self, job: Job, ticket: AdmissionTicket) -> Result<OcrOutput, OcrError> {
        let total_start = Instant::now();

        let _permit = Arc::clone(&ticket.admission.active)
            .acquire_owned()
            .await
            .map_err(|e| OcrError::Internal(format!("admission semaphore closed: {e}")))?;

        if job.cancel.is_cancelled() {
            info!("Document {} cancelled before start", job.id);
            let output = cancelled_before_start(&job);
            job.progress.on_document_complete(job.id, output.status, 0);
            return Ok(output);
        }

        info!(
            "Processing document {} ({}, {} bytes, {})",
            job.id,
            job.name,
            job.bytes.len(),
            job.media
        );
        job.progress.on_document_processing(job.id);

        // ── Rasterize + recognize ────────────────────────────────────────
        let mut options =
            RasterOptions::from_config(&self.inner.config).with_pages(job.pages.clone());
        options.cancel = job.cancel.clone();
        let mut stream = rasterize(job.bytes, job.media, options).await?;

        let selected = stream.header.selected.clone();
        let metadata = stream.header.metadata.clone();
        job.progress.on_document_start(job.id, selected.len());

        let recognize_start = Instant::now();
        let mut pages = self
            .recognize_pages(
                stream.pages(),
                selected.len(),
                &job.languages,
                &job.cancel,
                &job.progress,
            )
            .await;
        let recognize_ms = recognize_start.elapsed().as_millis() as u64;

        let rasterize_ms = match stream.finish().await {
            Ok(ms) => ms,
            Err(e) => {
                warn!("Rasterizer for document {} stopped early: {}", job.id, e);
                0
            }
        };
        fill_missing_pages(&mut pages, &selected);

        // ── Aggregate ────────────────────────────────────────────────────
        let output = aggregate(
            job.id,
            pages,
            metadata,
            &AggregateOptions::from_config(&self.inner.config),
            job.cancel.is_cancelled(),
            Timings {
                rasterize_ms,
                recognize_ms,
                total_ms: total_start.elapsed().as_millis() as u64,
            },
        );

        info!(
            "Document {} {}: {}/{} pages ok, mean confidence {:.2}, {}ms",
            job.id,
            output.status,
            output.stats.total_pages - output.stats.failed_pages,
            output.stats.total_pages,
            output.stats.mean_confidence,
            output.stats.total_duration_ms
        );
        job.progress.on_document_complete(
            job.id,
            output.status,
            output.stats.total_pages - output.stats.failed_pages,
        );
        Ok(output)
    }

    /// Preprocess and recognise pages as the rasterizer releases them, at
    /// most `page_concurrency` at a time. Results come back in completion
    /// order.
    ///
    /// The stream is only polled when a worker is free, so together with the
    /// rasterizer's read-ahead this bounds how many page images are alive.
    pub async fn recognize_pages(
        &self,
        pages: impl Stream<Item = RasterPage>,
        total: usize,
        languages: &[String],
        cancel: &CancelFlag,
        progress: &ProgressCallback,
    ) -> Vec<PageResult> {
        pages
            .map(|page| self.process_page(page, total, languages, cancel, progress))
            .buffer_unordered(self.inner.config.page_concurrency)
            .collect()
            .await
    }

    async fn process_page(
        &self,
        page: RasterPage,
        total: usize,
        languages: &[String],
        cancel: &CancelFlag,
        progress: &ProgressCallback,
    ) -> PageResult {
        let index = page.index;
        if cancel.is_cancelled() {
            let err = PageError::Cancelled { page: index };
            progress.on_page_error(index, total, &err);
            return PageResult::failed(index, err, 0);
        }

        let start = Instant::now();
        progress.on_page_start(index, total);

        let result = match page.content {
            PageContent::Failed(err) => {
                PageResult::failed(index, err, start.elapsed().as_millis() as u64)
            }
            PageContent::Text(text) => PageResult {
                index,
                text: clean_text(&text),
                confidence: 1.0,
                source: PageSource::EmbeddedText,
                words: None,
                width: 0,
                height: 0,
                skew_degrees: None,
                attempts: 0,
                duration_ms: start.elapsed().as_millis() as u64,
                error: None,
            },
            PageContent::Image(image) => self.ocr_page(index, image, languages, start).await,
        };

        match result.error {
            None => progress.on_page_complete(index, total, result.text.len()),
            Some(ref err) => {
                warn!("{}", err);
                progress.on_page_error(index, total, err);
            }
        }
        result
    }

    async fn ocr_page(
        &self,
        index: usize,
        image: DynamicImage,
        languages: &[String],
        start: Instant,
    ) -> PageResult {
        let config = &self.inner.config;
        let elapsed_ms = || start.elapsed().as_millis() as u64;

        let options = config.preprocess.clone();
        let limits = ImageLimits::from_config(config);
        let prepared =
            match tokio::task::spawn_blocking(move || preprocess(index, &image, &options, &limits))
                .await
            {
                Ok(Ok(prepared)) => prepared,
                Ok(Err(err)) => return PageResult::failed(index, err, elapsed_ms()),
                Err(e) => {
                    let err = PageError::CorruptPage {
                        page: index,
                        detail: format!("preprocessing panicked: {e}"),
                    };
                    return PageResult::failed(index, err, elapsed_ms());
                }
            };

        let width = prepared.image.width();
        let height = prepared.image.height();
        let policy = RetryPolicy::from_config(config);

        match recognize_page(self.inner.recognizer.as_ref(), &prepared, languages, &policy).await {
            Ok((recognition, attempts)) => {
                debug!("Page {} recognised in {}ms", index + 1, elapsed_ms());
                PageResult {
                    index,
                    text: clean_text(&recognition.text),
                    confidence: recognition.confidence,
                    source: PageSource::Ocr,
                    words: config.include_words.then_some(recognition.words),
                    width,
                    height,
                    skew_degrees: prepared.skew_degrees,
                    attempts,
                    duration_ms: elapsed_ms(),
                    error: None,
                }
            }
            Err(err) => {
                let attempts = match err {
                    PageError::RecognitionTimeout { attempts, .. } => attempts,
                    _ => 1,
                };
                PageResult {
                    width,
                    height,
                    skew_degrees: prepared.skew_degrees,
                    attempts,
                    ..PageResult::failed(index, err, elapsed_ms())
                }
            }
        }
    }
}

/// Give every selected page a result, even if the rasterizer stopped before
/// producing it.
fn fill_missing_pages(pages: &mut Vec<PageResult>, selected: &[usize]) {
    let seen: HashSet<usize> = pages.iter().map(|p| p.index).collect();
    for &index in selected.iter().filter(|i| !seen.contains(i)) {
        let err = PageError::CorruptPage {
            page: index,
            detail: "rasterizer stopped before this page".into(),
        };
        pages.push(PageResult::failed(index, err, 0));
    }
}

fn cancelled_before_start(job: &Job) -> OcrOutput {
    OcrOutput {
        document_id: job.id,
        status: DocumentStatus::Cancelled,
        text: String::new(),
        pages: Vec::new(),
        metadata: DocumentMetadata {
            media_type: job.media.as_mime().to_string(),
            ..Default::default()
        },
        stats: OcrStats::default(),
    }
}
