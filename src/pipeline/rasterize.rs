//! Rasterisation: turn a document container into one entry per selected page.
//!
//! PDF pages are rendered through pdfium. PNG and JPEG are a single page
//! decoded with `image`; TIFF may hold several images (one per IFD) and is
//! walked with the `tiff` decoder directly.
//!
//! Failures are split by scope. A container that cannot be opened at all is
//! [`OcrError::CorruptInput`]. A page that cannot be rendered or decoded, or
//! whose pixel size is over the ceiling, becomes [`PageContent::Failed`] and
//! keeps its slot; the other pages continue. A TIFF whose directory chain
//! breaks part way reports the unreadable directory as a failed page and ends
//! there.
//!
//! ## Streaming
//!
//! Pages are produced one at a time on the blocking pool and handed to the
//! engine through a channel of [`READ_AHEAD`] slots. The producer blocks
//! while the channel is full, so at most `page_concurrency + READ_AHEAD + 1`
//! page images exist for a document at any moment, whatever its page count.
//! Images are converted to 8-bit grayscale as they are produced.
//!
//! pdfium keeps library-global state, and dropping a [`Pdfium`] tears the
//! library down for the whole process. A PDF is therefore rasterised under
//! one process-wide lock, [`lock_pdfium`], held from binding the library to
//! closing the document. PDFs are rasterised one at a time; other formats
//! and recognition are unaffected. The consumer side never takes the lock,
//! so a producer parked on a full channel cannot deadlock.

use crate::config::{OcrConfig, PageSelection};
use crate::engine::CancelFlag;
use crate::error::{OcrError, PageError};
use crate::output::DocumentMetadata;
use crate::pipeline::input::MediaType;
use crate::pipeline::preprocess::ImageLimits;
use futures::stream::{self, Stream};
use image::{DynamicImage, GrayImage, ImageBuffer, ImageFormat, ImageReader, Luma, LumaA};
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::ColorType;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pages rasterised ahead of the recognition workers.
pub const READ_AHEAD: usize = 1;

/// What the rasteriser produced for one page.
#[derive(Debug, Clone)]
pub enum PageContent {
    /// An 8-bit grayscale page image to preprocess and recognise.
    Image(DynamicImage),
    /// The PDF text layer, used instead of OCR.
    Text(String),
    /// The page could not be produced.
    Failed(PageError),
}

#[derive(Debug, Clone)]
pub struct RasterPage {
    /// 0-based index in the source document.
    pub index: usize,
    pub content: PageContent,
}

/// What is known once the container is open, before any page is produced.
#[derive(Debug, Clone)]
pub struct RasterHeader {
    pub metadata: DocumentMetadata,
    /// Selected 0-based page indices, ascending. Never empty.
    pub selected: Vec<usize>,
}

/// Receives the rasteriser's output. Returning `false` stops production.
pub trait PageSink {
    fn begin(&mut self, header: RasterHeader) -> bool;
    fn page(&mut self, page: RasterPage) -> bool;
}

/// Rasteriser settings, extracted from [`OcrConfig`] so they can move into
/// the blocking task.
#[derive(Debug, Clone)]
pub struct RasterOptions {
    pub dpi: u32,
    pub limits: ImageLimits,
    pub pages: PageSelection,
    pub password: Option<String>,
    pub pdfium_lib_path: Option<PathBuf>,
    pub prefer_embedded_text: bool,
    pub embedded_text_min_chars: usize,
    /// Pages not yet produced when this is set come out as `Cancelled`
    /// without being decoded.
    pub cancel: CancelFlag,
}

impl RasterOptions {
    pub fn from_config(config: &OcrConfig) -> Self {
        Self {
            dpi: config.dpi,
            limits: ImageLimits::from_config(config),
            pages: config.pages.clone(),
            password: config.password.clone(),
            pdfium_lib_path: config.pdfium_lib_path.clone(),
            prefer_embedded_text: config.prefer_embedded_text,
            embedded_text_min_chars: config.embedded_text_min_chars,
            cancel: CancelFlag::new(),
        }
    }

    /// Override the page selection for one document.
    pub fn with_pages(mut self, pages: PageSelection) -> Self {
        self.pages = pages;
        self
    }
}

static PDFIUM: Mutex<()> = Mutex::new(());

/// Serialise access to pdfium across the process. Hold the guard for the
/// whole lifetime of any [`Pdfium`] created outside this module.
pub fn lock_pdfium() -> MutexGuard<'static, ()> {
    PDFIUM.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── async front end ──────────────────────────────────────────────────────

/// A document being rasterised in the background.
pub struct PageStream {
    pub header: RasterHeader,
    pages: mpsc::Receiver<RasterPage>,
    task: JoinHandle<Result<u64, OcrError>>,
}

impl PageStream {
    /// The pages, in document order, as the producer releases them.
    pub fn pages(&mut self) -> impl Stream<Item = RasterPage> + '_ {
        stream::unfold(&mut self.pages, |rx| async move {
            rx.recv().await.map(|page| (page, rx))
        })
    }

    /// Wait for the producer to exit and return how long it ran, in ms.
    ///
    /// `Err` if it panicked; pages it never sent are then missing from the
    /// stream and the caller must account for them.
    pub async fn finish(self) -> Result<u64, OcrError> {
        drop(self.pages);
        match self.task.await {
            Ok(Ok(ms)) => Ok(ms),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(OcrError::Internal(format!("Rasterize task panicked: {}", e))),
        }
    }
}

struct ChannelSink {
    header: Option<oneshot::Sender<RasterHeader>>,
    pages: mpsc::Sender<RasterPage>,
}

impl PageSink for ChannelSink {
    fn begin(&mut self, header: RasterHeader) -> bool {
        self.header
            .take()
            .is_some_and(|tx| tx.send(header).is_ok())
    }

    fn page(&mut self, page: RasterPage) -> bool {
        // Blocks the producer thread while the read-ahead slots are full.
        self.pages.blocking_send(page).is_ok()
    }
}

/// Open `bytes` as `media` and start producing the selected pages.
///
/// Resolves once the container is open: `Err` for document-level failures
/// (corrupt container, empty selection), otherwise the header plus a stream
/// that yields pages as they are rasterised.
pub async fn rasterize(
    bytes: Vec<u8>,
    media: MediaType,
    options: RasterOptions,
) -> Result<PageStream, OcrError> {
    let (header_tx, header_rx) = oneshot::channel();
    let (page_tx, page_rx) = mpsc::channel(READ_AHEAD);

    let task = tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let mut sink = ChannelSink {
            header: Some(header_tx),
            pages: page_tx,
        };
        rasterize_into(bytes, media, &options, &mut sink)?;
        Ok(start.elapsed().as_millis() as u64)
    });

    match header_rx.await {
        Ok(header) => Ok(PageStream {
            header,
            pages: page_rx,
            task,
        }),
        // No header: the producer stopped before the container was open.
        Err(_) => match task.await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(_)) => Err(OcrError::Internal(
                "rasterizer exited without opening the document".into(),
            )),
            Err(e) => Err(OcrError::Internal(format!("Rasterize task panicked: {}", e))),
        },
    }
}

/// Blocking implementation of [`rasterize`]: open the container, announce
/// the header, then push each selected page into `sink` in document order.
pub fn rasterize_into(
    bytes: Vec<u8>,
    media: MediaType,
    options: &RasterOptions,
    sink: &mut dyn PageSink,
) -> Result<(), OcrError> {
    match media {
        MediaType::Pdf => rasterize_pdf(bytes, options, sink),
        MediaType::Png => rasterize_image(&bytes, ImageFormat::Png, media, options, sink),
        MediaType::Jpeg => rasterize_image(&bytes, ImageFormat::Jpeg, media, options, sink),
        MediaType::Tiff => rasterize_tiff(&bytes, options, sink),
    }
}

/// Check the selection and hand the header to the sink.
///
/// `Ok(false)` when the sink has gone away.
fn announce(
    sink: &mut dyn PageSink,
    metadata: DocumentMetadata,
    selected: Vec<usize>,
) -> Result<bool, OcrError> {
    if selected.is_empty() {
        return Err(OcrError::PageOutOfRange {
            total: metadata.page_count,
        });
    }
    info!(
        "Rasterising {} of {} pages ({})",
        selected.len(),
        metadata.page_count,
        metadata.media_type
    );
    Ok(sink.begin(RasterHeader { metadata, selected }))
}

fn cancelled(index: usize) -> RasterPage {
    RasterPage {
        index,
        content: PageContent::Failed(PageError::Cancelled { page: index }),
    }
}

fn into_gray(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(_) => image,
        other => DynamicImage::ImageLuma8(other.to_luma8()),
    }
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Bind to libpdfium in `lib_dir`, or to the system library.
///
/// Hold [`lock_pdfium`] until the returned value is dropped.
pub fn bind_pdfium(lib_dir: Option<&Path>) -> Result<Pdfium, OcrError> {
    let bindings = match lib_dir {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| OcrError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

/// True if libpdfium can be loaded.
pub fn pdfium_available(lib_dir: Option<&Path>) -> bool {
    let _guard = lock_pdfium();
    bind_pdfium(lib_dir).is_ok()
}

fn rasterize_pdf(
    bytes: Vec<u8>,
    options: &RasterOptions,
    sink: &mut dyn PageSink,
) -> Result<(), OcrError> {
    let _guard = lock_pdfium();
    let pdfium = bind_pdfium(options.pdfium_lib_path.as_deref())?;
    let document = pdfium
        .load_pdf_from_byte_vec(bytes, options.password.as_deref())
        .map_err(|e| open_error(e, options.password.is_some()))?;
    let total_pages = document.pages().len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let metadata = pdf_metadata(&document, total_pages);
    stream_pdf_pages(&document, metadata, options, sink)
}

fn open_error(e: PdfiumError, has_password: bool) -> OcrError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        if has_password {
            OcrError::InvalidRequest("Incorrect PDF password".into())
        } else {
            OcrError::InvalidRequest("PDF is password-protected; supply a password".into())
        }
    } else {
        OcrError::CorruptInput {
            media_type: MediaType::Pdf.as_mime().into(),
            detail: err_str,
        }
    }
}

fn pdf_metadata(document: &PdfDocument, total_pages: usize) -> DocumentMetadata {
    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    DocumentMetadata {
        media_type: MediaType::Pdf.as_mime().into(),
        page_count: total_pages,
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        pdf_version: Some(format!("{:?}", document.version())),
    }
}

fn stream_pdf_pages(
    document: &PdfDocument,
    metadata: DocumentMetadata,
    options: &RasterOptions,
    sink: &mut dyn PageSink,
) -> Result<(), OcrError> {
    let selected = options.pages.to_indices(metadata.page_count);
    if !announce(sink, metadata, selected.clone())? {
        return Ok(());
    }

    for idx in selected {
        let page = if options.cancel.is_cancelled() {
            cancelled(idx)
        } else {
            RasterPage {
                index: idx,
                content: render_pdf_page(document, idx, options),
            }
        };
        if !sink.page(page) {
            debug!("Page consumer gone; stopping PDF rasterisation");
            break;
        }
    }
    Ok(())
}

fn render_pdf_page(document: &PdfDocument, idx: usize, options: &RasterOptions) -> PageContent {
    let corrupt = |e: PdfiumError| PageError::CorruptPage {
        page: idx,
        detail: format!("{:?}", e),
    };

    let page = match document.pages().get(idx as u16) {
        Ok(page) => page,
        Err(e) => {
            warn!("Page {} could not be loaded: {:?}", idx + 1, e);
            return PageContent::Failed(corrupt(e));
        }
    };

    if options.prefer_embedded_text {
        if let Ok(text) = page.text() {
            let text = text.all();
            if text_layer_is_dense(&text, options.embedded_text_min_chars) {
                debug!("Page {} uses its text layer ({} chars)", idx + 1, text.len());
                return PageContent::Text(text);
            }
        }
    }

    let width = points_to_pixels(page.width().value, options.dpi);
    let height = points_to_pixels(page.height().value, options.dpi);
    if let Err(e) = options.limits.check(idx, width, height) {
        warn!("{}", e);
        return PageContent::Failed(e);
    }

    let render_config = PdfRenderConfig::new()
        .set_target_width(width as i32)
        .set_maximum_height(height as i32);

    let content = match page.render_with_config(&render_config) {
        Ok(bitmap) => {
            let image = into_gray(bitmap.as_image());
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            PageContent::Image(image)
        }
        Err(e) => PageContent::Failed(corrupt(e)),
    };
    content
}

/// Whether a text layer holds at least `min_chars` visible characters
/// (at least one, whatever `min_chars` says).
pub fn text_layer_is_dense(text: &str, min_chars: usize) -> bool {
    let visible = text.chars().filter(|c| !c.is_whitespace()).count();
    visible >= min_chars.max(1)
}

fn points_to_pixels(points: f32, dpi: u32) -> u32 {
    (points.max(0.0) / 72.0 * dpi as f32).round() as u32
}

// ── single images ────────────────────────────────────────────────────────

fn rasterize_image(
    bytes: &[u8],
    format: ImageFormat,
    media: MediaType,
    options: &RasterOptions,
    sink: &mut dyn PageSink,
) -> Result<(), OcrError> {
    let corrupt = |e: image::ImageError| OcrError::CorruptInput {
        media_type: media.as_mime().into(),
        detail: e.to_string(),
    };
    let metadata = DocumentMetadata {
        media_type: media.as_mime().into(),
        page_count: 1,
        ..Default::default()
    };

    // Header only; nothing is allocated for pixels yet.
    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(corrupt)?;

    let selected = options.pages.to_indices(1);
    if selected.is_empty() {
        return Err(OcrError::PageOutOfRange { total: 1 });
    }

    // Decoded before the header goes out, so a broken body is still a
    // document-level failure.
    let content = match options.limits.check(0, width, height) {
        Err(e) => {
            warn!("{}", e);
            PageContent::Failed(e)
        }
        Ok(()) => {
            let image = ImageReader::with_format(Cursor::new(bytes), format)
                .decode()
                .map_err(corrupt)?;
            debug!("Decoded {} image {}x{} px", media, width, height);
            PageContent::Image(into_gray(image))
        }
    };

    if announce(sink, metadata, selected)? {
        sink.page(RasterPage { index: 0, content });
    }
    Ok(())
}

// ── TIFF ─────────────────────────────────────────────────────────────────

/// Result of walking a TIFF's directory chain without decoding pixels.
struct TiffChain {
    /// Directories that could be read, starting at the first.
    readable: usize,
    /// Why the directory after the last readable one could not be read.
    broken: Option<String>,
}

impl TiffChain {
    fn scan(mut decoder: Decoder<Cursor<&[u8]>>) -> Self {
        let mut readable = 1;
        while decoder.more_images() {
            if let Err(e) = decoder.next_image() {
                warn!("TIFF directory chain broken after page {}: {}", readable, e);
                return Self {
                    readable,
                    broken: Some(e.to_string()),
                };
            }
            readable += 1;
        }
        Self {
            readable,
            broken: None,
        }
    }

    /// Readable pages plus the unreadable one, if the chain broke.
    fn page_count(&self) -> usize {
        self.readable + usize::from(self.broken.is_some())
    }
}

fn rasterize_tiff(
    bytes: &[u8],
    options: &RasterOptions,
    sink: &mut dyn PageSink,
) -> Result<(), OcrError> {
    let open = || {
        Decoder::new(Cursor::new(bytes)).map_err(|e| OcrError::CorruptInput {
            media_type: MediaType::Tiff.as_mime().into(),
            detail: e.to_string(),
        })
    };

    let chain = TiffChain::scan(open()?);
    let metadata = DocumentMetadata {
        media_type: MediaType::Tiff.as_mime().into(),
        page_count: chain.page_count(),
        ..Default::default()
    };
    let selected = options.pages.to_indices(chain.page_count());
    if !announce(sink, metadata, selected.clone())? {
        return Ok(());
    }

    let mut decoder = open()?;
    // Directory the decoder is positioned on.
    let mut current = 0usize;
    for idx in selected {
        let page = if options.cancel.is_cancelled() {
            cancelled(idx)
        } else if idx >= chain.readable {
            RasterPage {
                index: idx,
                content: PageContent::Failed(PageError::CorruptPage {
                    page: idx,
                    detail: format!(
                        "unreadable image directory: {}",
                        chain.broken.as_deref().unwrap_or("unknown")
                    ),
                }),
            }
        } else {
            let mut content = None;
            while current < idx {
                if let Err(e) = decoder.next_image() {
                    content = Some(PageContent::Failed(PageError::CorruptPage {
                        page: idx,
                        detail: e.to_string(),
                    }));
                    break;
                }
                current += 1;
            }
            let content = content.unwrap_or_else(|| {
                match decode_tiff_page(&mut decoder, idx, &options.limits) {
                    Ok(image) => PageContent::Image(image),
                    Err(e) => {
                        warn!("{}", e);
                        PageContent::Failed(e)
                    }
                }
            });
            RasterPage { index: idx, content }
        };

        if !sink.page(page) {
            debug!("Page consumer gone; stopping TIFF rasterisation");
            break;
        }
    }
    Ok(())
}

fn decode_tiff_page(
    decoder: &mut Decoder<Cursor<&[u8]>>,
    index: usize,
    limits: &ImageLimits,
) -> Result<DynamicImage, PageError> {
    let corrupt = |detail: String| PageError::CorruptPage {
        page: index,
        detail,
    };

    let (width, height) = decoder.dimensions().map_err(|e| corrupt(e.to_string()))?;
    limits.check(index, width, height)?;

    let color = decoder.colortype().map_err(|e| corrupt(e.to_string()))?;
    let data = decoder.read_image().map_err(|e| corrupt(e.to_string()))?;
    let size_mismatch = || corrupt(format!("pixel buffer does not match {width}x{height}"));

    // The decoder has already mapped WhiteIsZero samples so that 0 is black.
    let image = match (color, data) {
        (ColorType::Gray(1), DecodingResult::U8(buf)) => {
            let gray = expand_bilevel(&buf, width, height).ok_or_else(size_mismatch)?;
            DynamicImage::ImageLuma8(gray)
        }
        (ColorType::Gray(8), DecodingResult::U8(buf)) => GrayImage::from_raw(width, height, buf)
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(size_mismatch)?,
        (ColorType::GrayA(8), DecodingResult::U8(buf)) => {
            ImageBuffer::<LumaA<u8>, _>::from_raw(width, height, buf)
                .map(DynamicImage::ImageLumaA8)
                .ok_or_else(size_mismatch)?
        }
        (ColorType::RGB(8), DecodingResult::U8(buf)) => {
            image::RgbImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(size_mismatch)?
        }
        (ColorType::RGBA(8), DecodingResult::U8(buf)) => {
            image::RgbaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(size_mismatch)?
        }
        (ColorType::Gray(16), DecodingResult::U16(buf)) => {
            ImageBuffer::<Luma<u16>, _>::from_raw(width, height, buf)
                .map(DynamicImage::ImageLuma16)
                .ok_or_else(size_mismatch)?
        }
        (other, _) => return Err(corrupt(format!("unsupported TIFF colour type {:?}", other))),
    };

    debug!("Decoded TIFF page {} → {}x{} px", index + 1, width, height);
    Ok(into_gray(image))
}

/// Expand packed 1-bit rows (most significant bit first, each row padded to
/// a whole byte) to 8-bit gray: a set bit is white.
fn expand_bilevel(packed: &[u8], width: u32, height: u32) -> Option<GrayImage> {
    let row_bytes = (width as usize).div_ceil(8);
    if packed.len() < row_bytes * height as usize {
        return None;
    }
    let mut gray = GrayImage::new(width, height);
    for (y, row) in packed.chunks(row_bytes).take(height as usize).enumerate() {
        for x in 0..width as usize {
            let bit = row[x / 8] >> (7 - (x % 8)) & 1;
            gray.put_pixel(x as u32, y as u32, Luma([if bit == 1 { 255 } else { 0 }]));
        }
    }
    Some(gray)
}
