//! Pipeline stages for document OCR.
//!
//! Each submodule implements one transformation step; the engine drives
//! them in order for every document.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ rasterize ──▶ preprocess ──▶ recognize ──▶ postprocess ──▶ aggregate
//! (bytes)   (pages)       (per page)     (per page)    (per page)      (document)
//! ```
//!
//! 1. [`input`]: resolve a path or URL and settle the media type
//! 2. [`rasterize`]: decode the container into page images, or take a PDF
//!    page's own text layer; runs in `spawn_blocking` and streams pages to
//!    the engine through a bounded channel
//! 3. [`preprocess`]: grayscale, median denoise, deskew, Otsu binarize
//! 4. [`recognize`]: the [`recognize::Recognizer`] seam and the timeout
//!    policy. Backends: [`tesseract`] (child process) and [`vision`]
//!    (vision LLM, pages sent through [`encode`])
//! 5. [`postprocess`]: deterministic text cleanup
//! 6. [`aggregate`]: restore page order and assemble the result

pub mod aggregate;
pub mod encode;
pub mod input;
pub mod postprocess;
pub mod preprocess;
pub mod rasterize;
pub mod recognize;
pub mod tesseract;
pub mod vision;
