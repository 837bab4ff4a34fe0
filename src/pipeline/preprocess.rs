//! Page normalisation: grayscale, denoise, deskew and binarize a page image
//! before recognition.
//!
//! Every step is a pure function of the input image and
//! [`PreprocessOptions`], so the same page always produces the same bitmap.
//! That keeps OCR output reproducible and lets a timed-out page be retried on
//! an identical image.
//!
//! ## Steps
//!
//! 1. Ceiling check: `ImageTooLarge` before any allocation proportional to
//!    the image.
//! 2. Grayscale (`to_luma8`).
//! 3. Median filter, radius 1, for salt-and-pepper scanner noise.
//! 4. Deskew: projection-profile search (see [`estimate_skew`]) and a
//!    bilinear rotation on a white background.
//! 5. Otsu binarization to pure black on white.

use crate::config::{OcrConfig, PreprocessOptions};
use crate::error::PageError;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::filter::median_filter;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use tracing::debug;

/// Skew below this angle (degrees) is left alone; rotating costs more sharpness than it gains.
const MIN_CORRECTION_DEGREES: f32 = 0.1;

/// Angle step of the skew search, in degrees.
const SKEW_STEP_DEGREES: f32 = 0.25;

/// Skew is estimated on a copy scaled down to this longest side.
const SKEW_SAMPLE_EDGE: u32 = 1000;

/// Upper bound on dark pixels fed to the projection search.
const SKEW_MAX_POINTS: usize = 200_000;

/// Below this many dark pixels there is no text to align.
const SKEW_MIN_POINTS: usize = 50;

/// Size limits applied to every page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_pixels: u64,
    pub max_dimension: u32,
}

impl ImageLimits {
    pub fn from_config(config: &OcrConfig) -> Self {
        Self {
            max_pixels: config.max_image_pixels,
            max_dimension: config.max_image_dimension,
        }
    }

    /// `ImageTooLarge` if either side or the area exceeds the limits.
    pub fn check(&self, page: usize, width: u32, height: u32) -> Result<(), PageError> {
        let pixels = width as u64 * height as u64;
        if pixels > self.max_pixels || width > self.max_dimension || height > self.max_dimension {
            return Err(PageError::ImageTooLarge {
                page,
                width,
                height,
                limit: self.max_pixels,
            });
        }
        Ok(())
    }
}

/// A normalised page image ready for recognition.
#[derive(Debug, Clone)]
pub struct PreparedPage {
    /// 0-based page index.
    pub index: usize,
    /// Grayscale (binarized unless disabled) page bitmap.
    pub image: DynamicImage,
    /// Rotation that was corrected, in degrees; `None` if deskew was off or unnecessary.
    pub skew_degrees: Option<f32>,
}

/// Normalise one page image.
pub fn preprocess(
    index: usize,
    image: &DynamicImage,
    options: &PreprocessOptions,
    limits: &ImageLimits,
) -> Result<PreparedPage, PageError> {
    limits.check(index, image.width(), image.height())?;

    let mut gray = image.to_luma8();

    if options.denoise {
        gray = median_filter(&gray, 1, 1);
    }

    let mut skew_degrees = None;
    if options.deskew && options.max_skew_degrees > 0.0 {
        let skew = estimate_skew(&gray, options.max_skew_degrees);
        if skew.abs() >= MIN_CORRECTION_DEGREES {
            gray = rotate_about_center(
                &gray,
                (-skew).to_radians(),
                Interpolation::Bilinear,
                Luma([255u8]),
            );
            skew_degrees = Some(skew);
        }
    }

    if options.binarize {
        gray = binarize(&gray);
    }

    debug!(
        "Preprocessed page {} → {}x{} px, skew {:?}",
        index + 1,
        gray.width(),
        gray.height(),
        skew_degrees
    );

    Ok(PreparedPage {
        index,
        image: DynamicImage::ImageLuma8(gray),
        skew_degrees,
    })
}

/// Otsu threshold to black (0) and white (255).
pub fn binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        pixel[0] = if pixel[0] <= level { 0 } else { 255 };
    }
    out
}

/// Estimate the angle of text lines, in degrees, within `±max_degrees`.
///
/// Positive angles mean lines descend to the right (image y axis points
/// down). For each candidate angle the dark pixels are projected onto the
/// axis perpendicular to that angle; aligned text lines pile up into a few
/// sharp bins, so the angle with the largest sum of squared bin counts wins.
/// Candidates are visited in order of increasing magnitude so ties resolve
/// to the smaller rotation.
pub fn estimate_skew(gray: &GrayImage, max_degrees: f32) -> f32 {
    let sample = downscale(gray);
    let level = otsu_level(&sample);

    let mut points: Vec<(f32, f32)> = sample
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] <= level && p[0] < 128)
        .map(|(x, y, _)| (x as f32, y as f32))
        .collect();

    if points.len() < SKEW_MIN_POINTS {
        return 0.0;
    }
    if points.len() > SKEW_MAX_POINTS {
        let stride = points.len().div_ceil(SKEW_MAX_POINTS);
        points = points.into_iter().step_by(stride).collect();
    }

    let cx = sample.width() as f32 / 2.0;
    let cy = sample.height() as f32 / 2.0;
    let diag = ((sample.width() as f32).hypot(sample.height() as f32)).ceil() as usize;
    let offset = (diag / 2 + 1) as f32;
    let mut bins = vec![0u32; diag + 3];

    let steps = (max_degrees / SKEW_STEP_DEGREES).floor() as i32;
    let mut best_angle = 0.0f32;
    let mut best_score = 0u64;

    for step in candidate_steps(steps) {
        let angle = step as f32 * SKEW_STEP_DEGREES;
        let (sin, cos) = angle.to_radians().sin_cos();

        bins.iter_mut().for_each(|b| *b = 0);
        for &(x, y) in &points {
            let r = (y - cy) * cos - (x - cx) * sin + offset;
            let bin = (r.round().max(0.0) as usize).min(bins.len() - 1);
            bins[bin] += 1;
        }

        let score: u64 = bins.iter().map(|&c| c as u64 * c as u64).sum();
        if score > best_score {
            best_score = score;
            best_angle = angle;
        }
    }

    best_angle
}

/// 0, 1, -1, 2, -2, … up to ±steps.
fn candidate_steps(steps: i32) -> impl Iterator<Item = i32> {
    std::iter::once(0).chain((1..=steps.max(0)).flat_map(|s| [s, -s]))
}

fn downscale(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let longest = w.max(h);
    if longest <= SKEW_SAMPLE_EDGE {
        return gray.clone();
    }
    let scale = SKEW_SAMPLE_EDGE as f32 / longest as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    image::imageops::resize(gray, nw, nh, FilterType::Triangle)
}
