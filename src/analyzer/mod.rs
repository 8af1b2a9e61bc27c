//! Frame analysis: four classical heuristics fused into one detection.
//!
//! Each heuristic yields an evidence score in `[0, 1]` for exactly one
//! failure category plus the regions that drove it:
//!
//! | heuristic | category           | signal                                        |
//! |-----------|--------------------|-----------------------------------------------|
//! | edge      | warping            | Canny edge density inside the print body      |
//! | line      | stringing          | Hough segments outside the expected envelope  |
//! | blob      | blob               | compact round outlines beside the print       |
//! | contour   | layer separation   | silhouette drift and horizontal gap bands     |
//!
//! The fused category is the one with the highest score; ties go to
//! stringing, then layer separation, warping and blob. Analysis never fails:
//! empty, undecodable or featureless frames produce a zero-confidence result
//! carrying a [`Diagnostic`].

mod blobs;
mod contours;
mod edges;
mod lines;

use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use imageproc::contrast::{otsu_level, threshold};
use imageproc::edges::canny;
use log::debug;

use crate::config::AnalyzerConfig;
use crate::model::{
    BoundingBox, DetectionResult, Diagnostic, Evidence, Heuristic, JobId, Region, clamp_unit,
};

pub use contours::Outline;
pub use lines::Segment;

/// An encoded camera frame submitted for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub job_id: JobId,
    /// Encoded image bytes (any format the `image` crate can decode).
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    /// Expected print envelope in frame coordinates. Filled in from the
    /// job's learned reference when the caller does not provide one.
    pub reference: Option<BoundingBox>,
}

impl Frame {
    pub fn new(job_id: JobId, data: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            data,
            captured_at,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: BoundingBox) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Anything that turns a frame into a detection.
///
/// [`ImageAnalyzer`] is the production implementation; the aggregator and
/// engine are generic over this so tests can script detections.
pub trait FrameAnalyzer: Send + Sync {
    fn analyze(&self, frame: &Frame) -> DetectionResult;
}

/// Score and supporting regions from one heuristic, in working-image
/// coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Signal {
    pub score: f32,
    pub regions: Vec<BoundingBox>,
}

impl Signal {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn clamped(mut self) -> Self {
        self.score = clamp_unit(self.score);
        self
    }
}

/// Classical-vision frame analyzer. Stateless and safe to share.
#[derive(Debug, Clone, Default)]
pub struct ImageAnalyzer {
    config: AnalyzerConfig,
}

impl ImageAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze an already decoded image.
    pub fn analyze_image(
        &self,
        image: &DynamicImage,
        reference: Option<BoundingBox>,
    ) -> DetectionResult {
        let gray = image.to_luma8();
        if gray.width() == 0 || gray.height() == 0 {
            return DetectionResult::degraded(Diagnostic::UndecodableFrame(
                "zero-sized image".to_string(),
            ));
        }

        let (gray, scale) = downscale(gray, self.config.max_dimension);
        if intensity_stddev(&gray) < self.config.flat_frame_stddev {
            debug!("Frame has no visible structure, skipping heuristics");
            return DetectionResult::degraded(Diagnostic::FlatFrame);
        }

        let cfg = &self.config;
        let edge_map = canny(&gray, cfg.canny_low, cfg.canny_high);
        let mask = foreground_mask(&gray);
        let outlines = contours::outer_outlines(&mask);
        let silhouette = contours::silhouette(&outlines, cfg.silhouette_min_area_fraction);
        let reference = reference
            .and_then(|r| r.rescale(1.0 / scale).clip(gray.width(), gray.height()));
        let envelope = reference.or(silhouette);

        let signals = [
            (Heuristic::Edge, edges::edge_evidence(&edge_map, &mask, envelope, cfg)),
            (Heuristic::Line, lines::line_evidence(&edge_map, envelope, cfg)),
            (Heuristic::Blob, blobs::blob_evidence(&outlines, cfg)),
            (
                Heuristic::Contour,
                contours::contour_evidence(&mask, silhouette, reference, cfg),
            ),
        ];

        let mut evidence = Evidence::default();
        let mut regions = Vec::new();
        for (heuristic, signal) in signals {
            evidence.set(heuristic.category(), signal.score);
            regions.extend(signal.regions.into_iter().map(|bbox| Region {
                heuristic,
                bbox: bbox.rescale(scale),
            }));
        }

        debug!(
            "Evidence: stringing={:.2} layer_separation={:.2} warping={:.2} blob={:.2}",
            evidence.stringing, evidence.layer_separation, evidence.warping, evidence.blob
        );

        DetectionResult::from_evidence(evidence, regions, silhouette.map(|s| s.rescale(scale)))
    }
}

impl FrameAnalyzer for ImageAnalyzer {
    fn analyze(&self, frame: &Frame) -> DetectionResult {
        if frame.data.is_empty() {
            return DetectionResult::degraded(Diagnostic::EmptyFrame);
        }
        match image::load_from_memory(&frame.data) {
            Ok(image) => self.analyze_image(&image, frame.reference),
            Err(e) => DetectionResult::degraded(Diagnostic::UndecodableFrame(e.to_string())),
        }
    }
}

/// Shrink so the longer side is at most `max_dimension`. Returns the image
/// and the factor that maps working coordinates back to the original.
fn downscale(gray: GrayImage, max_dimension: u32) -> (GrayImage, f32) {
    let longest = gray.width().max(gray.height());
    if max_dimension == 0 || longest <= max_dimension {
        return (gray, 1.0);
    }
    let factor = longest as f32 / max_dimension as f32;
    let width = ((gray.width() as f32 / factor).round() as u32).max(1);
    let height = ((gray.height() as f32 / factor).round() as u32).max(1);
    let resized = imageops::resize(&gray, width, height, FilterType::Triangle);
    (resized, gray.width() as f32 / width as f32)
}

fn intensity_stddev(gray: &GrayImage) -> f32 {
    let count = (gray.width() as u64 * gray.height() as u64) as f64;
    if count == 0.0 {
        return 0.0;
    }
    let (sum, sum_sq) = gray.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / count;
    ((sum_sq / count - mean * mean).max(0.0)).sqrt() as f32
}

/// Otsu foreground mask, inverted when the "foreground" covers most of the
/// frame (dark print on a bright bed).
fn foreground_mask(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    let mut mask = threshold(gray, level);
    let total = mask.width() as usize * mask.height() as usize;
    let lit = mask.pixels().filter(|p| p[0] > 0).count();
    if lit * 2 > total {
        imageops::invert(&mut mask);
    }
    mask
}
