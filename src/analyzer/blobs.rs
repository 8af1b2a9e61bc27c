//! Blob evidence: compact, roughly round lumps of material.
//!
//! Candidates are the outer outlines other than the print body (the largest
//! outline) whose area falls in the configured window and whose circularity
//! is high enough to rule out strings and debris.

use super::Signal;
use super::contours::Outline;
use crate::config::AnalyzerConfig;

pub fn blob_evidence(outlines: &[Outline], config: &AnalyzerConfig) -> Signal {
    let regions: Vec<_> = outlines
        .iter()
        .skip(1)
        .filter(|o| o.area >= config.blob_min_area && o.area <= config.blob_max_area)
        .filter(|o| o.circularity() >= config.blob_min_circularity)
        .map(|o| o.bbox)
        .collect();

    if regions.is_empty() {
        return Signal::none();
    }
    Signal {
        score: regions.len() as f32 / config.blobs_for_full_confidence.max(1) as f32,
        regions,
    }
    .clamped()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::contours::outer_outlines;
    use image::{GrayImage, Luma};
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_line_segment_mut};
    use imageproc::rect::Rect;

    fn print_body() -> GrayImage {
        let mut mask = GrayImage::new(240, 240);
        draw_filled_rect_mut(&mut mask, Rect::at(80, 80).of_size(100, 140), Luma([255u8]));
        mask
    }

    #[test]
    fn round_lumps_beside_the_print_are_blobs() {
        let mut mask = print_body();
        for center in [(30, 30), (30, 120), (120, 30), (210, 40)] {
            draw_filled_circle_mut(&mut mask, center, 8, Luma([255u8]));
        }
        let outlines = outer_outlines(&mask);
        let signal = blob_evidence(&outlines, &AnalyzerConfig::default());
        assert_eq!(signal.regions.len(), 4);
        assert!(signal.score > 0.5, "score was {}", signal.score);
    }

    #[test]
    fn print_body_alone_is_not_a_blob() {
        let outlines = outer_outlines(&print_body());
        let signal = blob_evidence(&outlines, &AnalyzerConfig::default());
        assert_eq!(signal.score, 0.0);
    }

    #[test]
    fn thin_strands_are_not_blobs() {
        let mut mask = print_body();
        draw_line_segment_mut(&mut mask, (10.0, 10.0), (60.0, 70.0), Luma([255u8]));
        let outlines = outer_outlines(&mask);
        let signal = blob_evidence(&outlines, &AnalyzerConfig::default());
        assert_eq!(signal.score, 0.0);
    }
}
