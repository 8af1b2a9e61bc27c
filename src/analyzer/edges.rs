//! Warping evidence from edge density inside the print body.
//!
//! A healthy print seen from the side has a smooth body: Canny edges sit on
//! its outline and nowhere else. Lifted corners and curled layers create
//! extra edges inside that outline. Only pixels deep inside the foreground
//! (the mask eroded by a few pixels) and inside the shrunk envelope are
//! counted, so the outline itself never contributes.

use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;

use super::Signal;
use crate::config::AnalyzerConfig;
use crate::model::BoundingBox;

/// Erosion radius that separates the body from its outline.
const OUTLINE_CLEARANCE: u8 = 3;

/// Fewer interior pixels than this is too little body to judge.
const MIN_INTERIOR_PIXELS: usize = 50;

pub fn edge_evidence(
    edges: &GrayImage,
    mask: &GrayImage,
    envelope: Option<BoundingBox>,
    config: &AnalyzerConfig,
) -> Signal {
    let Some(envelope) = envelope else {
        return Signal::none();
    };
    let (width, height) = edges.dimensions();
    let Some(inner) = envelope.scaled_margin(-config.envelope_margin, width, height) else {
        return Signal::none();
    };

    let body = erode(mask, Norm::LInf, OUTLINE_CLEARANCE);
    let mut interior = 0usize;
    let mut hits = Vec::new();
    for y in inner.y..inner.bottom().min(height) {
        for x in inner.x..inner.right().min(width) {
            if body.get_pixel(x, y)[0] == 0 {
                continue;
            }
            interior += 1;
            if edges.get_pixel(x, y)[0] > 0 {
                hits.push((x, y));
            }
        }
    }

    if interior < MIN_INTERIOR_PIXELS || hits.is_empty() {
        return Signal::none();
    }

    let density = hits.len() as f32 / interior as f32;
    Signal {
        score: density / config.edge_density_saturation,
        regions: BoundingBox::from_points(hits).into_iter().collect(),
    }
    .clamped()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
    use imageproc::rect::Rect;

    fn body_mask() -> GrayImage {
        let mut mask = GrayImage::new(200, 200);
        draw_filled_rect_mut(&mut mask, Rect::at(40, 40).of_size(120, 120), Luma([255u8]));
        mask
    }

    #[test]
    fn outline_edges_are_not_warping() {
        let mask = body_mask();
        let mut edges = GrayImage::new(200, 200);
        draw_hollow_rect_mut(&mut edges, Rect::at(40, 40).of_size(120, 120), Luma([255u8]));
        draw_hollow_rect_mut(&mut edges, Rect::at(39, 39).of_size(122, 122), Luma([255u8]));

        let signal = edge_evidence(
            &edges,
            &mask,
            Some(BoundingBox::new(40, 40, 120, 120)),
            &AnalyzerConfig::default(),
        );
        assert_eq!(signal.score, 0.0);
        assert!(signal.regions.is_empty());
    }

    #[test]
    fn interior_edges_raise_warping_score() {
        let mask = body_mask();
        let mut edges = GrayImage::new(200, 200);
        for y in (60..140).step_by(6) {
            draw_line_segment_mut(&mut edges, (60.0, y as f32), (140.0, y as f32), Luma([255u8]));
        }

        let signal = edge_evidence(
            &edges,
            &mask,
            Some(BoundingBox::new(40, 40, 120, 120)),
            &AnalyzerConfig::default(),
        );
        assert!(signal.score > 0.5, "score was {}", signal.score);
        assert_eq!(signal.regions.len(), 1);
        assert!(signal.regions[0].x >= 60 && signal.regions[0].right() <= 141);
    }

    #[test]
    fn no_envelope_means_no_evidence() {
        let mask = body_mask();
        let edges = GrayImage::from_pixel(200, 200, Luma([255u8]));
        let signal = edge_evidence(&edges, &mask, None, &AnalyzerConfig::default());
        assert_eq!(signal.score, 0.0);
    }
}
