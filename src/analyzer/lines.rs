//! Stringing evidence: thin non-horizontal strands outside the print.
//!
//! `imageproc::hough::detect_lines` only returns infinite lines, so each
//! detected line is walked across the edge map and split into segments
//! wherever the edge trail breaks for longer than `max_line_gap`.

use image::GrayImage;
use imageproc::hough::{LineDetectionOptions, PolarLine, detect_lines};

use super::Signal;
use crate::config::AnalyzerConfig;
use crate::model::BoundingBox;

/// A finite piece of a Hough line supported by edge pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: (f32, f32),
    pub end: (f32, f32),
    /// Degrees away from horizontal, in `[0, 90]`.
    pub tilt: f32,
}

impl Segment {
    pub fn length(&self) -> f32 {
        let (dx, dy) = (self.end.0 - self.start.0, self.end.1 - self.start.1);
        (dx * dx + dy * dy).sqrt()
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::from_points([
            (self.start.0.max(0.0) as u32, self.start.1.max(0.0) as u32),
            (self.end.0.max(0.0) as u32, self.end.1.max(0.0) as u32),
        ])
    }
}

pub fn line_evidence(
    edges: &GrayImage,
    envelope: Option<BoundingBox>,
    config: &AnalyzerConfig,
) -> Signal {
    let (width, height) = edges.dimensions();
    let exclusion = envelope.and_then(|e| e.scaled_margin(config.envelope_margin, width, height));

    let options = LineDetectionOptions {
        vote_threshold: config.hough_vote_threshold,
        suppression_radius: config.hough_suppression_radius,
    };

    let mut regions = Vec::new();
    for line in detect_lines(edges, options) {
        for segment in trace_segments(edges, &line, config.max_line_gap as f32) {
            if segment.length() < config.min_string_length as f32
                || segment.tilt < config.string_min_angle_degrees
            {
                continue;
            }
            let inside = exclusion.is_some_and(|ex| {
                ex.contains(segment.start.0, segment.start.1)
                    && ex.contains(segment.end.0, segment.end.1)
            });
            if inside {
                continue;
            }
            regions.extend(segment.bbox());
        }
    }

    if regions.is_empty() {
        return Signal::none();
    }
    Signal {
        score: regions.len() as f32 / config.strings_for_full_confidence.max(1) as f32,
        regions,
    }
    .clamped()
}

/// Walk `line` across the image one pixel at a time and return the runs
/// that stay on edge pixels, bridging breaks of up to `max_gap` pixels.
pub fn trace_segments(edges: &GrayImage, line: &PolarLine, max_gap: f32) -> Vec<Segment> {
    let (width, height) = edges.dimensions();
    let theta = (line.angle_in_degrees as f32).to_radians();
    let (sin, cos) = theta.sin_cos();
    let origin = (line.r * cos, line.r * sin);
    let direction = (-sin, cos);
    let tilt = (90.0 - line.angle_in_degrees as f32).abs();
    let reach = (width as f32).hypot(height as f32).ceil();

    let point_at = |t: f32| (origin.0 + t * direction.0, origin.1 + t * direction.1);
    let on_edge = |(x, y): (f32, f32)| {
        let (cx, cy) = (x.round() as i64, y.round() as i64);
        (-1..=1).any(|dy| {
            (-1..=1).any(|dx| {
                let (px, py) = (cx + dx, cy + dy);
                px >= 0
                    && py >= 0
                    && (px as u32) < width
                    && (py as u32) < height
                    && edges.get_pixel(px as u32, py as u32)[0] > 0
            })
        })
    };

    let mut segments = Vec::new();
    let mut run: Option<(f32, f32)> = None;
    let mut t = -reach;
    while t <= reach {
        if on_edge(point_at(t)) {
            run = Some(match run {
                Some((start, _)) => (start, t),
                None => (t, t),
            });
        } else if let Some((start, last)) = run {
            if t - last > max_gap {
                segments.push(Segment {
                    start: point_at(start),
                    end: point_at(last),
                    tilt,
                });
                run = None;
            }
        }
        t += 1.0;
    }
    if let Some((start, last)) = run {
        segments.push(Segment {
            start: point_at(start),
            end: point_at(last),
            tilt,
        });
    }
    segments
}
