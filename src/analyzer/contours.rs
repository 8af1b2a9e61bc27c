//! Outer-boundary extraction and silhouette comparison.
//!
//! The foreground mask is traced with `imageproc::contours::find_contours`
//! (Suzuki-Abe border following). Outer borders give both the print
//! silhouette and the blob candidates. Layer separation shows up either as a
//! silhouette that no longer matches the expected envelope or as a
//! horizontal band of empty rows cutting through the silhouette.

use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};

use super::Signal;
use crate::config::AnalyzerConfig;
use crate::model::BoundingBox;

/// Geometry of one outer border.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outline {
    pub bbox: BoundingBox,
    /// Shoelace area of the border polygon (pixel centers).
    pub area: f32,
    /// Length of the closed border chain.
    pub perimeter: f32,
}

impl Outline {
    /// `4πA/P²`: 1 for a disc, near 0 for thin shapes.
    pub fn circularity(&self) -> f32 {
        if self.perimeter <= 0.0 {
            return 0.0;
        }
        let c = 4.0 * std::f32::consts::PI * self.area / (self.perimeter * self.perimeter);
        c.min(1.0)
    }
}

/// Outer borders of every foreground component, largest area first.
pub fn outer_outlines(mask: &GrayImage) -> Vec<Outline> {
    let mut outlines: Vec<Outline> = find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && !c.points.is_empty())
        .filter_map(|c| {
            let points: Vec<(f32, f32)> = c
                .points
                .iter()
                .map(|p| (p.x as f32, p.y as f32))
                .collect();
            let bbox = BoundingBox::from_points(
                c.points.iter().map(|p| (p.x.max(0) as u32, p.y.max(0) as u32)),
            )?;
            Some(Outline {
                bbox,
                area: polygon_area(&points),
                perimeter: closed_length(&points),
            })
        })
        .collect();
    outlines.sort_by(|a, b| b.area.total_cmp(&a.area));
    outlines
}

/// Union of the outlines that are at least `min_fraction` of the largest.
pub fn silhouette(outlines: &[Outline], min_fraction: f32) -> Option<BoundingBox> {
    let largest = outlines.first()?;
    if largest.area <= 0.0 {
        return None;
    }
    let cutoff = largest.area * min_fraction;
    outlines
        .iter()
        .filter(|o| o.area >= cutoff)
        .map(|o| o.bbox)
        .reduce(|acc, b| acc.union(&b))
}

/// Layer-separation evidence: the larger of silhouette deviation from the
/// reference envelope (`1 - IoU`) and the relative height of the tallest
/// interior gap band.
pub fn contour_evidence(
    mask: &GrayImage,
    silhouette: Option<BoundingBox>,
    reference: Option<BoundingBox>,
    config: &AnalyzerConfig,
) -> Signal {
    let mut signal = Signal::none();

    if let Some(reference) = reference {
        let deviation = match silhouette {
            Some(observed) => 1.0 - observed.iou(&reference),
            // Print vanished from the expected envelope entirely.
            None => 1.0,
        };
        if deviation > 0.0 {
            signal.score = deviation;
            signal.regions.push(silhouette.unwrap_or(reference));
        }
    }

    if let Some(observed) = silhouette {
        if let Some(band) = tallest_gap_band(mask, observed, config.gap_fill_ratio) {
            let fraction = band.height as f32 / observed.height as f32;
            let gap_score = fraction / config.gap_fraction_for_full_confidence;
            if gap_score > signal.score {
                signal.score = gap_score;
            }
            signal.regions.push(band);
        }
    }

    signal.clamped()
}

/// Tallest run of sparse rows inside `bounds` that has filled rows both
/// above and below it.
fn tallest_gap_band(mask: &GrayImage, bounds: BoundingBox, fill_ratio: f32) -> Option<BoundingBox> {
    if bounds.width == 0 || bounds.height < 3 {
        return None;
    }
    let right = bounds.right().min(mask.width());
    let bottom = bounds.bottom().min(mask.height());
    let fills: Vec<f32> = (bounds.y..bottom)
        .map(|y| {
            let filled = (bounds.x..right)
                .filter(|&x| mask.get_pixel(x, y)[0] > 0)
                .count();
            filled as f32 / bounds.width as f32
        })
        .collect();

    let mut sorted = fills.clone();
    sorted.sort_by(f32::total_cmp);
    let median = sorted[sorted.len() / 2];
    if median <= 0.0 {
        return None;
    }
    let cutoff = median * fill_ratio;

    let mut best: Option<(usize, usize)> = None;
    let mut run_start: Option<usize> = None;
    for (i, &fill) in fills.iter().enumerate() {
        match (fill < cutoff, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                // Runs touching the top edge are not bounded above.
                if start > 0 {
                    let len = i - start;
                    if best.is_none_or(|(_, best_len)| len > best_len) {
                        best = Some((start, len));
                    }
                }
                run_start = None;
            }
            _ => {}
        }
    }

    best.map(|(start, len)| {
        BoundingBox::new(bounds.x, bounds.y + start as u32, bounds.width, len as u32)
    })
}

fn polygon_area(points: &[(f32, f32)]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for (i, &(x0, y0)) in points.iter().enumerate() {
        let (x1, y1) = points[(i + 1) % points.len()];
        twice += x0 * y1 - x1 * y0;
    }
    (twice * 0.5).abs()
}

fn closed_length(points: &[(f32, f32)]) -> f32 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut length = 0.0;
    for (i, &(x0, y0)) in points.iter().enumerate() {
        let (x1, y1) = points[(i + 1) % points.len()];
        length += ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
    }
    length
}
