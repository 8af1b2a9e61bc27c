//! Domain types shared by the analyzer, the state machine and the ledger.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// External print job identifier (e.g. `JOB_1A2B3C4D`).
    JobId
);
string_id!(
    /// Printer identifier.
    PrinterId
);
string_id!(
    /// Filament spool identifier.
    SpoolId
);

/// Inventory alert identifier, assigned by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub u64);

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure category reported for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    None,
    Stringing,
    LayerSeparation,
    Warping,
    Blob,
}

impl FailureType {
    /// Fusion priority, highest first. Earlier categories win ties.
    pub const PRIORITY: [FailureType; 4] = [
        FailureType::Stringing,
        FailureType::LayerSeparation,
        FailureType::Warping,
        FailureType::Blob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::None => "none",
            FailureType::Stringing => "stringing",
            FailureType::LayerSeparation => "layer_separation",
            FailureType::Warping => "warping",
            FailureType::Blob => "blob",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four image heuristics. Each maps to exactly one failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heuristic {
    Edge,
    Line,
    Blob,
    Contour,
}

impl Heuristic {
    pub fn category(&self) -> FailureType {
        match self {
            Heuristic::Edge => FailureType::Warping,
            Heuristic::Line => FailureType::Stringing,
            Heuristic::Blob => FailureType::Blob,
            Heuristic::Contour => FailureType::LayerSeparation,
        }
    }
}

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Smallest box containing every point. `None` for an empty iterator.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut iter = points.into_iter();
        let (x0, y0) = iter.next()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (x0, y0, x0, y0);
        for (x, y) in iter {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Some(Self::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x as f32
            && y >= self.y as f32
            && x < self.right() as f32
            && y < self.bottom() as f32
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        BoundingBox::new(x, y, right - x, bottom - y)
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right > x && bottom > y).then(|| BoundingBox::new(x, y, right - x, bottom - y))
    }

    /// The part of the box inside a `bounds_w` x `bounds_h` frame.
    pub fn clip(&self, bounds_w: u32, bounds_h: u32) -> Option<BoundingBox> {
        self.intersection(&BoundingBox::new(0, 0, bounds_w, bounds_h))
    }

    /// Intersection over union in `[0, 1]`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other).map_or(0, |b| b.area());
        let union = self.area().saturating_add(other.area()) - inter;
        if union == 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }

    /// Grow (positive `fraction`) or shrink (negative) each side by a fraction
    /// of the box size, clipped to `bounds_w` x `bounds_h`.
    pub fn scaled_margin(
        &self,
        fraction: f32,
        bounds_w: u32,
        bounds_h: u32,
    ) -> Option<BoundingBox> {
        let dx = self.width as f32 * fraction;
        let dy = self.height as f32 * fraction;
        let x0 = (self.x as f32 - dx).max(0.0);
        let y0 = (self.y as f32 - dy).max(0.0);
        let x1 = (self.right() as f32 + dx).min(bounds_w as f32);
        let y1 = (self.bottom() as f32 + dy).min(bounds_h as f32);
        if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
            return None;
        }
        let (x0, y0) = (x0.round() as u32, y0.round() as u32);
        let (x1, y1) = (x1.round() as u32, y1.round() as u32);
        (x1 > x0 && y1 > y0).then(|| BoundingBox::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// Multiply every coordinate by `factor` (used to map between the
    /// working resolution and the original frame).
    pub fn rescale(&self, factor: f32) -> BoundingBox {
        let x = (self.x as f32 * factor).round() as u32;
        let y = (self.y as f32 * factor).round() as u32;
        let width = ((self.width as f32 * factor).round() as u32).max(1);
        let height = ((self.height as f32 * factor).round() as u32).max(1);
        BoundingBox::new(x, y, width, height)
    }
}

/// A bounding box implicated by one heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub heuristic: Heuristic,
    pub bbox: BoundingBox,
}

/// One evidence score per failure category, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub stringing: f32,
    pub layer_separation: f32,
    pub warping: f32,
    pub blob: f32,
}

impl Evidence {
    pub fn get(&self, failure_type: FailureType) -> f32 {
        match failure_type {
            FailureType::None => 0.0,
            FailureType::Stringing => self.stringing,
            FailureType::LayerSeparation => self.layer_separation,
            FailureType::Warping => self.warping,
            FailureType::Blob => self.blob,
        }
    }

    pub fn set(&mut self, failure_type: FailureType, score: f32) {
        let score = clamp_unit(score);
        match failure_type {
            FailureType::None => {}
            FailureType::Stringing => self.stringing = score,
            FailureType::LayerSeparation => self.layer_separation = score,
            FailureType::Warping => self.warping = score,
            FailureType::Blob => self.blob = score,
        }
    }

    /// Category with the highest score and that score.
    ///
    /// Walks [`FailureType::PRIORITY`] and only replaces the current best on
    /// a strictly greater score, so ties resolve to the higher priority.
    pub fn fuse(&self) -> (FailureType, f32) {
        let mut best = (FailureType::None, 0.0_f32);
        for category in FailureType::PRIORITY {
            let score = clamp_unit(self.get(category));
            if score > best.1 {
                best = (category, score);
            }
        }
        best
    }
}

/// Clamp to `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Why a frame could not be (fully) analyzed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnostic {
    EmptyFrame,
    UndecodableFrame(String),
    FlatFrame,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::EmptyFrame => f.write_str("empty frame buffer"),
            Diagnostic::UndecodableFrame(reason) => write!(f, "undecodable frame: {}", reason),
            Diagnostic::FlatFrame => f.write_str("frame has no visible structure"),
        }
    }
}

/// Result of analyzing one frame. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub failure_type: FailureType,
    pub confidence: f32,
    pub evidence: Evidence,
    pub regions: Vec<Region>,
    /// Observed print silhouette, in frame coordinates.
    pub silhouette: Option<BoundingBox>,
    pub diagnostics: Vec<Diagnostic>,
}

impl DetectionResult {
    pub fn from_evidence(
        evidence: Evidence,
        regions: Vec<Region>,
        silhouette: Option<BoundingBox>,
    ) -> Self {
        let (failure_type, confidence) = evidence.fuse();
        Self {
            failure_type,
            confidence,
            evidence,
            regions,
            silhouette,
            diagnostics: Vec::new(),
        }
    }

    /// Zero-confidence result carrying a diagnostic.
    pub fn degraded(diagnostic: Diagnostic) -> Self {
        Self {
            failure_type: FailureType::None,
            confidence: 0.0,
            evidence: Evidence::default(),
            regions: Vec::new(),
            silhouette: None,
            diagnostics: vec![diagnostic],
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Regions produced by the heuristic behind `failure_type`.
    pub fn regions_for(&self, failure_type: FailureType) -> Vec<Region> {
        self.regions
            .iter()
            .filter(|r| r.heuristic.category() == failure_type)
            .copied()
            .collect()
    }
}

/// A detection that crossed the threshold, bound to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub job_id: JobId,
    /// 1-based, strictly increasing within a job.
    pub sequence: u64,
    pub failure_type: FailureType,
    pub confidence: f32,
    pub evidence: Evidence,
    pub regions: Vec<Region>,
    pub detected_at: DateTime<Utc>,
}

impl FailureEvent {
    pub fn from_detection(
        job_id: JobId,
        sequence: u64,
        detection: &DetectionResult,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            sequence,
            failure_type: detection.failure_type,
            confidence: detection.confidence,
            evidence: detection.evidence,
            regions: detection.regions_for(detection.failure_type),
            detected_at,
        }
    }

    pub fn description(&self) -> String {
        format!(
            "detected {} with {:.2} confidence",
            self.failure_type, self.confidence
        )
    }
}

/// Print job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Printing,
    PausedFailure,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Printing => "printing",
            JobStatus::PausedFailure => "paused_failure",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Printing or paused: the job holds its printer.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Printing | JobStatus::PausedFailure)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested job state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    AdvanceProgress,
    RecordFailure,
    Resume,
    Complete,
    Fail,
    Cancel,
    Delete,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transition::Start => "start",
            Transition::AdvanceProgress => "advance_progress",
            Transition::RecordFailure => "record_failure",
            Transition::Resume => "resume",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::Cancel => "cancel",
            Transition::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A print job and its lifecycle timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub printer_id: PrinterId,
    pub spool_id: Option<SpoolId>,
    pub part_name: String,
    pub estimated_material_grams: Option<f32>,
    pub estimated_minutes: Option<u32>,
    pub status: JobStatus,
    pub progress_percent: f32,
    pub material_used_grams: f32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Printer availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterStatus {
    Idle,
    Printing,
    Error,
    Maintenance,
}

impl fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrinterStatus::Idle => "idle",
            PrinterStatus::Printing => "printing",
            PrinterStatus::Error => "error",
            PrinterStatus::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printer {
    pub id: PrinterId,
    pub name: String,
    pub model: Option<String>,
    pub location: Option<String>,
    pub status: PrinterStatus,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Printer {
    /// Idle and active: a queued job may start on it.
    pub fn is_available(&self) -> bool {
        self.active && self.status == PrinterStatus::Idle
    }
}

/// A filament spool. `0 <= remaining_grams <= capacity_grams` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spool {
    pub id: SpoolId,
    pub material_type: String,
    pub color: Option<String>,
    pub brand: Option<String>,
    pub capacity_grams: f32,
    pub remaining_grams: f32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Spool {
    pub fn fill_ratio(&self) -> f32 {
        if self.capacity_grams <= 0.0 {
            return 0.0;
        }
        self.remaining_grams / self.capacity_grams
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowInventory,
    InsufficientMaterial,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::LowInventory => f.write_str("low_inventory"),
            AlertKind::InsufficientMaterial => f.write_str("insufficient_material"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryAlert {
    pub id: AlertId,
    pub spool_id: SpoolId,
    pub kind: AlertKind,
    pub threshold: f32,
    /// Fill ratio of the spool when the alert was raised.
    pub fill_ratio: f32,
    pub message: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl InventoryAlert {
    pub fn is_open(&self) -> bool {
        !self.resolved
    }
}

/// Alert contents before the repository assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub spool_id: SpoolId,
    pub kind: AlertKind,
    pub threshold: f32,
    pub fill_ratio: f32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewPrinter {
    pub id: Option<PrinterId>,
    pub name: String,
    pub model: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: Option<JobId>,
    pub printer_id: PrinterId,
    pub spool_id: Option<SpoolId>,
    pub part_name: String,
    pub estimated_material_grams: Option<f32>,
    pub estimated_minutes: Option<u32>,
}

impl NewJob {
    pub fn new(printer_id: PrinterId, part_name: impl Into<String>) -> Self {
        Self {
            id: None,
            printer_id,
            spool_id: None,
            part_name: part_name.into(),
            estimated_material_grams: None,
            estimated_minutes: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_spool(mut self, spool_id: SpoolId) -> Self {
        self.spool_id = Some(spool_id);
        self
    }

    pub fn with_estimated_material(mut self, grams: f32) -> Self {
        self.estimated_material_grams = Some(grams);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSpool {
    pub id: SpoolId,
    pub material_type: String,
    pub capacity_grams: f32,
    /// Defaults to full capacity.
    pub remaining_grams: Option<f32>,
    pub color: Option<String>,
    pub brand: Option<String>,
}

impl NewSpool {
    pub fn new(id: SpoolId, material_type: impl Into<String>, capacity_grams: f32) -> Self {
        Self {
            id,
            material_type: material_type.into(),
            capacity_grams,
            remaining_grams: None,
            color: None,
            brand: None,
        }
    }

    pub fn with_remaining(mut self, grams: f32) -> Self {
        self.remaining_grams = Some(grams);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuse_picks_maximum_evidence() {
        let evidence = Evidence {
            stringing: 0.2,
            layer_separation: 0.4,
            warping: 0.9,
            blob: 0.1,
        };
        assert_eq!(evidence.fuse(), (FailureType::Warping, 0.9));
    }

    #[test]
    fn fuse_breaks_ties_by_priority() {
        let evidence = Evidence {
            stringing: 0.5,
            layer_separation: 0.5,
            warping: 0.5,
            blob: 0.5,
        };
        assert_eq!(evidence.fuse().0, FailureType::Stringing);

        let evidence = Evidence {
            stringing: 0.1,
            layer_separation: 0.6,
            warping: 0.6,
            blob: 0.6,
        };
        assert_eq!(evidence.fuse().0, FailureType::LayerSeparation);

        let evidence = Evidence {
            warping: 0.3,
            blob: 0.3,
            ..Evidence::default()
        };
        assert_eq!(evidence.fuse().0, FailureType::Warping);
    }

    #[test]
    fn fuse_of_zero_evidence_is_none() {
        assert_eq!(Evidence::default().fuse(), (FailureType::None, 0.0));
    }

    #[test]
    fn evidence_set_clamps() {
        let mut evidence = Evidence::default();
        evidence.set(FailureType::Blob, 3.5);
        evidence.set(FailureType::Stringing, f32::NAN);
        assert_eq!(evidence.blob, 1.0);
        assert_eq!(evidence.stringing, 0.0);
    }

    #[test]
    fn bounding_box_iou_and_union() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 0, 10, 10);
        assert_eq!(a.union(&b), BoundingBox::new(0, 0, 15, 10));
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&a), 1.0);
        assert_eq!(a.iou(&BoundingBox::new(20, 20, 5, 5)), 0.0);
    }

    #[test]
    fn bounding_box_from_points_is_inclusive() {
        let bbox = BoundingBox::from_points([(2, 3), (5, 9), (4, 4)]).unwrap();
        assert_eq!(bbox, BoundingBox::new(2, 3, 4, 7));
        assert!(BoundingBox::from_points(Vec::new()).is_none());
    }

    #[test]
    fn bounding_box_margin_clips_to_bounds() {
        let bbox = BoundingBox::new(10, 10, 100, 100);
        assert_eq!(
            bbox.scaled_margin(0.1, 1000, 1000),
            Some(BoundingBox::new(0, 0, 120, 120))
        );
        assert_eq!(
            bbox.scaled_margin(-0.1, 1000, 1000),
            Some(BoundingBox::new(20, 20, 80, 80))
        );
        assert_eq!(bbox.scaled_margin(-0.5, 1000, 1000), None);
    }

    #[test]
    fn boxes_near_the_coordinate_limit_saturate() {
        let far = BoundingBox::new(u32::MAX - 5, 10, 100, 100);
        assert_eq!(far.right(), u32::MAX);
        assert_eq!(far.bottom(), 110);
        assert_eq!(far.scaled_margin(-0.1, 200, 200), None);
        assert_eq!(far.clip(200, 200), None);
        assert_eq!(
            far.union(&BoundingBox::new(0, 0, 10, 10)),
            BoundingBox::new(0, 0, u32::MAX, 110)
        );
        assert_eq!(
            BoundingBox::new(150, 150, 100, 100).clip(200, 200),
            Some(BoundingBox::new(150, 150, 50, 50))
        );
    }

    #[test]
    fn job_status_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::PausedFailure.is_terminal());
        assert!(JobStatus::PausedFailure.is_active());
        assert!(!JobStatus::Queued.is_active());
    }
}
