//! Turns per-frame detections into failure events.
//!
//! A detection becomes an event only when its confidence reaches the
//! threshold and it is not a repeat: either its type differs from the job's
//! most recent event, or the cooldown for that type has passed since the
//! job's last event of the same type. Time is measured between frame capture
//! times, so replayed or delayed frames are judged by when they were taken.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::analyzer::{Frame, FrameAnalyzer, ImageAnalyzer};
use crate::config::CooldownPolicy;
use crate::error::{EngineError, EngineResult};
use crate::model::{BoundingBox, DetectionResult, FailureEvent, FailureType, JobId};
use crate::repository::Repository;

pub struct DetectionAggregator<A: FrameAnalyzer = ImageAnalyzer> {
    analyzer: A,
    threshold: f32,
    cooldowns: CooldownPolicy,
    /// Silhouette of each job's most recent clean frame.
    references: Mutex<HashMap<JobId, BoundingBox>>,
}

impl<A: FrameAnalyzer> DetectionAggregator<A> {
    pub fn new(analyzer: A, threshold: f32, cooldowns: CooldownPolicy) -> Self {
        Self {
            analyzer,
            threshold,
            cooldowns,
            references: Mutex::new(HashMap::new()),
        }
    }

    /// Envelope learned for a job, if any clean frame has been seen.
    pub fn reference(&self, job_id: &JobId) -> Option<BoundingBox> {
        self.references
            .lock()
            .ok()
            .and_then(|refs| refs.get(job_id).copied())
    }

    /// Analyze a frame and, if it warrants one, append a new event to the
    /// job's history. Never changes job status.
    pub fn submit<R: Repository + ?Sized>(
        &self,
        repo: &R,
        frame: &Frame,
    ) -> EngineResult<(DetectionResult, Option<FailureEvent>)> {
        let detection = match (frame.reference, self.reference(&frame.job_id)) {
            (None, Some(learned)) => {
                let mut with_reference = frame.clone();
                with_reference.reference = Some(learned);
                self.analyzer.analyze(&with_reference)
            }
            _ => self.analyzer.analyze(frame),
        };

        if detection.is_degraded() {
            for diagnostic in &detection.diagnostics {
                warn!(
                    "Job {}: {}",
                    frame.job_id,
                    EngineError::AnalysisDegraded(diagnostic.to_string())
                );
            }
            return Ok((detection, None));
        }

        if detection.confidence < self.threshold || detection.failure_type == FailureType::None {
            if let Some(silhouette) = detection.silhouette {
                self.learn(&frame.job_id, silhouette)?;
            }
            debug!(
                "Job {}: no failure ({} at {:.2})",
                frame.job_id, detection.failure_type, detection.confidence
            );
            return Ok((detection, None));
        }

        let history = repo.events(&frame.job_id)?;
        if !self.should_emit(&history, detection.failure_type, frame.captured_at) {
            debug!(
                "Job {}: suppressed repeated {} detection ({:.2})",
                frame.job_id, detection.failure_type, detection.confidence
            );
            return Ok((detection, None));
        }

        let event = FailureEvent::from_detection(
            frame.job_id.clone(),
            history.len() as u64 + 1,
            &detection,
            frame.captured_at,
        );
        repo.append_event(event.clone())?;
        warn!(
            "Job {}: failure #{} {}",
            event.job_id,
            event.sequence,
            event.description()
        );
        Ok((detection, Some(event)))
    }

    /// Drop everything learned about a job.
    pub fn forget(&self, job_id: &JobId) {
        if let Ok(mut refs) = self.references.lock() {
            refs.remove(job_id);
        }
    }

    fn should_emit(
        &self,
        history: &[FailureEvent],
        failure_type: FailureType,
        captured_at: DateTime<Utc>,
    ) -> bool {
        match history.last() {
            None => true,
            Some(last) if last.failure_type != failure_type => true,
            Some(_) => history
                .iter()
                .rev()
                .find(|e| e.failure_type == failure_type)
                .is_none_or(|previous| {
                    captured_at - previous.detected_at >= self.cooldowns.cooldown_for(failure_type)
                }),
        }
    }

    fn learn(&self, job_id: &JobId, silhouette: BoundingBox) -> EngineResult<()> {
        let mut refs = self
            .references
            .lock()
            .map_err(|_| EngineError::storage("reference table poisoned"))?;
        refs.insert(job_id.clone(), silhouette);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Diagnostic, Evidence, NewJob, PrintJob, PrinterId};
    use crate::repository::InMemoryRepository;
    use chrono::Duration;

    /// Reports whatever evidence the frame's first byte selects.
    struct Scripted;

    impl FrameAnalyzer for Scripted {
        fn analyze(&self, frame: &Frame) -> DetectionResult {
            let mut evidence = Evidence::default();
            match frame.data.first() {
                Some(1) => evidence.stringing = 0.85,
                Some(2) => evidence.blob = 0.9,
                Some(3) => evidence.stringing = 0.3,
                _ => return DetectionResult::degraded(Diagnostic::EmptyFrame),
            }
            let silhouette = Some(BoundingBox::new(10, 10, 50, 50));
            let mut result = DetectionResult::from_evidence(evidence, Vec::new(), silhouette);
            if let Some(reference) = frame.reference {
                result.regions.push(crate::model::Region {
                    heuristic: crate::model::Heuristic::Contour,
                    bbox: reference,
                });
            }
            result
        }
    }

    fn setup() -> (InMemoryRepository, DetectionAggregator<Scripted>, JobId) {
        let repo = InMemoryRepository::new();
        let id = JobId::from("JOB_AGG");
        repo.insert_job(PrintJob::queued(
            id.clone(),
            NewJob::new(PrinterId::from("P1"), "part"),
            Utc::now(),
        ))
        .unwrap();
        let aggregator = DetectionAggregator::new(Scripted, 0.7, CooldownPolicy::uniform(300));
        (repo, aggregator, id)
    }

    fn frame(id: &JobId, kind: u8, at: DateTime<Utc>) -> Frame {
        Frame::new(id.clone(), vec![kind], at)
    }

    #[test]
    fn below_threshold_is_not_an_event() {
        let (repo, aggregator, id) = setup();
        let (detection, event) = aggregator.submit(&repo, &frame(&id, 3, Utc::now())).unwrap();
        assert_eq!(detection.failure_type, FailureType::Stringing);
        assert!(event.is_none());
        assert!(repo.events(&id).unwrap().is_empty());
    }

    #[test]
    fn repeated_type_is_suppressed_within_cooldown() {
        let (repo, aggregator, id) = setup();
        let t0 = Utc::now();
        let (_, first) = aggregator.submit(&repo, &frame(&id, 1, t0)).unwrap();
        assert_eq!(first.unwrap().sequence, 1);

        let (_, second) = aggregator
            .submit(&repo, &frame(&id, 1, t0 + Duration::seconds(1)))
            .unwrap();
        assert!(second.is_none());

        let (_, later) = aggregator
            .submit(&repo, &frame(&id, 1, t0 + Duration::seconds(300)))
            .unwrap();
        assert_eq!(later.unwrap().sequence, 2);
    }

    #[test]
    fn different_type_is_not_suppressed() {
        let (repo, aggregator, id) = setup();
        let t0 = Utc::now();
        aggregator.submit(&repo, &frame(&id, 1, t0)).unwrap();
        let (_, blob) = aggregator
            .submit(&repo, &frame(&id, 2, t0 + Duration::seconds(1)))
            .unwrap();
        let blob = blob.unwrap();
        assert_eq!(blob.failure_type, FailureType::Blob);
        assert_eq!(blob.sequence, 2);

        // Back to stringing: differs from the most recent event.
        let (_, again) = aggregator
            .submit(&repo, &frame(&id, 1, t0 + Duration::seconds(2)))
            .unwrap();
        assert_eq!(again.unwrap().sequence, 3);
    }

    #[test]
    fn degraded_frames_produce_nothing() {
        let (repo, aggregator, id) = setup();
        let (detection, event) = aggregator.submit(&repo, &frame(&id, 0, Utc::now())).unwrap();
        assert!(detection.is_degraded());
        assert!(event.is_none());
    }

    #[test]
    fn clean_frames_teach_the_reference() {
        let (repo, aggregator, id) = setup();
        assert_eq!(aggregator.reference(&id), None);
        aggregator.submit(&repo, &frame(&id, 3, Utc::now())).unwrap();
        assert_eq!(aggregator.reference(&id), Some(BoundingBox::new(10, 10, 50, 50)));

        // The learned envelope is supplied to later frames.
        let (detection, _) = aggregator.submit(&repo, &frame(&id, 3, Utc::now())).unwrap();
        assert_eq!(detection.regions.len(), 1);

        aggregator.forget(&id);
        assert_eq!(aggregator.reference(&id), None);
    }
}
