//! Print job lifecycle.
//!
//! ```text
//! queued ──start──▶ printing ──record_failure──▶ paused_failure
//!                     ▲  │                          │
//!                     └──┼────────resume────────────┘
//!                        ▼
//!            completed / failed / cancelled   (terminal)
//! ```
//!
//! Every transition checks [`JobStatus::permits`] before touching the job,
//! so a rejected request leaves the record exactly as it was. Printer side
//! effects are returned as a [`PrinterEffect`] for the caller to apply
//! together with the job.

use chrono::{DateTime, Duration, Utc};
use log::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{
    FailureEvent, JobId, JobStatus, NewJob, PrintJob, Printer, PrinterStatus, Transition,
};

impl JobStatus {
    /// The single permission table for job transitions.
    pub fn permits(&self, transition: Transition) -> bool {
        use JobStatus::*;
        match transition {
            Transition::Start => *self == Queued,
            Transition::AdvanceProgress => matches!(self, Printing | PausedFailure),
            Transition::RecordFailure => *self == Printing,
            Transition::Resume => *self == PausedFailure,
            Transition::Complete => matches!(self, Printing | PausedFailure),
            Transition::Fail | Transition::Cancel => !self.is_terminal(),
            Transition::Delete => *self == Queued,
        }
    }

    fn ensure(self, transition: Transition) -> EngineResult<()> {
        if self.permits(transition) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                status: self,
                transition,
            })
        }
    }
}

/// What a job transition means for the printer that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterEffect {
    Unchanged,
    /// The printer becomes busy with this job.
    Occupy,
    /// The job ended normally; the printer goes back to idle.
    Release,
    /// The job failed; the printer needs operator attention.
    Fault,
}

impl PrinterEffect {
    pub fn apply(self, printer: &mut Printer) {
        match self {
            PrinterEffect::Unchanged => {}
            PrinterEffect::Occupy => printer.status = PrinterStatus::Printing,
            PrinterEffect::Release => printer.status = PrinterStatus::Idle,
            PrinterEffect::Fault => printer.status = PrinterStatus::Error,
        }
    }
}

/// Generate an external job id of the form `JOB_1A2B3C4D`.
pub fn generate_job_id() -> JobId {
    let simple = Uuid::new_v4().simple().to_string().to_uppercase();
    JobId::new(format!("JOB_{}", &simple[..8]))
}

impl PrintJob {
    /// A new job in `queued`.
    pub fn queued(id: JobId, request: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            printer_id: request.printer_id,
            spool_id: request.spool_id,
            part_name: request.part_name,
            estimated_material_grams: request.estimated_material_grams,
            estimated_minutes: request.estimated_minutes,
            status: JobStatus::Queued,
            progress_percent: 0.0,
            material_used_grams: 0.0,
            created_at,
            started_at: None,
            paused_at: None,
            resumed_at: None,
            ended_at: None,
        }
    }

    /// `queued → printing`. The printer must be idle and active.
    pub fn start(&mut self, printer: &Printer, at: DateTime<Utc>) -> EngineResult<PrinterEffect> {
        self.status.ensure(Transition::Start)?;
        if printer.id != self.printer_id {
            return Err(EngineError::invalid_argument(format!(
                "job {} belongs to printer {}, not {}",
                self.id, self.printer_id, printer.id
            )));
        }
        if !printer.is_available() {
            return Err(EngineError::conflict(format!(
                "printer {} is not available (status {}, active {})",
                printer.id, printer.status, printer.active
            )));
        }

        self.status = JobStatus::Printing;
        self.started_at = Some(at);
        info!("Job {} started on printer {}", self.id, printer.id);
        Ok(PrinterEffect::Occupy)
    }

    /// Record progress. Reaching 100 completes the job.
    ///
    /// `percent` must be finite, within `0..=100` and not below the current
    /// progress. A paused job records progress but stays paused.
    pub fn advance_progress(
        &mut self,
        percent: f32,
        grams_used: f32,
        at: DateTime<Utc>,
    ) -> EngineResult<PrinterEffect> {
        self.status.ensure(Transition::AdvanceProgress)?;
        if !percent.is_finite()
            || !(0.0..=100.0).contains(&percent)
            || percent < self.progress_percent
        {
            return Err(EngineError::InvalidProgress {
                current: self.progress_percent,
                requested: percent,
            });
        }
        if !grams_used.is_finite() || grams_used < 0.0 {
            return Err(EngineError::invalid_argument(format!(
                "material usage must be a non-negative number of grams, got {}",
                grams_used
            )));
        }

        self.progress_percent = percent;
        self.material_used_grams += grams_used;
        if percent >= 100.0 {
            self.finish(JobStatus::Completed, at);
            return Ok(PrinterEffect::Release);
        }
        Ok(PrinterEffect::Unchanged)
    }

    /// `printing → paused_failure` in response to a failure event.
    pub fn record_failure(&mut self, event: &FailureEvent) -> EngineResult<()> {
        self.status.ensure(Transition::RecordFailure)?;
        if event.job_id != self.id {
            return Err(EngineError::invalid_argument(format!(
                "failure event for job {} applied to job {}",
                event.job_id, self.id
            )));
        }
        self.status = JobStatus::PausedFailure;
        self.paused_at = Some(event.detected_at);
        info!(
            "Job {} paused after failure #{} ({})",
            self.id, event.sequence, event.failure_type
        );
        Ok(())
    }

    /// `paused_failure → printing`, after an operator judged the print
    /// salvageable.
    pub fn resume(&mut self, at: DateTime<Utc>) -> EngineResult<()> {
        self.status.ensure(Transition::Resume)?;
        self.status = JobStatus::Printing;
        self.resumed_at = Some(at);
        info!("Job {} resumed", self.id);
        Ok(())
    }

    pub fn complete(&mut self, at: DateTime<Utc>) -> EngineResult<PrinterEffect> {
        self.status.ensure(Transition::Complete)?;
        self.finish(JobStatus::Completed, at);
        Ok(PrinterEffect::Release)
    }

    pub fn fail(&mut self, at: DateTime<Utc>) -> EngineResult<PrinterEffect> {
        self.status.ensure(Transition::Fail)?;
        let held = self.status.is_active();
        self.finish(JobStatus::Failed, at);
        Ok(if held {
            PrinterEffect::Fault
        } else {
            PrinterEffect::Unchanged
        })
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> EngineResult<PrinterEffect> {
        self.status.ensure(Transition::Cancel)?;
        let held = self.status.is_active();
        self.finish(JobStatus::Cancelled, at);
        Ok(if held {
            PrinterEffect::Release
        } else {
            PrinterEffect::Unchanged
        })
    }

    /// Only jobs that never started may be removed.
    pub fn ensure_deletable(&self) -> EngineResult<()> {
        self.status.ensure(Transition::Delete)
    }

    /// Material still expected to be consumed, from the estimate.
    pub fn remaining_material_grams(&self) -> Option<f32> {
        self.estimated_material_grams
            .map(|estimate| (estimate - self.material_used_grams).max(0.0))
    }

    /// Wall time between start and end, once the job has ended.
    pub fn actual_duration(&self) -> Option<Duration> {
        Some(self.ended_at? - self.started_at?)
    }

    fn finish(&mut self, status: JobStatus, at: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(at);
        info!("Job {} {}", self.id, status);
    }
}
