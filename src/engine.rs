//! The engine facade: the only surface external collaborators use.
//!
//! Every operation validates all of its guards before mutating anything and
//! holds the per-entity locks for every job, printer and spool it touches
//! until it returns. Operations on unrelated entities run in parallel.

use chrono::Utc;
use log::info;
use serde::Serialize;

use crate::aggregator::DetectionAggregator;
use crate::analyzer::{Frame, FrameAnalyzer, ImageAnalyzer};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, Entity};
use crate::job::{PrinterEffect, generate_job_id};
use crate::ledger::{InventoryLedger, UsageOutcome};
use crate::locks::{EntityGuard, EntityKey, EntityLocks};
use crate::model::{
    AlertId, DetectionResult, FailureEvent, InventoryAlert, JobId, JobStatus, NewJob, NewPrinter,
    NewSpool, PrintJob, Printer, PrinterId, PrinterStatus, Spool, SpoolId, Transition,
};
use crate::repository::{AlertFilter, JobFilter, Repository};

/// Result of [`Engine::submit_frame`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameOutcome {
    pub failure_event: Option<FailureEvent>,
    pub detection: DetectionResult,
    pub job_status: JobStatus,
}

/// Result of [`Engine::advance_progress`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressOutcome {
    pub job_status: JobStatus,
    pub progress_percent: f32,
    /// Inventory alert raised by this update, if any.
    pub spool_alert: Option<InventoryAlert>,
    /// More material was reported than the spool held.
    #[serde(skip)]
    pub material_warning: Option<EngineError>,
}

pub struct Engine<R: Repository, A: FrameAnalyzer = ImageAnalyzer> {
    config: EngineConfig,
    repo: R,
    aggregator: DetectionAggregator<A>,
    ledger: InventoryLedger,
    locks: EntityLocks,
}

impl<R: Repository> Engine<R, ImageAnalyzer> {
    /// Engine with the classical image analyzer configured from `config`.
    pub fn new(config: EngineConfig, repo: R) -> Self {
        let analyzer = ImageAnalyzer::new(config.analyzer.clone());
        Self::with_analyzer(config, repo, analyzer)
    }
}

impl<R: Repository, A: FrameAnalyzer> Engine<R, A> {
    pub fn with_analyzer(config: EngineConfig, repo: R, analyzer: A) -> Self {
        let aggregator = DetectionAggregator::new(
            analyzer,
            config.failure_detection_threshold,
            config.cooldowns,
        );
        let ledger = InventoryLedger::new(config.inventory_alert_threshold);
        Self {
            config,
            repo,
            aggregator,
            ledger,
            locks: EntityLocks::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    // ---- printers ----

    pub fn register_printer(&self, request: NewPrinter) -> EngineResult<Printer> {
        if request.name.trim().is_empty() {
            return Err(EngineError::invalid_argument("printer name is required"));
        }
        let id = request.id.unwrap_or_else(|| {
            let simple = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
            PrinterId::new(format!("PRINTER_{}", &simple[..8]))
        });
        let _guard = self.locks.acquire([EntityKey::from(&id)])?;

        let printer = Printer {
            id,
            name: request.name,
            model: request.model,
            location: request.location,
            status: PrinterStatus::Idle,
            active: true,
            created_at: Utc::now(),
        };
        self.repo.insert_printer(printer.clone())?;
        info!("Registered printer {} ({})", printer.id, printer.name);
        Ok(printer)
    }

    /// Return a printer to service after an error or maintenance.
    pub fn activate_printer(&self, printer_id: &PrinterId) -> EngineResult<Printer> {
        let _guard = self.locks.acquire([EntityKey::from(printer_id)])?;
        let mut printer = self.load_printer(printer_id)?;
        printer.active = true;
        if printer.status != PrinterStatus::Printing {
            printer.status = PrinterStatus::Idle;
        }
        self.repo.save_printer(&printer)?;
        info!("Printer {} is {}", printer.id, printer.status);
        Ok(printer)
    }

    /// Take an idle printer out of service.
    pub fn set_printer_maintenance(&self, printer_id: &PrinterId) -> EngineResult<Printer> {
        let _guard = self.locks.acquire([EntityKey::from(printer_id)])?;
        let mut printer = self.load_printer(printer_id)?;
        let busy = self
            .repo
            .jobs(&JobFilter::for_printer(printer_id.clone()))?
            .iter()
            .any(|job| job.status.is_active());
        if busy {
            return Err(EngineError::conflict(format!(
                "printer {} has an active job",
                printer_id
            )));
        }
        printer.status = PrinterStatus::Maintenance;
        self.repo.save_printer(&printer)?;
        info!("Printer {} is in maintenance", printer.id);
        Ok(printer)
    }

    // ---- jobs ----

    pub fn create_job(&self, request: NewJob) -> EngineResult<PrintJob> {
        if request.part_name.trim().is_empty() {
            return Err(EngineError::invalid_argument("part name is required"));
        }
        if let Some(grams) = request.estimated_material_grams {
            if !grams.is_finite() || grams < 0.0 {
                return Err(EngineError::invalid_argument(format!(
                    "estimated material must be a non-negative number of grams, got {}",
                    grams
                )));
            }
        }
        let printer = self.load_printer(&request.printer_id)?;
        if !printer.active {
            return Err(EngineError::conflict(format!(
                "printer {} is not active",
                printer.id
            )));
        }
        if let Some(spool_id) = &request.spool_id {
            self.load_spool(spool_id)?;
        }

        let id = request.id.clone().unwrap_or_else(generate_job_id);
        let _guard = self.locks.acquire([EntityKey::from(&id)])?;
        let job = PrintJob::queued(id, request, Utc::now());
        self.repo.insert_job(job.clone())?;
        info!("Queued job {} ({}) on printer {}", job.id, job.part_name, job.printer_id);
        Ok(job)
    }

    /// `queued → printing`; the printer becomes busy with the job.
    pub fn start_job(&self, job_id: &JobId) -> EngineResult<JobStatus> {
        let (_guard, mut job) = self.lock_job(job_id)?;
        let mut printer = self.load_printer(&job.printer_id)?;

        if let Some(spool_id) = &job.spool_id {
            self.load_spool(spool_id)?;
            let busy = self
                .repo
                .jobs(&JobFilter::active())?
                .into_iter()
                .find(|other| other.id != job.id && other.spool_id.as_ref() == Some(spool_id));
            if let Some(other) = busy {
                return Err(EngineError::conflict(format!(
                    "spool {} is in use by job {}",
                    spool_id, other.id
                )));
            }
        }

        let effect = job.start(&printer, Utc::now())?;
        effect.apply(&mut printer);
        self.repo.save_job(&job)?;
        self.repo.save_printer(&printer)?;

        if let (Some(spool_id), Some(required)) = (&job.spool_id, job.remaining_material_grams()) {
            self.ledger.ensure_sufficient(&self.repo, spool_id, required, Utc::now())?;
        }
        Ok(job.status)
    }

    /// Analyze a frame for a printing or paused job. A new failure event
    /// pauses a printing job; a paused job stays paused.
    pub fn submit_frame(&self, job_id: &JobId, frame: &Frame) -> EngineResult<FrameOutcome> {
        if frame.job_id != *job_id {
            return Err(EngineError::invalid_argument(format!(
                "frame belongs to job {}, submitted for {}",
                frame.job_id, job_id
            )));
        }
        let (_guard, mut job) = self.lock_job(job_id)?;
        if !job.status.is_active() {
            return Err(EngineError::InvalidTransition {
                status: job.status,
                transition: Transition::RecordFailure,
            });
        }

        let (detection, failure_event) = self.aggregator.submit(&self.repo, frame)?;
        if let Some(event) = &failure_event {
            if job.status.permits(Transition::RecordFailure) {
                job.record_failure(event)?;
                self.repo.save_job(&job)?;
            }
        }

        Ok(FrameOutcome {
            failure_event,
            detection,
            job_status: job.status,
        })
    }

    /// Record progress and the material it consumed. Reaching 100%
    /// completes the job.
    pub fn advance_progress(
        &self,
        job_id: &JobId,
        percent: f32,
        grams_delta: f32,
    ) -> EngineResult<ProgressOutcome> {
        let (_guard, mut job) = self.lock_job(job_id)?;
        if let Some(spool_id) = &job.spool_id {
            self.load_spool(spool_id)?;
        }

        let now = Utc::now();
        let effect = job.advance_progress(percent, grams_delta, now)?;
        self.repo.save_job(&job)?;
        self.apply_printer_effect(&job, effect)?;

        let mut spool_alert = None;
        let mut material_warning = None;
        if let Some(spool_id) = &job.spool_id {
            let UsageOutcome { alert, warning, .. } =
                self.ledger.record_usage(&self.repo, spool_id, grams_delta, now)?;
            spool_alert = alert;
            material_warning = warning;
            if job.status.is_active() {
                if let Some(required) = job.remaining_material_grams() {
                    let shortfall = self
                        .ledger
                        .ensure_sufficient(&self.repo, spool_id, required, now)?;
                    spool_alert = spool_alert.or(shortfall);
                }
            }
        }

        Ok(ProgressOutcome {
            job_status: job.status,
            progress_percent: job.progress_percent,
            spool_alert,
            material_warning,
        })
    }

    pub fn resume_job(&self, job_id: &JobId) -> EngineResult<JobStatus> {
        let (_guard, mut job) = self.lock_job(job_id)?;
        job.resume(Utc::now())?;
        self.repo.save_job(&job)?;
        Ok(job.status)
    }

    /// Finish a job. Whatever part of the material estimate was not yet
    /// reported through progress is charged to the job's spool.
    pub fn complete_job(&self, job_id: &JobId) -> EngineResult<JobStatus> {
        let (_guard, mut job) = self.lock_job(job_id)?;
        if let Some(spool_id) = &job.spool_id {
            self.load_spool(spool_id)?;
        }

        let now = Utc::now();
        let remainder = job.remaining_material_grams().filter(|grams| *grams > 0.0);
        let effect = job.complete(now)?;
        if let Some(grams) = remainder {
            job.material_used_grams += grams;
        }
        self.repo.save_job(&job)?;
        self.apply_printer_effect(&job, effect)?;

        if let (Some(spool_id), Some(grams)) = (&job.spool_id, remainder) {
            self.ledger.record_usage(&self.repo, spool_id, grams, now)?;
            info!("Charged remaining {:.1}g of job {} to spool {}", grams, job.id, spool_id);
        }
        Ok(job.status)
    }

    /// Abandon a job as failed. A printer it held goes to `error` until an
    /// operator calls [`Engine::activate_printer`].
    pub fn fail_job(&self, job_id: &JobId) -> EngineResult<JobStatus> {
        let (_guard, mut job) = self.lock_job(job_id)?;
        let effect = job.fail(Utc::now())?;
        self.repo.save_job(&job)?;
        self.apply_printer_effect(&job, effect)?;
        Ok(job.status)
    }

    pub fn cancel_job(&self, job_id: &JobId) -> EngineResult<JobStatus> {
        let (_guard, mut job) = self.lock_job(job_id)?;
        let effect = job.cancel(Utc::now())?;
        self.repo.save_job(&job)?;
        self.apply_printer_effect(&job, effect)?;
        Ok(job.status)
    }

    /// Remove a job that never started.
    pub fn delete_job(&self, job_id: &JobId) -> EngineResult<()> {
        let (_guard, job) = self.lock_job(job_id)?;
        job.ensure_deletable()?;
        self.repo.delete_job(job_id)?;
        self.aggregator.forget(job_id);
        info!("Deleted job {}", job_id);
        Ok(())
    }

    // ---- inventory ----

    pub fn create_spool(&self, request: NewSpool) -> EngineResult<SpoolId> {
        let _guard = self.locks.acquire([EntityKey::from(&request.id)])?;
        let spool = self.ledger.create_spool(&self.repo, request, Utc::now())?;
        Ok(spool.id)
    }

    pub fn record_usage(&self, spool_id: &SpoolId, grams: f32) -> EngineResult<UsageOutcome> {
        let _guard = self.locks.acquire([EntityKey::from(spool_id)])?;
        self.ledger.record_usage(&self.repo, spool_id, grams, Utc::now())
    }

    /// Swap in a full spool and resolve the spool's open alerts.
    pub fn replace_spool(&self, spool_id: &SpoolId) -> EngineResult<(Spool, Vec<InventoryAlert>)> {
        let _guard = self.locks.acquire([EntityKey::from(spool_id)])?;
        self.ledger.replace_spool(&self.repo, spool_id, Utc::now())
    }

    pub fn restock_spool(&self, spool_id: &SpoolId, grams: f32) -> EngineResult<Spool> {
        let _guard = self.locks.acquire([EntityKey::from(spool_id)])?;
        self.ledger.restock_spool(&self.repo, spool_id, grams, Utc::now())
    }

    pub fn deactivate_spool(&self, spool_id: &SpoolId) -> EngineResult<Spool> {
        let _guard = self.locks.acquire([EntityKey::from(spool_id)])?;
        self.ledger.deactivate_spool(&self.repo, spool_id, Utc::now())
    }

    pub fn activate_spool(&self, spool_id: &SpoolId) -> EngineResult<Spool> {
        let _guard = self.locks.acquire([EntityKey::from(spool_id)])?;
        self.ledger.activate_spool(&self.repo, spool_id, Utc::now())
    }

    /// Raise missing low-inventory alerts and return every open alert.
    pub fn evaluate_alerts(&self) -> EngineResult<Vec<InventoryAlert>> {
        let keys: Vec<EntityKey> = self
            .repo
            .spools(false)?
            .iter()
            .map(|spool| EntityKey::from(&spool.id))
            .collect();
        let _guard = self.locks.acquire(keys)?;
        self.ledger.evaluate_alerts(&self.repo, Utc::now())
    }

    pub fn resolve_alert(&self, alert_id: AlertId) -> EngineResult<InventoryAlert> {
        let alert = self
            .repo
            .alert(alert_id)?
            .ok_or_else(|| EngineError::not_found(Entity::Alert, alert_id))?;
        let _guard = self.locks.acquire([EntityKey::from(&alert.spool_id)])?;
        self.ledger.resolve_alert(&self.repo, alert_id, Utc::now())
    }

    // ---- queries ----

    pub fn job(&self, job_id: &JobId) -> EngineResult<PrintJob> {
        self.load_job(job_id)
    }

    pub fn printer(&self, printer_id: &PrinterId) -> EngineResult<Printer> {
        self.load_printer(printer_id)
    }

    pub fn spool(&self, spool_id: &SpoolId) -> EngineResult<Spool> {
        self.load_spool(spool_id)
    }

    /// Event history of a job, in sequence order.
    pub fn failure_events(&self, job_id: &JobId) -> EngineResult<Vec<FailureEvent>> {
        self.load_job(job_id)?;
        self.repo.events(job_id)
    }

    pub fn active_jobs(&self) -> EngineResult<Vec<PrintJob>> {
        self.repo.jobs(&JobFilter::active())
    }

    pub fn jobs_for_printer(&self, printer_id: &PrinterId) -> EngineResult<Vec<PrintJob>> {
        self.load_printer(printer_id)?;
        self.repo.jobs(&JobFilter::for_printer(printer_id.clone()))
    }

    pub fn spools(&self, include_inactive: bool) -> EngineResult<Vec<Spool>> {
        self.repo.spools(include_inactive)
    }

    /// Active spools below the inventory alert threshold.
    pub fn low_inventory_spools(&self) -> EngineResult<Vec<Spool>> {
        Ok(self
            .repo
            .spools(false)?
            .into_iter()
            .filter(|spool| self.ledger.is_low(spool))
            .collect())
    }

    pub fn open_alerts(&self) -> EngineResult<Vec<InventoryAlert>> {
        self.repo.alerts(&AlertFilter::open())
    }

    // ---- helpers ----

    /// Lock the job with its printer and spool, then reload it under the
    /// lock.
    fn lock_job(&self, job_id: &JobId) -> EngineResult<(EntityGuard<'_>, PrintJob)> {
        let peek = self.load_job(job_id)?;
        let mut keys = vec![EntityKey::from(&peek.id), EntityKey::from(&peek.printer_id)];
        keys.extend(peek.spool_id.as_ref().map(EntityKey::from));
        let guard = self.locks.acquire(keys)?;
        let job = self.load_job(job_id)?;
        Ok((guard, job))
    }

    fn apply_printer_effect(&self, job: &PrintJob, effect: PrinterEffect) -> EngineResult<()> {
        if job.status.is_terminal() {
            self.aggregator.forget(&job.id);
        }
        if effect == PrinterEffect::Unchanged {
            return Ok(());
        }
        let mut printer = self.load_printer(&job.printer_id)?;
        effect.apply(&mut printer);
        self.repo.save_printer(&printer)?;
        info!("Printer {} is {}", printer.id, printer.status);
        Ok(())
    }

    fn load_job(&self, id: &JobId) -> EngineResult<PrintJob> {
        self.repo
            .job(id)?
            .ok_or_else(|| EngineError::not_found(Entity::Job, id))
    }

    fn load_printer(&self, id: &PrinterId) -> EngineResult<Printer> {
        self.repo
            .printer(id)?
            .ok_or_else(|| EngineError::not_found(Entity::Printer, id))
    }

    fn load_spool(&self, id: &SpoolId) -> EngineResult<Spool> {
        self.repo
            .spool(id)?
            .ok_or_else(|| EngineError::not_found(Entity::Spool, id))
    }
}
