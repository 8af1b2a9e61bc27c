//! Persistence boundary.
//!
//! The engine reads and writes records only through [`Repository`]. Exclusive
//! updates per entity are provided by the engine's lock table, so a
//! repository only has to make each individual call atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult, Entity};
use crate::model::{
    AlertId, FailureEvent, InventoryAlert, JobId, NewAlert, PrintJob, Printer, PrinterId, Spool,
    SpoolId,
};

/// Which jobs to list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub printer_id: Option<PrinterId>,
    /// Only `printing` and `paused_failure` jobs.
    pub active_only: bool,
}

impl JobFilter {
    pub fn active() -> Self {
        Self {
            printer_id: None,
            active_only: true,
        }
    }

    pub fn for_printer(printer_id: PrinterId) -> Self {
        Self {
            printer_id: Some(printer_id),
            active_only: false,
        }
    }

    fn matches(&self, job: &PrintJob) -> bool {
        self.printer_id.as_ref().is_none_or(|p| *p == job.printer_id)
            && (!self.active_only || job.status.is_active())
    }
}

/// Which alerts to list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertFilter {
    pub spool_id: Option<SpoolId>,
    pub open_only: bool,
}

impl AlertFilter {
    pub fn open() -> Self {
        Self {
            spool_id: None,
            open_only: true,
        }
    }

    pub fn open_for(spool_id: SpoolId) -> Self {
        Self {
            spool_id: Some(spool_id),
            open_only: true,
        }
    }

    fn matches(&self, alert: &InventoryAlert) -> bool {
        self.spool_id.as_ref().is_none_or(|s| *s == alert.spool_id)
            && (!self.open_only || alert.is_open())
    }
}

/// Storage operations the engine needs. `insert_*` fails with `Conflict` on a
/// duplicate id; `save_*` fails with `NotFound` for unknown records.
pub trait Repository: Send + Sync {
    fn insert_printer(&self, printer: Printer) -> EngineResult<()>;
    fn printer(&self, id: &PrinterId) -> EngineResult<Option<Printer>>;
    fn save_printer(&self, printer: &Printer) -> EngineResult<()>;

    fn insert_job(&self, job: PrintJob) -> EngineResult<()>;
    fn job(&self, id: &JobId) -> EngineResult<Option<PrintJob>>;
    fn save_job(&self, job: &PrintJob) -> EngineResult<()>;
    fn delete_job(&self, id: &JobId) -> EngineResult<()>;
    fn jobs(&self, filter: &JobFilter) -> EngineResult<Vec<PrintJob>>;

    /// Append to the job's event history, which is kept in sequence order.
    fn append_event(&self, event: FailureEvent) -> EngineResult<()>;
    fn events(&self, job_id: &JobId) -> EngineResult<Vec<FailureEvent>>;

    fn insert_spool(&self, spool: Spool) -> EngineResult<()>;
    fn spool(&self, id: &SpoolId) -> EngineResult<Option<Spool>>;
    fn save_spool(&self, spool: &Spool) -> EngineResult<()>;
    fn spools(&self, include_inactive: bool) -> EngineResult<Vec<Spool>>;

    /// Store a new alert and assign its id.
    fn insert_alert(&self, alert: NewAlert, at: DateTime<Utc>) -> EngineResult<InventoryAlert>;
    fn alert(&self, id: AlertId) -> EngineResult<Option<InventoryAlert>>;
    fn save_alert(&self, alert: &InventoryAlert) -> EngineResult<()>;
    fn alerts(&self, filter: &AlertFilter) -> EngineResult<Vec<InventoryAlert>>;
}

#[derive(Debug, Default)]
struct Tables {
    printers: BTreeMap<PrinterId, Printer>,
    jobs: BTreeMap<JobId, PrintJob>,
    events: HashMap<JobId, Vec<FailureEvent>>,
    spools: BTreeMap<SpoolId, Spool>,
    alerts: BTreeMap<AlertId, InventoryAlert>,
    next_alert_id: u64,
}

/// Process-local repository backed by ordered maps.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> EngineResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| EngineError::storage("repository lock poisoned"))
    }

    fn write(&self) -> EngineResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| EngineError::storage("repository lock poisoned"))
    }
}

fn insert_unique<K: Ord + Clone + std::fmt::Display, V>(
    map: &mut BTreeMap<K, V>,
    key: &K,
    value: V,
    what: &str,
) -> EngineResult<()> {
    if map.contains_key(key) {
        return Err(EngineError::conflict(format!("{} '{}' already exists", what, key)));
    }
    map.insert(key.clone(), value);
    Ok(())
}

fn replace_existing<K: Ord + std::fmt::Display, V>(
    map: &mut BTreeMap<K, V>,
    key: &K,
    value: V,
    entity: Entity,
) -> EngineResult<()> {
    match map.get_mut(key) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(EngineError::not_found(entity, key)),
    }
}

impl Repository for InMemoryRepository {
    fn insert_printer(&self, printer: Printer) -> EngineResult<()> {
        let id = printer.id.clone();
        insert_unique(&mut self.write()?.printers, &id, printer, "printer")
    }

    fn printer(&self, id: &PrinterId) -> EngineResult<Option<Printer>> {
        Ok(self.read()?.printers.get(id).cloned())
    }

    fn save_printer(&self, printer: &Printer) -> EngineResult<()> {
        replace_existing(
            &mut self.write()?.printers,
            &printer.id,
            printer.clone(),
            Entity::Printer,
        )
    }

    fn insert_job(&self, job: PrintJob) -> EngineResult<()> {
        let id = job.id.clone();
        insert_unique(&mut self.write()?.jobs, &id, job, "job")
    }

    fn job(&self, id: &JobId) -> EngineResult<Option<PrintJob>> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    fn save_job(&self, job: &PrintJob) -> EngineResult<()> {
        replace_existing(&mut self.write()?.jobs, &job.id, job.clone(), Entity::Job)
    }

    fn delete_job(&self, id: &JobId) -> EngineResult<()> {
        let mut tables = self.write()?;
        if tables.jobs.remove(id).is_none() {
            return Err(EngineError::not_found(Entity::Job, id));
        }
        tables.events.remove(id);
        Ok(())
    }

    fn jobs(&self, filter: &JobFilter) -> EngineResult<Vec<PrintJob>> {
        let mut jobs: Vec<PrintJob> = self
            .read()?
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn append_event(&self, event: FailureEvent) -> EngineResult<()> {
        let mut tables = self.write()?;
        if !tables.jobs.contains_key(&event.job_id) {
            return Err(EngineError::not_found(Entity::Job, &event.job_id));
        }
        let history = tables.events.entry(event.job_id.clone()).or_default();
        let expected = history.len() as u64 + 1;
        if event.sequence != expected {
            return Err(EngineError::conflict(format!(
                "event sequence {} for job {} out of order (expected {})",
                event.sequence, event.job_id, expected
            )));
        }
        history.push(event);
        Ok(())
    }

    fn events(&self, job_id: &JobId) -> EngineResult<Vec<FailureEvent>> {
        Ok(self
            .read()?
            .events
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    fn insert_spool(&self, spool: Spool) -> EngineResult<()> {
        let id = spool.id.clone();
        insert_unique(&mut self.write()?.spools, &id, spool, "spool")
    }

    fn spool(&self, id: &SpoolId) -> EngineResult<Option<Spool>> {
        Ok(self.read()?.spools.get(id).cloned())
    }

    fn save_spool(&self, spool: &Spool) -> EngineResult<()> {
        replace_existing(&mut self.write()?.spools, &spool.id, spool.clone(), Entity::Spool)
    }

    fn spools(&self, include_inactive: bool) -> EngineResult<Vec<Spool>> {
        Ok(self
            .read()?
            .spools
            .values()
            .filter(|spool| include_inactive || spool.active)
            .cloned()
            .collect())
    }

    fn insert_alert(&self, alert: NewAlert, at: DateTime<Utc>) -> EngineResult<InventoryAlert> {
        let mut tables = self.write()?;
        tables.next_alert_id += 1;
        let stored = InventoryAlert {
            id: AlertId(tables.next_alert_id),
            spool_id: alert.spool_id,
            kind: alert.kind,
            threshold: alert.threshold,
            fill_ratio: alert.fill_ratio,
            message: alert.message,
            resolved: false,
            created_at: at,
            resolved_at: None,
        };
        tables.alerts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn alert(&self, id: AlertId) -> EngineResult<Option<InventoryAlert>> {
        Ok(self.read()?.alerts.get(&id).cloned())
    }

    fn save_alert(&self, alert: &InventoryAlert) -> EngineResult<()> {
        replace_existing(&mut self.write()?.alerts, &alert.id, alert.clone(), Entity::Alert)
    }

    fn alerts(&self, filter: &AlertFilter) -> EngineResult<Vec<InventoryAlert>> {
        Ok(self
            .read()?
            .alerts
            .values()
            .filter(|alert| filter.matches(alert))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertKind, JobStatus, NewJob, PrinterStatus};

    fn printer(id: &str) -> Printer {
        Printer {
            id: PrinterId::from(id),
            name: id.to_string(),
            model: None,
            location: None,
            status: PrinterStatus::Idle,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_insert_is_conflict() {
        let repo = InMemoryRepository::new();
        repo.insert_printer(printer("P1")).unwrap();
        let err = repo.insert_printer(printer("P1")).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn save_unknown_record_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo.save_printer(&printer("ghost")).unwrap_err();
        assert_eq!(err.to_string(), "printer 'ghost' not found");
    }

    #[test]
    fn job_filters() {
        let repo = InMemoryRepository::new();
        let mut running = PrintJob::queued(
            JobId::from("JOB_A"),
            NewJob::new(PrinterId::from("P1"), "a"),
            Utc::now(),
        );
        running.status = JobStatus::Printing;
        let queued = PrintJob::queued(
            JobId::from("JOB_B"),
            NewJob::new(PrinterId::from("P2"), "b"),
            Utc::now(),
        );
        repo.insert_job(running).unwrap();
        repo.insert_job(queued).unwrap();

        let active = repo.jobs(&JobFilter::active()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, JobId::from("JOB_A"));

        let on_p2 = repo.jobs(&JobFilter::for_printer(PrinterId::from("P2"))).unwrap();
        assert_eq!(on_p2.len(), 1);
        assert_eq!(on_p2[0].id, JobId::from("JOB_B"));
        assert_eq!(repo.jobs(&JobFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn alert_ids_are_sequential() {
        let repo = InMemoryRepository::new();
        let new_alert = |spool: &str| NewAlert {
            spool_id: SpoolId::from(spool),
            kind: AlertKind::LowInventory,
            threshold: 0.15,
            fill_ratio: 0.1,
            message: "low".to_string(),
        };
        let first = repo.insert_alert(new_alert("S1"), Utc::now()).unwrap();
        let second = repo.insert_alert(new_alert("S2"), Utc::now()).unwrap();
        assert_eq!(first.id, AlertId(1));
        assert_eq!(second.id, AlertId(2));
        assert_eq!(
            repo.alerts(&AlertFilter::open_for(SpoolId::from("S2"))).unwrap(),
            vec![second]
        );
    }
}
