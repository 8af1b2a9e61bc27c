//! Filament inventory: spool consumption and inventory alerts.
//!
//! A spool has at most one open alert at a time, of either kind. Alerts are
//! only closed by an operator, through [`InventoryLedger::resolve_alert`] or
//! [`InventoryLedger::replace_spool`]; usage and restocking never close them.

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::error::{EngineError, EngineResult, Entity};
use crate::model::{AlertId, AlertKind, InventoryAlert, NewAlert, NewSpool, Spool, SpoolId};
use crate::repository::{AlertFilter, Repository};

/// Result of [`InventoryLedger::record_usage`].
#[derive(Debug, Clone, PartialEq)]
pub struct UsageOutcome {
    pub spool: Spool,
    /// Alert raised by this update, if any.
    pub alert: Option<InventoryAlert>,
    /// Set when more material was reported than the spool held. The usage
    /// is still applied (clamped at zero).
    pub warning: Option<EngineError>,
}

#[derive(Debug, Clone)]
pub struct InventoryLedger {
    threshold: f32,
}

impl InventoryLedger {
    /// `threshold` is the fill ratio below which a spool is low.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_low(&self, spool: &Spool) -> bool {
        spool.fill_ratio() < self.threshold
    }

    pub fn create_spool<R: Repository + ?Sized>(
        &self,
        repo: &R,
        request: NewSpool,
        at: DateTime<Utc>,
    ) -> EngineResult<Spool> {
        if !request.capacity_grams.is_finite() || request.capacity_grams <= 0.0 {
            return Err(EngineError::invalid_argument(format!(
                "spool capacity must be positive, got {}",
                request.capacity_grams
            )));
        }
        let remaining = request.remaining_grams.unwrap_or(request.capacity_grams);
        if !remaining.is_finite() || remaining < 0.0 || remaining > request.capacity_grams {
            return Err(EngineError::invalid_argument(format!(
                "remaining grams must lie within 0..={}, got {}",
                request.capacity_grams, remaining
            )));
        }
        if request.material_type.trim().is_empty() {
            return Err(EngineError::invalid_argument("material type is required"));
        }

        let spool = Spool {
            id: request.id,
            material_type: request.material_type,
            color: request.color,
            brand: request.brand,
            capacity_grams: request.capacity_grams,
            remaining_grams: remaining,
            active: true,
            created_at: at,
            updated_at: None,
        };
        repo.insert_spool(spool.clone())?;
        info!(
            "Created spool {} ({}, {:.0}/{:.0}g)",
            spool.id, spool.material_type, spool.remaining_grams, spool.capacity_grams
        );
        Ok(spool)
    }

    /// Deduct `grams` from a spool, clamping at zero, and raise alerts.
    pub fn record_usage<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool_id: &SpoolId,
        grams: f32,
        at: DateTime<Utc>,
    ) -> EngineResult<UsageOutcome> {
        if !grams.is_finite() || grams < 0.0 {
            return Err(EngineError::invalid_argument(format!(
                "material usage must be a non-negative number of grams, got {}",
                grams
            )));
        }
        let mut spool = load_spool(repo, spool_id)?;

        let warning = (grams > spool.remaining_grams).then(|| EngineError::InsufficientMaterial {
            spool: spool.id.to_string(),
            requested: grams,
            available: spool.remaining_grams,
        });

        spool.remaining_grams = (spool.remaining_grams - grams).max(0.0);
        spool.updated_at = Some(at);
        repo.save_spool(&spool)?;

        let mut alert = None;
        if let Some(shortfall) = &warning {
            warn!("{}", shortfall);
            alert = self.ensure_alert(
                repo,
                &spool,
                AlertKind::InsufficientMaterial,
                shortfall.to_string(),
                at,
            )?;
        }
        if alert.is_none() {
            alert = self.check_low(repo, &spool, at)?;
        }

        Ok(UsageOutcome {
            spool,
            alert,
            warning,
        })
    }

    /// Raise an insufficient-material alert when the spool holds less than
    /// `required_grams`. Never blocks the caller.
    pub fn ensure_sufficient<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool_id: &SpoolId,
        required_grams: f32,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<InventoryAlert>> {
        let spool = load_spool(repo, spool_id)?;
        if required_grams <= spool.remaining_grams {
            return Ok(None);
        }
        let shortfall = EngineError::InsufficientMaterial {
            spool: spool.id.to_string(),
            requested: required_grams,
            available: spool.remaining_grams,
        };
        warn!("{}", shortfall);
        self.ensure_alert(
            repo,
            &spool,
            AlertKind::InsufficientMaterial,
            shortfall.to_string(),
            at,
        )
    }

    /// Sweep active spools, raise missing low-inventory alerts and return
    /// every open alert.
    pub fn evaluate_alerts<R: Repository + ?Sized>(
        &self,
        repo: &R,
        at: DateTime<Utc>,
    ) -> EngineResult<Vec<InventoryAlert>> {
        for spool in repo.spools(false)? {
            self.check_low(repo, &spool, at)?;
        }
        repo.alerts(&AlertFilter::open())
    }

    /// Close an alert. Resolving an already resolved alert is a no-op.
    pub fn resolve_alert<R: Repository + ?Sized>(
        &self,
        repo: &R,
        id: AlertId,
        at: DateTime<Utc>,
    ) -> EngineResult<InventoryAlert> {
        let mut alert = repo
            .alert(id)?
            .ok_or_else(|| EngineError::not_found(Entity::Alert, id))?;
        if alert.resolved {
            return Ok(alert);
        }
        alert.resolved = true;
        alert.resolved_at = Some(at);
        repo.save_alert(&alert)?;
        info!("Resolved alert {} for spool {}", alert.id, alert.spool_id);
        Ok(alert)
    }

    /// Swap in a fresh full spool under the same id and resolve its open
    /// alerts.
    pub fn replace_spool<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool_id: &SpoolId,
        at: DateTime<Utc>,
    ) -> EngineResult<(Spool, Vec<InventoryAlert>)> {
        let mut spool = load_spool(repo, spool_id)?;
        spool.remaining_grams = spool.capacity_grams;
        spool.active = true;
        spool.updated_at = Some(at);
        repo.save_spool(&spool)?;

        let mut resolved = Vec::new();
        for alert in repo.alerts(&AlertFilter::open_for(spool_id.clone()))? {
            resolved.push(self.resolve_alert(repo, alert.id, at)?);
        }
        info!(
            "Replaced spool {} ({} alert(s) resolved)",
            spool.id,
            resolved.len()
        );
        Ok((spool, resolved))
    }

    /// Add grams, up to capacity. Open alerts stay open.
    pub fn restock_spool<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool_id: &SpoolId,
        grams: f32,
        at: DateTime<Utc>,
    ) -> EngineResult<Spool> {
        if !grams.is_finite() || grams <= 0.0 {
            return Err(EngineError::invalid_argument(format!(
                "restock amount must be positive, got {}",
                grams
            )));
        }
        let mut spool = load_spool(repo, spool_id)?;
        spool.remaining_grams = (spool.remaining_grams + grams).min(spool.capacity_grams);
        spool.updated_at = Some(at);
        repo.save_spool(&spool)?;
        info!("Restocked spool {} to {:.0}g", spool.id, spool.remaining_grams);
        Ok(spool)
    }

    pub fn deactivate_spool<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool_id: &SpoolId,
        at: DateTime<Utc>,
    ) -> EngineResult<Spool> {
        self.set_active(repo, spool_id, false, at)
    }

    pub fn activate_spool<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool_id: &SpoolId,
        at: DateTime<Utc>,
    ) -> EngineResult<Spool> {
        self.set_active(repo, spool_id, true, at)
    }

    fn set_active<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool_id: &SpoolId,
        active: bool,
        at: DateTime<Utc>,
    ) -> EngineResult<Spool> {
        let mut spool = load_spool(repo, spool_id)?;
        if spool.active != active {
            spool.active = active;
            spool.updated_at = Some(at);
            repo.save_spool(&spool)?;
            info!(
                "Spool {} {}",
                spool.id,
                if active { "activated" } else { "deactivated" }
            );
        }
        Ok(spool)
    }

    fn check_low<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool: &Spool,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<InventoryAlert>> {
        if !self.is_low(spool) {
            return Ok(None);
        }
        let message = format!(
            "Spool {} ({}) is at {:.0}% ({:.0}g of {:.0}g)",
            spool.id,
            spool.material_type,
            spool.fill_ratio() * 100.0,
            spool.remaining_grams,
            spool.capacity_grams
        );
        self.ensure_alert(repo, spool, AlertKind::LowInventory, message, at)
    }

    /// Create an alert unless the spool already has an open one.
    fn ensure_alert<R: Repository + ?Sized>(
        &self,
        repo: &R,
        spool: &Spool,
        kind: AlertKind,
        message: String,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<InventoryAlert>> {
        if !repo.alerts(&AlertFilter::open_for(spool.id.clone()))?.is_empty() {
            return Ok(None);
        }
        let alert = repo.insert_alert(
            NewAlert {
                spool_id: spool.id.clone(),
                kind,
                threshold: self.threshold,
                fill_ratio: spool.fill_ratio(),
                message,
            },
            at,
        )?;
        warn!("Inventory alert {} ({}): {}", alert.id, alert.kind, alert.message);
        Ok(Some(alert))
    }
}

fn load_spool<R: Repository + ?Sized>(repo: &R, id: &SpoolId) -> EngineResult<Spool> {
    repo.spool(id)?
        .ok_or_else(|| EngineError::not_found(Entity::Spool, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use proptest::prelude::*;

    fn setup(remaining: f32) -> (InMemoryRepository, InventoryLedger, SpoolId) {
        let repo = InMemoryRepository::new();
        let ledger = InventoryLedger::new(0.15);
        let id = SpoolId::from("SPOOL_1");
        ledger
            .create_spool(
                &repo,
                NewSpool::new(id.clone(), "PLA", 1000.0).with_remaining(remaining),
                Utc::now(),
            )
            .unwrap();
        (repo, ledger, id)
    }

    fn open_alerts(repo: &InMemoryRepository, id: &SpoolId) -> Vec<InventoryAlert> {
        repo.alerts(&AlertFilter::open_for(id.clone())).unwrap()
    }

    #[test]
    fn usage_crossing_threshold_raises_one_alert() {
        let (repo, ledger, id) = setup(200.0);
        let outcome = ledger.record_usage(&repo, &id, 80.0, Utc::now()).unwrap();
        assert_eq!(outcome.spool.remaining_grams, 120.0);
        assert!((outcome.spool.fill_ratio() - 0.12).abs() < 1e-6);
        assert!(outcome.warning.is_none());
        let alert = outcome.alert.unwrap();
        assert_eq!(alert.kind, AlertKind::LowInventory);
        assert_eq!(alert.threshold, 0.15);

        let again = ledger.record_usage(&repo, &id, 10.0, Utc::now()).unwrap();
        assert!(again.alert.is_none());
        assert_eq!(open_alerts(&repo, &id).len(), 1);
    }

    #[test]
    fn threshold_is_strict() {
        let (repo, ledger, id) = setup(200.0);
        let outcome = ledger.record_usage(&repo, &id, 50.0, Utc::now()).unwrap();
        assert_eq!(outcome.spool.remaining_grams, 150.0);
        assert!(outcome.alert.is_none());
    }

    #[test]
    fn overdraw_clamps_and_warns() {
        let (repo, ledger, id) = setup(30.0);
        let outcome = ledger.record_usage(&repo, &id, 50.0, Utc::now()).unwrap();
        assert_eq!(outcome.spool.remaining_grams, 0.0);
        assert_eq!(
            outcome.warning,
            Some(EngineError::InsufficientMaterial {
                spool: "SPOOL_1".to_string(),
                requested: 50.0,
                available: 30.0,
            })
        );
        assert_eq!(outcome.alert.unwrap().kind, AlertKind::InsufficientMaterial);
        assert_eq!(open_alerts(&repo, &id).len(), 1);
    }

    #[test]
    fn rejects_invalid_usage() {
        let (repo, ledger, id) = setup(500.0);
        for bad in [-1.0, f32::NAN, f32::INFINITY] {
            let err = ledger.record_usage(&repo, &id, bad, Utc::now()).unwrap_err();
            assert!(matches!(err, EngineError::InvalidArgument(_)));
        }
        let err = ledger
            .record_usage(&repo, &SpoolId::from("nope"), 1.0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: Entity::Spool, .. }));
    }

    #[test]
    fn restock_and_deactivate_keep_alerts_open() {
        let (repo, ledger, id) = setup(100.0);
        ledger.record_usage(&repo, &id, 1.0, Utc::now()).unwrap();
        assert_eq!(open_alerts(&repo, &id).len(), 1);

        let spool = ledger.restock_spool(&repo, &id, 5000.0, Utc::now()).unwrap();
        assert_eq!(spool.remaining_grams, 1000.0);
        ledger.deactivate_spool(&repo, &id, Utc::now()).unwrap();
        assert_eq!(open_alerts(&repo, &id).len(), 1);
        assert!(repo.spools(false).unwrap().is_empty());
    }

    #[test]
    fn replace_resolves_open_alerts() {
        let (repo, ledger, id) = setup(100.0);
        ledger.record_usage(&repo, &id, 1.0, Utc::now()).unwrap();
        let (spool, resolved) = ledger.replace_spool(&repo, &id, Utc::now()).unwrap();
        assert_eq!(spool.remaining_grams, spool.capacity_grams);
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].resolved_at.is_some());
        assert!(open_alerts(&repo, &id).is_empty());
    }

    #[test]
    fn resolve_is_idempotent_and_checks_existence() {
        let (repo, ledger, id) = setup(100.0);
        let alert = ledger
            .record_usage(&repo, &id, 1.0, Utc::now())
            .unwrap()
            .alert
            .unwrap();
        let first = ledger.resolve_alert(&repo, alert.id, Utc::now()).unwrap();
        let second = ledger.resolve_alert(&repo, alert.id, Utc::now()).unwrap();
        assert_eq!(first, second);

        let err = ledger.resolve_alert(&repo, AlertId(99), Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: Entity::Alert, .. }));
    }

    #[test]
    fn evaluate_sweeps_active_spools() {
        let repo = InMemoryRepository::new();
        let ledger = InventoryLedger::new(0.15);
        for (id, remaining) in [("A", 50.0), ("B", 900.0), ("C", 10.0)] {
            ledger
                .create_spool(
                    &repo,
                    NewSpool::new(SpoolId::from(id), "PETG", 1000.0).with_remaining(remaining),
                    Utc::now(),
                )
                .unwrap();
        }
        ledger
            .deactivate_spool(&repo, &SpoolId::from("C"), Utc::now())
            .unwrap();

        let open = ledger.evaluate_alerts(&repo, Utc::now()).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].spool_id, SpoolId::from("A"));
        // A second sweep does not duplicate.
        assert_eq!(ledger.evaluate_alerts(&repo, Utc::now()).unwrap().len(), 1);
    }

    #[test]
    fn create_spool_validates_amounts() {
        let repo = InMemoryRepository::new();
        let ledger = InventoryLedger::new(0.15);
        let bad = [
            NewSpool::new(SpoolId::from("X"), "PLA", 0.0),
            NewSpool::new(SpoolId::from("X"), "PLA", 100.0).with_remaining(150.0),
            NewSpool::new(SpoolId::from("X"), "PLA", 100.0).with_remaining(-1.0),
            NewSpool::new(SpoolId::from("X"), " ", 100.0),
        ];
        for request in bad {
            assert!(ledger.create_spool(&repo, request, Utc::now()).is_err());
        }
        let spool = ledger
            .create_spool(&repo, NewSpool::new(SpoolId::from("X"), "PLA", 100.0), Utc::now())
            .unwrap();
        assert_eq!(spool.remaining_grams, 100.0);
        let dup = ledger.create_spool(
            &repo,
            NewSpool::new(SpoolId::from("X"), "PLA", 100.0),
            Utc::now(),
        );
        assert!(matches!(dup, Err(EngineError::Conflict(_))));
    }

    #[test]
    fn ensure_sufficient_alerts_on_shortfall() {
        let (repo, ledger, id) = setup(500.0);
        assert!(ledger.ensure_sufficient(&repo, &id, 400.0, Utc::now()).unwrap().is_none());
        let alert = ledger.ensure_sufficient(&repo, &id, 600.0, Utc::now()).unwrap().unwrap();
        assert_eq!(alert.kind, AlertKind::InsufficientMaterial);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Use(f32),
        Restock(f32),
        Replace,
        ResolveAll,
        Evaluate,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0.0f32..400.0).prop_map(Op::Use),
            1 => (1.0f32..400.0).prop_map(Op::Restock),
            1 => Just(Op::Replace),
            1 => Just(Op::ResolveAll),
            1 => Just(Op::Evaluate),
        ]
    }

    proptest! {
        #[test]
        fn remaining_stays_within_capacity(usages in prop::collection::vec(0.0f32..2000.0, 1..40)) {
            let (repo, ledger, id) = setup(1000.0);
            for grams in usages {
                let outcome = ledger.record_usage(&repo, &id, grams, Utc::now()).unwrap();
                prop_assert!(outcome.spool.remaining_grams >= 0.0);
                prop_assert!(outcome.spool.remaining_grams <= outcome.spool.capacity_grams);
            }
        }

        #[test]
        fn at_most_one_open_alert_per_spool(ops in prop::collection::vec(op(), 1..50)) {
            let (repo, ledger, id) = setup(1000.0);
            for op in ops {
                match op {
                    Op::Use(g) => { ledger.record_usage(&repo, &id, g, Utc::now()).unwrap(); }
                    Op::Restock(g) => { ledger.restock_spool(&repo, &id, g, Utc::now()).unwrap(); }
                    Op::Replace => { ledger.replace_spool(&repo, &id, Utc::now()).unwrap(); }
                    Op::ResolveAll => {
                        for alert in open_alerts(&repo, &id) {
                            ledger.resolve_alert(&repo, alert.id, Utc::now()).unwrap();
                        }
                    }
                    Op::Evaluate => { ledger.evaluate_alerts(&repo, Utc::now()).unwrap(); }
                }
                prop_assert!(open_alerts(&repo, &id).len() <= 1);
            }
        }
    }
}
