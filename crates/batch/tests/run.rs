//! End-to-end batch runs against a real on-disk store.

use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};
use tempfile::TempDir;

use fleetlink_batch::{start_run, CancelFlag, RunKind, RunOptions, RunScope};
use fleetlink_engine::model::{
    Coordinate, CorrelationKind, DeliveryRecord, Driver, DriverAlias, QualityTier, TelemetryEvent,
    Trip, Vehicle, VehicleAssignment,
};
use fleetlink_engine::{EngineConfig, MatchMethod};
use fleetlink_store::{CorrelationFilter, RunStatus, Store};

struct Fixture {
    _dir: TempDir,
    path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.db");
        Store::open(&path).unwrap();
        Self { _dir: dir, path }
    }

    fn store(&self) -> Store {
        Store::open(&self.path).unwrap()
    }
}

fn at(h: u32, m: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
}

fn seed_fleet(store: &Store) {
    store
        .upsert_vehicle(&Vehicle {
            id: "veh_1".into(),
            registration: "KX71 WDF".into(),
            fleet: "south".into(),
        })
        .unwrap();
    store
        .upsert_driver(&Driver {
            id: "drv_1".into(),
            name: "Priya Patel".into(),
            aliases: vec![DriverAlias { source: "telematics".into(), alias: "p.patel".into() }],
        })
        .unwrap();
    store
        .upsert_driver(&Driver { id: "drv_2".into(), name: "Jon Smith".into(), aliases: vec![] })
        .unwrap();
}

fn event(id: &str, t: chrono::DateTime<Utc>, driver_ref: Option<&str>) -> TelemetryEvent {
    TelemetryEvent {
        id: id.into(),
        vehicle_id: "veh_1".into(),
        occurred_at: t,
        coordinate: None,
        driver_ref: driver_ref.map(String::from),
        source: "telematics".into(),
    }
}

fn driver_run() -> RunOptions {
    RunOptions { kind: RunKind::Driver, workers: 2, ..Default::default() }
}

#[test]
fn driver_run_attributes_through_the_cascade() {
    let fx = Fixture::new();
    let store = fx.store();
    seed_fleet(&store);

    // evt_a: covered by an assignment at confidence 0.85.
    // evt_b: no assignment, but a reading 25 min later names Jon Smith.
    // evt_c: lone event on another vehicle; must still land as a
    // confidence-0 record.
    store
        .upsert_assignment(&VehicleAssignment {
            id: "asg_1".into(),
            vehicle_id: "veh_1".into(),
            driver_id: "drv_1".into(),
            valid_from: at(8, 0),
            valid_until: Some(at(11, 0)),
            kind: "roster".into(),
            confidence: Some(0.85),
        })
        .unwrap();
    store.upsert_event(&event("evt_a", at(9, 0), None)).unwrap();
    store.upsert_event(&event("evt_b", at(14, 0), None)).unwrap();
    store.upsert_event(&event("evt_b2", at(14, 25), Some("Jon Smith"))).unwrap();
    let mut lone = event("evt_c", at(3, 0), None);
    lone.vehicle_id = "veh_2".into();
    store.upsert_event(&lone).unwrap();
    drop(store);

    let outcome =
        start_run(&fx.path, &EngineConfig::default(), &driver_run(), &CancelFlag::new()).unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.stats.processed, 4);
    assert_eq!(outcome.stats.failed, 0);

    let store = fx.store();
    let a = &store.correlations_for_subject(CorrelationKind::Driver, "evt_a").unwrap()[0];
    assert_eq!(a.matched_entity_id.as_deref(), Some("drv_1"));
    assert_eq!(a.confidence, 85.0);
    assert_eq!(a.methods, vec![MatchMethod::VehicleAssignment]);

    let b = &store.correlations_for_subject(CorrelationKind::Driver, "evt_b").unwrap()[0];
    assert_eq!(b.matched_entity_id.as_deref(), Some("drv_2"));
    assert_eq!(b.confidence, 80.0);
    assert_eq!(b.methods, vec![MatchMethod::TimeWindowTight]);

    let c = &store.correlations_for_subject(CorrelationKind::Driver, "evt_c").unwrap()[0];
    assert!(c.matched_entity_id.is_none());
    assert_eq!(c.confidence, 0.0);
    assert!(c.requires_review);
    assert_eq!(c.run_id.as_deref(), Some(outcome.run_id.as_str()));
}

#[test]
fn rerun_is_idempotent_and_respects_verification() {
    let fx = Fixture::new();
    let store = fx.store();
    seed_fleet(&store);
    store
        .upsert_assignment(&VehicleAssignment {
            id: "asg_1".into(),
            vehicle_id: "veh_1".into(),
            driver_id: "drv_1".into(),
            valid_from: at(8, 0),
            valid_until: None,
            kind: "roster".into(),
            confidence: None,
        })
        .unwrap();
    store.upsert_event(&event("evt_a", at(9, 0), None)).unwrap();
    drop(store);

    let config = EngineConfig::default();
    start_run(&fx.path, &config, &driver_run(), &CancelFlag::new()).unwrap();
    start_run(&fx.path, &config, &driver_run(), &CancelFlag::new()).unwrap();

    let mut store = fx.store();
    let rows = store.list_correlations(&CorrelationFilter::default()).unwrap();
    assert_eq!(rows.len(), 1, "re-running must update, not duplicate");

    // A human signs the attribution off. The source data then shifts so a
    // re-run would compute something else; the verified row must not move.
    let id = rows[0].id.clone();
    assert_eq!(rows[0].matched_entity_id.as_deref(), Some("drv_1"));
    store.verify_correlation(&id, "ops@example.com", true).unwrap();
    store
        .upsert_assignment(&VehicleAssignment {
            id: "asg_1".into(),
            vehicle_id: "veh_1".into(),
            driver_id: "drv_2".into(),
            valid_from: at(8, 0),
            valid_until: None,
            kind: "roster".into(),
            confidence: None,
        })
        .unwrap();
    drop(store);

    start_run(&fx.path, &config, &driver_run(), &CancelFlag::new()).unwrap();
    let store = fx.store();
    let row = store.get_correlation(&id).unwrap();
    assert!(row.verified);
    assert_eq!(row.matched_entity_id.as_deref(), Some("drv_1"));
    assert_eq!(row.verified_by.as_deref(), Some("ops@example.com"));
}

#[test]
fn rerun_reproduces_identical_record_fields() {
    let fx = Fixture::new();
    let store = fx.store();
    seed_fleet(&store);
    store
        .upsert_assignment(&VehicleAssignment {
            id: "asg_1".into(),
            vehicle_id: "veh_1".into(),
            driver_id: "drv_1".into(),
            valid_from: at(8, 0),
            valid_until: None,
            kind: "roster".into(),
            confidence: Some(0.85),
        })
        .unwrap();
    store.upsert_event(&event("evt_a", at(9, 0), None)).unwrap();
    drop(store);

    let config = EngineConfig::default();
    let first = start_run(&fx.path, &config, &driver_run(), &CancelFlag::new()).unwrap();
    let before = fx.store().correlations_for_subject(CorrelationKind::Driver, "evt_a").unwrap();
    let second = start_run(&fx.path, &config, &driver_run(), &CancelFlag::new()).unwrap();
    let after = fx.store().correlations_for_subject(CorrelationKind::Driver, "evt_a").unwrap();

    // Everything substantive is reproduced in place; only provenance
    // (run_id, updated_at) tracks the rerun.
    let (a, b) = (&before[0], &after[0]);
    assert_eq!(a.id, b.id);
    assert_eq!(a.kind, b.kind);
    assert_eq!(a.matched_entity_id, b.matched_entity_id);
    assert_eq!(a.confidence, b.confidence);
    assert_eq!(a.breakdown, b.breakdown);
    assert_eq!(a.methods, b.methods);
    assert_eq!(a.tier, b.tier);
    assert_eq!(a.requires_review, b.requires_review);
    assert_eq!(a.flags, b.flags);
    assert_eq!(a.verified, b.verified);
    assert_eq!(a.run_id.as_deref(), Some(first.run_id.as_str()));
    assert_eq!(b.run_id.as_deref(), Some(second.run_id.as_str()));
}

#[test]
fn delivery_run_blends_and_gates_on_floor() {
    let fx = Fixture::new();
    let store = fx.store();
    seed_fleet(&store);
    let end = Coordinate { lat: 52.0, lon: 0.0 };
    store
        .upsert_trip(&Trip {
            id: "trip_1".into(),
            vehicle_id: "veh_1".into(),
            started_at: at(12, 0),
            ended_at: at(15, 0),
            end_coordinate: Some(end),
            driver_ref: None,
        })
        .unwrap();
    // Strong pair: same day, ~2.3 km, normalized-exact docket text → 94.
    store
        .upsert_delivery(&DeliveryRecord {
            id: "del_good".into(),
            vehicle_text: Some("kx71-wdf".into()),
            site_name: "Harbour Terminal".into(),
            delivery_date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            coordinate: Some(Coordinate { lat: 52.0207, lon: 0.0 }),
            service_radius_km: Some(5.0),
        })
        .unwrap();
    // Weak pair: 10 days out, ~120 km, alien docket text → well under 50.
    store
        .upsert_delivery(&DeliveryRecord {
            id: "del_weak".into(),
            vehicle_text: Some("something else".into()),
            site_name: "Far Depot".into(),
            delivery_date: NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            coordinate: Some(Coordinate { lat: 53.08, lon: 0.0 }),
            service_radius_km: None,
        })
        .unwrap();
    drop(store);

    let options = RunOptions {
        kind: RunKind::Delivery,
        workers: 2,
        min_confidence: 50.0,
        ..Default::default()
    };
    let outcome =
        start_run(&fx.path, &EngineConfig::default(), &options, &CancelFlag::new()).unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.stats.processed, 1);
    assert_eq!(outcome.stats.high_confidence, 1);

    let store = fx.store();
    let rows = store.correlations_for_subject(CorrelationKind::Delivery, "trip_1").unwrap();
    assert_eq!(rows.len(), 1, "below-floor pair must not persist");
    assert_eq!(rows[0].matched_entity_id.as_deref(), Some("del_good"));
    assert!((rows[0].confidence - 94.0).abs() < 1e-9);
    assert_eq!(rows[0].tier, QualityTier::Excellent);
}

#[test]
fn bad_subject_is_counted_failed_without_sinking_the_run() {
    let fx = Fixture::new();
    let store = fx.store();
    seed_fleet(&store);
    // trip_ok correlates normally; trip_bad references a vehicle no
    // source ever delivered, so its subject fails at lookup time.
    store
        .upsert_trip(&Trip {
            id: "trip_ok".into(),
            vehicle_id: "veh_1".into(),
            started_at: at(12, 0),
            ended_at: at(15, 0),
            end_coordinate: None,
            driver_ref: None,
        })
        .unwrap();
    store
        .upsert_trip(&Trip {
            id: "trip_bad".into(),
            vehicle_id: "veh_ghost".into(),
            started_at: at(12, 0),
            ended_at: at(15, 0),
            end_coordinate: None,
            driver_ref: None,
        })
        .unwrap();
    store
        .upsert_delivery(&DeliveryRecord {
            id: "del_1".into(),
            vehicle_text: Some("KX71 WDF".into()),
            site_name: "Harbour Terminal".into(),
            delivery_date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            coordinate: None,
            service_radius_km: None,
        })
        .unwrap();
    drop(store);

    let options = RunOptions { kind: RunKind::Delivery, workers: 2, ..Default::default() };
    let outcome =
        start_run(&fx.path, &EngineConfig::default(), &options, &CancelFlag::new()).unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.stats.processed, 2);
    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.stats.matched, 1);

    let store = fx.store();
    assert_eq!(store.correlations_for_subject(CorrelationKind::Delivery, "trip_ok").unwrap().len(), 1);
    assert!(store.correlations_for_subject(CorrelationKind::Delivery, "trip_bad").unwrap().is_empty());
}

#[test]
fn orphan_report_counts_unattributed_events_per_vehicle() {
    let fx = Fixture::new();
    let store = fx.store();
    seed_fleet(&store);
    // Three events on veh_1, none attributable.
    store.upsert_event(&event("evt_1", at(8, 0), None)).unwrap();
    store.upsert_event(&event("evt_2", at(12, 0), None)).unwrap();
    store.upsert_event(&event("evt_3", at(17, 0), None)).unwrap();
    drop(store);

    start_run(&fx.path, &EngineConfig::default(), &driver_run(), &CancelFlag::new()).unwrap();

    let store = fx.store();
    let report = store.orphan_report().unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].vehicle_id, "veh_1");
    assert_eq!(report[0].event_count, 3);
    assert_eq!(report[0].first_seen, at(8, 0));
    assert_eq!(report[0].last_seen, at(17, 0));
}

#[test]
fn scoped_run_only_touches_its_vehicle() {
    let fx = Fixture::new();
    let store = fx.store();
    seed_fleet(&store);
    store
        .upsert_vehicle(&Vehicle {
            id: "veh_2".into(),
            registration: "LM22 XYZ".into(),
            fleet: "north".into(),
        })
        .unwrap();
    store.upsert_event(&event("evt_1", at(9, 0), None)).unwrap();
    let mut other = event("evt_other", at(9, 0), None);
    other.vehicle_id = "veh_2".into();
    store.upsert_event(&other).unwrap();
    drop(store);

    let options = RunOptions {
        kind: RunKind::Driver,
        scope: RunScope { vehicle_id: Some("veh_1".into()), ..Default::default() },
        workers: 1,
        ..Default::default()
    };
    let outcome =
        start_run(&fx.path, &EngineConfig::default(), &options, &CancelFlag::new()).unwrap();
    assert_eq!(outcome.stats.processed, 1);

    let store = fx.store();
    assert!(store
        .correlations_for_subject(CorrelationKind::Driver, "evt_other")
        .unwrap()
        .is_empty());
}

#[test]
fn pre_cancelled_run_processes_nothing_and_fails() {
    let fx = Fixture::new();
    let store = fx.store();
    seed_fleet(&store);
    store.upsert_event(&event("evt_1", at(9, 0), None)).unwrap();
    drop(store);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let outcome =
        start_run(&fx.path, &EngineConfig::default(), &driver_run(), &cancel).unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.stats.processed, 0);

    let store = fx.store();
    let run = store.get_run(&outcome.run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("cancelled"));
    assert!(store
        .correlations_for_subject(CorrelationKind::Driver, "evt_1")
        .unwrap()
        .is_empty());
}
