//! `fleetlink-batch` — batch orchestration over the engine and store.
//!
//! A run enumerates its subjects, fans them out over a bounded worker
//! pool, and writes one run row with final stats. Each worker opens its
//! own store connection; results funnel back over a channel so only the
//! coordinator touches the run row.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fleetlink_engine::blend::quality_tier;
use fleetlink_engine::model::CorrelationKind;
use fleetlink_engine::{correlate_delivery, resolve_driver, EngineConfig};
use fleetlink_store::{NewCorrelation, RunStats, RunStatus, Store, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum BatchError {
    Store(StoreError),
    /// The run could not even start (bad scope, no subjects to enumerate).
    Setup(String),
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Setup(msg) => write!(f, "run setup failed: {msg}"),
        }
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Setup(_) => None,
        }
    }
}

impl From<StoreError> for BatchError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Run description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Driver,
    Delivery,
    Full,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Driver => write!(f, "driver"),
            Self::Delivery => write!(f, "delivery"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// What slice of the fleet a run covers. Empty scope means everything.
/// The time bounds apply to event time for driver runs and trip end for
/// delivery runs.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RunScope {
    pub vehicle_id: Option<String>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub kind: RunKind,
    pub scope: RunScope,
    pub workers: usize,
    /// Delivery correlations below this floor are not persisted.
    /// Driver attributions always persist, unresolved ones included.
    pub min_confidence: f64,
    /// Drop unverified rows in scope before re-analysis.
    pub clear_existing: bool,
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            kind: RunKind::Full,
            scope: RunScope::default(),
            workers: 4,
            min_confidence: 0.0,
            clear_existing: false,
            timeout: None,
        }
    }
}

/// Cooperative cancellation handle. Cancelling stops new subjects from
/// being picked up; in-flight subjects finish and their writes stand.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub stats: RunStats,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Per-subject work
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subject {
    Event,
    Trip,
}

#[derive(Debug, Default)]
struct SubjectResult {
    matched: bool,
    failed: bool,
    records: u64,
    confidence_sum: f64,
    high_confidence: u64,
    needs_review: u64,
}

fn process_subject(
    store: &mut Store,
    config: &EngineConfig,
    run_id: &str,
    subject: Subject,
    id: &str,
    min_confidence: f64,
) -> Result<SubjectResult, StoreError> {
    let mut result = SubjectResult::default();
    match subject {
        Subject::Event => {
            let event = store.get_event(id)?;
            let candidates =
                store.driver_candidates(&event, config.windows.event_minutes)?;
            let attribution = resolve_driver(&event, &candidates, config);
            let tier = quality_tier(attribution.confidence, &config.tiers);
            let new = NewCorrelation::from_attribution(
                &attribution,
                tier,
                config.review.min_confidence,
                Some(run_id),
            );
            store.upsert_correlation(&new)?;
            result.matched = attribution.is_resolved();
            result.records = 1;
            result.confidence_sum = attribution.confidence;
            if attribution.confidence >= config.tiers.excellent {
                result.high_confidence = 1;
            }
            if new.requires_review {
                result.needs_review = 1;
            }
        }
        Subject::Trip => {
            let trip = store.get_trip(id)?;
            let vehicle = store.get_vehicle(&trip.vehicle_id)?;
            let near = trip
                .end_coordinate
                .map(|c| (c, config.windows.delivery_radius_km));
            let deliveries = store.deliveries_in_window(
                trip.ended_at.date_naive(),
                config.windows.delivery_days,
                near,
            )?;
            for delivery in &deliveries {
                let Some(correlation) = correlate_delivery(&trip, &vehicle, delivery, config)
                else {
                    continue;
                };
                if correlation.confidence < min_confidence {
                    continue;
                }
                let new = NewCorrelation::from_correlation(&correlation, Some(run_id));
                store.upsert_correlation(&new)?;
                result.matched = true;
                result.records += 1;
                result.confidence_sum += correlation.confidence;
                if correlation.confidence >= config.tiers.excellent {
                    result.high_confidence += 1;
                }
                if correlation.requires_review {
                    result.needs_review += 1;
                }
            }
        }
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// The run itself
// ---------------------------------------------------------------------------

/// Execute one analysis run to completion (or failure) and return its
/// outcome. The run row in the store carries the same information.
pub fn start_run(
    db_path: &Path,
    config: &EngineConfig,
    options: &RunOptions,
    cancel: &CancelFlag,
) -> Result<RunOutcome, BatchError> {
    let started = Instant::now();
    let mut store = Store::open(db_path)?;
    let scope_json = serde_json::to_string(&options.scope)
        .map_err(|e| BatchError::Setup(e.to_string()))?;
    let run_id = store.create_run(&options.kind.to_string(), &scope_json)?;

    let vehicle = options.scope.vehicle_id.as_deref();
    let (from, to) = (options.scope.from, options.scope.to);
    let scoped = vehicle.is_some() || from.is_some() || to.is_some();
    let mut jobs: Vec<(Subject, String)> = Vec::new();
    if matches!(options.kind, RunKind::Driver | RunKind::Full) {
        for event in store.events_for_scope(vehicle, from, to)? {
            jobs.push((Subject::Event, event.id));
        }
    }
    if matches!(options.kind, RunKind::Delivery | RunKind::Full) {
        for trip in store.trips_for_scope(vehicle, from, to)? {
            jobs.push((Subject::Trip, trip.id));
        }
    }

    if options.clear_existing {
        if matches!(options.kind, RunKind::Driver | RunKind::Full) {
            let subjects: Vec<String> = jobs
                .iter()
                .filter(|(s, _)| *s == Subject::Event)
                .map(|(_, id)| id.clone())
                .collect();
            store.clear_unverified(
                CorrelationKind::Driver,
                scoped.then_some(subjects.as_slice()),
            )?;
        }
        if matches!(options.kind, RunKind::Delivery | RunKind::Full) {
            let subjects: Vec<String> = jobs
                .iter()
                .filter(|(s, _)| *s == Subject::Trip)
                .map(|(_, id)| id.clone())
                .collect();
            store.clear_unverified(
                CorrelationKind::Delivery,
                scoped.then_some(subjects.as_slice()),
            )?;
        }
    }

    store.set_run_running(&run_id)?;

    let total = jobs.len();
    let workers = options.workers.clamp(1, total.max(1));
    let deadline = options.timeout.map(|t| started + t);

    let (job_tx, job_rx) = mpsc::channel::<(Subject, String)>();
    let (result_tx, result_rx) = mpsc::channel::<(String, Result<SubjectResult, String>)>();
    for job in jobs {
        // Unbounded channel; the whole queue fits before workers start.
        let _ = job_tx.send(job);
    }
    drop(job_tx);
    let job_rx = Arc::new(Mutex::new(job_rx));

    let mut stats = RunStats::default();
    let mut records_total: u64 = 0;
    let mut timed_out = false;

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let run_id = run_id.clone();
            let db_path: PathBuf = db_path.to_path_buf();
            let min_confidence = options.min_confidence;
            scope.spawn(move || {
                let mut store = match Store::open(&db_path) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        eprintln!("worker: cannot open store: {e}");
                        None
                    }
                };
                loop {
                    let job = {
                        let rx = match job_rx.lock() {
                            Ok(rx) => rx,
                            Err(_) => return,
                        };
                        rx.recv()
                    };
                    let Ok((subject, id)) = job else { return };
                    if cancel.is_cancelled() {
                        continue; // drain without processing
                    }
                    // A worker without a connection fails its share of the
                    // queue instead of abandoning it.
                    let outcome = match store.as_mut() {
                        Some(store) => process_subject(
                            store,
                            config,
                            &run_id,
                            subject,
                            &id,
                            min_confidence,
                        )
                        .map_err(|e| e.to_string()),
                        None => Err("store unavailable".to_string()),
                    };
                    if result_tx.send((id, outcome)).is_err() {
                        return;
                    }
                }
            });
        }
        drop(result_tx);

        let mut received = 0usize;
        while received < total {
            let next = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        timed_out = true;
                        cancel.cancel();
                        break;
                    }
                    match result_rx.recv_timeout(d - now) {
                        Ok(r) => r,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            timed_out = true;
                            cancel.cancel();
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match result_rx.recv() {
                    Ok(r) => r,
                    Err(_) => break,
                },
            };
            received += 1;
            let (subject_id, outcome) = next;
            match outcome {
                Ok(r) => {
                    stats.processed += 1;
                    if r.matched {
                        stats.matched += 1;
                    }
                    records_total += r.records;
                    stats.high_confidence += r.high_confidence;
                    stats.needs_review += r.needs_review;
                    stats.avg_confidence += r.confidence_sum;
                }
                Err(e) => {
                    // One bad subject never sinks the run.
                    eprintln!("run {run_id}: subject {subject_id}: {e}");
                    stats.processed += 1;
                    stats.failed += 1;
                }
            }
        }
        // Workers drain the remaining queue (skipping under cancellation)
        // and exit when it empties; scope joins them here.
    });

    if records_total > 0 {
        stats.avg_confidence /= records_total as f64;
    }

    let elapsed = started.elapsed();
    let status = if timed_out {
        store.fail_run(
            &run_id,
            &format!("timed out after {:.1}s", elapsed.as_secs_f64()),
            &stats,
        )?;
        RunStatus::Failed
    } else if cancel.is_cancelled() {
        store.fail_run(&run_id, "cancelled", &stats)?;
        RunStatus::Failed
    } else {
        store.complete_run(&run_id, &stats)?;
        RunStatus::Completed
    };

    Ok(RunOutcome { run_id, status, stats, elapsed })
}
