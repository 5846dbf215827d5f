// fleetlink CLI - batch correlation runs, queries, and review tooling

mod exit_codes;
mod import;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use fleetlink_batch::{start_run, CancelFlag, RunKind, RunOptions, RunScope};
use fleetlink_engine::audit::{explain_delivery, explain_driver};
use fleetlink_engine::model::CorrelationKind;
use fleetlink_engine::{EngineConfig, QualityTier};
use fleetlink_store::{CorrelationFilter, RunStatus, Store};

use exit_codes::{
    store_exit_code, EXIT_CONFIG_INVALID, EXIT_IMPORT_PARSE, EXIT_RUN_FAILED, EXIT_RUN_SETUP,
    EXIT_SUCCESS, EXIT_USAGE,
};
use import::ImportKind;

#[derive(Parser)]
#[command(name = "fleetlink")]
#[command(about = "Fleet entity correlation: driver attribution and trip-delivery matching")]
#[command(version)]
struct Cli {
    /// Path to the fleet database
    #[arg(long, global = true, env = "FLEETLINK_DB", default_value = "fleet.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunKindArg {
    Driver,
    Delivery,
    Full,
}

impl From<RunKindArg> for RunKind {
    fn from(k: RunKindArg) -> Self {
        match k {
            RunKindArg::Driver => RunKind::Driver,
            RunKindArg::Delivery => RunKind::Delivery,
            RunKindArg::Full => RunKind::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Driver,
    Delivery,
}

impl From<KindArg> for CorrelationKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Driver => CorrelationKind::Driver,
            KindArg::Delivery => CorrelationKind::Delivery,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run batch analysis over the stored fleet data
    #[command(after_help = "\
Examples:
  fleetlink run --kind driver
  fleetlink run --kind delivery --min-confidence 50 --clear
  fleetlink run --kind full --vehicle veh_1 --workers 8 --timeout-secs 300")]
    Run {
        #[arg(long, value_enum, default_value = "full")]
        kind: RunKindArg,

        /// Restrict the run to one vehicle
        #[arg(long)]
        vehicle: Option<String>,

        /// Only subjects at or after this instant (RFC 3339)
        #[arg(long)]
        from: Option<String>,

        /// Only subjects at or before this instant (RFC 3339)
        #[arg(long)]
        to: Option<String>,

        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Delivery correlations below this confidence are not persisted
        #[arg(long, default_value_t = 0.0)]
        min_confidence: f64,

        /// Drop unverified results in scope before re-analysis
        #[arg(long)]
        clear: bool,

        /// Fail the run if it exceeds this wall-clock budget
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Engine config TOML (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output JSON to stdout instead of human summary
        #[arg(long)]
        json: bool,
    },

    /// List recent analysis runs, or show one
    Runs {
        /// Show this run only
        id: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Query correlation results
    #[command(after_help = "\
Examples:
  fleetlink query --kind delivery --tier excellent
  fleetlink query --review --max-confidence 60
  fleetlink query --subject evt_123 --json")]
    Query {
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        #[arg(long)]
        subject: Option<String>,

        /// Matched entity (driver or delivery id)
        #[arg(long)]
        entity: Option<String>,

        /// excellent | good | fair | poor
        #[arg(long)]
        tier: Option<String>,

        /// Only results flagged for manual review
        #[arg(long)]
        review: bool,

        /// Only verified results
        #[arg(long)]
        verified: bool,

        #[arg(long)]
        min_confidence: Option<f64>,

        #[arg(long)]
        max_confidence: Option<f64>,

        #[arg(long)]
        run: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Mark a correlation verified (or withdraw verification)
    Verify {
        /// Correlation id
        id: String,

        /// Who is signing off
        #[arg(long)]
        by: String,

        /// Withdraw a previous verification instead
        #[arg(long)]
        revoke: bool,
    },

    /// Report vehicles with events no driver could be attributed to
    Orphans {
        #[arg(long)]
        json: bool,
    },

    /// Show every matcher's verdict for one subject
    Explain {
        #[command(subcommand)]
        what: ExplainCommands,
    },

    /// Load a CSV source file into the database
    #[command(after_help = "\
Examples:
  fleetlink import vehicles fleet.csv
  fleetlink import events telematics-march.csv")]
    Import {
        #[arg(value_enum)]
        kind: ImportKind,

        file: PathBuf,
    },

    /// Validate an engine config TOML without running anything
    ValidateConfig { file: PathBuf },
}

#[derive(Subcommand)]
enum ExplainCommands {
    /// Trace driver attribution for one telemetry event
    Event {
        id: String,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Trace trip-delivery correlation for one pair
    Pair {
        trip_id: String,
        delivery_id: String,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            kind,
            vehicle,
            from,
            to,
            workers,
            min_confidence,
            clear,
            timeout_secs,
            config,
            json,
        } => cmd_run(
            &cli.db,
            kind,
            RawScope { vehicle, from, to },
            workers,
            min_confidence,
            clear,
            timeout_secs,
            config,
            json,
        ),
        Commands::Runs { id, limit, json } => cmd_runs(&cli.db, id, limit, json),
        Commands::Query {
            kind,
            subject,
            entity,
            tier,
            review,
            verified,
            min_confidence,
            max_confidence,
            run,
            limit,
            json,
        } => cmd_query(
            &cli.db,
            kind,
            subject,
            entity,
            tier,
            review,
            verified,
            min_confidence,
            max_confidence,
            run,
            limit,
            json,
        ),
        Commands::Verify { id, by, revoke } => cmd_verify(&cli.db, &id, &by, revoke),
        Commands::Orphans { json } => cmd_orphans(&cli.db, json),
        Commands::Explain { what } => match what {
            ExplainCommands::Event { id, config, json } => {
                cmd_explain_event(&cli.db, &id, config, json)
            }
            ExplainCommands::Pair { trip_id, delivery_id, config, json } => {
                cmd_explain_pair(&cli.db, &trip_id, &delivery_id, config, json)
            }
        },
        Commands::Import { kind, file } => cmd_import(&cli.db, kind, &file),
        Commands::ValidateConfig { file } => cmd_validate_config(&file),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {message}");
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {hint}");
            }
            ExitCode::from(code)
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn open_store(db: &PathBuf) -> Result<Store, CliError> {
    Store::open(db).map_err(|e| CliError {
        code: store_exit_code(&e),
        message: format!("cannot open {}: {e}", db.display()),
        hint: None,
    })
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig, CliError> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(&path).map_err(|e| CliError {
        code: EXIT_CONFIG_INVALID,
        message: format!("cannot read {}: {e}", path.display()),
        hint: None,
    })?;
    EngineConfig::from_toml(&text).map_err(|e| CliError {
        code: EXIT_CONFIG_INVALID,
        message: e.to_string(),
        hint: Some("see fleetlink validate-config".into()),
    })
}

struct RawScope {
    vehicle: Option<String>,
    from: Option<String>,
    to: Option<String>,
}

impl RawScope {
    fn parse(self) -> Result<RunScope, CliError> {
        let parse_ts = |flag: &str, s: &str| {
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&chrono::Utc))
                .map_err(|e| CliError::usage(format!("{flag} {s:?}: {e}")))
        };
        Ok(RunScope {
            vehicle_id: self.vehicle,
            from: self.from.as_deref().map(|s| parse_ts("--from", s)).transpose()?,
            to: self.to.as_deref().map(|s| parse_ts("--to", s)).transpose()?,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    db: &PathBuf,
    kind: RunKindArg,
    scope: RawScope,
    workers: usize,
    min_confidence: f64,
    clear: bool,
    timeout_secs: Option<u64>,
    config_path: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    if workers == 0 {
        return Err(CliError::usage("--workers must be at least 1"));
    }
    if !(0.0..=100.0).contains(&min_confidence) {
        return Err(CliError::usage("--min-confidence must be in [0,100]"));
    }
    let config = load_config(config_path)?;
    let options = RunOptions {
        kind: kind.into(),
        scope: scope.parse()?,
        workers,
        min_confidence,
        clear_existing: clear,
        timeout: timeout_secs.map(Duration::from_secs),
    };
    let outcome = start_run(db, &config, &options, &CancelFlag::new()).map_err(|e| CliError {
        code: EXIT_RUN_SETUP,
        message: e.to_string(),
        hint: None,
    })?;

    if json {
        let out = serde_json::json!({
            "run_id": outcome.run_id,
            "status": outcome.status,
            "stats": outcome.stats,
            "elapsed_ms": outcome.elapsed.as_millis() as u64,
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    }

    let s = &outcome.stats;
    eprintln!(
        "run {} {}: {} subjects — {} matched, {} failed, {} high confidence, {} need review, avg {:.1} ({:.1}s)",
        outcome.run_id,
        outcome.status,
        s.processed,
        s.matched,
        s.failed,
        s.high_confidence,
        s.needs_review,
        s.avg_confidence,
        outcome.elapsed.as_secs_f64(),
    );

    if outcome.status == RunStatus::Failed {
        return Err(CliError { code: EXIT_RUN_FAILED, message: String::new(), hint: None });
    }
    Ok(())
}

fn cmd_runs(db: &PathBuf, id: Option<String>, limit: usize, json: bool) -> Result<(), CliError> {
    let store = open_store(db)?;
    let runs = match id {
        Some(id) => vec![store.get_run(&id).map_err(CliError::store)?],
        None => store.list_runs(limit).map_err(CliError::store)?,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&runs).unwrap_or_default());
        return Ok(());
    }
    for run in &runs {
        println!(
            "{}  {:9}  {:9}  {:>6} subjects  {:>5.1} avg  {}",
            run.id,
            run.kind,
            run.status.to_string(),
            run.stats.processed,
            run.stats.avg_confidence,
            run.started_at.to_rfc3339(),
        );
        if let Some(ref error) = run.error {
            println!("    error: {error}");
        }
    }
    eprintln!("{} runs", runs.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_query(
    db: &PathBuf,
    kind: Option<KindArg>,
    subject: Option<String>,
    entity: Option<String>,
    tier: Option<String>,
    review: bool,
    verified: bool,
    min_confidence: Option<f64>,
    max_confidence: Option<f64>,
    run: Option<String>,
    limit: usize,
    json: bool,
) -> Result<(), CliError> {
    let tier = tier
        .as_deref()
        .map(str::parse::<QualityTier>)
        .transpose()
        .map_err(CliError::usage)?;
    let filter = CorrelationFilter {
        kind: kind.map(Into::into),
        subject_id: subject,
        matched_entity_id: entity,
        tier,
        requires_review: review.then_some(true),
        verified: verified.then_some(true),
        min_confidence,
        max_confidence,
        run_id: run,
        limit: Some(limit),
    };
    let store = open_store(db)?;
    let records = store.list_correlations(&filter).map_err(CliError::store)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records).unwrap_or_default());
        return Ok(());
    }
    for r in &records {
        let flags = if r.flags.is_empty() {
            String::new()
        } else {
            let names: Vec<String> = r.flags.iter().map(ToString::to_string).collect();
            format!("  [{}]", names.join(","))
        };
        println!(
            "{}  {:8}  {} -> {}  {:>5.1}  {:9}{}{}",
            r.id,
            r.kind.to_string(),
            r.subject_id,
            r.matched_entity_id.as_deref().unwrap_or("-"),
            r.confidence,
            r.tier.to_string(),
            if r.verified { "  verified" } else { "" },
            flags,
        );
    }
    eprintln!("{} results", records.len());
    Ok(())
}

fn cmd_verify(db: &PathBuf, id: &str, by: &str, revoke: bool) -> Result<(), CliError> {
    let mut store = open_store(db)?;
    store.verify_correlation(id, by, !revoke).map_err(CliError::store)?;
    if revoke {
        eprintln!("withdrew verification on {id}");
    } else {
        eprintln!("verified {id} ({by})");
    }
    Ok(())
}

fn cmd_orphans(db: &PathBuf, json: bool) -> Result<(), CliError> {
    let store = open_store(db)?;
    let report = store.orphan_report().map_err(CliError::store)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        return Ok(());
    }
    for group in &report {
        println!(
            "{:12}  {:10}  {:>5} events  {} .. {}",
            group.vehicle_id,
            group.registration,
            group.event_count,
            group.first_seen.to_rfc3339(),
            group.last_seen.to_rfc3339(),
        );
    }
    eprintln!("{} vehicles with unattributed events", report.len());
    Ok(())
}

fn cmd_explain_event(
    db: &PathBuf,
    id: &str,
    config_path: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let store = open_store(db)?;
    let event = store.get_event(id).map_err(CliError::store)?;
    let candidates = store
        .driver_candidates(&event, config.windows.event_minutes)
        .map_err(CliError::store)?;
    let trace = explain_driver(&event, &candidates, &config);
    if json {
        println!("{}", serde_json::to_string_pretty(&trace).unwrap_or_default());
        return Ok(());
    }
    println!("event {}  vehicle {}  at {}", event.id, event.vehicle_id, event.occurred_at.to_rfc3339());
    for t in &trace.traces {
        let verdict = match t.score {
            Some(score) => format!("{:?} at {score:.1}", t.outcome),
            None => format!("{:?}", t.outcome),
        };
        println!(
            "  {:20} {}{}{}",
            t.method.to_string(),
            verdict,
            t.entity_id.as_deref().map(|e| format!(" -> {e}")).unwrap_or_default(),
            if t.selected { "  <- selected" } else { "" },
        );
    }
    if trace.resolved {
        eprintln!("resolved to {} at {:.1}", trace.driver_id.as_deref().unwrap_or("-"), trace.confidence);
    } else {
        eprintln!("unresolved");
    }
    Ok(())
}

fn cmd_explain_pair(
    db: &PathBuf,
    trip_id: &str,
    delivery_id: &str,
    config_path: Option<PathBuf>,
    json: bool,
) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let store = open_store(db)?;
    let trip = store.get_trip(trip_id).map_err(CliError::store)?;
    let vehicle = store.get_vehicle(&trip.vehicle_id).map_err(CliError::store)?;
    let delivery = store.get_delivery(delivery_id).map_err(CliError::store)?;
    let trace = explain_delivery(&trip, &vehicle, &delivery, &config);
    if json {
        println!("{}", serde_json::to_string_pretty(&trace).unwrap_or_default());
        return Ok(());
    }
    println!(
        "trip {} ({}) x delivery {} ({})",
        trip.id, vehicle.registration, delivery.id, delivery.site_name
    );
    for t in &trace.traces {
        let verdict = match t.score {
            Some(score) => format!("{:?} at {score:.1}", t.outcome),
            None => format!("{:?}", t.outcome),
        };
        println!("  {:20} {}", t.method.to_string(), verdict);
    }
    println!("  day gap: {}", trace.day_gap);
    if let Some(km) = trace.distance_km {
        println!("  distance: {km:.1} km");
    }
    match trace.confidence {
        Some(confidence) => eprintln!(
            "blended {:.1} ({})",
            confidence,
            trace.tier.map(|t| t.to_string()).unwrap_or_default()
        ),
        None => eprintln!("rejected: outside the temporal window"),
    }
    Ok(())
}

fn cmd_import(db: &PathBuf, kind: ImportKind, file: &PathBuf) -> Result<(), CliError> {
    let store = open_store(db)?;
    let count = import::import_file(&store, kind, file).map_err(|message| CliError {
        code: EXIT_IMPORT_PARSE,
        message,
        hint: None,
    })?;
    eprintln!("imported {count} rows from {}", file.display());
    Ok(())
}

fn cmd_validate_config(file: &PathBuf) -> Result<(), CliError> {
    let text = std::fs::read_to_string(file).map_err(|e| CliError {
        code: EXIT_CONFIG_INVALID,
        message: format!("cannot read {}: {e}", file.display()),
        hint: None,
    })?;
    match EngineConfig::from_toml(&text) {
        Ok(_) => {
            eprintln!("{} is valid", file.display());
            Ok(())
        }
        Err(e) => Err(CliError { code: EXIT_CONFIG_INVALID, message: e.to_string(), hint: None }),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn store(err: fleetlink_store::StoreError) -> Self {
        Self { code: store_exit_code(&err), message: err.to_string(), hint: None }
    }
}
