//! CSV ingest for the six source-record kinds. Files are headed CSV;
//! timestamps are RFC 3339, dates are YYYY-MM-DD. Rows are keyed by id,
//! so re-importing a corrected file replaces rather than duplicates.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use fleetlink_engine::model::{
    Coordinate, DeliveryRecord, Driver, DriverAlias, TelemetryEvent, Trip, Vehicle,
    VehicleAssignment,
};
use fleetlink_store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ImportKind {
    Vehicles,
    Drivers,
    Assignments,
    Events,
    Trips,
    Deliveries,
}

pub fn import_file(store: &Store, kind: ImportKind, path: &Path) -> Result<usize, String> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    import_str(store, kind, &data)
}

pub fn import_str(store: &Store, kind: ImportKind, data: &str) -> Result<usize, String> {
    match kind {
        ImportKind::Vehicles => import_rows(store, data, parse_vehicle, Store::upsert_vehicle),
        ImportKind::Drivers => import_rows(store, data, parse_driver, Store::upsert_driver),
        ImportKind::Assignments => {
            import_rows(store, data, parse_assignment, Store::upsert_assignment)
        }
        ImportKind::Events => import_rows(store, data, parse_event, Store::upsert_event),
        ImportKind::Trips => import_rows(store, data, parse_trip, Store::upsert_trip),
        ImportKind::Deliveries => import_rows(store, data, parse_delivery, Store::upsert_delivery),
    }
}

fn import_rows<Raw, T>(
    store: &Store,
    data: &str,
    parse: impl Fn(Raw) -> Result<T, String>,
    insert: impl Fn(&Store, &T) -> fleetlink_store::Result<()>,
) -> Result<usize, String>
where
    Raw: for<'de> Deserialize<'de>,
{
    let mut reader = csv::Reader::from_reader(data.as_bytes());
    let mut count = 0;
    for (line, row) in reader.deserialize::<Raw>().enumerate() {
        let raw = row.map_err(|e| format!("row {}: {e}", line + 2))?;
        let record = parse(raw).map_err(|e| format!("row {}: {e}", line + 2))?;
        insert(store, &record).map_err(|e| format!("row {}: {e}", line + 2))?;
        count += 1;
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

fn parse_ts(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("timestamp {s:?}: {e}"))
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("date {s:?}: {e}"))
}

fn coordinate(lat: Option<f64>, lon: Option<f64>) -> Result<Option<Coordinate>, String> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Ok(Some(Coordinate { lat, lon })),
        (None, None) => Ok(None),
        _ => Err("lat and lon must be given together".into()),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Per-kind rows
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct VehicleRow {
    id: String,
    registration: String,
    #[serde(default)]
    fleet: Option<String>,
}

fn parse_vehicle(row: VehicleRow) -> Result<Vehicle, String> {
    Ok(Vehicle {
        id: row.id,
        registration: row.registration,
        fleet: row.fleet.unwrap_or_default(),
    })
}

#[derive(Deserialize)]
struct DriverRow {
    id: String,
    name: String,
    /// Pipe-separated `source:alias` entries, e.g. `telematics:p.patel|pod:PP`.
    #[serde(default)]
    aliases: Option<String>,
}

fn parse_driver(row: DriverRow) -> Result<Driver, String> {
    let mut aliases = Vec::new();
    if let Some(field) = non_empty(row.aliases) {
        for entry in field.split('|') {
            let (source, alias) = entry
                .split_once(':')
                .ok_or_else(|| format!("alias {entry:?}: expected source:alias"))?;
            aliases.push(DriverAlias { source: source.to_string(), alias: alias.to_string() });
        }
    }
    Ok(Driver { id: row.id, name: row.name, aliases })
}

#[derive(Deserialize)]
struct AssignmentRow {
    id: String,
    vehicle_id: String,
    driver_id: String,
    valid_from: String,
    #[serde(default)]
    valid_until: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

fn parse_assignment(row: AssignmentRow) -> Result<VehicleAssignment, String> {
    if let Some(c) = row.confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(format!("confidence {c} outside [0,1]"));
        }
    }
    Ok(VehicleAssignment {
        id: row.id,
        vehicle_id: row.vehicle_id,
        driver_id: row.driver_id,
        valid_from: parse_ts(&row.valid_from)?,
        valid_until: non_empty(row.valid_until).as_deref().map(parse_ts).transpose()?,
        kind: row.kind.unwrap_or_else(|| "roster".into()),
        confidence: row.confidence,
    })
}

#[derive(Deserialize)]
struct EventRow {
    id: String,
    vehicle_id: String,
    occurred_at: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    driver_ref: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

fn parse_event(row: EventRow) -> Result<TelemetryEvent, String> {
    Ok(TelemetryEvent {
        id: row.id,
        vehicle_id: row.vehicle_id,
        occurred_at: parse_ts(&row.occurred_at)?,
        coordinate: coordinate(row.lat, row.lon)?,
        driver_ref: non_empty(row.driver_ref),
        source: row.source.unwrap_or_else(|| "unknown".into()),
    })
}

#[derive(Deserialize)]
struct TripRow {
    id: String,
    vehicle_id: String,
    started_at: String,
    ended_at: String,
    #[serde(default)]
    end_lat: Option<f64>,
    #[serde(default)]
    end_lon: Option<f64>,
    #[serde(default)]
    driver_ref: Option<String>,
}

fn parse_trip(row: TripRow) -> Result<Trip, String> {
    let started_at = parse_ts(&row.started_at)?;
    let ended_at = parse_ts(&row.ended_at)?;
    if ended_at < started_at {
        return Err(format!("trip {} ends before it starts", row.id));
    }
    Ok(Trip {
        id: row.id,
        vehicle_id: row.vehicle_id,
        started_at,
        ended_at,
        end_coordinate: coordinate(row.end_lat, row.end_lon)?,
        driver_ref: non_empty(row.driver_ref),
    })
}

#[derive(Deserialize)]
struct DeliveryRow {
    id: String,
    #[serde(default)]
    vehicle_text: Option<String>,
    site_name: String,
    delivery_date: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    service_radius_km: Option<f64>,
}

fn parse_delivery(row: DeliveryRow) -> Result<DeliveryRecord, String> {
    Ok(DeliveryRecord {
        id: row.id,
        vehicle_text: non_empty(row.vehicle_text),
        site_name: row.site_name,
        delivery_date: parse_date(&row.delivery_date)?,
        coordinate: coordinate(row.lat, row.lon)?,
        service_radius_km: row.service_radius_km,
    })
}
