//! Source-record persistence and the candidate indexer: bounded queries
//! that carve out the slice of the fleet each engine call needs.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use fleetlink_engine::model::{
    Coordinate, DeliveryRecord, Driver, DriverAlias, DriverCandidates, TelemetryEvent, Trip,
    Vehicle, VehicleAssignment,
};

use crate::{format_ts, parse_date, parse_ts, Result, Store, StoreError};

fn coordinate(lat: Option<f64>, lon: Option<f64>) -> Option<Coordinate> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Some(Coordinate { lat, lon }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Writes (imports are idempotent: re-loading a file replaces by id)
// ---------------------------------------------------------------------------

impl Store {
    pub fn upsert_vehicle(&self, v: &Vehicle) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO vehicles (id, registration, fleet) VALUES (?1, ?2, ?3)",
            params![v.id, v.registration, v.fleet],
        )?;
        Ok(())
    }

    pub fn upsert_driver(&self, d: &Driver) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO drivers (id, name) VALUES (?1, ?2)",
            params![d.id, d.name],
        )?;
        self.conn
            .execute("DELETE FROM driver_aliases WHERE driver_id = ?1", params![d.id])?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO driver_aliases (driver_id, source, alias) VALUES (?1, ?2, ?3)",
        )?;
        for alias in &d.aliases {
            stmt.execute(params![d.id, alias.source, alias.alias])?;
        }
        Ok(())
    }

    pub fn upsert_assignment(&self, a: &VehicleAssignment) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO vehicle_assignments
             (id, vehicle_id, driver_id, valid_from, valid_until, kind, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                a.id,
                a.vehicle_id,
                a.driver_id,
                format_ts(a.valid_from),
                a.valid_until.map(format_ts),
                a.kind,
                a.confidence,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_event(&self, e: &TelemetryEvent) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO telemetry_events
             (id, vehicle_id, occurred_at, lat, lon, driver_ref, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                e.id,
                e.vehicle_id,
                format_ts(e.occurred_at),
                e.coordinate.map(|c| c.lat),
                e.coordinate.map(|c| c.lon),
                e.driver_ref,
                e.source,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_trip(&self, t: &Trip) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO trips
             (id, vehicle_id, started_at, ended_at, end_lat, end_lon, driver_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                t.id,
                t.vehicle_id,
                format_ts(t.started_at),
                format_ts(t.ended_at),
                t.end_coordinate.map(|c| c.lat),
                t.end_coordinate.map(|c| c.lon),
                t.driver_ref,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_delivery(&self, d: &DeliveryRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO deliveries
             (id, vehicle_text, site_name, delivery_date, lat, lon, service_radius_km)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                d.id,
                d.vehicle_text,
                d.site_name,
                d.delivery_date.format("%Y-%m-%d").to_string(),
                d.coordinate.map(|c| c.lat),
                d.coordinate.map(|c| c.lon),
                d.service_radius_km,
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn event_from_row(row: &Row) -> rusqlite::Result<(TelemetryEvent, String)> {
    Ok((
        TelemetryEvent {
            id: row.get(0)?,
            vehicle_id: row.get(1)?,
            occurred_at: Utc::now(), // replaced by the caller after parsing
            coordinate: coordinate(row.get(3)?, row.get(4)?),
            driver_ref: row.get(5)?,
            source: row.get(6)?,
        },
        row.get(2)?,
    ))
}

fn trip_from_row(row: &Row) -> rusqlite::Result<(Trip, String, String)> {
    Ok((
        Trip {
            id: row.get(0)?,
            vehicle_id: row.get(1)?,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            end_coordinate: coordinate(row.get(4)?, row.get(5)?),
            driver_ref: row.get(6)?,
        },
        row.get(2)?,
        row.get(3)?,
    ))
}

fn delivery_from_row(row: &Row) -> rusqlite::Result<(DeliveryRecord, String)> {
    Ok((
        DeliveryRecord {
            id: row.get(0)?,
            vehicle_text: row.get(1)?,
            site_name: row.get(2)?,
            delivery_date: NaiveDate::MIN,
            coordinate: coordinate(row.get(4)?, row.get(5)?),
            service_radius_km: row.get(6)?,
        },
        row.get(3)?,
    ))
}

fn scope_clauses(
    time_col: &str,
    vehicle_id: Option<&str>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> (Vec<String>, Vec<String>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    if let Some(v) = vehicle_id {
        values.push(v.to_string());
        clauses.push(format!("vehicle_id = ?{}", values.len()));
    }
    if let Some(from) = from {
        values.push(format_ts(from));
        clauses.push(format!("{time_col} >= ?{}", values.len()));
    }
    if let Some(to) = to {
        values.push(format_ts(to));
        clauses.push(format!("{time_col} <= ?{}", values.len()));
    }
    (clauses, values)
}

const EVENT_COLS: &str = "id, vehicle_id, occurred_at, lat, lon, driver_ref, source";
const TRIP_COLS: &str = "id, vehicle_id, started_at, ended_at, end_lat, end_lon, driver_ref";
const DELIVERY_COLS: &str = "id, vehicle_text, site_name, delivery_date, lat, lon, service_radius_km";

fn finish_events(rows: Vec<(TelemetryEvent, String)>) -> Result<Vec<TelemetryEvent>> {
    rows.into_iter()
        .map(|(mut e, ts)| {
            e.occurred_at = parse_ts(&ts)?;
            Ok(e)
        })
        .collect()
}

fn finish_trips(rows: Vec<(Trip, String, String)>) -> Result<Vec<Trip>> {
    rows.into_iter()
        .map(|(mut t, start, end)| {
            t.started_at = parse_ts(&start)?;
            t.ended_at = parse_ts(&end)?;
            Ok(t)
        })
        .collect()
}

fn finish_deliveries(rows: Vec<(DeliveryRecord, String)>) -> Result<Vec<DeliveryRecord>> {
    rows.into_iter()
        .map(|(mut d, date)| {
            d.delivery_date = parse_date(&date)?;
            Ok(d)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

impl Store {
    pub fn get_vehicle(&self, id: &str) -> Result<Vehicle> {
        self.conn
            .query_row(
                "SELECT id, registration, fleet FROM vehicles WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Vehicle { id: row.get(0)?, registration: row.get(1)?, fleet: row.get(2)? })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("vehicle {id}")))
    }

    pub fn get_event(&self, id: &str) -> Result<TelemetryEvent> {
        let sql = format!("SELECT {EVENT_COLS} FROM telemetry_events WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], event_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("event {id}")))?;
        Ok(finish_events(vec![row])?.remove(0))
    }

    pub fn get_delivery(&self, id: &str) -> Result<DeliveryRecord> {
        let sql = format!("SELECT {DELIVERY_COLS} FROM deliveries WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], delivery_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("delivery {id}")))?;
        Ok(finish_deliveries(vec![row])?.remove(0))
    }

    pub fn get_trip(&self, id: &str) -> Result<Trip> {
        let sql = format!("SELECT {TRIP_COLS} FROM trips WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], trip_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("trip {id}")))?;
        Ok(finish_trips(vec![row])?.remove(0))
    }

    /// Full roster with per-source aliases attached.
    pub fn drivers_all(&self) -> Result<Vec<Driver>> {
        let mut stmt = self.conn.prepare("SELECT id, name FROM drivers ORDER BY id")?;
        let mut drivers: Vec<Driver> = stmt
            .query_map([], |row| {
                Ok(Driver { id: row.get(0)?, name: row.get(1)?, aliases: Vec::new() })
            })?
            .collect::<rusqlite::Result<_>>()?;
        let mut stmt = self.conn.prepare(
            "SELECT driver_id, source, alias FROM driver_aliases ORDER BY driver_id, source, alias",
        )?;
        let aliases: Vec<(String, DriverAlias)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, DriverAlias { source: row.get(1)?, alias: row.get(2)? }))
            })?
            .collect::<rusqlite::Result<_>>()?;
        for (driver_id, alias) in aliases {
            if let Some(d) = drivers.iter_mut().find(|d| d.id == driver_id) {
                d.aliases.push(alias);
            }
        }
        Ok(drivers)
    }

    /// Subjects for a driver run, optionally narrowed to one vehicle
    /// and/or a time range.
    pub fn events_for_scope(
        &self,
        vehicle_id: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<TelemetryEvent>> {
        let (clauses, values) = scope_clauses("occurred_at", vehicle_id, from, to);
        let mut sql = format!("SELECT {EVENT_COLS} FROM telemetry_events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY occurred_at, id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        finish_events(rows)
    }

    /// Subjects for a delivery run. The time range applies to trip end,
    /// which is also what delivery candidates anchor on.
    pub fn trips_for_scope(
        &self,
        vehicle_id: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Trip>> {
        let (clauses, values) = scope_clauses("ended_at", vehicle_id, from, to);
        let mut sql = format!("SELECT {TRIP_COLS} FROM trips");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY started_at, id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), trip_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        finish_trips(rows)
    }

    /// Same-vehicle events within ±`minutes` of `center`, subject included.
    pub fn events_in_window(
        &self,
        vehicle_id: &str,
        center: DateTime<Utc>,
        minutes: i64,
    ) -> Result<Vec<TelemetryEvent>> {
        let lo = format_ts(center - Duration::minutes(minutes));
        let hi = format_ts(center + Duration::minutes(minutes));
        let sql = format!(
            "SELECT {EVENT_COLS} FROM telemetry_events
             WHERE vehicle_id = ?1 AND occurred_at >= ?2 AND occurred_at <= ?3
             ORDER BY occurred_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![vehicle_id, lo, hi], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        finish_events(rows)
    }

    /// Trips for `vehicle_id` overlapping [from, to].
    pub fn trips_overlapping(
        &self,
        vehicle_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Trip>> {
        let sql = format!(
            "SELECT {TRIP_COLS} FROM trips
             WHERE vehicle_id = ?1 AND started_at <= ?2 AND ended_at >= ?3
             ORDER BY started_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![vehicle_id, format_ts(to), format_ts(from)], trip_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        finish_trips(rows)
    }

    pub fn assignments_for_vehicle(&self, vehicle_id: &str) -> Result<Vec<VehicleAssignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, vehicle_id, driver_id, valid_from, valid_until, kind, confidence
             FROM vehicle_assignments WHERE vehicle_id = ?1 ORDER BY valid_from, id",
        )?;
        let rows: Vec<(VehicleAssignment, String, Option<String>)> = stmt
            .query_map(params![vehicle_id], |row| {
                Ok((
                    VehicleAssignment {
                        id: row.get(0)?,
                        vehicle_id: row.get(1)?,
                        driver_id: row.get(2)?,
                        valid_from: Utc::now(),
                        valid_until: None,
                        kind: row.get(5)?,
                        confidence: row.get(6)?,
                    },
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        rows.into_iter()
            .map(|(mut a, from, until)| {
                a.valid_from = parse_ts(&from)?;
                a.valid_until = until.as_deref().map(parse_ts).transpose()?;
                Ok(a)
            })
            .collect()
    }

    /// Deliveries within ±`days` of `date`. When a center coordinate is
    /// given, far-away sites are cut by a bounding box; rows without
    /// coordinates always pass (text and temporal can still match them).
    pub fn deliveries_in_window(
        &self,
        date: NaiveDate,
        days: i64,
        near: Option<(Coordinate, f64)>,
    ) -> Result<Vec<DeliveryRecord>> {
        let lo = (date - Duration::days(days)).format("%Y-%m-%d").to_string();
        let hi = (date + Duration::days(days)).format("%Y-%m-%d").to_string();
        let rows = match near {
            Some((center, radius_km)) => {
                let dlat = radius_km / 110.574;
                let dlon = radius_km / (111.320 * center.lat.to_radians().cos().abs().max(1e-6));
                let sql = format!(
                    "SELECT {DELIVERY_COLS} FROM deliveries
                     WHERE delivery_date >= ?1 AND delivery_date <= ?2
                       AND (lat IS NULL
                            OR (lat BETWEEN ?3 AND ?4 AND lon BETWEEN ?5 AND ?6))
                     ORDER BY delivery_date, id"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        params![
                            lo,
                            hi,
                            center.lat - dlat,
                            center.lat + dlat,
                            center.lon - dlon,
                            center.lon + dlon,
                        ],
                        delivery_from_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {DELIVERY_COLS} FROM deliveries
                     WHERE delivery_date >= ?1 AND delivery_date <= ?2
                     ORDER BY delivery_date, id"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![lo, hi], delivery_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        finish_deliveries(rows)
    }

    /// Everything one driver-attribution call needs, bounded by the
    /// configured loose window.
    pub fn driver_candidates(
        &self,
        subject: &TelemetryEvent,
        window_minutes: i64,
    ) -> Result<DriverCandidates> {
        Ok(DriverCandidates {
            drivers: self.drivers_all()?,
            assignments: self.assignments_for_vehicle(&subject.vehicle_id)?,
            window_events: self.events_in_window(
                &subject.vehicle_id,
                subject.occurred_at,
                window_minutes,
            )?,
            trips: self.trips_overlapping(
                &subject.vehicle_id,
                subject.occurred_at - Duration::minutes(window_minutes),
                subject.occurred_at + Duration::minutes(window_minutes),
            )?,
        })
    }
}
