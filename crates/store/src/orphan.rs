//! Orphan report: events that went through attribution and came out with
//! nothing, grouped per vehicle so systematic gaps stand out.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::{parse_ts, Result, Store};

#[derive(Debug, Clone, serde::Serialize)]
pub struct OrphanGroup {
    pub vehicle_id: String,
    pub registration: String,
    pub event_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Store {
    /// Vehicles with unresolved attributions, worst offenders first.
    /// RFC 3339 text sorts chronologically, so MIN/MAX on the raw column
    /// is safe.
    pub fn orphan_report(&self) -> Result<Vec<OrphanGroup>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.vehicle_id, COALESCE(v.registration, ''),
                    COUNT(*), MIN(e.occurred_at), MAX(e.occurred_at)
             FROM correlations c
             JOIN telemetry_events e ON e.id = c.subject_id
             LEFT JOIN vehicles v ON v.id = e.vehicle_id
             WHERE c.kind = 'driver' AND c.matched_entity_id IS NULL AND c.verified = 0
             GROUP BY e.vehicle_id
             ORDER BY COUNT(*) DESC, e.vehicle_id",
        )?;
        let raws: Vec<(OrphanGroup, String, String)> = stmt
            .query_map(params![], |row| {
                Ok((
                    OrphanGroup {
                        vehicle_id: row.get(0)?,
                        registration: row.get(1)?,
                        event_count: row.get::<_, i64>(2)? as u64,
                        first_seen: Utc::now(),
                        last_seen: Utc::now(),
                    },
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        raws.into_iter()
            .map(|(mut g, first, last)| {
                g.first_seen = parse_ts(&first)?;
                g.last_seen = parse_ts(&last)?;
                Ok(g)
            })
            .collect()
    }
}
