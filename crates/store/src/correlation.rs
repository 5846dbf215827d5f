//! Correlation persistence: idempotent keyed upsert, verification, and
//! filtered queries.
//!
//! Identity is logical, not row-id based. A driver attribution is keyed
//! by its subject alone; a delivery correlation by the (trip, delivery)
//! pair. Re-running analysis updates rows in place, and rows a human has
//! verified are never overwritten by the engine.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use fleetlink_engine::model::{
    Breakdown, CorrelationKind, CorrelationRecord, DeliveryCorrelation, DriverAttribution,
    MatchMethod, QualityTier, ReviewFlag,
};

use crate::{format_ts, parse_ts, Result, Store, StoreError};

// ---------------------------------------------------------------------------
// Inputs and outcomes
// ---------------------------------------------------------------------------

/// Engine output ready to persist. The store assigns the row id.
#[derive(Debug, Clone)]
pub struct NewCorrelation {
    pub kind: CorrelationKind,
    pub subject_id: String,
    pub matched_entity_id: Option<String>,
    pub confidence: f64,
    pub breakdown: Breakdown,
    pub methods: Vec<MatchMethod>,
    pub tier: QualityTier,
    pub requires_review: bool,
    pub flags: Vec<ReviewFlag>,
    pub run_id: Option<String>,
}

impl NewCorrelation {
    /// Unresolved attributions and resolved ones below `review_floor`
    /// both land in the review queue.
    pub fn from_attribution(
        a: &DriverAttribution,
        tier: QualityTier,
        review_floor: f64,
        run_id: Option<&str>,
    ) -> Self {
        let low = a.confidence < review_floor;
        Self {
            kind: CorrelationKind::Driver,
            subject_id: a.subject_id.clone(),
            matched_entity_id: a.driver_id.clone(),
            confidence: a.confidence,
            breakdown: a.breakdown.clone(),
            methods: a.method.into_iter().collect(),
            tier,
            requires_review: low || !a.is_resolved(),
            flags: if low { vec![ReviewFlag::LowConfidence] } else { vec![] },
            run_id: run_id.map(String::from),
        }
    }

    pub fn from_correlation(c: &DeliveryCorrelation, run_id: Option<&str>) -> Self {
        Self {
            kind: CorrelationKind::Delivery,
            subject_id: c.trip_id.clone(),
            matched_entity_id: Some(c.delivery_id.clone()),
            confidence: c.confidence,
            breakdown: c.breakdown.clone(),
            methods: c.methods.clone(),
            tier: c.tier,
            requires_review: c.requires_review,
            flags: c.flags.clone(),
            run_id: run_id.map(String::from),
        }
    }
}

/// What the upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The existing row is verified; the engine result was discarded.
    SkippedVerified,
}

/// Query filter for `list_correlations`. `Default` matches everything.
#[derive(Debug, Clone, Default)]
pub struct CorrelationFilter {
    pub kind: Option<CorrelationKind>,
    pub subject_id: Option<String>,
    pub matched_entity_id: Option<String>,
    pub tier: Option<QualityTier>,
    pub requires_review: Option<bool>,
    pub verified: Option<bool>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub run_id: Option<String>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// JSON columns
// ---------------------------------------------------------------------------

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| StoreError::Corrupt(format!("json {s:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const CORRELATION_COLS: &str = "id, kind, subject_id, matched_entity_id, confidence, breakdown, \
     methods, tier, requires_review, flags, verified, verified_by, verified_at, run_id, updated_at";

struct RawCorrelation {
    record: CorrelationRecord,
    kind: String,
    breakdown: String,
    methods: String,
    tier: String,
    flags: String,
    verified_at: Option<String>,
    updated_at: String,
}

fn correlation_from_row(row: &Row) -> rusqlite::Result<RawCorrelation> {
    Ok(RawCorrelation {
        record: CorrelationRecord {
            id: row.get(0)?,
            kind: CorrelationKind::Driver,
            subject_id: row.get(2)?,
            matched_entity_id: row.get(3)?,
            confidence: row.get(4)?,
            breakdown: BTreeMap::new(),
            methods: Vec::new(),
            tier: QualityTier::Poor,
            requires_review: row.get::<_, i64>(8)? != 0,
            flags: Vec::new(),
            verified: row.get::<_, i64>(10)? != 0,
            verified_by: row.get(11)?,
            verified_at: None,
            run_id: row.get(13)?,
            updated_at: Utc::now(),
        },
        kind: row.get(1)?,
        breakdown: row.get(5)?,
        methods: row.get(6)?,
        tier: row.get(7)?,
        flags: row.get(9)?,
        verified_at: row.get(12)?,
        updated_at: row.get(14)?,
    })
}

fn finish_correlation(raw: RawCorrelation) -> Result<CorrelationRecord> {
    let mut record = raw.record;
    record.kind = raw.kind.parse().map_err(StoreError::Corrupt)?;
    record.tier = raw.tier.parse().map_err(StoreError::Corrupt)?;
    record.breakdown = from_json(&raw.breakdown)?;
    record.methods = from_json(&raw.methods)?;
    record.flags = from_json(&raw.flags)?;
    record.verified_at = raw.verified_at.as_deref().map(parse_ts).transpose()?;
    record.updated_at = parse_ts(&raw.updated_at)?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// Busy retry
// ---------------------------------------------------------------------------

const BUSY_RETRIES: u32 = 5;

fn is_busy(e: &StoreError) -> bool {
    matches!(
        e,
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(f, _))
            if f.code == rusqlite::ErrorCode::DatabaseBusy
                || f.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl Store {
    /// Idempotent keyed upsert. The existence check, verified check, and
    /// write happen inside one IMMEDIATE transaction so concurrent workers
    /// cannot interleave between them.
    pub fn upsert_correlation(&mut self, new: &NewCorrelation) -> Result<UpsertOutcome> {
        let mut attempt = 0;
        loop {
            match self.upsert_correlation_once(new) {
                Err(e) if is_busy(&e) && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(std::time::Duration::from_millis(10 * u64::from(attempt)));
                }
                other => return other,
            }
        }
    }

    fn upsert_correlation_once(&mut self, new: &NewCorrelation) -> Result<UpsertOutcome> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, bool)> = match new.kind {
            CorrelationKind::Driver => tx
                .query_row(
                    "SELECT id, verified FROM correlations
                     WHERE kind = 'driver' AND subject_id = ?1",
                    params![new.subject_id],
                    |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
                )
                .optional()?,
            CorrelationKind::Delivery => tx
                .query_row(
                    "SELECT id, verified FROM correlations
                     WHERE kind = 'delivery' AND subject_id = ?1 AND matched_entity_id IS ?2",
                    params![new.subject_id, new.matched_entity_id],
                    |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
                )
                .optional()?,
        };

        let now = format_ts(Utc::now());
        let outcome = match existing {
            Some((_, true)) => UpsertOutcome::SkippedVerified,
            Some((id, false)) => {
                tx.execute(
                    "UPDATE correlations SET
                         matched_entity_id = ?2, confidence = ?3, breakdown = ?4,
                         methods = ?5, tier = ?6, requires_review = ?7, flags = ?8,
                         run_id = ?9, updated_at = ?10
                     WHERE id = ?1",
                    params![
                        id,
                        new.matched_entity_id,
                        new.confidence,
                        to_json(&new.breakdown)?,
                        to_json(&new.methods)?,
                        new.tier.to_string(),
                        new.requires_review as i64,
                        to_json(&new.flags)?,
                        new.run_id,
                        now,
                    ],
                )?;
                UpsertOutcome::Updated
            }
            None => {
                tx.execute(
                    "INSERT INTO correlations
                         (id, kind, subject_id, matched_entity_id, confidence, breakdown,
                          methods, tier, requires_review, flags, verified, run_id, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12)",
                    params![
                        Uuid::new_v4().to_string(),
                        new.kind.to_string(),
                        new.subject_id,
                        new.matched_entity_id,
                        new.confidence,
                        to_json(&new.breakdown)?,
                        to_json(&new.methods)?,
                        new.tier.to_string(),
                        new.requires_review as i64,
                        to_json(&new.flags)?,
                        new.run_id,
                        now,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Mark a correlation verified (or withdraw verification).
    pub fn verify_correlation(&mut self, id: &str, verifier: &str, approve: bool) -> Result<()> {
        let now = format_ts(Utc::now());
        let changed = if approve {
            self.conn.execute(
                "UPDATE correlations SET verified = 1, verified_by = ?2, verified_at = ?3,
                     requires_review = 0, updated_at = ?3
                 WHERE id = ?1",
                params![id, verifier, now],
            )?
        } else {
            self.conn.execute(
                "UPDATE correlations SET verified = 0, verified_by = NULL, verified_at = NULL,
                     updated_at = ?2
                 WHERE id = ?1",
                params![id, now],
            )?
        };
        if changed == 0 {
            return Err(StoreError::NotFound(format!("correlation {id}")));
        }
        Ok(())
    }

    /// Delete unverified rows of one kind, optionally narrowed to a set
    /// of subjects. Verified rows always survive a re-run.
    pub fn clear_unverified(
        &mut self,
        kind: CorrelationKind,
        subject_ids: Option<&[String]>,
    ) -> Result<usize> {
        match subject_ids {
            None => {
                let n = self.conn.execute(
                    "DELETE FROM correlations WHERE kind = ?1 AND verified = 0",
                    params![kind.to_string()],
                )?;
                Ok(n)
            }
            Some(ids) => {
                let tx = self.conn.transaction()?;
                let mut total = 0;
                {
                    let mut stmt = tx.prepare(
                        "DELETE FROM correlations
                         WHERE kind = ?1 AND verified = 0 AND subject_id = ?2",
                    )?;
                    for id in ids {
                        total += stmt.execute(params![kind.to_string(), id])?;
                    }
                }
                tx.commit()?;
                Ok(total)
            }
        }
    }

    pub fn get_correlation(&self, id: &str) -> Result<CorrelationRecord> {
        let sql = format!("SELECT {CORRELATION_COLS} FROM correlations WHERE id = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![id], correlation_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("correlation {id}")))?;
        finish_correlation(raw)
    }

    /// All rows for one subject, highest confidence first.
    pub fn correlations_for_subject(
        &self,
        kind: CorrelationKind,
        subject_id: &str,
    ) -> Result<Vec<CorrelationRecord>> {
        let sql = format!(
            "SELECT {CORRELATION_COLS} FROM correlations
             WHERE kind = ?1 AND subject_id = ?2
             ORDER BY confidence DESC, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![kind.to_string(), subject_id], correlation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(finish_correlation).collect()
    }

    pub fn list_correlations(&self, filter: &CorrelationFilter) -> Result<Vec<CorrelationRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        fn bind(clause: &str, value: Box<dyn ToSql>, values: &mut Vec<Box<dyn ToSql>>) -> String {
            values.push(value);
            format!("{} ?{}", clause, values.len())
        }
        if let Some(kind) = filter.kind {
            clauses.push(bind("kind =", Box::new(kind.to_string()), &mut values));
        }
        if let Some(ref subject) = filter.subject_id {
            clauses.push(bind("subject_id =", Box::new(subject.clone()), &mut values));
        }
        if let Some(ref entity) = filter.matched_entity_id {
            clauses.push(bind("matched_entity_id =", Box::new(entity.clone()), &mut values));
        }
        if let Some(tier) = filter.tier {
            clauses.push(bind("tier =", Box::new(tier.to_string()), &mut values));
        }
        if let Some(review) = filter.requires_review {
            clauses.push(bind("requires_review =", Box::new(review as i64), &mut values));
        }
        if let Some(verified) = filter.verified {
            clauses.push(bind("verified =", Box::new(verified as i64), &mut values));
        }
        if let Some(min) = filter.min_confidence {
            clauses.push(bind("confidence >=", Box::new(min), &mut values));
        }
        if let Some(max) = filter.max_confidence {
            clauses.push(bind("confidence <=", Box::new(max), &mut values));
        }
        if let Some(ref run) = filter.run_id {
            clauses.push(bind("run_id =", Box::new(run.clone()), &mut values));
        }
        let mut sql = format!("SELECT {CORRELATION_COLS} FROM correlations");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY confidence DESC, updated_at DESC, id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(values.iter().map(|v| v.as_ref()));
        let raws = stmt
            .query_map(params, correlation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(finish_correlation).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_result(subject: &str, driver: Option<&str>, confidence: f64) -> NewCorrelation {
        NewCorrelation {
            kind: CorrelationKind::Driver,
            subject_id: subject.into(),
            matched_entity_id: driver.map(String::from),
            confidence,
            breakdown: Breakdown::new(),
            methods: driver.map(|_| MatchMethod::VehicleAssignment).into_iter().collect(),
            tier: QualityTier::Good,
            requires_review: false,
            flags: vec![],
            run_id: Some("run_1".into()),
        }
    }

    #[test]
    fn low_confidence_resolved_attribution_is_flagged_for_review() {
        let mut attribution = DriverAttribution::unresolved("evt_1");
        attribution.driver_id = Some("drv_1".into());
        attribution.method = Some(MatchMethod::TimeWindowLoose);
        attribution.confidence = 45.0;

        // Resolved, but under the review floor.
        let new = NewCorrelation::from_attribution(&attribution, QualityTier::Poor, 60.0, None);
        assert!(new.requires_review);
        assert_eq!(new.flags, vec![ReviewFlag::LowConfidence]);

        // Comfortably above the floor: no flag, no review.
        attribution.confidence = 80.0;
        let new = NewCorrelation::from_attribution(&attribution, QualityTier::Good, 60.0, None);
        assert!(!new.requires_review);
        assert!(new.flags.is_empty());

        // Unresolved always lands in the queue.
        let unresolved = DriverAttribution::unresolved("evt_2");
        let new = NewCorrelation::from_attribution(&unresolved, QualityTier::Poor, 60.0, None);
        assert!(new.requires_review);
        assert_eq!(new.flags, vec![ReviewFlag::LowConfidence]);
    }

    #[test]
    fn repeated_upsert_keeps_one_row_per_subject() {
        let mut s = Store::open_in_memory().unwrap();
        let new = driver_result("evt_1", Some("drv_1"), 80.0);
        assert_eq!(s.upsert_correlation(&new).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(s.upsert_correlation(&new).unwrap(), UpsertOutcome::Updated);
        assert_eq!(s.upsert_correlation(&new).unwrap(), UpsertOutcome::Updated);
        let rows = s.correlations_for_subject(CorrelationKind::Driver, "evt_1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].matched_entity_id.as_deref(), Some("drv_1"));
    }

    #[test]
    fn upsert_keeps_row_id_stable_across_updates() {
        let mut s = Store::open_in_memory().unwrap();
        s.upsert_correlation(&driver_result("evt_1", Some("drv_1"), 80.0)).unwrap();
        let before = s.correlations_for_subject(CorrelationKind::Driver, "evt_1").unwrap();
        s.upsert_correlation(&driver_result("evt_1", Some("drv_2"), 65.0)).unwrap();
        let after = s.correlations_for_subject(CorrelationKind::Driver, "evt_1").unwrap();
        assert_eq!(before[0].id, after[0].id);
        assert_eq!(after[0].matched_entity_id.as_deref(), Some("drv_2"));
        assert_eq!(after[0].confidence, 65.0);
    }

    #[test]
    fn verified_rows_survive_engine_rewrites() {
        let mut s = Store::open_in_memory().unwrap();
        s.upsert_correlation(&driver_result("evt_1", Some("drv_1"), 80.0)).unwrap();
        let id = s.correlations_for_subject(CorrelationKind::Driver, "evt_1").unwrap()[0]
            .id
            .clone();
        s.verify_correlation(&id, "ops@example.com", true).unwrap();

        let outcome = s.upsert_correlation(&driver_result("evt_1", Some("drv_2"), 99.0)).unwrap();
        assert_eq!(outcome, UpsertOutcome::SkippedVerified);
        let row = s.get_correlation(&id).unwrap();
        assert_eq!(row.matched_entity_id.as_deref(), Some("drv_1"));
        assert!(row.verified);
        assert_eq!(row.verified_by.as_deref(), Some("ops@example.com"));

        // Withdrawing verification reopens the row to the engine.
        s.verify_correlation(&id, "ops@example.com", false).unwrap();
        assert_eq!(
            s.upsert_correlation(&driver_result("evt_1", Some("drv_2"), 99.0)).unwrap(),
            UpsertOutcome::Updated
        );
    }

    #[test]
    fn delivery_rows_key_on_the_pair() {
        let mut s = Store::open_in_memory().unwrap();
        let mk = |delivery: &str| NewCorrelation {
            kind: CorrelationKind::Delivery,
            subject_id: "trip_1".into(),
            matched_entity_id: Some(delivery.into()),
            confidence: 70.0,
            breakdown: Breakdown::new(),
            methods: vec![MatchMethod::GeoProximity],
            tier: QualityTier::Fair,
            requires_review: false,
            flags: vec![],
            run_id: None,
        };
        assert_eq!(s.upsert_correlation(&mk("del_1")).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(s.upsert_correlation(&mk("del_2")).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(s.upsert_correlation(&mk("del_1")).unwrap(), UpsertOutcome::Updated);
        assert_eq!(
            s.correlations_for_subject(CorrelationKind::Delivery, "trip_1").unwrap().len(),
            2
        );
    }

    #[test]
    fn clear_unverified_spares_verified_rows() {
        let mut s = Store::open_in_memory().unwrap();
        s.upsert_correlation(&driver_result("evt_1", Some("drv_1"), 80.0)).unwrap();
        s.upsert_correlation(&driver_result("evt_2", Some("drv_2"), 70.0)).unwrap();
        let id = s.correlations_for_subject(CorrelationKind::Driver, "evt_1").unwrap()[0]
            .id
            .clone();
        s.verify_correlation(&id, "ops", true).unwrap();
        let removed = s.clear_unverified(CorrelationKind::Driver, None).unwrap();
        assert_eq!(removed, 1);
        assert!(s.get_correlation(&id).is_ok());
        assert!(s.correlations_for_subject(CorrelationKind::Driver, "evt_2").unwrap().is_empty());
    }

    #[test]
    fn round_trips_json_columns() {
        let mut s = Store::open_in_memory().unwrap();
        let mut breakdown = Breakdown::new();
        breakdown.insert(MatchMethod::TextNormalized, 100.0);
        breakdown.insert(MatchMethod::GeoProximity, 95.0);
        let new = NewCorrelation {
            kind: CorrelationKind::Delivery,
            subject_id: "trip_1".into(),
            matched_entity_id: Some("del_1".into()),
            confidence: 94.0,
            breakdown: breakdown.clone(),
            methods: vec![MatchMethod::TextNormalized, MatchMethod::GeoProximity],
            tier: QualityTier::Excellent,
            requires_review: true,
            flags: vec![ReviewFlag::LargeDateGap],
            run_id: Some("run_9".into()),
        };
        s.upsert_correlation(&new).unwrap();
        let row = &s.correlations_for_subject(CorrelationKind::Delivery, "trip_1").unwrap()[0];
        assert_eq!(row.breakdown, breakdown);
        assert_eq!(row.methods, new.methods);
        assert_eq!(row.flags, vec![ReviewFlag::LargeDateGap]);
        assert_eq!(row.tier, QualityTier::Excellent);
        assert!(row.requires_review);
        assert_eq!(row.run_id.as_deref(), Some("run_9"));
    }

    #[test]
    fn filter_combines_clauses() {
        let mut s = Store::open_in_memory().unwrap();
        s.upsert_correlation(&driver_result("evt_1", Some("drv_1"), 95.0)).unwrap();
        s.upsert_correlation(&driver_result("evt_2", Some("drv_1"), 50.0)).unwrap();
        s.upsert_correlation(&driver_result("evt_3", None, 0.0)).unwrap();
        let filter = CorrelationFilter {
            kind: Some(CorrelationKind::Driver),
            min_confidence: Some(40.0),
            ..Default::default()
        };
        let rows = s.list_correlations(&filter).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].subject_id, "evt_1"); // confidence desc
        let limited =
            s.list_correlations(&CorrelationFilter { limit: Some(1), ..Default::default() }).unwrap();
        assert_eq!(limited.len(), 1);
    }
}
