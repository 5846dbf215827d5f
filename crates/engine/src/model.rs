use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Source records (created upstream, read-only here)
// ---------------------------------------------------------------------------

/// WGS-84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

/// A telemetry/safety event captured without a driver key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: String,
    pub vehicle_id: String,
    pub occurred_at: DateTime<Utc>,
    pub coordinate: Option<Coordinate>,
    /// Free-text driver identifier some sources embed (name, badge, tag).
    pub driver_ref: Option<String>,
    pub source: String,
}

/// A completed vehicle trip with a time interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub vehicle_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_coordinate: Option<Coordinate>,
    pub driver_ref: Option<String>,
}

/// A commercial delivery record keyed by clerks, not by vehicle id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    /// Free-text vehicle reference as entered on the delivery docket.
    pub vehicle_text: Option<String>,
    pub site_name: String,
    pub delivery_date: NaiveDate,
    pub coordinate: Option<Coordinate>,
    /// Declared service radius of the delivery site, when known.
    pub service_radius_km: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub registration: String,
    pub fleet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverAlias {
    pub source: String,
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub aliases: Vec<DriverAlias>,
}

/// Time-bounded authoritative vehicle→driver assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleAssignment {
    pub id: String,
    pub vehicle_id: String,
    pub driver_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub kind: String,
    /// Recorded confidence in [0,1]; None means the source didn't say.
    pub confidence: Option<f64>,
}

// ---------------------------------------------------------------------------
// Candidate sets (bounded by the indexer, consumed by matchers)
// ---------------------------------------------------------------------------

/// Bounded candidates for one driver-attribution subject.
#[derive(Debug, Clone, Default)]
pub struct DriverCandidates {
    /// Known driver roster with per-source aliases.
    pub drivers: Vec<Driver>,
    /// Assignments for the subject's vehicle (engine picks the active one).
    pub assignments: Vec<VehicleAssignment>,
    /// Same-vehicle events inside the loose window, subject included.
    pub window_events: Vec<TelemetryEvent>,
    /// Trips for the subject's vehicle overlapping the loose window.
    pub trips: Vec<Trip>,
}

/// Bounded delivery candidates for one trip.
#[derive(Debug, Clone, Default)]
pub struct DeliveryCandidates {
    pub deliveries: Vec<DeliveryRecord>,
}

// ---------------------------------------------------------------------------
// Match signals
// ---------------------------------------------------------------------------

/// Strategy tag recorded on every signal a matcher produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    DirectSource,
    VehicleAssignment,
    TimeWindowTight,
    TripContainment,
    TimeWindowLoose,
    TextExact,
    TextNormalized,
    TextFuzzy,
    GeoProximity,
    TemporalProximity,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DirectSource => "direct_source",
            Self::VehicleAssignment => "vehicle_assignment",
            Self::TimeWindowTight => "time_window_tight",
            Self::TripContainment => "trip_containment",
            Self::TimeWindowLoose => "time_window_loose",
            Self::TextExact => "text_exact",
            Self::TextNormalized => "text_normalized",
            Self::TextFuzzy => "text_fuzzy",
            Self::GeoProximity => "geo_proximity",
            Self::TemporalProximity => "temporal_proximity",
        };
        write!(f, "{s}")
    }
}

/// A raw signal from one matcher, already normalized to [0,100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSignal {
    pub method: MatchMethod,
    pub score: f64,
    pub entity_id: Option<String>,
}

/// Outcome of evaluating one matcher against a subject.
///
/// `NotApplicable` (required input missing) is distinct from `NoMatch`
/// (evaluated, nothing qualified) — only the latter counts against a subject.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    NotApplicable,
    NoMatch,
    Match(MatchSignal),
}

impl MatchOutcome {
    pub fn signal(&self) -> Option<&MatchSignal> {
        match self {
            Self::Match(s) => Some(s),
            _ => None,
        }
    }
}

/// Per-matcher sub-scores that contributed to a correlation.
pub type Breakdown = BTreeMap<MatchMethod, f64>;

// ---------------------------------------------------------------------------
// Engine outputs
// ---------------------------------------------------------------------------

/// Categorical bucket derived deterministically from the confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
        }
    }
}

impl std::str::FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "excellent" => Ok(Self::Excellent),
            "good" => Ok(Self::Good),
            "fair" => Ok(Self::Fair),
            "poor" => Ok(Self::Poor),
            other => Err(format!("unknown quality tier: {other}")),
        }
    }
}

/// Reason a correlation was flagged for manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewFlag {
    LowConfidence,
    LargeDateGap,
    LongDistance,
}

impl std::fmt::Display for ReviewFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowConfidence => write!(f, "low_confidence"),
            Self::LargeDateGap => write!(f, "large_date_gap"),
            Self::LongDistance => write!(f, "long_distance"),
        }
    }
}

/// Which correlation family a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKind {
    Driver,
    Delivery,
}

impl std::fmt::Display for CorrelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Driver => write!(f, "driver"),
            Self::Delivery => write!(f, "delivery"),
        }
    }
}

impl std::str::FromStr for CorrelationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "driver" => Ok(Self::Driver),
            "delivery" => Ok(Self::Delivery),
            other => Err(format!("unknown correlation kind: {other}")),
        }
    }
}

/// Result of resolving one telemetry event to a driver.
///
/// An unresolved subject still produces a value (confidence 0, no method)
/// so coverage gaps stay auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverAttribution {
    pub subject_id: String,
    pub driver_id: Option<String>,
    pub confidence: f64,
    pub method: Option<MatchMethod>,
    pub breakdown: Breakdown,
}

impl DriverAttribution {
    pub fn unresolved(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            driver_id: None,
            confidence: 0.0,
            method: None,
            breakdown: Breakdown::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.method.is_some()
    }
}

/// Result of blending all applicable signals for one (trip, delivery) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCorrelation {
    pub trip_id: String,
    pub delivery_id: String,
    pub confidence: f64,
    pub breakdown: Breakdown,
    pub methods: Vec<MatchMethod>,
    pub tier: QualityTier,
    pub requires_review: bool,
    pub flags: Vec<ReviewFlag>,
    /// Raw measures kept for reviewers.
    pub distance_km: Option<f64>,
    pub day_gap: Option<i64>,
    pub within_service_radius: Option<bool>,
}

/// Persisted correlation record (engine output, store owned).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub id: String,
    pub kind: CorrelationKind,
    pub subject_id: String,
    pub matched_entity_id: Option<String>,
    pub confidence: f64,
    pub breakdown: Breakdown,
    pub methods: Vec<MatchMethod>,
    pub tier: QualityTier,
    pub requires_review: bool,
    pub flags: Vec<ReviewFlag>,
    pub verified: bool,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}
