//! Raw-signal scorers: bucket tables, great-circle distance, and
//! case/punctuation-normalized text comparison.

use crate::config::{CorrelationConfig, DayBucket, KmBucket, TimeBucket};
use crate::model::Coordinate;

// ---------------------------------------------------------------------------
// Bucket tables
// ---------------------------------------------------------------------------

/// First bucket whose bound covers `minutes` wins; past the table → None.
pub fn time_bucket_score(buckets: &[TimeBucket], minutes: i64) -> Option<f64> {
    buckets
        .iter()
        .find(|b| minutes <= b.max_minutes)
        .map(|b| b.score)
}

/// Day-gap score; past the table falls to `beyond_day_score`. The hard
/// cutoff (`max_day_gap`) is the caller's job, not this table's.
pub fn day_gap_score(config: &CorrelationConfig, days: i64) -> f64 {
    day_bucket_score(&config.day_buckets, days).unwrap_or(config.beyond_day_score)
}

fn day_bucket_score(buckets: &[DayBucket], days: i64) -> Option<f64> {
    buckets.iter().find(|b| days <= b.max_days).map(|b| b.score)
}

pub fn distance_score(config: &CorrelationConfig, km: f64) -> f64 {
    km_bucket_score(&config.km_buckets, km).unwrap_or(config.beyond_km_score)
}

fn km_bucket_score(buckets: &[KmBucket], km: f64) -> Option<f64> {
    buckets.iter().find(|b| km <= b.max_km).map(|b| b.score)
}

// ---------------------------------------------------------------------------
// Geospatial
// ---------------------------------------------------------------------------

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres (haversine).
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// How two names compared after normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TextClass {
    Exact,
    NormalizedExact,
    Fuzzy,
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_name(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Classify a pair of names; `None` when the fuzzy ratio falls below the
/// threshold. Exact and normalized-exact both carry ratio 1.0.
pub fn classify_text(a: &str, b: &str, fuzzy_threshold: f64) -> Option<(TextClass, f64)> {
    if a == b {
        return Some((TextClass::Exact, 1.0));
    }
    let na = normalize_name(a);
    let nb = normalize_name(b);
    if na.is_empty() || nb.is_empty() {
        return None;
    }
    if na == nb {
        return Some((TextClass::NormalizedExact, 1.0));
    }
    let ratio = strsim::jaro_winkler(&na, &nb);
    if ratio >= fuzzy_threshold {
        Some((TextClass::Fuzzy, ratio))
    } else {
        None
    }
}
