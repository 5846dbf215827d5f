//! Quality auditor: full matcher traces for a single subject and
//! aggregate coverage over a batch of attributions.
//!
//! Unlike the resolver, `explain_driver` never early-exits. Every matcher
//! in the cascade runs and reports, so a near-miss (a matcher that fired
//! below the winning tier) is visible instead of silently skipped.

use serde::Serialize;

use crate::blend::quality_tier;
use crate::config::EngineConfig;
use crate::delivery::{day_gap, geo_measure, match_geo, match_temporal, match_text};
use crate::driver::DRIVER_CASCADE;
use crate::model::{
    DeliveryRecord, DriverAttribution, DriverCandidates, MatchMethod, MatchOutcome, QualityTier,
    TelemetryEvent, Trip, Vehicle,
};

// ---------------------------------------------------------------------------
// Per-subject traces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    NotApplicable,
    NoMatch,
    Matched,
}

/// One matcher's verdict for one subject.
#[derive(Debug, Clone, Serialize)]
pub struct MatcherTrace {
    pub method: MatchMethod,
    pub outcome: TraceOutcome,
    pub score: Option<f64>,
    pub entity_id: Option<String>,
    /// True for the matcher the resolver would have committed to.
    pub selected: bool,
}

/// Every cascade matcher evaluated against one event, in priority order.
#[derive(Debug, Clone, Serialize)]
pub struct DriverTrace {
    pub subject_id: String,
    pub traces: Vec<MatcherTrace>,
    pub resolved: bool,
    pub confidence: f64,
    pub driver_id: Option<String>,
}

pub fn explain_driver(
    subject: &TelemetryEvent,
    candidates: &DriverCandidates,
    config: &EngineConfig,
) -> DriverTrace {
    let mut traces = Vec::with_capacity(DRIVER_CASCADE.len());
    let mut selected_at: Option<usize> = None;
    for (i, (method, matcher)) in DRIVER_CASCADE.iter().enumerate() {
        let outcome = matcher(subject, candidates, config);
        let trace = match outcome {
            MatchOutcome::NotApplicable => MatcherTrace {
                method: *method,
                outcome: TraceOutcome::NotApplicable,
                score: None,
                entity_id: None,
                selected: false,
            },
            MatchOutcome::NoMatch => MatcherTrace {
                method: *method,
                outcome: TraceOutcome::NoMatch,
                score: None,
                entity_id: None,
                selected: false,
            },
            MatchOutcome::Match(signal) => {
                let selected = selected_at.is_none();
                if selected {
                    selected_at = Some(i);
                }
                MatcherTrace {
                    method: *method,
                    outcome: TraceOutcome::Matched,
                    score: Some(signal.score),
                    entity_id: signal.entity_id,
                    selected,
                }
            }
        };
        traces.push(trace);
    }
    let winner = selected_at.map(|i| &traces[i]);
    DriverTrace {
        subject_id: subject.id.clone(),
        resolved: winner.is_some(),
        confidence: winner.and_then(|t| t.score).unwrap_or(0.0),
        driver_id: winner.and_then(|t| t.entity_id.clone()),
        traces,
    }
}

/// All three correlation matchers against one (trip, delivery) pair,
/// plus the geometry and calendar context the blender would see.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryTrace {
    pub trip_id: String,
    pub delivery_id: String,
    pub traces: Vec<MatcherTrace>,
    pub day_gap: i64,
    pub distance_km: Option<f64>,
    pub within_service_radius: Option<bool>,
    /// None when the pair sits past the temporal hard cutoff.
    pub confidence: Option<f64>,
    pub tier: Option<QualityTier>,
}

pub fn explain_delivery(
    trip: &Trip,
    vehicle: &Vehicle,
    delivery: &DeliveryRecord,
    config: &EngineConfig,
) -> DeliveryTrace {
    let weighted = [
        (config.correlation.text_weight, match_text(delivery, vehicle, config)),
        (config.correlation.geo_weight, match_geo(trip, delivery, config)),
        (config.correlation.temporal_weight, match_temporal(trip, delivery, config)),
    ];
    let methods = [
        MatchMethod::TextExact,
        MatchMethod::GeoProximity,
        MatchMethod::TemporalProximity,
    ];

    let mut traces = Vec::with_capacity(3);
    let mut applicable_weight = 0.0;
    let mut weighted_sum = 0.0;
    for (fallback, (weight, outcome)) in methods.iter().zip(&weighted) {
        let trace = match outcome {
            MatchOutcome::NotApplicable => MatcherTrace {
                method: *fallback,
                outcome: TraceOutcome::NotApplicable,
                score: None,
                entity_id: None,
                selected: false,
            },
            MatchOutcome::NoMatch => {
                applicable_weight += weight;
                MatcherTrace {
                    method: *fallback,
                    outcome: TraceOutcome::NoMatch,
                    score: None,
                    entity_id: None,
                    selected: false,
                }
            }
            MatchOutcome::Match(signal) => {
                applicable_weight += weight;
                weighted_sum += weight * signal.score;
                MatcherTrace {
                    method: signal.method,
                    outcome: TraceOutcome::Matched,
                    score: Some(signal.score),
                    entity_id: signal.entity_id.clone(),
                    selected: true,
                }
            }
        };
        traces.push(trace);
    }

    let days = day_gap(trip, delivery);
    let past_cutoff = days > config.correlation.max_day_gap;
    let confidence = if past_cutoff {
        None
    } else if applicable_weight > 0.0 {
        Some((weighted_sum / applicable_weight).clamp(0.0, 100.0))
    } else {
        Some(0.0)
    };
    let measure = geo_measure(trip, delivery);
    DeliveryTrace {
        trip_id: trip.id.clone(),
        delivery_id: delivery.id.clone(),
        traces,
        day_gap: days,
        distance_km: measure.map(|(km, _)| km),
        within_service_radius: measure.and_then(|(_, within)| within),
        tier: confidence.map(|c| quality_tier(c, &config.tiers)),
        confidence,
    }
}

// ---------------------------------------------------------------------------
// Batch coverage
// ---------------------------------------------------------------------------

/// Aggregate attribution quality over one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoverageSummary {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub by_method: Vec<(MatchMethod, usize)>,
    pub by_tier: Vec<(QualityTier, usize)>,
    pub avg_confidence: f64,
    pub below_review_floor: usize,
}

pub fn coverage_summary(attributions: &[DriverAttribution], config: &EngineConfig) -> CoverageSummary {
    let mut counts = std::collections::BTreeMap::new();
    let mut tier_counts = [0usize; 4];
    let mut resolved = 0;
    let mut below = 0;
    let mut sum = 0.0;
    for a in attributions {
        sum += a.confidence;
        if let Some(method) = a.method {
            resolved += 1;
            *counts.entry(method).or_insert(0usize) += 1;
        }
        let slot = match quality_tier(a.confidence, &config.tiers) {
            QualityTier::Excellent => 0,
            QualityTier::Good => 1,
            QualityTier::Fair => 2,
            QualityTier::Poor => 3,
        };
        tier_counts[slot] += 1;
        if a.confidence < config.review.min_confidence {
            below += 1;
        }
    }
    let tiers = [
        QualityTier::Excellent,
        QualityTier::Good,
        QualityTier::Fair,
        QualityTier::Poor,
    ];
    CoverageSummary {
        total: attributions.len(),
        resolved,
        unresolved: attributions.len() - resolved,
        by_method: counts.into_iter().collect(),
        by_tier: tiers
            .into_iter()
            .zip(tier_counts)
            .filter(|(_, n)| *n > 0)
            .collect(),
        avg_confidence: if attributions.is_empty() { 0.0 } else { sum / attributions.len() as f64 },
        below_review_floor: below,
    }
}
