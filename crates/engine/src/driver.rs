//! Driver attribution: five strategy matchers and the cascading resolver.
//!
//! The resolver walks `DRIVER_CASCADE` in fixed priority order and commits
//! to the first matcher that fires — scores are never blended across tiers.

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::model::{
    Breakdown, Driver, DriverAttribution, DriverCandidates, MatchMethod, MatchOutcome,
    MatchSignal, TelemetryEvent, Trip, VehicleAssignment,
};
use crate::score::{normalize_name, time_bucket_score};

pub type DriverMatcher = fn(&TelemetryEvent, &DriverCandidates, &EngineConfig) -> MatchOutcome;

/// Fixed priority order. The auditor iterates the same list without
/// early exit, so matcher order is defined exactly once.
pub const DRIVER_CASCADE: [(MatchMethod, DriverMatcher); 5] = [
    (MatchMethod::DirectSource, match_direct_source),
    (MatchMethod::VehicleAssignment, match_vehicle_assignment),
    (MatchMethod::TimeWindowTight, match_time_window_tight),
    (MatchMethod::TripContainment, match_trip_containment),
    (MatchMethod::TimeWindowLoose, match_time_window_loose),
];

/// Resolve one event to a driver, stopping at the first matcher that fires.
/// Nothing firing still yields a value (confidence 0) so the gap is auditable.
pub fn resolve_driver(
    subject: &TelemetryEvent,
    candidates: &DriverCandidates,
    config: &EngineConfig,
) -> DriverAttribution {
    for (method, matcher) in DRIVER_CASCADE {
        if let MatchOutcome::Match(signal) = matcher(subject, candidates, config) {
            let mut breakdown = Breakdown::new();
            breakdown.insert(method, signal.score);
            return DriverAttribution {
                subject_id: subject.id.clone(),
                driver_id: signal.entity_id,
                confidence: signal.score,
                method: Some(method),
                breakdown,
            };
        }
    }
    DriverAttribution::unresolved(&subject.id)
}

// ---------------------------------------------------------------------------
// Roster lookup
// ---------------------------------------------------------------------------

/// Resolve a free-text driver reference against the roster: id, canonical
/// name, then per-source aliases, all after normalization.
pub fn resolve_ref<'a>(reference: &str, drivers: &'a [Driver]) -> Option<&'a Driver> {
    let normalized = normalize_name(reference);
    if normalized.is_empty() {
        return None;
    }
    drivers.iter().find(|d| {
        d.id == reference
            || normalize_name(&d.name) == normalized
            || d.aliases.iter().any(|a| normalize_name(&a.alias) == normalized)
    })
}

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

/// The candidate already embeds a known identifier.
fn match_direct_source(
    subject: &TelemetryEvent,
    candidates: &DriverCandidates,
    config: &EngineConfig,
) -> MatchOutcome {
    let Some(ref reference) = subject.driver_ref else {
        return MatchOutcome::NotApplicable;
    };
    match resolve_ref(reference, &candidates.drivers) {
        Some(driver) => MatchOutcome::Match(MatchSignal {
            method: MatchMethod::DirectSource,
            score: config.attribution.direct_score,
            entity_id: Some(driver.id.clone()),
        }),
        None => MatchOutcome::NoMatch,
    }
}

/// Assignment active at the subject's timestamp. Overlaps resolve to the
/// most authoritative: recorded confidence, then recency, then id.
fn match_vehicle_assignment(
    subject: &TelemetryEvent,
    candidates: &DriverCandidates,
    config: &EngineConfig,
) -> MatchOutcome {
    let default = config.attribution.assignment_default_score;
    let mut active: Vec<&VehicleAssignment> = candidates
        .assignments
        .iter()
        .filter(|a| {
            a.valid_from <= subject.occurred_at
                && a.valid_until.map_or(true, |until| subject.occurred_at < until)
        })
        .collect();
    if active.is_empty() {
        return MatchOutcome::NoMatch;
    }
    active.sort_by(|a, b| {
        let ca = a.confidence.unwrap_or(default / 100.0);
        let cb = b.confidence.unwrap_or(default / 100.0);
        cb.partial_cmp(&ca)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.valid_from.cmp(&a.valid_from))
            .then_with(|| a.id.cmp(&b.id))
    });
    let best = active[0];
    let score = best
        .confidence
        .map(|c| (c * 100.0).clamp(0.0, 100.0))
        .unwrap_or(default);
    MatchOutcome::Match(MatchSignal {
        method: MatchMethod::VehicleAssignment,
        score,
        entity_id: Some(best.driver_id.clone()),
    })
}

fn match_time_window_tight(
    subject: &TelemetryEvent,
    candidates: &DriverCandidates,
    config: &EngineConfig,
) -> MatchOutcome {
    match_time_window(subject, candidates, &config.attribution.tight_buckets, MatchMethod::TimeWindowTight)
}

fn match_time_window_loose(
    subject: &TelemetryEvent,
    candidates: &DriverCandidates,
    config: &EngineConfig,
) -> MatchOutcome {
    match_time_window(subject, candidates, &config.attribution.loose_buckets, MatchMethod::TimeWindowLoose)
}

/// Nearest same-vehicle reading that names a resolvable driver.
/// Exact |Δt| ties break toward the earlier-occurring candidate, then id.
fn match_time_window(
    subject: &TelemetryEvent,
    candidates: &DriverCandidates,
    buckets: &[crate::config::TimeBucket],
    method: MatchMethod,
) -> MatchOutcome {
    let mut qualifying: Vec<(i64, DateTime<Utc>, &str, &Driver)> = Vec::new();
    for event in &candidates.window_events {
        if event.id == subject.id {
            continue;
        }
        let Some(ref reference) = event.driver_ref else {
            continue;
        };
        let Some(driver) = resolve_ref(reference, &candidates.drivers) else {
            continue;
        };
        let minutes = (event.occurred_at - subject.occurred_at).num_minutes().abs();
        if time_bucket_score(buckets, minutes).is_some() {
            qualifying.push((minutes, event.occurred_at, event.id.as_str(), driver));
        }
    }
    if qualifying.is_empty() {
        return MatchOutcome::NoMatch;
    }
    qualifying.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)).then_with(|| a.2.cmp(b.2)));
    let (minutes, _, _, driver) = qualifying[0];
    // Bucket membership was checked above; the lookup cannot miss here.
    let score = time_bucket_score(buckets, minutes).unwrap_or(0.0);
    MatchOutcome::Match(MatchSignal {
        method,
        score,
        entity_id: Some(driver.id.clone()),
    })
}

/// Subject timestamp falls inside a trip interval whose trip names a
/// resolvable driver. Shortest containing trip wins.
fn match_trip_containment(
    subject: &TelemetryEvent,
    candidates: &DriverCandidates,
    config: &EngineConfig,
) -> MatchOutcome {
    let mut containing: Vec<(&Trip, &Driver)> = Vec::new();
    for trip in &candidates.trips {
        if trip.started_at <= subject.occurred_at && subject.occurred_at <= trip.ended_at {
            let Some(ref reference) = trip.driver_ref else {
                continue;
            };
            if let Some(driver) = resolve_ref(reference, &candidates.drivers) {
                containing.push((trip, driver));
            }
        }
    }
    if containing.is_empty() {
        return MatchOutcome::NoMatch;
    }
    containing.sort_by(|(a, _), (b, _)| {
        let len_a = a.ended_at - a.started_at;
        let len_b = b.ended_at - b.started_at;
        len_a
            .cmp(&len_b)
            .then_with(|| a.started_at.cmp(&b.started_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    let (_, driver) = containing[0];
    MatchOutcome::Match(MatchSignal {
        method: MatchMethod::TripContainment,
        score: config.attribution.trip_containment_score,
        entity_id: Some(driver.id.clone()),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DriverAlias;
    use chrono::TimeZone;

    fn at(hm: &str) -> DateTime<Utc> {
        let (h, m) = hm.split_once(':').unwrap();
        Utc.with_ymd_and_hms(2026, 3, 10, h.parse().unwrap(), m.parse().unwrap(), 0)
            .unwrap()
    }

    fn event(id: &str, time: &str, driver_ref: Option<&str>) -> TelemetryEvent {
        TelemetryEvent {
            id: id.into(),
            vehicle_id: "veh_1".into(),
            occurred_at: at(time),
            coordinate: None,
            driver_ref: driver_ref.map(String::from),
            source: "telematics".into(),
        }
    }

    fn driver(id: &str, name: &str, aliases: &[&str]) -> Driver {
        Driver {
            id: id.into(),
            name: name.into(),
            aliases: aliases
                .iter()
                .map(|a| DriverAlias { source: "telematics".into(), alias: (*a).into() })
                .collect(),
        }
    }

    fn assignment(id: &str, driver_id: &str, from: &str, until: Option<&str>, conf: Option<f64>) -> VehicleAssignment {
        VehicleAssignment {
            id: id.into(),
            vehicle_id: "veh_1".into(),
            driver_id: driver_id.into(),
            valid_from: at(from),
            valid_until: until.map(at),
            kind: "roster".into(),
            confidence: conf,
        }
    }

    fn roster() -> Vec<Driver> {
        vec![
            driver("drv_1", "Priya Patel", &["p.patel"]),
            driver("drv_2", "Jon Smith", &["jsmith"]),
        ]
    }

    #[test]
    fn assignment_attribution_scenario() {
        // Event at 14:00, active assignment to drv_1 at confidence 0.85.
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates {
            drivers: roster(),
            assignments: vec![assignment("asg_1", "drv_1", "08:00", Some("18:00"), Some(0.85))],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert_eq!(result.method, Some(MatchMethod::VehicleAssignment));
        assert_eq!(result.confidence, 85.0);
        assert_eq!(result.driver_id.as_deref(), Some("drv_1"));
        assert_eq!(result.breakdown[&MatchMethod::VehicleAssignment], 85.0);
    }

    #[test]
    fn tight_window_scenario() {
        // No assignment, but a same-vehicle reading 25 minutes later
        // names a roster driver → tight bucket (≤30 min) scores 80.
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates {
            drivers: roster(),
            window_events: vec![event("evt_2", "14:25", Some("Jon Smith"))],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert_eq!(result.method, Some(MatchMethod::TimeWindowTight));
        assert_eq!(result.confidence, 80.0);
        assert_eq!(result.driver_id.as_deref(), Some("drv_2"));
    }

    #[test]
    fn direct_source_beats_assignment() {
        let subject = event("evt_1", "14:00", Some("p.patel"));
        let candidates = DriverCandidates {
            drivers: roster(),
            assignments: vec![assignment("asg_1", "drv_2", "08:00", None, Some(0.99))],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert_eq!(result.method, Some(MatchMethod::DirectSource));
        assert_eq!(result.confidence, 100.0);
        assert_eq!(result.driver_id.as_deref(), Some("drv_1"));
    }

    #[test]
    fn direct_source_unresolvable_falls_through() {
        let subject = event("evt_1", "14:00", Some("badge_9999"));
        let candidates = DriverCandidates {
            drivers: roster(),
            assignments: vec![assignment("asg_1", "drv_1", "08:00", None, None)],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        // Unknown embedded ref is NoMatch, not an answer — cascade continues.
        assert_eq!(result.method, Some(MatchMethod::VehicleAssignment));
        assert_eq!(result.confidence, 80.0);
    }

    #[test]
    fn missing_ref_is_not_applicable() {
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates { drivers: roster(), ..Default::default() };
        let outcome = match_direct_source(&subject, &candidates, &EngineConfig::default());
        assert_eq!(outcome, MatchOutcome::NotApplicable);
    }

    #[test]
    fn expired_assignment_does_not_fire() {
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates {
            drivers: roster(),
            assignments: vec![assignment("asg_1", "drv_1", "06:00", Some("12:00"), None)],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert!(!result.is_resolved());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn overlapping_assignments_pick_most_authoritative() {
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates {
            drivers: roster(),
            assignments: vec![
                assignment("asg_1", "drv_1", "08:00", None, Some(0.7)),
                assignment("asg_2", "drv_2", "09:00", None, Some(0.9)),
            ],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert_eq!(result.driver_id.as_deref(), Some("drv_2"));
        assert_eq!(result.confidence, 90.0);
    }

    #[test]
    fn overlapping_equal_confidence_picks_most_recent() {
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates {
            drivers: roster(),
            assignments: vec![
                assignment("asg_1", "drv_1", "08:00", None, Some(0.8)),
                assignment("asg_2", "drv_2", "12:00", None, Some(0.8)),
            ],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert_eq!(result.driver_id.as_deref(), Some("drv_2"));
    }

    #[test]
    fn tie_breaks_toward_earlier_candidate() {
        // Two candidates exactly 30 minutes before and after the subject.
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates {
            drivers: roster(),
            window_events: vec![
                event("evt_after", "14:30", Some("Jon Smith")),
                event("evt_before", "13:30", Some("Priya Patel")),
            ],
            ..Default::default()
        };
        // Deterministic across repeated runs regardless of input order.
        for _ in 0..3 {
            let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
            assert_eq!(result.driver_id.as_deref(), Some("drv_1"));
            assert_eq!(result.confidence, 80.0);
        }
    }

    #[test]
    fn nearest_candidate_wins() {
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates {
            drivers: roster(),
            window_events: vec![
                event("evt_far", "14:50", Some("Priya Patel")),
                event("evt_near", "14:10", Some("Jon Smith")),
            ],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert_eq!(result.driver_id.as_deref(), Some("drv_2"));
        assert_eq!(result.confidence, 80.0);
    }

    #[test]
    fn second_tight_bucket_scores_lower() {
        let subject = event("evt_1", "14:00", None);
        let candidates = DriverCandidates {
            drivers: roster(),
            window_events: vec![event("evt_2", "14:45", Some("Jon Smith"))],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert_eq!(result.method, Some(MatchMethod::TimeWindowTight));
        assert_eq!(result.confidence, 70.0);
    }

    #[test]
    fn loose_window_buckets() {
        let config = EngineConfig::default();
        for (time, expected) in [("15:30", 55.0), ("17:00", 50.0), ("23:00", 45.0)] {
            let subject = event("evt_1", "14:00", None);
            let candidates = DriverCandidates {
                drivers: roster(),
                window_events: vec![event("evt_2", time, Some("Jon Smith"))],
                ..Default::default()
            };
            let result = resolve_driver(&subject, &candidates, &config);
            assert_eq!(result.method, Some(MatchMethod::TimeWindowLoose), "at {time}");
            assert_eq!(result.confidence, expected, "at {time}");
        }
    }

    #[test]
    fn trip_containment_outranks_loose_window() {
        let subject = event("evt_1", "14:00", None);
        let trip = Trip {
            id: "trip_1".into(),
            vehicle_id: "veh_1".into(),
            started_at: at("13:00"),
            ended_at: at("15:00"),
            end_coordinate: None,
            driver_ref: Some("jsmith".into()),
        };
        let candidates = DriverCandidates {
            drivers: roster(),
            trips: vec![trip],
            window_events: vec![event("evt_2", "16:30", Some("Priya Patel"))],
            ..Default::default()
        };
        let result = resolve_driver(&subject, &candidates, &EngineConfig::default());
        assert_eq!(result.method, Some(MatchMethod::TripContainment));
        assert_eq!(result.confidence, 65.0);
        assert_eq!(result.driver_id.as_deref(), Some("drv_2"));
    }

    #[test]
    fn unresolved_subject_still_produces_record() {
        let subject = event("evt_1", "14:00", None);
        let result = resolve_driver(&subject, &DriverCandidates::default(), &EngineConfig::default());
        assert_eq!(result.subject_id, "evt_1");
        assert_eq!(result.confidence, 0.0);
        assert!(result.method.is_none());
        assert!(result.breakdown.is_empty());
    }
}
