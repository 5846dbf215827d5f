//! Trip–delivery matchers: text similarity, geospatial proximity,
//! temporal proximity. All three run for every pair; the blender in
//! `blend.rs` combines whatever fired.

use crate::config::EngineConfig;
use crate::model::{
    DeliveryRecord, MatchMethod, MatchOutcome, MatchSignal, Trip, Vehicle,
};
use crate::score::{classify_text, day_gap_score, distance_score, haversine_km, TextClass};

/// Delivery docket vehicle text vs. the trip vehicle's registration.
pub fn match_text(delivery: &DeliveryRecord, vehicle: &Vehicle, config: &EngineConfig) -> MatchOutcome {
    let Some(ref text) = delivery.vehicle_text else {
        return MatchOutcome::NotApplicable;
    };
    match classify_text(text, &vehicle.registration, config.correlation.fuzzy_threshold) {
        Some((class, ratio)) => {
            let (method, score) = match class {
                TextClass::Exact => (MatchMethod::TextExact, 100.0),
                TextClass::NormalizedExact => (MatchMethod::TextNormalized, 100.0),
                TextClass::Fuzzy => (MatchMethod::TextFuzzy, ratio * 100.0),
            };
            MatchOutcome::Match(MatchSignal {
                method,
                score,
                entity_id: Some(delivery.id.clone()),
            })
        }
        None => MatchOutcome::NoMatch,
    }
}

/// Great-circle distance between the trip's end point and the delivery site.
pub fn match_geo(trip: &Trip, delivery: &DeliveryRecord, config: &EngineConfig) -> MatchOutcome {
    match geo_measure(trip, delivery) {
        Some((km, _)) => MatchOutcome::Match(MatchSignal {
            method: MatchMethod::GeoProximity,
            score: distance_score(&config.correlation, km),
            entity_id: Some(delivery.id.clone()),
        }),
        None => MatchOutcome::NotApplicable,
    }
}

/// Distance in km plus whether the trip ended inside the site's declared
/// service radius (None when the site declares none).
pub fn geo_measure(trip: &Trip, delivery: &DeliveryRecord) -> Option<(f64, Option<bool>)> {
    let end = trip.end_coordinate?;
    let site = delivery.coordinate?;
    let km = haversine_km(end, site);
    let within = delivery.service_radius_km.map(|r| km <= r);
    Some((km, within))
}

/// Calendar-day gap between trip end and delivery date.
pub fn day_gap(trip: &Trip, delivery: &DeliveryRecord) -> i64 {
    (trip.ended_at.date_naive() - delivery.delivery_date).num_days().abs()
}

/// Day-gap bucket score. Beyond the hard cutoff the pair is rejected
/// outright — the blender drops it before any record exists.
pub fn match_temporal(trip: &Trip, delivery: &DeliveryRecord, config: &EngineConfig) -> MatchOutcome {
    let days = day_gap(trip, delivery);
    if days > config.correlation.max_day_gap {
        return MatchOutcome::NoMatch;
    }
    MatchOutcome::Match(MatchSignal {
        method: MatchMethod::TemporalProximity,
        score: day_gap_score(&config.correlation, days),
        entity_id: Some(delivery.id.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Coordinate;
    use chrono::NaiveDate;

    fn trip_ending(date: &str, coord: Option<Coordinate>) -> Trip {
        let d = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        let ended_at = d.and_hms_opt(16, 30, 0).unwrap().and_utc();
        Trip {
            id: "trip_1".into(),
            vehicle_id: "veh_1".into(),
            started_at: ended_at - chrono::Duration::hours(2),
            ended_at,
            end_coordinate: coord,
            driver_ref: None,
        }
    }

    fn delivery(date: &str, coord: Option<Coordinate>, text: Option<&str>) -> DeliveryRecord {
        DeliveryRecord {
            id: "del_1".into(),
            vehicle_text: text.map(String::from),
            site_name: "Northgate Depot".into(),
            delivery_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            coordinate: coord,
            service_radius_km: Some(5.0),
        }
    }

    fn vehicle(reg: &str) -> Vehicle {
        Vehicle { id: "veh_1".into(), registration: reg.into(), fleet: "north".into() }
    }

    #[test]
    fn text_normalized_exact_scores_full() {
        let d = delivery("2026-03-10", None, Some("ab-12-cd"));
        let outcome = match_text(&d, &vehicle("AB 12 CD"), &EngineConfig::default());
        let signal = outcome.signal().unwrap();
        assert_eq!(signal.method, MatchMethod::TextNormalized);
        assert_eq!(signal.score, 100.0);
    }

    #[test]
    fn text_fuzzy_carries_ratio() {
        let d = delivery("2026-03-10", None, Some("AB12 CO"));
        let outcome = match_text(&d, &vehicle("AB12 CD"), &EngineConfig::default());
        let signal = outcome.signal().unwrap();
        assert_eq!(signal.method, MatchMethod::TextFuzzy);
        assert!(signal.score > 65.0 && signal.score < 100.0);
    }

    #[test]
    fn text_missing_docket_is_not_applicable() {
        let d = delivery("2026-03-10", None, None);
        assert_eq!(
            match_text(&d, &vehicle("AB12 CD"), &EngineConfig::default()),
            MatchOutcome::NotApplicable
        );
    }

    #[test]
    fn geo_close_site_scores_high_and_reports_radius() {
        let end = Coordinate { lat: 52.0, lon: 0.0 };
        // ~2.2 km north
        let site = Coordinate { lat: 52.02, lon: 0.0 };
        let trip = trip_ending("2026-03-10", Some(end));
        let d = delivery("2026-03-10", Some(site), None);
        let signal_score = match_geo(&trip, &d, &EngineConfig::default())
            .signal()
            .unwrap()
            .score;
        assert_eq!(signal_score, 95.0);
        let (km, within) = geo_measure(&trip, &d).unwrap();
        assert!(km < 5.0);
        assert_eq!(within, Some(true));
    }

    #[test]
    fn geo_without_coordinates_is_not_applicable() {
        let trip = trip_ending("2026-03-10", None);
        let d = delivery("2026-03-10", Some(Coordinate { lat: 52.0, lon: 0.0 }), None);
        assert_eq!(match_geo(&trip, &d, &EngineConfig::default()), MatchOutcome::NotApplicable);
    }

    #[test]
    fn temporal_same_day_scores_top_bucket() {
        let trip = trip_ending("2026-03-10", None);
        let d = delivery("2026-03-10", None, None);
        let signal = match_temporal(&trip, &d, &EngineConfig::default());
        assert_eq!(signal.signal().unwrap().score, 80.0);
    }

    #[test]
    fn temporal_past_buckets_scores_floor() {
        let trip = trip_ending("2026-03-20", None);
        let d = delivery("2026-03-10", None, None);
        let signal = match_temporal(&trip, &d, &EngineConfig::default());
        assert_eq!(signal.signal().unwrap().score, 20.0);
    }

    #[test]
    fn temporal_hard_cutoff_rejects() {
        let trip = trip_ending("2026-04-10", None);
        let d = delivery("2026-03-10", None, None); // 31 days
        assert_eq!(match_temporal(&trip, &d, &EngineConfig::default()), MatchOutcome::NoMatch);
    }
}
