//! Weighted blender for trip–delivery correlation.
//!
//! All applicable matchers run; their scores combine into one overall
//! confidence. Weight belonging to an inapplicable matcher is
//! redistributed proportionally among the rest — a matcher that was
//! evaluated and found nothing keeps its weight and contributes zero.

use crate::config::{EngineConfig, TierConfig};
use crate::delivery::{day_gap, geo_measure, match_geo, match_temporal, match_text};
use crate::model::{
    Breakdown, DeliveryCorrelation, DeliveryRecord, MatchOutcome, QualityTier, ReviewFlag, Trip,
    Vehicle,
};

/// Threshold function from overall confidence to tier. Applied uniformly,
/// regardless of how many matchers contributed.
pub fn quality_tier(confidence: f64, tiers: &TierConfig) -> QualityTier {
    if confidence >= tiers.excellent {
        QualityTier::Excellent
    } else if confidence >= tiers.good {
        QualityTier::Good
    } else if confidence >= tiers.fair {
        QualityTier::Fair
    } else {
        QualityTier::Poor
    }
}

/// Correlate one (trip, delivery) pair. Returns `None` past the temporal
/// hard cutoff — such pairs produce no record at all, even at poor quality.
pub fn correlate_delivery(
    trip: &Trip,
    vehicle: &Vehicle,
    delivery: &DeliveryRecord,
    config: &EngineConfig,
) -> Option<DeliveryCorrelation> {
    let days = day_gap(trip, delivery);
    if days > config.correlation.max_day_gap {
        return None;
    }

    let weighted = [
        (config.correlation.text_weight, match_text(delivery, vehicle, config)),
        (config.correlation.geo_weight, match_geo(trip, delivery, config)),
        (config.correlation.temporal_weight, match_temporal(trip, delivery, config)),
    ];

    let mut breakdown = Breakdown::new();
    let mut methods = Vec::new();
    let mut applicable_weight = 0.0;
    let mut weighted_sum = 0.0;

    for (weight, outcome) in &weighted {
        match outcome {
            MatchOutcome::NotApplicable => {}
            MatchOutcome::NoMatch => {
                applicable_weight += weight;
            }
            MatchOutcome::Match(signal) => {
                applicable_weight += weight;
                weighted_sum += weight * signal.score;
                breakdown.insert(signal.method, signal.score);
                methods.push(signal.method);
            }
        }
    }

    let confidence = if applicable_weight > 0.0 {
        (weighted_sum / applicable_weight).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let measure = geo_measure(trip, delivery);
    let distance_km = measure.map(|(km, _)| km);
    let within_service_radius = measure.and_then(|(_, within)| within);

    let mut flags = Vec::new();
    if confidence < config.review.min_confidence {
        flags.push(ReviewFlag::LowConfidence);
    }
    if days > config.review.max_day_gap {
        flags.push(ReviewFlag::LargeDateGap);
    }
    if distance_km.map_or(false, |km| km > config.review.max_distance_km) {
        flags.push(ReviewFlag::LongDistance);
    }

    Some(DeliveryCorrelation {
        trip_id: trip.id.clone(),
        delivery_id: delivery.id.clone(),
        confidence,
        breakdown,
        methods,
        tier: quality_tier(confidence, &config.tiers),
        requires_review: !flags.is_empty(),
        flags,
        distance_km,
        day_gap: Some(days),
        within_service_radius,
    })
}
