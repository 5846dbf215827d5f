use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// All thresholds, weights, buckets, and candidate windows.
///
/// The numeric defaults are representative, not law — deployments tune
/// them per fleet. `validate()` keeps a tuned file internally consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub attribution: AttributionConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub tiers: TierConfig,
    #[serde(default)]
    pub windows: WindowConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attribution: AttributionConfig::default(),
            correlation: CorrelationConfig::default(),
            review: ReviewConfig::default(),
            tiers: TierConfig::default(),
            windows: WindowConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver attribution
// ---------------------------------------------------------------------------

/// One score bucket: a candidate within `max_minutes` of the subject
/// scores `score` (first matching bucket wins).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeBucket {
    pub max_minutes: i64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Score for an embedded identifier the roster resolves.
    pub direct_score: f64,
    /// Used when an assignment carries no recorded confidence.
    pub assignment_default_score: f64,
    /// Subject timestamp falls inside a trip's interval.
    pub trip_containment_score: f64,
    pub tight_buckets: Vec<TimeBucket>,
    pub loose_buckets: Vec<TimeBucket>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            direct_score: 100.0,
            assignment_default_score: 80.0,
            trip_containment_score: 65.0,
            tight_buckets: vec![
                TimeBucket { max_minutes: 30, score: 80.0 },
                TimeBucket { max_minutes: 60, score: 70.0 },
            ],
            loose_buckets: vec![
                TimeBucket { max_minutes: 120, score: 55.0 },
                TimeBucket { max_minutes: 240, score: 50.0 },
                TimeBucket { max_minutes: 1440, score: 45.0 },
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Trip–delivery correlation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DayBucket {
    pub max_days: i64,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KmBucket {
    pub max_km: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub text_weight: f64,
    pub geo_weight: f64,
    pub temporal_weight: f64,
    /// Fuzzy text similarity floor (Jaro-Winkler ratio).
    pub fuzzy_threshold: f64,
    pub day_buckets: Vec<DayBucket>,
    /// Score past the last day bucket (still inside the hard cutoff).
    pub beyond_day_score: f64,
    /// Pairs further apart than this produce no record at all.
    pub max_day_gap: i64,
    pub km_buckets: Vec<KmBucket>,
    pub beyond_km_score: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            text_weight: 0.4,
            geo_weight: 0.4,
            temporal_weight: 0.2,
            fuzzy_threshold: 0.65,
            day_buckets: vec![
                DayBucket { max_days: 1, score: 80.0 },
                DayBucket { max_days: 2, score: 60.0 },
                DayBucket { max_days: 3, score: 40.0 },
            ],
            beyond_day_score: 20.0,
            max_day_gap: 30,
            km_buckets: vec![
                KmBucket { max_km: 5.0, score: 95.0 },
                KmBucket { max_km: 10.0, score: 85.0 },
                KmBucket { max_km: 20.0, score: 70.0 },
                KmBucket { max_km: 50.0, score: 55.0 },
            ],
            beyond_km_score: 30.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Review triggers + tiers + candidate windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub min_confidence: f64,
    pub max_day_gap: i64,
    pub max_distance_km: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            min_confidence: 60.0,
            max_day_gap: 3,
            max_distance_km: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub excellent: f64,
    pub good: f64,
    pub fair: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            excellent: 90.0,
            good: 75.0,
            fair: 60.0,
        }
    }
}

/// Mandatory bounds the candidate indexer applies before any matcher runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// ± minutes for same-source event candidates (covers both buckets).
    pub event_minutes: i64,
    /// ± days for delivery candidates around a trip's end date.
    pub delivery_days: i64,
    /// Radius for spatial delivery candidates, when the trip has a coordinate.
    pub delivery_radius_km: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            event_minutes: 1440,
            delivery_days: 30,
            delivery_radius_km: 200.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl EngineConfig {
    pub fn from_toml(input: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            toml::from_str(input).map_err(|e| EngineError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let c = &self.correlation;
        for (name, w) in [
            ("text_weight", c.text_weight),
            ("geo_weight", c.geo_weight),
            ("temporal_weight", c.temporal_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(EngineError::ConfigValidation(format!(
                    "{name} must be in [0,1], got {w}"
                )));
            }
        }
        let sum = c.text_weight + c.geo_weight + c.temporal_weight;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(EngineError::ConfigValidation(format!(
                "blend weights must sum to 1.0, got {sum}"
            )));
        }

        if !(0.0 < c.fuzzy_threshold && c.fuzzy_threshold <= 1.0) {
            return Err(EngineError::ConfigValidation(format!(
                "fuzzy_threshold must be in (0,1], got {}",
                c.fuzzy_threshold
            )));
        }

        if c.max_day_gap < 1 {
            return Err(EngineError::ConfigValidation(
                "max_day_gap must be at least 1 day".into(),
            ));
        }
        if let Some(last) = c.day_buckets.last() {
            if last.max_days > c.max_day_gap {
                return Err(EngineError::ConfigValidation(format!(
                    "day bucket bound {} exceeds max_day_gap {}",
                    last.max_days, c.max_day_gap
                )));
            }
        }

        validate_ascending("tight_buckets", self.attribution.tight_buckets.iter().map(|b| b.max_minutes as f64))?;
        validate_ascending("loose_buckets", self.attribution.loose_buckets.iter().map(|b| b.max_minutes as f64))?;
        validate_ascending("day_buckets", c.day_buckets.iter().map(|b| b.max_days as f64))?;
        validate_ascending("km_buckets", c.km_buckets.iter().map(|b| b.max_km))?;

        for (name, score) in self.all_scores() {
            if !(0.0..=100.0).contains(&score) {
                return Err(EngineError::ConfigValidation(format!(
                    "{name} score {score} outside [0,100]"
                )));
            }
        }

        let t = &self.tiers;
        if !(t.excellent > t.good && t.good > t.fair && t.fair > 0.0) {
            return Err(EngineError::ConfigValidation(format!(
                "tier thresholds must be strictly descending: excellent={} good={} fair={}",
                t.excellent, t.good, t.fair
            )));
        }

        let w = &self.windows;
        if w.event_minutes < 1 || w.delivery_days < 1 || w.delivery_radius_km <= 0.0 {
            return Err(EngineError::ConfigValidation(
                "candidate windows must be positive".into(),
            ));
        }

        Ok(())
    }

    fn all_scores(&self) -> Vec<(&'static str, f64)> {
        let a = &self.attribution;
        let c = &self.correlation;
        let mut scores = vec![
            ("direct_score", a.direct_score),
            ("assignment_default_score", a.assignment_default_score),
            ("trip_containment_score", a.trip_containment_score),
            ("beyond_day_score", c.beyond_day_score),
            ("beyond_km_score", c.beyond_km_score),
        ];
        scores.extend(a.tight_buckets.iter().map(|b| ("tight_buckets", b.score)));
        scores.extend(a.loose_buckets.iter().map(|b| ("loose_buckets", b.score)));
        scores.extend(c.day_buckets.iter().map(|b| ("day_buckets", b.score)));
        scores.extend(c.km_buckets.iter().map(|b| ("km_buckets", b.score)));
        scores
    }
}

fn validate_ascending(
    name: &str,
    bounds: impl Iterator<Item = f64>,
) -> Result<(), EngineError> {
    let mut prev: Option<f64> = None;
    for b in bounds {
        if let Some(p) = prev {
            if b <= p {
                return Err(EngineError::ConfigValidation(format!(
                    "{name} bounds must be strictly ascending ({p} then {b})"
                )));
            }
        }
        prev = Some(b);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
