//! Accept / adjust / reject policy for candidate distance deltas.
//!
//! Pure functions over a [`DeltaInput`] and a [`FilterConfig`]; the caller
//! supplies the rolling mean and stationary state, and decides what to do
//! with the verdict. Nothing here logs or keeps state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{FilterConfig, FilterPolicy};
use crate::types::LocationSample;

/// At or below this horizontal accuracy (meters) the raw delta is trusted.
pub const HYBRID_ACCURACY_THRESHOLD: f64 = 10.0;

/// Multiplier for both rolling-average caps.
pub const OUTLIER_FACTOR: f64 = 3.0;

/// Rolling means at or below this are treated as "no history".
const MIN_ROLLING_MEAN: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterDecision {
    Accept,
    Adjust,
    Reject,
}

impl FilterDecision {
    /// Whether the delta contributes to the odometer.
    pub fn is_counted(self) -> bool {
        !matches!(self, FilterDecision::Reject)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterReason {
    Nominal,
    NonMonotonicTime,
    Burst,
    ImpliedSpeed,
    RollingOutlier,
    BurstAndImpliedSpeed,
    StationaryNoise,
}

impl FilterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterReason::Nominal => "ok",
            FilterReason::NonMonotonicTime => "non-monotonic-time",
            FilterReason::Burst => "burst",
            FilterReason::ImpliedSpeed => "implied-speed",
            FilterReason::RollingOutlier => "rolling-outlier",
            FilterReason::BurstAndImpliedSpeed => "burst+implied-speed",
            FilterReason::StationaryNoise => "stationary-noise",
        }
    }
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which anomaly checks tripped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterFlags {
    pub burst: bool,
    pub implied_speed: bool,
    pub rolling_outlier: bool,
    pub stationary_noise: bool,
}

impl FilterFlags {
    pub fn any_cap(&self) -> bool {
        self.burst || self.implied_speed || self.rolling_outlier
    }

    fn primary_reason(&self) -> FilterReason {
        if self.burst && self.implied_speed {
            FilterReason::BurstAndImpliedSpeed
        } else if self.burst {
            FilterReason::Burst
        } else if self.implied_speed {
            FilterReason::ImpliedSpeed
        } else if self.rolling_outlier {
            FilterReason::RollingOutlier
        } else if self.stationary_noise {
            FilterReason::StationaryNoise
        } else {
            FilterReason::Nominal
        }
    }
}

/// Per-sample numbers behind a verdict, for `filterDebug` inspection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterMetrics {
    pub raw_delta: f64,
    pub effective_delta: f64,
    pub selected_delta: f64,
    pub candidate_delta: f64,
    pub elapsed: f64,
    pub implied_speed: f64,
    pub rolling_mean: Option<f64>,
    pub burst_cap: Option<f64>,
    pub speed_cap: Option<f64>,
    pub rolling_cap: Option<f64>,
    pub flags: FilterFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterVerdict {
    pub decision: FilterDecision,
    /// Meters credited to the odometer; 0 on reject.
    pub capped_delta: f64,
    pub reason: FilterReason,
    pub metrics: FilterMetrics,
}

/// Everything the policy needs to know about one step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeltaInput {
    /// Geodesic distance between the previous and current fix.
    pub raw_delta: f64,
    /// `raw_delta` minus the combined accuracy error, floored at 0.
    pub effective_delta: f64,
    /// Hybrid choice between raw and effective.
    pub selected_delta: f64,
    /// The delta being judged (selected, possibly Kalman-smoothed).
    pub candidate_delta: f64,
    /// Seconds between the fixes.
    pub elapsed: f64,
    pub rolling_mean: Option<f64>,
    pub stationary: bool,
}

impl DeltaInput {
    pub fn between(previous: &LocationSample, current: &LocationSample) -> Self {
        let raw_delta = previous.distance_to(current);
        let effective_delta = effective_delta(raw_delta, current.accuracy, previous.accuracy);
        let selected_delta = select_delta(raw_delta, effective_delta, current.accuracy);
        DeltaInput {
            raw_delta,
            effective_delta,
            selected_delta,
            candidate_delta: selected_delta,
            elapsed: current.seconds_since(previous),
            rolling_mean: None,
            stationary: false,
        }
    }

    pub fn with_candidate(mut self, candidate: f64) -> Self {
        self.candidate_delta = candidate;
        self
    }

    pub fn with_rolling_mean(mut self, mean: Option<f64>) -> Self {
        self.rolling_mean = mean;
        self
    }

    pub fn with_stationary(mut self, stationary: bool) -> Self {
        self.stationary = stationary;
        self
    }
}

/// Raw delta less the propagated accuracy of both endpoints, never negative.
pub fn effective_delta(raw_delta: f64, accuracy: f64, prior_accuracy: f64) -> f64 {
    let error = (accuracy * accuracy + prior_accuracy * prior_accuracy).sqrt();
    (raw_delta - error).max(0.0)
}

/// Trust the raw delta for precise fixes, subtract the noise floor otherwise.
pub fn select_delta(raw_delta: f64, effective_delta: f64, accuracy: f64) -> f64 {
    if accuracy <= HYBRID_ACCURACY_THRESHOLD {
        raw_delta
    } else {
        effective_delta
    }
}

pub fn evaluate(input: &DeltaInput, config: &FilterConfig) -> FilterVerdict {
    let config = config.clamped();
    let elapsed = input.elapsed;

    let mut metrics = FilterMetrics {
        raw_delta: input.raw_delta,
        effective_delta: input.effective_delta,
        selected_delta: input.selected_delta,
        candidate_delta: input.candidate_delta,
        elapsed,
        rolling_mean: input.rolling_mean,
        ..FilterMetrics::default()
    };

    // NaN elapsed lands here too
    if !(elapsed > 0.0) {
        return FilterVerdict {
            decision: FilterDecision::Reject,
            capped_delta: 0.0,
            reason: FilterReason::NonMonotonicTime,
            metrics,
        };
    }

    let candidate = if input.candidate_delta.is_finite() {
        input.candidate_delta.max(0.0)
    } else {
        0.0
    };
    let implied_speed = input.raw_delta / elapsed;
    metrics.implied_speed = implied_speed;

    // Burst: a big single step inside the burst window
    let burst_cap = config.max_burst_distance;
    let burst = input.raw_delta > burst_cap && elapsed <= config.burst_window;

    // Implied speed
    let speed_cap = config.max_implied_speed * elapsed;
    let implied = implied_speed > config.max_implied_speed;

    // Rolling average: no cap from an empty/zero mean or a zero distance filter
    let mean_cap = input
        .rolling_mean
        .filter(|m| *m > MIN_ROLLING_MEAN)
        .map(|m| OUTLIER_FACTOR * m);
    let distance_filter_cap =
        (config.distance_filter > 0.0).then(|| OUTLIER_FACTOR * config.distance_filter);
    let rolling_cap = match (mean_cap, distance_filter_cap) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let rolling = rolling_cap.map_or(false, |cap| candidate > cap);

    let stationary_noise = input.stationary
        && config.stationary_noise_floor > 0.0
        && candidate < config.stationary_noise_floor;

    let flags = FilterFlags {
        burst,
        implied_speed: implied,
        rolling_outlier: rolling,
        stationary_noise,
    };
    metrics.burst_cap = (elapsed <= config.burst_window).then_some(burst_cap);
    metrics.speed_cap = Some(speed_cap);
    metrics.rolling_cap = rolling_cap;
    metrics.flags = flags;

    let verdict = |decision, capped_delta, reason| FilterVerdict {
        decision,
        capped_delta,
        reason,
        metrics,
    };

    match config.policy {
        FilterPolicy::PassThrough => {
            verdict(FilterDecision::Accept, candidate, flags.primary_reason())
        }
        FilterPolicy::Adjust | FilterPolicy::Conservative => {
            if stationary_noise {
                return verdict(FilterDecision::Reject, 0.0, FilterReason::StationaryNoise);
            }
            if config.policy == FilterPolicy::Conservative && burst && implied {
                return verdict(FilterDecision::Reject, 0.0, FilterReason::BurstAndImpliedSpeed);
            }
            if !flags.any_cap() {
                return verdict(FilterDecision::Accept, candidate, FilterReason::Nominal);
            }

            // Smallest active cap wins
            let caps = [
                (burst, burst_cap, FilterReason::Burst),
                (implied, speed_cap, FilterReason::ImpliedSpeed),
                (rolling, rolling_cap.unwrap_or(f64::INFINITY), FilterReason::RollingOutlier),
            ];
            let (cap, reason) = caps
                .iter()
                .filter(|(active, _, _)| *active)
                .map(|(_, cap, reason)| (*cap, *reason))
                .fold((f64::INFINITY, FilterReason::Nominal), |best, next| {
                    if next.0 < best.0 {
                        next
                    } else {
                        best
                    }
                });

            verdict(FilterDecision::Adjust, candidate.min(cap), reason)
        }
    }
}
