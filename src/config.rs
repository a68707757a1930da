//! Filter configuration snapshot.
//!
//! A `FilterConfig` is a plain value: callers build one (or load it from JSON),
//! hand it to each `evaluate`/`update` call, and produce a new value to change
//! behaviour. Nothing in the pipeline mutates it. Out-of-range values are
//! tolerated on input and clamped by [`FilterConfig::clamped`] at evaluation
//! time.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OdometerError, Result};

/// Preset for the Kalman smoother's noise tuning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KalmanProfile {
    /// Balanced
    #[default]
    Default,
    /// Very smooth, slow to react
    Aggressive,
    /// Quick to react, less smoothing
    Conservative,
}

impl KalmanProfile {
    /// Multiplier applied to the process-noise variance Q.
    pub fn q_scale(self) -> f64 {
        match self {
            KalmanProfile::Default => 1.0,
            KalmanProfile::Aggressive => 0.5,
            KalmanProfile::Conservative => 2.0,
        }
    }

    /// Multiplier applied to the measurement-noise variance R.
    pub fn r_scale(self) -> f64 {
        match self {
            KalmanProfile::Default => 1.0,
            KalmanProfile::Aggressive => 1.5,
            KalmanProfile::Conservative => 0.75,
        }
    }
}

impl FromStr for KalmanProfile {
    type Err = OdometerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(KalmanProfile::Default),
            "aggressive" => Ok(KalmanProfile::Aggressive),
            "conservative" => Ok(KalmanProfile::Conservative),
            other => Err(OdometerError::InvalidConfig(format!(
                "unknown kalman profile '{}'",
                other
            ))),
        }
    }
}

/// How the policy engine treats dubious deltas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterPolicy {
    /// Never reject or cap; statistics only.
    PassThrough,
    /// Accept, but cap overly large deltas.
    Adjust,
    /// Reject clearly implausible bursts and cap the rest.
    #[default]
    Conservative,
}

impl fmt::Display for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterPolicy::PassThrough => "pass-through",
            FilterPolicy::Adjust => "adjust",
            FilterPolicy::Conservative => "conservative",
        };
        f.write_str(name)
    }
}

impl FromStr for FilterPolicy {
    type Err = OdometerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "passthrough" => Ok(FilterPolicy::PassThrough),
            "adjust" => Ok(FilterPolicy::Adjust),
            "conservative" => Ok(FilterPolicy::Conservative),
            _ => Err(OdometerError::InvalidConfig(format!(
                "unknown filter policy '{}'",
                s
            ))),
        }
    }
}

// Valid ranges
pub const IMPLIED_SPEED_RANGE: (f64, f64) = (1.0, 200.0);
pub const BURST_DISTANCE_RANGE: (f64, f64) = (5.0, 2000.0);
pub const BURST_WINDOW_RANGE: (f64, f64) = (0.2, 120.0);
pub const ROLLING_WINDOW_RANGE: (usize, usize) = (3, 20);
pub const ACCURACY_THRESHOLD_RANGE: (f64, f64) = (0.0, 500.0);

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterConfig {
    pub use_kalman: bool,
    pub kalman_profile: KalmanProfile,
    pub policy: FilterPolicy,
    /// m/s
    pub max_implied_speed: f64,
    /// meters
    pub max_burst_distance: f64,
    /// seconds
    pub burst_window: f64,
    /// sample count
    pub rolling_window: usize,
    /// meters, applied to every location type except `Odometer`
    pub accuracy_threshold: f64,
    /// meters, applied to `LocationType::Odometer`
    pub odometer_accuracy_threshold: f64,
    /// meters, from the host's tracking configuration
    pub distance_filter: f64,
    /// meters; deltas below this are noise while stationary
    pub stationary_noise_floor: f64,
    pub filter_debug: bool,
    pub kalman_debug: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            use_kalman: true,
            kalman_profile: KalmanProfile::Default,
            policy: FilterPolicy::Conservative,
            max_implied_speed: 60.0,
            max_burst_distance: 300.0,
            burst_window: 10.0,
            rolling_window: 5,
            accuracy_threshold: 100.0,
            odometer_accuracy_threshold: 20.0,
            distance_filter: 10.0,
            stationary_noise_floor: 5.0,
            filter_debug: false,
            kalman_debug: false,
        }
    }
}

impl FilterConfig {
    /// Copy with every field forced into its valid range.
    pub fn clamped(&self) -> Self {
        Self {
            max_implied_speed: clamp_finite(self.max_implied_speed, IMPLIED_SPEED_RANGE),
            max_burst_distance: clamp_finite(self.max_burst_distance, BURST_DISTANCE_RANGE),
            burst_window: clamp_finite(self.burst_window, BURST_WINDOW_RANGE),
            rolling_window: self
                .rolling_window
                .clamp(ROLLING_WINDOW_RANGE.0, ROLLING_WINDOW_RANGE.1),
            accuracy_threshold: clamp_finite(self.accuracy_threshold, ACCURACY_THRESHOLD_RANGE),
            odometer_accuracy_threshold: clamp_finite(
                self.odometer_accuracy_threshold,
                ACCURACY_THRESHOLD_RANGE,
            ),
            distance_filter: non_negative(self.distance_filter),
            stationary_noise_floor: non_negative(self.stationary_noise_floor),
            ..*self
        }
    }

    /// Parse a (possibly partial) JSON document; missing keys take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_policy(mut self, policy: FilterPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_kalman(mut self, use_kalman: bool) -> Self {
        self.use_kalman = use_kalman;
        self
    }

    pub fn with_kalman_profile(mut self, profile: KalmanProfile) -> Self {
        self.kalman_profile = profile;
        self
    }

    pub fn with_distance_filter(mut self, meters: f64) -> Self {
        self.distance_filter = meters;
        self
    }

    pub fn with_limits(mut self, max_implied_speed: f64, max_burst_distance: f64, burst_window: f64) -> Self {
        self.max_implied_speed = max_implied_speed;
        self.max_burst_distance = max_burst_distance;
        self.burst_window = burst_window;
        self
    }

    pub fn with_rolling_window(mut self, samples: usize) -> Self {
        self.rolling_window = samples;
        self
    }

    pub fn with_accuracy_thresholds(mut self, tracking: f64, odometer: f64) -> Self {
        self.accuracy_threshold = tracking;
        self.odometer_accuracy_threshold = odometer;
        self
    }

    pub fn with_debug(mut self, filter_debug: bool, kalman_debug: bool) -> Self {
        self.filter_debug = filter_debug;
        self.kalman_debug = kalman_debug;
        self
    }
}

// NaN falls back to the lower bound
fn clamp_finite(value: f64, (lo, hi): (f64, f64)) -> f64 {
    if value.is_nan() {
        lo
    } else {
        value.clamp(lo, hi)
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_within_ranges() {
        let config = FilterConfig::default();
        assert_eq!(config.clamped(), config);
    }

    #[test]
    fn test_clamping() {
        let config = FilterConfig {
            max_implied_speed: 0.0,
            max_burst_distance: 10_000.0,
            burst_window: 0.01,
            rolling_window: 50,
            accuracy_threshold: -3.0,
            odometer_accuracy_threshold: 900.0,
            distance_filter: -5.0,
            ..FilterConfig::default()
        }
        .clamped();

        assert_eq!(config.max_implied_speed, 1.0);
        assert_eq!(config.max_burst_distance, 2000.0);
        assert_eq!(config.burst_window, 0.2);
        assert_eq!(config.rolling_window, 20);
        assert_eq!(config.accuracy_threshold, 0.0);
        assert_eq!(config.odometer_accuracy_threshold, 500.0);
        assert_eq!(config.distance_filter, 0.0);
    }

    #[test]
    fn test_rolling_window_lower_bound() {
        let config = FilterConfig::default().with_rolling_window(1).clamped();
        assert_eq!(config.rolling_window, 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = FilterConfig::from_json_str(r#"{"policy": "adjust", "maxImpliedSpeed": 90}"#).unwrap();
        assert_eq!(config.policy, FilterPolicy::Adjust);
        assert_eq!(config.max_implied_speed, 90.0);
        assert_eq!(config.max_burst_distance, 300.0);
        assert!(config.use_kalman);
    }

    #[test]
    fn test_json_round_trip_keys_are_camel_case() {
        let json = FilterConfig::default().to_json().unwrap();
        assert!(json.contains("odometerAccuracyThreshold"));
        assert!(json.contains("\"kalmanProfile\": \"default\""));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("pass-through".parse::<FilterPolicy>().unwrap(), FilterPolicy::PassThrough);
        assert_eq!("PassThrough".parse::<FilterPolicy>().unwrap(), FilterPolicy::PassThrough);
        assert_eq!("adjust".parse::<FilterPolicy>().unwrap(), FilterPolicy::Adjust);
        assert!("strict".parse::<FilterPolicy>().is_err());
    }

    #[test]
    fn test_profile_scales() {
        assert!(KalmanProfile::Aggressive.q_scale() < KalmanProfile::Default.q_scale());
        assert!(KalmanProfile::Conservative.q_scale() > KalmanProfile::Default.q_scale());
        assert!("AGGRESSIVE".parse::<KalmanProfile>().is_ok());
    }
}
