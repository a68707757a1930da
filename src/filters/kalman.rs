//! Adaptive 1-D Kalman smoother for per-sample distance deltas.
//!
//! State is a single scalar (the smoothed delta). Before each measurement the
//! noise pair is retuned from the fix context:
//!
//!   R = clamp(accuracy² · r_scale, 4, 10 000)
//!   Q = clamp(max(0.3 · distanceFilter, baseBySpeed)² · q_scale, 0.1, 400)
//!
//! and after each update R drifts by ±α according to the normalized
//! innovation squared (NIS), so a systematically wrong noise assumption
//! corrects itself over time.

use serde::{Deserialize, Serialize};

use crate::config::KalmanProfile;
use crate::diagnostics::{DiagnosticsBuffer, KalmanDiagnostic};

pub const INITIAL_VARIANCE: f64 = 100.0;
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 25.0;
pub const DEFAULT_PROCESS_NOISE: f64 = 1.0;

pub const R_MIN: f64 = 4.0;
pub const R_MAX: f64 = 10_000.0;
pub const Q_MIN: f64 = 0.1;
pub const Q_MAX: f64 = 400.0;

const DISTANCE_FILTER_WEIGHT: f64 = 0.3;
const NIS_HIGH: f64 = 1.2;
const NIS_LOW: f64 = 0.8;
const R_ADAPT_ALPHA: f64 = 0.02;
const EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KalmanState {
    pub estimate: f64,
    /// Estimate variance
    pub p: f64,
    /// Process-noise variance
    pub q: f64,
    /// Measurement-noise variance
    pub r: f64,
}

#[derive(Clone, Debug)]
pub struct KalmanSmoother {
    estimate: f64,
    p: f64,
    q: f64,
    r: f64,
    profile: KalmanProfile,
    update_count: u64,
    diagnostics_enabled: bool,
    diagnostics: DiagnosticsBuffer,
}

impl KalmanSmoother {
    pub fn new(profile: KalmanProfile) -> Self {
        let mut filter = Self {
            estimate: 0.0,
            p: INITIAL_VARIANCE,
            q: DEFAULT_PROCESS_NOISE,
            r: DEFAULT_MEASUREMENT_NOISE,
            profile,
            update_count: 0,
            diagnostics_enabled: false,
            diagnostics: DiagnosticsBuffer::default(),
        };
        filter.reset();
        filter
    }

    /// Monotonic in speed: faster travel means larger legitimate change
    /// between consecutive deltas.
    pub fn base_by_speed(speed: f64) -> f64 {
        1.0 + 0.5 * sanitize(speed)
    }

    /// Retune Q and R for the upcoming measurement.
    pub fn configure(&mut self, speed: f64, accuracy: f64, distance_filter: f64) {
        let accuracy = sanitize(accuracy);
        let distance_filter = sanitize(distance_filter);

        self.r = (accuracy * accuracy * self.profile.r_scale()).clamp(R_MIN, R_MAX);

        let spread = (DISTANCE_FILTER_WEIGHT * distance_filter).max(Self::base_by_speed(speed));
        self.q = (spread * spread * self.profile.q_scale()).clamp(Q_MIN, Q_MAX);
    }

    /// Fold one measurement into the estimate and return the smoothed value.
    ///
    /// A positive `accuracy` sets this step's measurement variance directly;
    /// otherwise the configured (and adaptively drifted) R is used.
    pub fn process(&mut self, measurement: f64, accuracy: f64) -> f64 {
        if !measurement.is_finite() {
            return self.estimate;
        }

        let rm = if accuracy.is_finite() && accuracy > 0.0 {
            accuracy * accuracy
        } else {
            self.r
        };

        let residual = measurement - self.estimate;
        let s = (self.p + rm).max(EPSILON);
        let gain = self.p / s;

        self.estimate += gain * residual;
        self.p = ((1.0 - gain) * self.p + self.q).max(0.0);

        let nis = residual * residual / s;
        if nis > NIS_HIGH {
            self.r *= 1.0 + R_ADAPT_ALPHA;
        } else if nis < NIS_LOW {
            self.r *= 1.0 - R_ADAPT_ALPHA;
        }
        self.r = self.r.clamp(R_MIN, R_MAX);

        self.update_count += 1;

        if self.diagnostics_enabled {
            log::debug!(
                "[KALMAN] z={:.2} acc={:.1} K={:.3} Q={:.3} R={:.2} r={:.3} S={:.3} NIS={:.3}",
                measurement,
                accuracy,
                gain,
                self.q,
                self.r,
                residual,
                s,
                nis
            );
            self.diagnostics.push(KalmanDiagnostic {
                measurement,
                accuracy,
                gain,
                q: self.q,
                r: self.r,
                residual,
                innovation_variance: s,
                nis,
            });
        }

        self.estimate
    }

    /// Back to the initial uncertainty with profile-default noise.
    /// Diagnostics already recorded are kept until drained.
    pub fn reset(&mut self) {
        self.estimate = 0.0;
        self.p = INITIAL_VARIANCE;
        self.r = (DEFAULT_MEASUREMENT_NOISE * self.profile.r_scale()).clamp(R_MIN, R_MAX);
        self.q = (DEFAULT_PROCESS_NOISE * self.profile.q_scale()).clamp(Q_MIN, Q_MAX);
        self.update_count = 0;
    }

    pub fn set_profile(&mut self, profile: KalmanProfile) {
        self.profile = profile;
    }

    pub fn profile(&self) -> KalmanProfile {
        self.profile
    }

    pub fn set_diagnostics_enabled(&mut self, enabled: bool) {
        self.diagnostics_enabled = enabled;
    }

    pub fn diagnostics_enabled(&self) -> bool {
        self.diagnostics_enabled
    }

    pub fn diagnostics(&self) -> Vec<KalmanDiagnostic> {
        self.diagnostics.records()
    }

    pub fn drain_diagnostics(&mut self) -> Vec<KalmanDiagnostic> {
        self.diagnostics.drain()
    }

    pub fn state(&self) -> KalmanState {
        KalmanState {
            estimate: self.estimate,
            p: self.p,
            q: self.q,
            r: self.r,
        }
    }

    /// Roll the filter back to an earlier [`state`](Self::state) snapshot.
    /// The profile and diagnostics buffer are left alone.
    pub fn restore(&mut self, state: KalmanState) {
        self.estimate = state.estimate;
        self.p = state.p;
        self.q = state.q;
        self.r = state.r;
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }
}

impl Default for KalmanSmoother {
    fn default() -> Self {
        Self::new(KalmanProfile::Default)
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn test_configure_clamps_r() {
        let mut kf = KalmanSmoother::default();
        kf.configure(0.0, 1.0, 0.0);
        assert_eq!(kf.state().r, R_MIN);
        kf.configure(0.0, 500.0, 0.0);
        assert_eq!(kf.state().r, R_MAX);
        kf.configure(0.0, 10.0, 0.0);
        assert_eq!(kf.state().r, 100.0);
    }

    #[test]
    fn test_configure_q_from_distance_filter_and_speed() {
        let mut kf = KalmanSmoother::default();
        // 0.3 * 10 = 3 beats base 1.0
        kf.configure(0.0, 5.0, 10.0);
        assert_relative_eq!(kf.state().q, 9.0, epsilon = 1e-9);
        // base 1 + 0.5 * 20 = 11 beats 3
        kf.configure(20.0, 5.0, 10.0);
        assert_relative_eq!(kf.state().q, 121.0, epsilon = 1e-9);
        // clamped at the top
        kf.configure(100.0, 5.0, 10.0);
        assert_eq!(kf.state().q, Q_MAX);
    }

    #[test]
    fn test_base_by_speed_monotonic() {
        let mut prev = KalmanSmoother::base_by_speed(0.0);
        for speed in [0.5, 1.0, 5.0, 10.0, 30.0, 60.0] {
            let next = KalmanSmoother::base_by_speed(speed);
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(KalmanSmoother::base_by_speed(-1.0), 1.0);
        assert_eq!(KalmanSmoother::base_by_speed(f64::NAN), 1.0);
    }

    #[test]
    fn test_constant_measurement_converges() {
        let mut kf = KalmanSmoother::default();
        kf.configure(0.0, 5.0, 10.0);
        let q = kf.state().q;
        let rm = 25.0;

        for _ in 0..100 {
            kf.process(10.0, 5.0);
        }

        assert_abs_diff_eq!(kf.estimate(), 10.0, epsilon = 1e-6);

        // Steady state of P = P·Rm/(P + Rm) + Q
        let p_steady = (q + (q * q + 4.0 * q * rm).sqrt()) / 2.0;
        assert_relative_eq!(kf.state().p, p_steady, epsilon = 1e-9);
    }

    #[test]
    fn test_nis_inflates_r_on_large_residual() {
        let mut kf = KalmanSmoother::default();
        kf.configure(0.0, 0.0, 0.0);
        let r_before = kf.state().r;
        kf.process(100.0, 0.0);
        assert_relative_eq!(kf.state().r, r_before * 1.02, epsilon = 1e-9);
    }

    #[test]
    fn test_nis_deflates_r_on_small_residual() {
        let mut kf = KalmanSmoother::default();
        kf.configure(0.0, 50.0, 0.0);
        assert_eq!(kf.state().r, 2500.0);
        kf.process(0.0, 0.0);
        assert_relative_eq!(kf.state().r, 2450.0, epsilon = 1e-9);
    }

    #[test]
    fn test_variances_never_negative() {
        let mut kf = KalmanSmoother::new(KalmanProfile::Conservative);
        let mut seed: u64 = 42;
        for i in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let unit = (seed >> 11) as f64 / (1u64 << 53) as f64;
            let measurement = if i % 37 == 0 { 1.0e6 } else { unit * 50.0 };
            let accuracy = match i % 5 {
                0 => 0.0,
                1 => -1.0,
                2 => 1.0e4,
                _ => unit * 30.0,
            };
            kf.configure(unit * 40.0, accuracy, (i % 3) as f64 * 10.0);
            kf.process(measurement, accuracy);
            let state = kf.state();
            assert!(state.p >= 0.0);
            assert!(state.q >= 0.0);
            assert!(state.r >= 0.0);
        }
    }

    #[test]
    fn test_non_finite_measurement_ignored() {
        let mut kf = KalmanSmoother::default();
        kf.process(5.0, 5.0);
        let before = kf.state();
        assert_eq!(kf.process(f64::NAN, 5.0), before.estimate);
        assert_eq!(kf.state(), before);
    }

    #[test]
    fn test_aggressive_profile_lags_more() {
        let mut default = KalmanSmoother::new(KalmanProfile::Default);
        let mut aggressive = KalmanSmoother::new(KalmanProfile::Aggressive);
        for _ in 0..3 {
            default.configure(0.0, 5.0, 10.0);
            aggressive.configure(0.0, 5.0, 10.0);
            default.process(10.0, 5.0);
            aggressive.process(10.0, 5.0);
        }
        assert!(aggressive.estimate() < default.estimate());
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut kf = KalmanSmoother::default();
        kf.configure(10.0, 30.0, 50.0);
        kf.process(25.0, 30.0);
        kf.reset();
        let state = kf.state();
        assert_eq!(state.estimate, 0.0);
        assert_eq!(state.p, INITIAL_VARIANCE);
        assert_eq!(state.r, DEFAULT_MEASUREMENT_NOISE);
        assert_eq!(state.q, DEFAULT_PROCESS_NOISE);
        assert_eq!(kf.update_count(), 0);
    }

    #[test]
    fn test_diagnostics_recorded_only_when_enabled() {
        let mut kf = KalmanSmoother::default();
        kf.process(3.0, 5.0);
        assert!(kf.diagnostics().is_empty());

        kf.set_diagnostics_enabled(true);
        kf.configure(0.0, 5.0, 0.0);
        kf.process(4.0, 5.0);
        let rows = kf.drain_diagnostics();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].measurement, 4.0);
        assert_eq!(rows[0].accuracy, 5.0);
        assert!(rows[0].gain > 0.0 && rows[0].gain < 1.0);
        assert!(kf.diagnostics().is_empty());
    }

    #[test]
    fn test_restore_undoes_outlier() {
        let mut kf = KalmanSmoother::default();
        for _ in 0..20 {
            kf.configure(10.0, 5.0, 10.0);
            kf.process(10.0, 5.0);
        }
        let before = kf.state();

        kf.configure(10.0, 5.0, 10.0);
        kf.process(5000.0, 5.0);
        assert!(kf.estimate() > 100.0);

        kf.restore(before);
        assert_eq!(kf.state(), before);
        kf.configure(10.0, 5.0, 10.0);
        assert_relative_eq!(kf.process(10.0, 5.0), 10.0, epsilon = 0.1);
    }
}
