//! Odometer accumulator.
//!
//! Owns the Kalman smoother, the rolling window of accepted deltas and the
//! running totals. All of that sits behind one mutex, so an update, a reset
//! and an administrative override never interleave. Display reads go through
//! a lock-free [`OdometerReading`] snapshot instead of the mutex.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::diagnostics::{self, KalmanDiagnostic};
use crate::error::{OdometerError, Result};
use crate::filters::kalman::{KalmanSmoother, KalmanState};
use crate::filters::policy::{self, DeltaInput, FilterVerdict};
use crate::filters::rolling::RollingWindow;
use crate::storage::{OdometerState, OdometerStore, PersistenceWorker};
use crate::types::{LocationSample, LocationType, TrackingMode};

/// Totals as last published by the update path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OdometerReading {
    pub odometer: f64,
    pub odometer_error: f64,
}

/// Why a sample never reached the policy engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// Tracking stopped or in geofence-only mode
    Disabled,
    /// Negative or non-finite accuracy
    InvalidAccuracy,
    AccuracyAboveThreshold,
    /// First fix only seeds `last_location`
    FirstFix,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateStatus {
    Skipped(SkipReason),
    Evaluated(FilterVerdict),
}

/// Result of feeding one sample to the odometer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OdometerUpdate {
    /// Meters added by this sample
    pub delta: f64,
    pub odometer: f64,
    pub odometer_error: f64,
    pub status: UpdateStatus,
}

impl OdometerUpdate {
    pub fn verdict(&self) -> Option<&FilterVerdict> {
        match &self.status {
            UpdateStatus::Evaluated(verdict) => Some(verdict),
            UpdateStatus::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.status {
            UpdateStatus::Skipped(reason) => Some(reason),
            UpdateStatus::Evaluated(_) => None,
        }
    }

    /// Whether this sample contributed distance.
    pub fn is_counted(&self) -> bool {
        self.verdict().map_or(false, |v| v.decision.is_counted())
    }
}

#[derive(Debug)]
struct Inner {
    kalman: Option<KalmanSmoother>,
    window: RollingWindow,
    odometer: f64,
    odometer_error: f64,
    last_location: Option<LocationSample>,
    enabled: bool,
    moving: bool,
}

impl Inner {
    fn new(rolling_window: usize) -> Self {
        Self {
            kalman: None,
            window: RollingWindow::new(rolling_window),
            odometer: 0.0,
            odometer_error: 0.0,
            last_location: None,
            enabled: true,
            moving: true,
        }
    }

    fn reading(&self) -> OdometerReading {
        OdometerReading {
            odometer: self.odometer,
            odometer_error: self.odometer_error,
        }
    }

    fn snapshot(&self) -> OdometerState {
        OdometerState::new(self.odometer, self.odometer_error, self.last_location)
    }

    fn outcome(&self, delta: f64, status: UpdateStatus) -> OdometerUpdate {
        OdometerUpdate {
            delta,
            odometer: self.odometer,
            odometer_error: self.odometer_error,
            status,
        }
    }

    fn skipped(&self, reason: SkipReason) -> OdometerUpdate {
        self.outcome(0.0, UpdateStatus::Skipped(reason))
    }

    /// One pass of the pipeline. `config` must already be clamped.
    fn step(&mut self, sample: &LocationSample, kind: LocationType, config: &FilterConfig) -> OdometerUpdate {
        if !self.enabled {
            return self.skipped(SkipReason::Disabled);
        }
        if !sample.has_valid_accuracy() {
            return self.skipped(SkipReason::InvalidAccuracy);
        }
        let threshold = if kind.is_odometer() {
            config.odometer_accuracy_threshold
        } else {
            config.accuracy_threshold
        };
        if sample.accuracy > threshold {
            return self.skipped(SkipReason::AccuracyAboveThreshold);
        }
        let previous = match self.last_location {
            Some(previous) => previous,
            None => {
                self.last_location = Some(*sample);
                return self.skipped(SkipReason::FirstFix);
            }
        };

        let input = DeltaInput::between(&previous, sample);

        // Out-of-order fix: leave the smoother and last_location alone
        if !(input.elapsed > 0.0) {
            let verdict = policy::evaluate(&input, config);
            return self.outcome(0.0, UpdateStatus::Evaluated(verdict));
        }

        let mut checkpoint = None;
        let filtered = if config.use_kalman {
            let kalman = self
                .kalman
                .get_or_insert_with(|| KalmanSmoother::new(config.kalman_profile));
            if kalman.profile() != config.kalman_profile {
                kalman.set_profile(config.kalman_profile);
            }
            kalman.set_diagnostics_enabled(config.kalman_debug);
            checkpoint = Some(kalman.state());
            kalman.configure(sample.speed_or_zero(), sample.accuracy, config.distance_filter);
            kalman.process(input.selected_delta, sample.accuracy)
        } else {
            input.selected_delta
        };

        self.window.resize(config.rolling_window);
        let input = input
            .with_candidate(filtered)
            .with_rolling_mean(self.window.mean())
            .with_stationary(!self.moving);
        let verdict = policy::evaluate(&input, config);

        let delta = if verdict.decision.is_counted() {
            let delta = verdict.capped_delta;
            self.window.push(delta);
            self.odometer += delta;
            self.odometer_error = self.odometer_error.hypot(sample.accuracy);
            delta
        } else {
            // A rejected delta must not leak into the next estimate
            if let (Some(kalman), Some(state)) = (self.kalman.as_mut(), checkpoint) {
                kalman.restore(state);
            }
            0.0
        };
        self.last_location = Some(*sample);

        self.outcome(delta, UpdateStatus::Evaluated(verdict))
    }

    fn reset(&mut self) {
        self.odometer = 0.0;
        self.odometer_error = 0.0;
        self.last_location = None;
        self.window.clear();
        if let Some(kalman) = self.kalman.as_mut() {
            kalman.reset();
        }
    }
}

/// Distance accumulator for one tracking pipeline.
///
/// Construct one per pipeline and share it by reference (or `Arc`); every
/// method takes `&self`.
#[derive(Debug)]
pub struct Odometer {
    inner: Mutex<Inner>,
    reading: AtomicCell<OdometerReading>,
    persister: Option<PersistenceWorker>,
}

impl Odometer {
    /// In-memory odometer, enabled, with nothing persisted.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new(FilterConfig::default().rolling_window)),
            reading: AtomicCell::new(OdometerReading::default()),
            persister: None,
        }
    }

    /// Odometer that writes a snapshot to `store` after every counted update.
    pub fn with_store(store: Arc<dyn OdometerStore>) -> Result<Self> {
        let mut odometer = Self::new();
        odometer.persister = Some(PersistenceWorker::spawn(store)?);
        Ok(odometer)
    }

    /// Rebuild from the last snapshot in `store`, then keep persisting to it.
    pub fn restore(store: Arc<dyn OdometerStore>) -> Result<Self> {
        let saved = store.load()?;
        let odometer = Self::with_store(store)?;
        if let Some(state) = saved {
            let mut inner = odometer.lock();
            inner.odometer = state.odometer;
            inner.odometer_error = state.odometer_error;
            inner.last_location = state.last_location;
            odometer.reading.store(inner.reading());
            log::info!(
                "[ODOMETER] restored {:.1} m (±{:.1} m) saved at {}",
                state.odometer,
                state.odometer_error,
                state.saved_at
            );
        }
        Ok(odometer)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed a sample captured for odometer purposes.
    pub fn update(&self, sample: &LocationSample, config: &FilterConfig) -> OdometerUpdate {
        self.evaluate_location(sample, LocationType::Odometer, config)
    }

    /// Feed a sample of any location type; the type selects which accuracy
    /// threshold gates it.
    pub fn evaluate_location(
        &self,
        sample: &LocationSample,
        kind: LocationType,
        config: &FilterConfig,
    ) -> OdometerUpdate {
        let config = config.clamped();

        let result = {
            let mut inner = self.lock();
            let result = inner.step(sample, kind, &config);
            self.reading.store(inner.reading());
            if result.is_counted() {
                self.persist_async(&inner);
            }
            result
        };

        if config.filter_debug {
            log_update(&result);
        }
        result
    }

    /// Enable accumulation for `Location` mode; `Geofence` mode disables it.
    pub fn start(&self, mode: TrackingMode) {
        let enabled = mode == TrackingMode::Location;
        self.lock().enabled = enabled;
        log::info!("[ODOMETER] start {:?} (accumulating: {})", mode, enabled);
    }

    pub fn stop(&self) {
        self.lock().enabled = false;
        log::info!("[ODOMETER] stop");
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// While stationary, deltas under the configured noise floor are dropped.
    pub fn on_motion_change(&self, is_moving: bool) {
        let mut inner = self.lock();
        if inner.moving != is_moving {
            log::debug!("[ODOMETER] motion change: moving={}", is_moving);
        }
        inner.moving = is_moving;
    }

    pub fn is_moving(&self) -> bool {
        self.lock().moving
    }

    pub fn reset(&self) {
        {
            let mut inner = self.lock();
            inner.reset();
            self.reading.store(inner.reading());
            self.persist_async(&inner);
        }
        log::info!("[ODOMETER] reset");
    }

    /// Override the total. Leaves the error, last location and window as is.
    pub fn set_odometer(&self, value: f64) -> Result<OdometerReading> {
        if !value.is_finite() || value < 0.0 {
            return Err(OdometerError::InvalidOdometer(value));
        }
        let reading = {
            let mut inner = self.lock();
            inner.odometer = value;
            let reading = inner.reading();
            self.reading.store(reading);
            self.persist_async(&inner);
            reading
        };
        log::info!("[ODOMETER] set to {:.1} m", value);
        Ok(reading)
    }

    /// Lock-free read of the latest totals.
    pub fn reading(&self) -> OdometerReading {
        self.reading.load()
    }

    pub fn odometer(&self) -> f64 {
        self.reading().odometer
    }

    pub fn odometer_error(&self) -> f64 {
        self.reading().odometer_error
    }

    pub fn last_location(&self) -> Option<LocationSample> {
        self.lock().last_location
    }

    /// Accepted deltas currently in the rolling window, oldest first.
    pub fn window_contents(&self) -> Vec<f64> {
        self.lock().window.to_vec()
    }

    /// `None` until the first Kalman-smoothed update.
    pub fn kalman_state(&self) -> Option<KalmanState> {
        self.lock().kalman.as_ref().map(KalmanSmoother::state)
    }

    pub fn state(&self) -> OdometerState {
        self.lock().snapshot()
    }

    /// Write the current snapshot synchronously.
    pub fn persist(&self) -> Result<()> {
        let worker = self
            .persister
            .as_ref()
            .ok_or_else(|| OdometerError::Storage("no store attached".into()))?;
        // Queue under the lock so the channel sees snapshots in state order
        let pending = {
            let inner = self.lock();
            worker.write(inner.snapshot())?
        };
        pending.wait()
    }

    /// Wait until every queued snapshot has reached the store. A no-op
    /// without a store.
    pub fn flush(&self) -> Result<()> {
        match &self.persister {
            Some(worker) => worker.flush(),
            None => Ok(()),
        }
    }

    /// Background writes that failed so far.
    pub fn persistence_failures(&self) -> u64 {
        self.persister.as_ref().map_or(0, PersistenceWorker::failure_count)
    }

    /// Called with the lock held.
    fn persist_async(&self, inner: &Inner) {
        if let Some(worker) = &self.persister {
            if let Err(e) = worker.submit(inner.snapshot()) {
                log::warn!("[ODOMETER] could not queue snapshot: {}", e);
            }
        }
    }

    /// Kalman diagnostic rows recorded while `kalman_debug` was on.
    pub fn diagnostics(&self) -> Vec<KalmanDiagnostic> {
        self.lock()
            .kalman
            .as_ref()
            .map(KalmanSmoother::diagnostics)
            .unwrap_or_default()
    }

    pub fn drain_diagnostics(&self) -> Vec<KalmanDiagnostic> {
        self.lock()
            .kalman
            .as_mut()
            .map(KalmanSmoother::drain_diagnostics)
            .unwrap_or_default()
    }

    /// Write buffered diagnostics as CSV; returns the number of rows.
    pub fn export_diagnostics_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let rows = self.diagnostics();
        diagnostics::write_csv(path, &rows)?;
        Ok(rows.len())
    }
}

impl Default for Odometer {
    fn default() -> Self {
        Self::new()
    }
}

fn log_update(update: &OdometerUpdate) {
    match &update.status {
        UpdateStatus::Skipped(reason) => {
            log::debug!("[ODOMETER] skipped: {:?}", reason);
        }
        UpdateStatus::Evaluated(verdict) => {
            let m = &verdict.metrics;
            log::debug!(
                "[ODOMETER] {:?} ({}) raw={:.2} eff={:.2} sel={:.2} cand={:.2} dt={:.2} v={:.1} mean={:?} -> +{:.2} = {:.1} m (±{:.1})",
                verdict.decision,
                verdict.reason,
                m.raw_delta,
                m.effective_delta,
                m.selected_delta,
                m.candidate_delta,
                m.elapsed,
                m.implied_speed,
                m.rolling_mean,
                update.delta,
                update.odometer,
                update.odometer_error
            );
        }
    }
}
