//! GPS odometer: turns a stream of position fixes into a cumulative distance
//! and an error bound, rejecting or capping implausible jumps on the way.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod filters;
pub mod odometer;
pub mod storage;
pub mod types;

pub use config::{FilterConfig, FilterPolicy, KalmanProfile};
pub use error::{OdometerError, Result};
pub use filters::kalman::{KalmanSmoother, KalmanState};
pub use filters::policy::{FilterDecision, FilterMetrics, FilterReason, FilterVerdict};
pub use filters::rolling::RollingWindow;
pub use odometer::{Odometer, OdometerReading, OdometerUpdate, SkipReason, UpdateStatus};
pub use storage::{JsonFileStore, MemoryStore, OdometerState, OdometerStore};
pub use types::{LocationSample, LocationType, TrackingMode};
