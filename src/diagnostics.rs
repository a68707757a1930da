//! Kalman smoother diagnostics: one typed row per processed measurement,
//! buffered in memory and exported as a flat CSV table for offline tuning.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 10_000;

pub const CSV_HEADER: &str = "measurement,accuracy,gain,q,r,residual,innovation_variance,nis";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KalmanDiagnostic {
    pub measurement: f64,
    pub accuracy: f64,
    pub gain: f64,
    pub q: f64,
    pub r: f64,
    pub residual: f64,
    pub innovation_variance: f64,
    pub nis: f64,
}

/// Bounded append-only buffer; the oldest rows are dropped once full.
#[derive(Clone, Debug)]
pub struct DiagnosticsBuffer {
    records: VecDeque<KalmanDiagnostic>,
    capacity: usize,
    dropped: u64,
}

impl DiagnosticsBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        DiagnosticsBuffer {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, record: KalmanDiagnostic) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(record);
    }

    /// Take every buffered row, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<KalmanDiagnostic> {
        self.records.drain(..).collect()
    }

    pub fn records(&self) -> Vec<KalmanDiagnostic> {
        self.records.iter().copied().collect()
    }

    /// Rows evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for DiagnosticsBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTIC_CAPACITY)
    }
}

/// Render rows as CSV with a header line.
pub fn to_csv(records: &[KalmanDiagnostic]) -> String {
    let mut csv = String::with_capacity(CSV_HEADER.len() + 1 + records.len() * 96);
    csv.push_str(CSV_HEADER);
    csv.push('\n');
    for r in records {
        // Writing into a String cannot fail
        let _ = writeln!(
            csv,
            "{:.6},{:.3},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
            r.measurement, r.accuracy, r.gain, r.q, r.r, r.residual, r.innovation_variance, r.nis
        );
    }
    csv
}

pub fn write_csv<P: AsRef<Path>>(path: P, records: &[KalmanDiagnostic]) -> Result<()> {
    fs::write(path, to_csv(records))?;
    Ok(())
}
