//! Append-only log of the spectra acquired during a full-sweep scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One swept spectrum and where it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumRecord {
    /// Image row
    pub row: usize,
    /// Image column
    pub col: usize,
    /// x position in metres
    pub x: f64,
    /// y position in metres
    pub y: f64,
    /// Swept frequencies in Hz
    pub frequencies: Vec<f64>,
    /// Averaged counts, one per frequency
    pub signal: Vec<f64>,
    /// Time the sweep finished
    pub acquired_at: DateTime<Utc>,
}

impl SpectrumRecord {
    /// `(frequency, signal)` pairs.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.frequencies
            .iter()
            .copied()
            .zip(self.signal.iter().copied())
    }
}

/// Spectra in acquisition order. Records are only ever appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumLog {
    records: Vec<SpectrumRecord>,
}

impl SpectrumLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record at the end.
    pub fn append(&mut self, record: SpectrumRecord) {
        self.records.push(record);
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent record.
    pub fn last(&self) -> Option<&SpectrumRecord> {
        self.records.last()
    }

    /// All records in acquisition order.
    pub fn records(&self) -> &[SpectrumRecord] {
        &self.records
    }

    /// Iterate in acquisition order.
    pub fn iter(&self) -> std::slice::Iter<'_, SpectrumRecord> {
        self.records.iter()
    }
}
