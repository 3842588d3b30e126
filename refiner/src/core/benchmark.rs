//! Append-only benchmark history.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub key: String,
    pub timestamp: String,
    pub score: f64,
    pub workflow_id: String,
    pub version: String,
}

/// Records are never edited; "best" is always a query over the history.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkLog {
    records: Vec<BenchmarkRecord>,
}

impl BenchmarkLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: BenchmarkRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[BenchmarkRecord] {
        &self.records
    }

    /// Highest-scoring record for `key`; the earliest wins ties.
    pub fn best(&self, key: &str) -> Option<&BenchmarkRecord> {
        self.records
            .iter()
            .filter(|r| r.key == key && r.score.is_finite())
            .fold(None, |best: Option<&BenchmarkRecord>, r| match best {
                Some(b) if b.score >= r.score => Some(b),
                _ => Some(r),
            })
    }
}
