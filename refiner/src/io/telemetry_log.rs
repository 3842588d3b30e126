//! Telemetry and run-report output.
//!
//! Telemetry records are product artifacts, separate from `tracing`
//! diagnostics: one JSON object per governor step, appended as JSONL.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::governor::TelemetryRecord;

pub trait TelemetrySink {
    fn emit(&self, record: &TelemetryRecord) -> Result<()>;
}

/// Sink that drops every record.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _record: &TelemetryRecord) -> Result<()> {
        Ok(())
    }
}

/// Appends records to a JSONL file.
pub struct JsonlTelemetryLog {
    path: PathBuf,
}

impl JsonlTelemetryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TelemetrySink for JsonlTelemetryLog {
    fn emit(&self, record: &TelemetryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).context("serialize telemetry record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::governor::{Decision, TerminationReason, VerityTensor};

    fn record(iteration: usize, decision: Decision) -> TelemetryRecord {
        TelemetryRecord {
            telemetry_id: format!("run-{iteration:04}"),
            iteration,
            determinism: 1.0,
            entropy: 0.1 * iteration as f64,
            verity_tensor: VerityTensor::scalar(0.5),
            entropy_budget: 1.0,
            decision,
            termination_reason: (decision == Decision::Halt)
                .then_some(TerminationReason::DvDeNonpositive),
        }
    }

    #[test]
    fn appends_one_line_per_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = JsonlTelemetryLog::new(temp.path().join("out/telemetry.jsonl"));
        log.emit(&record(1, Decision::Continue)).expect("emit");
        log.emit(&record(2, Decision::Halt)).expect("emit");

        let contents = fs::read_to_string(log.path()).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let last: TelemetryRecord = serde_json::from_str(lines[1]).expect("parse");
        assert_eq!(last, record(2, Decision::Halt));
    }
}
