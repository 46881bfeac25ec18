//! JSON output format for checkpoint reports

use serde::{Deserialize, Serialize};

use crate::engine::ProbeConfig;
use crate::report::{DiscardTally, Report, ReportRow, SortKey};

/// Timing information for a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTiming {
    /// RFC 3339 wall-clock time the session started
    pub experiment_start: String,
    /// RFC 3339 wall-clock time of this checkpoint
    pub current_time: String,
    pub seconds_elapsed: f64,
}

/// Summary totals across all rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSummary {
    pub total_calls: u64,
    pub total_overhead_us: f64,
    /// Exit code of the measured program, on the last report of a `--run`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Root JSON output structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonOutput {
    /// Format version identifier
    pub version: String,
    /// Format name
    pub format: String,
    pub seq: u64,
    pub last: bool,
    pub cleared: bool,
    pub sort: SortKey,
    pub timing: JsonTiming,
    /// Engine constants the counters were collected under
    pub probe: ProbeConfig,
    pub syscalls: Vec<ReportRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Vec<ReportRow>>,
    pub discards: DiscardTally,
    pub summary: JsonSummary,
}

impl JsonOutput {
    pub fn new(report: &Report, probe: &ProbeConfig, sort: SortKey) -> Self {
        let total_calls = report.rows.iter().map(|r| r.count).sum();
        let total_overhead_us = report.rows.iter().map(|r| r.overhead_us).sum();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "scbench-json-v1".to_string(),
            seq: report.seq,
            last: report.last,
            cleared: report.cleared,
            sort,
            timing: JsonTiming {
                experiment_start: report.started.to_rfc3339(),
                current_time: report.taken.to_rfc3339(),
                seconds_elapsed: report.elapsed.as_secs_f64(),
            },
            probe: probe.clone(),
            syscalls: report.rows.clone(),
            delta: report.delta.clone(),
            discards: report.discards.clone(),
            summary: JsonSummary {
                total_calls,
                total_overhead_us,
                exit_code: None,
            },
        }
    }

    /// Set the exit code
    pub fn set_exit_code(&mut self, code: Option<i32>) {
        self.summary.exit_code = code;
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
