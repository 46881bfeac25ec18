//! Checkpoint reports
//!
//! Turns a [`CounterSnapshot`] into per-syscall rows: replicas merged,
//! zero rows dropped, sorted, and compared against the previous checkpoint.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::engine::{CounterSnapshot, CounterValue, Discard, DiscardCategory};
use crate::syscalls;

/// Column a report is ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Syscall name, ascending
    Sysname,
    /// Syscall number, descending
    Sysnum,
    /// Invocation count, descending
    Count,
    /// Cumulative latency, descending
    Overhead,
    /// Latency per call, descending
    #[default]
    #[value(name = "avg_overhead")]
    AvgOverhead,
}

/// One syscall's totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub sysname: String,
    pub sysnum: usize,
    pub count: u64,
    pub overhead_us: f64,
    pub avg_overhead_us: f64,
}

impl ReportRow {
    pub fn new(sysnum: usize, value: CounterValue) -> Self {
        let overhead_us = value.overhead as f64 / 1e3;
        let avg_overhead_us = if value.count == 0 {
            0.0
        } else {
            overhead_us / value.count as f64
        };
        Self {
            sysname: syscalls::display_name(sysnum as i64),
            sysnum,
            count: value.count,
            overhead_us,
            avg_overhead_us,
        }
    }
}

/// Build rows from merged totals, skipping syscalls never credited
pub fn rows_from_totals(totals: &[CounterValue]) -> Vec<ReportRow> {
    totals
        .iter()
        .enumerate()
        .filter(|(_, value)| value.count != 0)
        .map(|(sysnum, value)| ReportRow::new(sysnum, *value))
        .collect()
}

pub fn sort_rows(rows: &mut [ReportRow], key: SortKey) {
    rows.sort_by(|a, b| {
        let primary = match key {
            SortKey::Sysname => a.sysname.cmp(&b.sysname),
            SortKey::Sysnum => b.sysnum.cmp(&a.sysnum),
            SortKey::Count => b.count.cmp(&a.count),
            SortKey::Overhead => b.overhead_us.total_cmp(&a.overhead_us),
            SortKey::AvgOverhead => b.avg_overhead_us.total_cmp(&a.avg_overhead_us),
        };
        primary.then(a.sysnum.cmp(&b.sysnum))
    });
}

/// Dropped events, by category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardTally {
    pub categories: BTreeMap<DiscardCategory, u64>,
}

impl DiscardTally {
    pub fn record(&mut self, discard: Discard) {
        *self.categories.entry(discard.category()).or_default() += 1;
    }

    pub fn get(&self, category: DiscardCategory) -> u64 {
        self.categories.get(&category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.categories.values().sum()
    }
}

/// A rendered-ready checkpoint
#[derive(Debug, Clone)]
pub struct Report {
    /// 0 for the first checkpoint
    pub seq: u64,
    pub started: DateTime<Local>,
    pub taken: DateTime<Local>,
    pub elapsed: Duration,
    /// `rows` covers only the interval since the previous checkpoint
    pub cleared: bool,
    /// Last report of the session
    pub last: bool,
    pub rows: Vec<ReportRow>,
    /// Change since the previous checkpoint; absent for the first one and
    /// for cleared reports
    pub delta: Option<Vec<ReportRow>>,
    pub discards: DiscardTally,
}

/// Accumulates checkpoints over a session
#[derive(Debug)]
pub struct Reporter {
    started: DateTime<Local>,
    start_instant: Instant,
    sort: SortKey,
    previous: Option<Vec<CounterValue>>,
    seq: u64,
}

impl Reporter {
    pub fn new(sort: SortKey) -> Self {
        Self {
            started: Local::now(),
            start_instant: Instant::now(),
            sort,
            previous: None,
            seq: 0,
        }
    }

    pub fn started(&self) -> DateTime<Local> {
        self.started
    }

    /// Build the next report from a cumulative snapshot. With `cleared` the
    /// rows cover only the interval since the previous checkpoint.
    pub fn checkpoint(
        &mut self,
        snapshot: &CounterSnapshot,
        cleared: bool,
        last: bool,
        discards: &DiscardTally,
    ) -> Report {
        let totals = snapshot.merge();
        let since_previous = self
            .previous
            .as_ref()
            .map(|previous| subtract(&totals, previous));

        let (mut rows, delta) = match (cleared, since_previous) {
            (true, Some(interval)) => (rows_from_totals(&interval), None),
            (_, None) => (rows_from_totals(&totals), None),
            (false, Some(interval)) => {
                let mut delta = rows_from_totals(&interval);
                sort_rows(&mut delta, self.sort);
                (rows_from_totals(&totals), Some(delta))
            }
        };
        sort_rows(&mut rows, self.sort);
        self.previous = Some(totals);

        let report = Report {
            seq: self.seq,
            started: self.started,
            taken: Local::now(),
            elapsed: self.start_instant.elapsed(),
            cleared,
            last,
            rows,
            delta,
            discards: discards.clone(),
        };
        self.seq += 1;
        report
    }
}

/// `current - previous` per syscall; counters only grow, so anything else
/// clamps to zero
fn subtract(current: &[CounterValue], previous: &[CounterValue]) -> Vec<CounterValue> {
    current
        .iter()
        .enumerate()
        .map(|(sysnum, now)| {
            let before = previous.get(sysnum).copied().unwrap_or_default();
            CounterValue {
                count: now.count.saturating_sub(before.count),
                overhead: now.overhead.saturating_sub(before.overhead),
            }
        })
        .collect()
}

const TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn write_table(out: &mut String, rows: &[ReportRow], show_sysnum: bool) {
    if show_sysnum {
        let _ = write!(out, "{:>6} ", "SYSNUM");
    }
    let _ = writeln!(
        out,
        "{:<22} {:>8} {:>16} {:>20}",
        "SYSCALL", "COUNT", "OVERHEAD(us)", "AVG. OVERHEAD(us)"
    );
    for row in rows {
        if show_sysnum {
            let _ = write!(out, "{:>6} ", row.sysnum);
        }
        let _ = writeln!(
            out,
            "{:<22} {:>8} {:>16.3} {:>20.3}",
            row.sysname, row.count, row.overhead_us, row.avg_overhead_us
        );
    }
}

/// Plain-text rendering
pub fn render_text(report: &Report, show_sysnum: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Experiment start: {}", report.started.format(TIMESTAMP));
    let _ = writeln!(out, "Current time:     {}", report.taken.format(TIMESTAMP));
    let _ = writeln!(
        out,
        "Seconds elapsed:  {:.6}",
        report.elapsed.as_secs_f64()
    );
    if report.cleared {
        out.push_str("Counters cleared after this checkpoint\n");
    }
    out.push('\n');

    write_table(&mut out, &report.rows, show_sysnum);

    if let Some(delta) = &report.delta {
        out.push_str("\nSince previous checkpoint:\n");
        write_table(&mut out, delta, show_sysnum);
    }

    let dropped = report.discards.total();
    if dropped > 0 {
        let _ = writeln!(
            out,
            "\nDropped events: {} (policy {}, kernel restart {}, missing state {}, identity mismatch {})",
            dropped,
            report.discards.get(DiscardCategory::Policy),
            report.discards.get(DiscardCategory::KernelRestart),
            report.discards.get(DiscardCategory::MissingState),
            report.discards.get(DiscardCategory::IdentityMismatch),
        );
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(values: &[(usize, u64, u64)]) -> CounterSnapshot {
        let mut replica = vec![CounterValue::default(); syscalls::NUM_SYSCALLS];
        for &(sysno, count, overhead) in values {
            replica[sysno] = CounterValue { count, overhead };
        }
        CounterSnapshot {
            percpu: vec![replica],
        }
    }

    #[test]
    fn test_row_units() {
        let row = ReportRow::new(39, CounterValue { count: 4, overhead: 10_000 });
        assert_eq!(row.sysname, "getpid");
        assert_eq!(row.overhead_us, 10.0);
        assert_eq!(row.avg_overhead_us, 2.5);
    }

    #[test]
    fn test_zero_rows_dropped() {
        let rows = rows_from_totals(&snapshot(&[(0, 1, 5), (1, 0, 0)]).merge());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sysname, "read");
    }

    #[test]
    fn test_sort_keys() {
        let mut rows = rows_from_totals(
            &snapshot(&[(0, 10, 1_000), (1, 1, 5_000), (39, 100, 2_000)]).merge(),
        );

        sort_rows(&mut rows, SortKey::Sysname);
        let names: Vec<_> = rows.iter().map(|r| r.sysname.as_str()).collect();
        assert_eq!(names, ["getpid", "read", "write"]);

        sort_rows(&mut rows, SortKey::Sysnum);
        assert_eq!(rows[0].sysnum, 39);

        sort_rows(&mut rows, SortKey::Count);
        assert_eq!(rows[0].sysname, "getpid");

        sort_rows(&mut rows, SortKey::Overhead);
        assert_eq!(rows[0].sysname, "write");

        sort_rows(&mut rows, SortKey::AvgOverhead);
        assert_eq!(rows[0].sysname, "write");
        assert_eq!(rows[2].sysname, "getpid");
    }

    #[test]
    fn test_delta_against_previous() {
        let mut reporter = Reporter::new(SortKey::Sysnum);
        let tally = DiscardTally::default();

        let first = reporter.checkpoint(&snapshot(&[(39, 10, 100)]), false, false, &tally);
        assert_eq!(first.seq, 0);
        assert!(first.delta.is_none());

        let second = reporter.checkpoint(
            &snapshot(&[(39, 15, 150), (0, 2, 20)]),
            false,
            true,
            &tally,
        );
        assert_eq!(second.seq, 1);
        let delta = second.delta.unwrap();
        assert_eq!(delta.len(), 2);
        assert_eq!((delta[0].sysnum, delta[0].count), (39, 5));
        assert_eq!((delta[1].sysnum, delta[1].count), (0, 2));
    }

    #[test]
    fn test_cleared_reports_have_no_delta() {
        let mut reporter = Reporter::new(SortKey::Count);
        let tally = DiscardTally::default();
        let first = reporter.checkpoint(&snapshot(&[(39, 10, 100)]), true, false, &tally);
        assert_eq!(first.rows[0].count, 10);
        let next = reporter.checkpoint(&snapshot(&[(39, 13, 130)]), true, false, &tally);
        assert!(next.delta.is_none());
        assert_eq!(next.rows.len(), 1);
        assert_eq!((next.rows[0].count, next.rows[0].overhead_us), (3, 0.03));

        // Nothing new since the last checkpoint leaves an empty table
        let idle = reporter.checkpoint(&snapshot(&[(39, 13, 130)]), true, true, &tally);
        assert!(idle.rows.is_empty());
    }

    #[test]
    fn test_discard_tally() {
        let mut tally = DiscardTally::default();
        tally.record(Discard::RestartSyscall);
        tally.record(Discard::RestartPending);
        tally.record(Discard::CallerMismatch);
        assert_eq!(tally.get(DiscardCategory::KernelRestart), 2);
        assert_eq!(tally.get(DiscardCategory::IdentityMismatch), 1);
        assert_eq!(tally.get(DiscardCategory::Policy), 0);
        assert_eq!(tally.total(), 3);
    }

    #[test]
    fn test_render_text() {
        let mut reporter = Reporter::new(SortKey::AvgOverhead);
        let mut tally = DiscardTally::default();
        tally.record(Discard::OutOfScope);
        let report = reporter.checkpoint(&snapshot(&[(39, 100, 50_000)]), false, true, &tally);

        let text = render_text(&report, true);
        assert!(text.starts_with("Experiment start: "));
        assert!(text.contains("Current time:     "));
        assert!(text.contains("Seconds elapsed:  "));
        assert!(text.contains("SYSNUM SYSCALL"));
        assert!(text.contains("AVG. OVERHEAD(us)"));
        let line = text.lines().find(|l| l.contains("getpid")).unwrap();
        assert!(line.trim_start().starts_with("39 getpid"));
        assert!(line.contains("100"));
        assert!(line.contains("50.000"));
        assert!(line.trim_end().ends_with("0.500"));
        assert!(text.contains("Dropped events: 1 (policy 1,"));
    }

    #[test]
    fn test_render_text_without_sysnum() {
        let mut reporter = Reporter::new(SortKey::AvgOverhead);
        let report =
            reporter.checkpoint(&snapshot(&[]), false, true, &DiscardTally::default());
        let text = render_text(&report, false);
        assert!(!text.contains("SYSNUM"));
        assert!(!text.contains("Dropped events"));
    }
}
