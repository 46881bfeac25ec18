//! Processor discovery
//!
//! The counter table needs one replica per *possible* CPU, not per online
//! CPU: a hot-plugged processor must still find its replica.

use anyhow::{bail, Context, Result};

const POSSIBLE_CPUS: &str = "/sys/devices/system/cpu/possible";

/// Parse a sysfs CPU list such as `0-3,8,10-11`
pub fn parse_cpu_list(content: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for group in content.trim().split(',').filter(|g| !g.is_empty()) {
        let mut bounds = group.splitn(2, '-');
        let start: u32 = bounds
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .with_context(|| format!("Invalid CPU range '{}'", group))?;
        let end: u32 = match bounds.next() {
            Some(end) => end
                .trim()
                .parse()
                .with_context(|| format!("Invalid CPU range '{}'", group))?,
            None => start,
        };
        if end < start {
            bail!("Invalid CPU range '{}'", group);
        }
        cpus.extend(start..=end);
    }
    Ok(cpus)
}

/// Number of replicas needed to cover every possible CPU id
pub fn num_possible_cpus() -> usize {
    match std::fs::read_to_string(POSSIBLE_CPUS)
        .context("Failed to read possible CPUs")
        .and_then(|content| parse_cpu_list(&content))
    {
        Ok(cpus) if !cpus.is_empty() => cpus.iter().max().map_or(1, |&max| max as usize + 1),
        Ok(_) => fallback_cpus(),
        Err(e) => {
            tracing::debug!("{:#}, falling back to available parallelism", e);
            fallback_cpus()
        }
    }
}

fn fallback_cpus() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

/// Processor `tid` last ran on, field 39 of `/proc/<tid>/stat`
pub fn last_cpu_of(tid: u32) -> Result<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", tid))
        .with_context(|| format!("Failed to read /proc/{}/stat", tid))?;
    parse_stat_processor(&stat).with_context(|| format!("Malformed /proc/{}/stat", tid))
}

/// The command name (field 2) may contain spaces and parentheses, so fields
/// are counted from the last ')'.
fn parse_stat_processor(stat: &str) -> Result<u32> {
    let after_comm = stat
        .rfind(')')
        .map(|pos| &stat[pos + 1..])
        .context("missing command name")?;
    // after_comm starts at field 3 (state); processor is field 39
    let field = after_comm
        .split_whitespace()
        .nth(39 - 3)
        .context("missing processor field")?;
    Ok(field.parse()?)
}
