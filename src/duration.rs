//! Time specifications for `--duration` and `--checkpoint`
//!
//! Works like the arguments to timeout(1): `90`, `90s`, `5m`, `2h`, `1d`,
//! `1w`. Several values add up, so `1m 30s` is ninety seconds.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("Invalid specification for time \"{0}\"")]
    Invalid(String),

    #[error("Time \"{0}\" is too large")]
    Overflow(String),
}

fn time_spec() -> &'static Regex {
    static SPEC: OnceLock<Regex> = OnceLock::new();
    SPEC.get_or_init(|| Regex::new(r"^(\d+)([sSmMhHdDwW]?)$").expect("static regex"))
}

/// Parse a single value such as `30m`
pub fn parse_time_spec(value: &str) -> Result<Duration, DurationParseError> {
    let value = value.trim();
    let caps = time_spec()
        .captures(value)
        .ok_or_else(|| DurationParseError::Invalid(value.to_string()))?;
    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| DurationParseError::Overflow(value.to_string()))?;
    let unit = match caps[2].to_ascii_lowercase().as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        _ => return Err(DurationParseError::Invalid(value.to_string())),
    };
    amount
        .checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(|| DurationParseError::Overflow(value.to_string()))
}

/// Sum several values, e.g. `["1m", "30s"]`
pub fn sum_time_specs<S: AsRef<str>>(values: &[S]) -> Result<Duration, DurationParseError> {
    values.iter().try_fold(Duration::ZERO, |total, value| {
        let part = parse_time_spec(value.as_ref())?;
        total
            .checked_add(part)
            .ok_or_else(|| DurationParseError::Overflow(value.as_ref().to_string()))
    })
}

/// Render a duration the way it would be typed, e.g. `1h 30s`
pub fn format_duration(duration: Duration) -> String {
    const UNITS: [(u64, &str); 5] = [
        (7 * 24 * 60 * 60, "w"),
        (24 * 60 * 60, "d"),
        (60 * 60, "h"),
        (60, "m"),
        (1, "s"),
    ];
    let mut secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let mut parts = Vec::new();
    for (size, suffix) in UNITS {
        if secs >= size {
            parts.push(format!("{}{}", secs / size, suffix));
            secs %= size;
        }
    }
    parts.join(" ")
}
