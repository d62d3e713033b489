use std::num::{IntErrorKind, ParseIntError};

use serde::Serialize;

/// Reports the statistics for a cgroup. Controllers fill in their part of the
/// record in place, so several of them can share one instance.
#[derive(Debug, Serialize, Default, PartialEq, Eq)]
pub struct Stats {
    /// Cpu statistics for the cgroup
    pub cpu: CpuStats,
}

/// Reports the cpu statistics for a cgroup
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    /// Cpu Throttling statistics for the cgroup
    pub throttling: CpuThrottling,
}

/// Reports the cpu throttling for a cgroup
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuThrottling {
    /// Number of period intervals (as specified in cpu.cfs_period_us) that have elapsed
    pub periods: u64,
    /// Number of period intervals where tasks have been throttled because they exhausted their quota
    pub throttled_periods: u64,
    /// Total time duration (in nanoseconds) for which tasks have been throttled
    pub throttled_time: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("entry '{line}' does not conform to 'key value'")]
    DoesNotConform { line: String },
    #[error("failed to parse value {value} of {key}: {err}")]
    FailedToParse {
        key: String,
        value: String,
        err: ParseIntError,
    },
}

/// Splits one line of a stats file into its key and numeric value.
#[cfg_attr(test, automock)]
pub trait KeyValueParser {
    fn parse(&self, line: &str) -> Result<(String, u64), ParseError>;
}

/// Parses entries of the flat keyed format, i.e. `key value` separated by whitespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatKeyedParser;

impl KeyValueParser for FlatKeyedParser {
    fn parse(&self, line: &str) -> Result<(String, u64), ParseError> {
        let entry_fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if entry_fields.len() != 2 {
            return Err(ParseError::DoesNotConform { line: line.into() });
        }

        let value = parse_value(entry_fields[1]).map_err(|err| ParseError::FailedToParse {
            key: entry_fields[0].into(),
            value: entry_fields[1].into(),
            err,
        })?;

        Ok((entry_fields[0].to_owned(), value))
    }
}

/// Parses this string slice into an u64. Negative values are reported as 0,
/// since the kernel exposes some counters as -1.
/// # Example
/// ```
/// use libcpuctl::stats::parse_value;
///
/// assert_eq!(parse_value("32").unwrap(), 32);
/// assert_eq!(parse_value("-1").unwrap(), 0);
/// ```
pub fn parse_value(value: &str) -> Result<u64, ParseIntError> {
    value.parse().or_else(|err| match value.parse::<i64>() {
        Ok(signed) if signed < 0 => Ok(0),
        Err(signed_err) if *signed_err.kind() == IntErrorKind::NegOverflow => Ok(0),
        _ => Err(err),
    })
}
