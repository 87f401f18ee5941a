//! Human-readable duration parsing for configuration values.

use std::time::Duration;

use crate::error::Error;

/// Parses `"30s"`, `"5m"`, `"250ms"` and friends into a [`Duration`].
///
/// Bare integers are taken as seconds, matching what operators usually mean
/// in environment variables.
pub fn parse(input: &str) -> Result<Duration, Error> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::configuration("duration must not be empty"));
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed)
        .map_err(|e| Error::configuration(format!("invalid duration {trimmed:?}: {e}")))
}

/// Parses a comma-separated backoff schedule, e.g. `"1s,5s,15s"`.
pub fn parse_schedule(input: &str) -> Result<Vec<Duration>, Error> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse)
        .collect()
}
