//! Configuration types for runtime and execution settings

use anyhow::{Context, anyhow};
use std::time::Duration;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
    /// Print the summary on stderr, stdout carries the tool's own output
    pub summary_to_stderr: bool,
}

impl OutputConfig {
    /// Default log directive for the configured verbosity
    pub fn level(&self) -> &'static str {
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Parse an age given either as plain seconds ("3600") or as a human readable duration ("1h 30m")
pub fn parse_age(value: &str) -> anyhow::Result<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(value).with_context(|| format!("invalid age: '{}'", value))
}

/// Split an `attribute=value` pair
pub fn parse_pair(value: &str) -> anyhow::Result<(String, String)> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("expected attribute=value, got '{}'", value))?;
    if key.is_empty() {
        return Err(anyhow!("empty attribute name in '{}'", value));
    }
    Ok((key.to_string(), val.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_age() {
        assert_eq!(parse_age("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_age("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_age("2days").unwrap(), Duration::from_secs(172800));
        assert!(parse_age("soon").is_err());
    }

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("source=%sp").unwrap(),
            ("source".to_string(), "%sp".to_string())
        );
        assert_eq!(
            parse_pair("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_pair("novalue").is_err());
        assert!(parse_pair("=x").is_err());
    }

    #[test]
    fn test_level() {
        let mut output = OutputConfig::default();
        assert_eq!(output.level(), "error");
        output.verbose = 5;
        assert_eq!(output.level(), "trace");
    }
}
