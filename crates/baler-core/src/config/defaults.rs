use std::time::Duration;

use super::types::LockModeConfig;
use crate::error::{BalerError, Result};

pub(super) fn default_label() -> String {
    "backup".to_string()
}

pub(super) fn default_max_unreadable() -> usize {
    100
}

pub(super) fn default_big_file_threshold() -> String {
    "100MiB".to_string()
}

pub(super) fn default_max_children() -> usize {
    250
}

pub(super) fn default_max_nodes() -> usize {
    10_000
}

pub(super) fn default_glob_size() -> String {
    "1MiB".to_string()
}

pub(super) fn default_batch_rows() -> u64 {
    1000
}

pub(super) fn default_segment_size() -> String {
    "4MiB".to_string()
}

pub(super) fn default_time_budget() -> String {
    "25s".to_string()
}

pub(super) fn default_max_retries() -> u32 {
    3
}

pub(super) fn default_lock_mode() -> LockModeConfig {
    LockModeConfig::Auto
}

pub(super) fn default_true() -> bool {
    true
}

/// Parse a duration string like "500ms", "25s", "5m", "4h" or "2d".
///
/// A plain number is taken as seconds.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(BalerError::Config("duration must not be empty".into()));
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (num_part, unit) = input.split_at(split);

    let value: u64 = num_part
        .parse()
        .map_err(|_| BalerError::Config(format!("invalid duration value: '{raw}'")))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(value),
        "" | "s" | "S" => Duration::from_secs(value),
        "m" | "M" => Duration::from_secs(value.saturating_mul(60)),
        "h" | "H" => Duration::from_secs(value.saturating_mul(60 * 60)),
        "d" | "D" => Duration::from_secs(value.saturating_mul(60 * 60 * 24)),
        other => {
            return Err(BalerError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use ms/s/m/h/d)"
            )));
        }
    };

    if duration.is_zero() {
        return Err(BalerError::Config(
            "duration must be greater than zero".into(),
        ));
    }

    Ok(duration)
}

/// Parse a byte size like "512", "64KiB", "2MiB", "1G" or "10MB".
///
/// Binary and decimal suffixes are both accepted; a bare `K`/`M`/`G` is binary.
pub fn parse_human_size(raw: &str) -> Result<u64> {
    let input = raw.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (num_part, unit) = input.split_at(split);

    let value: u64 = num_part
        .parse()
        .map_err(|_| BalerError::Config(format!("invalid size value: '{raw}'")))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        other => {
            return Err(BalerError::Config(format!(
                "unsupported size suffix '{other}' in '{raw}'"
            )));
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| BalerError::Config(format!("size out of range: '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_human_duration_units() {
        assert_eq!(parse_human_duration("500ms").unwrap().as_millis(), 500);
        assert_eq!(parse_human_duration("25s").unwrap().as_secs(), 25);
        assert_eq!(parse_human_duration("5m").unwrap().as_secs(), 5 * 60);
        assert_eq!(parse_human_duration("4h").unwrap().as_secs(), 4 * 60 * 60);
        assert_eq!(
            parse_human_duration("2d").unwrap().as_secs(),
            2 * 24 * 60 * 60
        );
    }

    #[test]
    fn test_parse_human_duration_plain_number_is_seconds() {
        assert_eq!(parse_human_duration("30").unwrap().as_secs(), 30);
    }

    #[test]
    fn test_parse_human_duration_rejects_invalid_values() {
        assert!(parse_human_duration("").is_err());
        assert!(parse_human_duration("0s").is_err());
        assert!(parse_human_duration("5w").is_err());
        assert!(parse_human_duration("s").is_err());
    }

    #[test]
    fn test_parse_human_size() {
        assert_eq!(parse_human_size("512").unwrap(), 512);
        assert_eq!(parse_human_size("64KiB").unwrap(), 64 * 1024);
        assert_eq!(parse_human_size("2MiB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_human_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_human_size("10MB").unwrap(), 10_000_000);
        assert!(parse_human_size("10XB").is_err());
        assert!(parse_human_size("MiB").is_err());
    }
}
