//! `/proc/meminfo` reader.
//!
//! Lines are `Label:   <value> kB`. Only the first line carrying a label is
//! consulted.

use std::path::Path;

use super::{TelemetryError, TelemetryResult, read_proc_file};

/// Label of the total memory line.
pub const MEM_TOTAL: &str = "MemTotal:";

/// Label of the available memory line.
pub const MEM_AVAILABLE: &str = "MemAvailable:";

/// Reads `label` from the meminfo file at `path`, in kilobytes.
///
/// # Errors
///
/// Returns an error if the file is unreadable, the label is absent, or its
/// value is not an unsigned integer.
pub fn read_field(path: &Path, label: &str) -> TelemetryResult<u64> {
    let content = read_proc_file(path)?;
    parse_field(&content, label).map_err(|reason| match reason {
        FieldError::Missing => TelemetryError::MissingField {
            path: path.display().to_string(),
            field: label.to_string(),
        },
        FieldError::Malformed(value) => TelemetryError::Parse {
            path: path.display().to_string(),
            reason: format!("invalid {label} value: '{value}'"),
        },
    })
}

#[derive(Debug, PartialEq, Eq)]
enum FieldError {
    Missing,
    Malformed(String),
}

fn parse_field(content: &str, label: &str) -> Result<u64, FieldError> {
    let line = content
        .lines()
        .find(|line| line.starts_with(label))
        .ok_or(FieldError::Missing)?;

    let value = line[label.len()..]
        .split_whitespace()
        .next()
        .ok_or_else(|| FieldError::Malformed(String::new()))?;

    value
        .parse::<u64>()
        .map_err(|_| FieldError::Malformed(value.to_string()))
}
