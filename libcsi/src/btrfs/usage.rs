//! Parser for `btrfs filesystem usage --raw` reports.
//!
//! The report is free-form `key: value` text whose field order and
//! indentation have changed between btrfs-progs releases, so fields are
//! looked up by key and never by position.  Example:
//!
//! ```text
//! Overall:
//!     Device size:                       10737418240
//!     Used:                                   393216
//!     Free (estimated):                  10183770112      (min: 5096079360)
//!     Data ratio:                               1.00
//!     Global reserve:                        5767168      (used: 0)
//!     Multiple profiles:                          no
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ParseError;

const FREE_ESTIMATED: &str = "Free (estimated)";

/// One point-in-time usage snapshot.  All sizes are bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemUsage {
    pub device_size: u64,
    pub device_allocated: u64,
    pub device_unallocated: u64,
    pub device_missing: u64,
    pub device_slack: u64,
    pub used: u64,
    pub free_estimated: u64,
    /// The `(min: N)` annotation on the free-estimated line.
    pub free_estimated_min: u64,
    pub free_statfs: u64,
    pub data_ratio: f64,
    pub metadata_ratio: f64,
    pub global_reserve: u64,
    /// The `(used: N)` annotation on the global-reserve line.
    pub global_reserve_used: u64,
    pub multiple_profiles: bool,
}

/// A report line split into key, leading value token and the optional
/// parenthetical annotation that follows it.
struct Field<'a> {
    key: &'a str,
    value: &'a str,
    annotation: Option<(&'a str, &'a str)>,
}

fn split_line(line: &str) -> Option<Field<'_>> {
    let (key, rest) = line.split_once(':')?;
    let key = key.trim();
    let rest = rest.trim();
    let value = rest.split_whitespace().next()?;

    let annotation = rest
        .find('(')
        .and_then(|start| {
            let inner = &rest[start + 1..];
            inner.find(')').map(|end| &inner[..end])
        })
        .and_then(|inner| inner.split_once(':'))
        .map(|(name, n)| (name.trim(), n.trim()));

    Some(Field {
        key,
        value,
        annotation,
    })
}

fn int(key: &str, value: &str) -> Result<u64, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidInteger {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn ratio(key: &str, value: &str) -> Result<f64, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidRatio {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn flag(key: &str, value: &str) -> Result<bool, ParseError> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(ParseError::InvalidFlag {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

impl FilesystemUsage {
    /// Decode a full report.  Unknown keys are ignored; a missing
    /// `Free (estimated)` line is an error because capacity reporting
    /// depends on it.
    pub fn parse(report: &str) -> Result<Self, ParseError> {
        let mut usage = Self::default();
        let mut saw_free = false;

        for field in report.lines().filter_map(split_line) {
            let Field {
                key,
                value,
                annotation,
            } = field;
            match key {
                "Device size" => usage.device_size = int(key, value)?,
                "Device allocated" => usage.device_allocated = int(key, value)?,
                "Device unallocated" => usage.device_unallocated = int(key, value)?,
                "Device missing" => usage.device_missing = int(key, value)?,
                "Device slack" => usage.device_slack = int(key, value)?,
                "Used" => usage.used = int(key, value)?,
                FREE_ESTIMATED => {
                    usage.free_estimated = int(key, value)?;
                    saw_free = true;
                    if let Some(("min", min)) = annotation {
                        usage.free_estimated_min = int("Free (estimated) min", min)?;
                    }
                }
                "Free (statfs, df)" => usage.free_statfs = int(key, value)?,
                "Data ratio" => usage.data_ratio = ratio(key, value)?,
                "Metadata ratio" => usage.metadata_ratio = ratio(key, value)?,
                "Global reserve" => {
                    usage.global_reserve = int(key, value)?;
                    if let Some(("used", used)) = annotation {
                        usage.global_reserve_used = int("Global reserve used", used)?;
                    }
                }
                "Multiple profiles" => usage.multiple_profiles = flag(key, value)?,
                _ => {}
            }
        }

        if !saw_free {
            return Err(ParseError::MissingField {
                key: FREE_ESTIMATED.to_owned(),
            });
        }
        Ok(usage)
    }
}

impl FromStr for FilesystemUsage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
