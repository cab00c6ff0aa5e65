//! Capacity and retention unit conversions
//!
//! The canonical capacity unit on the wire is KiB. Declared sizes convert to
//! KiB and back without loss; anything that would need rounding is rejected.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// KiB in one GiB
pub const GIB_IN_KB: u64 = 1024 * 1024;

/// KiB in one TiB
pub const TIB_IN_KB: u64 = 1024 * 1024 * 1024;

/// Volumes are allocated in 8 GiB slices
pub const VOLUME_GRANULARITY_KB: u64 = 8 * GIB_IN_KB;

const HOUR_IN_MINUTES: u64 = 60;
const DAY_IN_MINUTES: u64 = 24 * HOUR_IN_MINUTES;

/// Unit a size is declared in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapacityUnit {
    #[default]
    GB,
    TB,
}

impl CapacityUnit {
    /// KiB per one of this unit
    pub fn kb_per_unit(self) -> u64 {
        match self {
            CapacityUnit::GB => GIB_IN_KB,
            CapacityUnit::TB => TIB_IN_KB,
        }
    }
}

impl std::fmt::Display for CapacityUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityUnit::GB => write!(f, "GB"),
            CapacityUnit::TB => write!(f, "TB"),
        }
    }
}

impl std::str::FromStr for CapacityUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GB" => Ok(CapacityUnit::GB),
            "TB" => Ok(CapacityUnit::TB),
            other => Err(Error::validation(format!(
                "unknown capacity unit {other:?}, expected GB or TB"
            ))),
        }
    }
}

/// Convert a declared size to KiB
pub fn to_kb(size: u64, unit: CapacityUnit) -> Result<u64> {
    size.checked_mul(unit.kb_per_unit())
        .ok_or_else(|| Error::validation(format!("size {size}{unit} overflows")))
}

/// Convert KiB back to the declared unit, rejecting values that do not divide evenly
pub fn from_kb(kb: u64, unit: CapacityUnit) -> Result<u64> {
    let per = unit.kb_per_unit();
    if kb % per != 0 {
        return Err(Error::validation(format!(
            "{kb} KB is not a whole number of {unit}"
        )));
    }
    Ok(kb / per)
}

/// Convert a declared volume size to KiB, enforcing the 8 GB allocation granularity
pub fn volume_size_kb(size: u64, unit: CapacityUnit) -> Result<u64> {
    if size == 0 {
        return Err(Error::validation("volume size must be a positive number"));
    }
    let kb = to_kb(size, unit)?;
    if kb % VOLUME_GRANULARITY_KB != 0 {
        return Err(Error::validation(format!(
            "volume size {size}{unit} must be a positive number in granularity of 8 GB"
        )));
    }
    Ok(kb)
}

/// Whole GiB for resize requests
pub fn kb_to_gb(kb: u64) -> u64 {
    kb / GIB_IN_KB
}

/// Size of a remote entity in the declared unit, falling back to GB when
/// the remote value is not a whole number of that unit
///
/// Anything below GiB resolution only shows in the raw KiB value.
pub fn observed_size(kb: u64, unit: CapacityUnit) -> (u64, CapacityUnit) {
    match from_kb(kb, unit) {
        Ok(size) => (size, unit),
        Err(_) => (kb_to_gb(kb), CapacityUnit::GB),
    }
}

/// Unit a snapshot retention is declared in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionUnit {
    #[default]
    Hours,
    Days,
}

impl RetentionUnit {
    fn minutes_per_unit(self) -> u64 {
        match self {
            RetentionUnit::Hours => HOUR_IN_MINUTES,
            RetentionUnit::Days => DAY_IN_MINUTES,
        }
    }
}

/// Convert a retention period to minutes
pub fn retention_minutes(value: u64, unit: RetentionUnit) -> Result<u64> {
    value
        .checked_mul(unit.minutes_per_unit())
        .ok_or_else(|| Error::validation(format!("retention {value} overflows")))
}

/// Retention in minutes derived from a snapshot's expiry and creation timestamps (seconds)
pub fn observed_retention_minutes(secure_exp_time: i64, creation_time: i64) -> Result<Option<u64>> {
    if secure_exp_time <= 0 {
        return Ok(None);
    }
    let secs = secure_exp_time.checked_sub(creation_time).ok_or_else(|| {
        Error::validation(format!(
            "snapshot expiry {secure_exp_time} and creation time {creation_time} are out of range"
        ))
    })?;
    Ok(u64::try_from(secs).ok().filter(|s| *s > 0).map(|s| s / 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_aligned_sizes_round_trip() {
        for (size, unit) in [(8, CapacityUnit::GB), (64, CapacityUnit::GB), (3, CapacityUnit::TB)] {
            let kb = to_kb(size, unit).unwrap();
            assert_eq!(from_kb(kb, unit).unwrap(), size);
        }
    }

    #[test]
    fn test_misaligned_kb_rejected() {
        assert_matches!(from_kb(GIB_IN_KB + 1, CapacityUnit::GB), Err(Error::Validation(_)));
        assert_matches!(from_kb(512 * GIB_IN_KB, CapacityUnit::TB), Err(Error::Validation(_)));
    }

    #[test]
    fn test_volume_granularity() {
        assert_eq!(volume_size_kb(8, CapacityUnit::GB).unwrap(), 8 * GIB_IN_KB);
        assert_eq!(volume_size_kb(1, CapacityUnit::TB).unwrap(), TIB_IN_KB);
        assert_matches!(volume_size_kb(10, CapacityUnit::GB), Err(Error::Validation(_)));
        assert_matches!(volume_size_kb(0, CapacityUnit::GB), Err(Error::Validation(_)));
    }

    #[test]
    fn test_retention() {
        assert_eq!(retention_minutes(2, RetentionUnit::Hours).unwrap(), 120);
        assert_eq!(retention_minutes(1, RetentionUnit::Days).unwrap(), 1440);
        assert_eq!(observed_retention_minutes(1_000 + 7_200, 1_000).unwrap(), Some(120));
        assert_eq!(observed_retention_minutes(0, 1_000).unwrap(), None);
        assert_eq!(observed_retention_minutes(500, 1_000).unwrap(), None);
    }

    #[test]
    fn test_retention_timestamps_out_of_range() {
        assert_matches!(
            observed_retention_minutes(i64::MAX, -1),
            Err(Error::Validation(_))
        );
    }

    #[test]
    fn test_observed_size_falls_back_to_gb() {
        assert_eq!(observed_size(2 * TIB_IN_KB, CapacityUnit::TB), (2, CapacityUnit::TB));
        assert_eq!(
            observed_size(1032 * GIB_IN_KB, CapacityUnit::TB),
            (1032, CapacityUnit::GB)
        );
        assert_eq!(observed_size(24 * GIB_IN_KB, CapacityUnit::GB), (24, CapacityUnit::GB));
    }

    #[test]
    fn test_unit_parse() {
        assert_eq!("TB".parse::<CapacityUnit>().unwrap(), CapacityUnit::TB);
        assert!("MB".parse::<CapacityUnit>().is_err());
    }
}
