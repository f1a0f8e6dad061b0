//! Composite keys for sorting through the aggregate operator.
//!
//! The aggregate operator emits groups in ascending key order. Inverting the
//! magnitude of the timestamp and id and zero-padding both turns that into
//! newest-first order, with the larger id first among equal timestamps.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// 2100-01-01T00:00:00Z.
pub const MAX_TIMESTAMP: i64 = 4_102_444_800;

pub const MAX_ID: u64 = 999_999_999_999_999_999;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SortKeyError {
    #[error("unrecognized timestamp '{0}'")]
    Timestamp(String),

    #[error("timestamp {0} is outside 0..={MAX_TIMESTAMP}")]
    TimestampOutOfRange(i64),

    #[error("invalid id '{0}': expected a non-negative integer")]
    Id(String),

    #[error("id {0} exceeds {MAX_ID}")]
    IdOutOfRange(u64),
}

/// Build the key for one record.
pub fn composite_key(timestamp: i64, id: u64) -> Result<String, SortKeyError> {
    if !(0..=MAX_TIMESTAMP).contains(&timestamp) {
        return Err(SortKeyError::TimestampOutOfRange(timestamp));
    }
    if id > MAX_ID {
        return Err(SortKeyError::IdOutOfRange(id));
    }
    Ok(format!(
        "{:012}_{:020}",
        MAX_TIMESTAMP - timestamp,
        MAX_ID - id
    ))
}

/// Parse a creation date into epoch seconds.
///
/// Accepts epoch seconds, RFC 3339, the `2010-02-14T15:32:10.447+0000` form
/// used by LDBC exports, and naive date-times (read as UTC).
pub fn parse_timestamp(raw: &str) -> Result<i64, SortKeyError> {
    let s = raw.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(dt.timestamp());
    }
    let naive = s.trim_end_matches('Z');
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Some(dt) = NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(dt.and_utc().timestamp());
    }
    Err(SortKeyError::Timestamp(raw.to_string()))
}

/// Build the key from raw CSV fields.
pub fn sort_key_for(timestamp: &str, id: &str) -> Result<String, SortKeyError> {
    let ts = parse_timestamp(timestamp)?;
    let id: u64 = id
        .trim()
        .parse()
        .map_err(|_| SortKeyError::Id(id.to_string()))?;
    composite_key(ts, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_sorts_first() {
        let newer = composite_key(1_300_000_000, 1).unwrap();
        let older = composite_key(1_200_000_000, 1).unwrap();
        assert!(newer < older);
    }

    #[test]
    fn test_larger_id_breaks_ties_first() {
        let big = composite_key(1_300_000_000, 900).unwrap();
        let small = composite_key(1_300_000_000, 12).unwrap();
        assert!(big < small);
    }

    #[test]
    fn test_timestamp_dominates_id() {
        let newer_small_id = composite_key(1_300_000_001, 0).unwrap();
        let older_big_id = composite_key(1_300_000_000, MAX_ID).unwrap();
        assert!(newer_small_id < older_big_id);
    }

    #[test]
    fn test_fixed_width() {
        let key = composite_key(0, 0).unwrap();
        assert_eq!(key, "004102444800_00999999999999999999");
        assert_eq!(composite_key(MAX_TIMESTAMP, MAX_ID).unwrap().len(), key.len());
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(
            composite_key(-1, 0),
            Err(SortKeyError::TimestampOutOfRange(-1))
        );
        assert_eq!(
            composite_key(0, MAX_ID + 1),
            Err(SortKeyError::IdOutOfRange(MAX_ID + 1))
        );
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp("1266161530").unwrap(), 1_266_161_530);
        assert_eq!(
            parse_timestamp("2010-02-14T15:32:10.447+0000").unwrap(),
            1_266_161_530
        );
        assert_eq!(
            parse_timestamp("2010-02-14T15:32:10Z").unwrap(),
            1_266_161_530
        );
        assert_eq!(
            parse_timestamp("2010-02-14 15:32:10").unwrap(),
            1_266_161_530
        );
        assert_eq!(parse_timestamp("2010-02-14").unwrap(), 1_266_105_600);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_sort_key_for_bad_id() {
        assert_eq!(
            sort_key_for("0", "abc"),
            Err(SortKeyError::Id("abc".into()))
        );
    }
}
