//! Epoch-seconds timestamps.
//!
//! The API and the credential file both carry times as integer seconds since
//! the Unix epoch. Use with `#[serde(with = "crate::epoch")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(to_secs(*time))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
    let secs = i64::deserialize(deserializer)?;
    from_secs(secs).ok_or_else(|| serde::de::Error::custom(format!("timestamp {} out of range", secs)))
}

/// Seconds since the epoch, clamped at zero
pub fn to_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Negative timestamps are rejected
pub fn from_secs(secs: i64) -> Option<SystemTime> {
    let secs = u64::try_from(secs).ok()?;
    UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Stamp {
        #[serde(with = "crate::epoch")]
        at: SystemTime,
    }

    #[test]
    fn test_epoch_seconds() {
        let stamp: Stamp = serde_json::from_str(r#"{"at": 1700000000}"#).unwrap();
        assert_eq!(to_secs(stamp.at), 1_700_000_000);
        assert_eq!(serde_json::to_string(&stamp).unwrap(), r#"{"at":1700000000}"#);

        assert!(serde_json::from_str::<Stamp>(r#"{"at": -5}"#).is_err());
    }
}
