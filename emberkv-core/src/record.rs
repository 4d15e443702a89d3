use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Sentinel expiration meaning "never expires"; encoded as zero on disk.
pub const EXPIRE_FOREVER: i64 = 0;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as i64)
}

/// Deadline for a record written now with the given lifetime in seconds.
/// Zero seconds means the record never expires.
pub(crate) fn deadline_after(expire_seconds: i64) -> i64 {
    if expire_seconds == 0 {
        EXPIRE_FOREVER
    } else {
        now_nanos() + expire_seconds.saturating_mul(NANOS_PER_SECOND)
    }
}

fn deadline_passed(expire_at: i64, now: i64) -> bool {
    expire_at != EXPIRE_FOREVER && expire_at <= now
}

/// A single string value under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub key: String,
    pub data: String,
    pub expire_at: i64,
}

impl ScalarRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        deadline_passed(self.expire_at, now)
    }
}

/// A field-name to value mapping under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashRecord {
    pub key: String,
    pub fields: HashMap<String, String>,
    pub expire_at: i64,
}

impl HashRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        deadline_passed(self.expire_at, now)
    }
}

/// An ordered sequence of strings under a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRecord {
    pub key: String,
    pub items: Vec<String>,
    pub expire_at: i64,
}

impl ListRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        deadline_passed(self.expire_at, now)
    }
}

/// The kind of a committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Add,
    Del,
}

/// A record of any of the three shapes, as handed to the change observer.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Scalar(ScalarRecord),
    Hash(HashRecord),
    List(ListRecord),
}

impl Item {
    /// The top-level key of the wrapped record.
    pub fn key(&self) -> &str {
        match self {
            Item::Scalar(record) => &record.key,
            Item::Hash(record) => &record.key,
            Item::List(record) => &record.key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forever_records_never_expire() {
        let record = ScalarRecord {
            key: "k".to_string(),
            data: "v".to_string(),
            expire_at: EXPIRE_FOREVER,
        };
        assert!(!record.is_expired(i64::MAX));
    }

    #[test]
    fn deadline_is_inclusive() {
        let record = ScalarRecord {
            key: "k".to_string(),
            data: "v".to_string(),
            expire_at: 100,
        };
        assert!(!record.is_expired(99));
        assert!(record.is_expired(100));
        assert!(record.is_expired(101));
    }

    #[test]
    fn zero_seconds_means_forever() {
        assert_eq!(deadline_after(0), EXPIRE_FOREVER);
    }

    #[test]
    fn positive_seconds_land_in_the_future() {
        let deadline = deadline_after(60);
        assert!(deadline > now_nanos());
        assert!(deadline <= now_nanos() + 61 * NANOS_PER_SECOND);
    }

    #[test]
    fn item_exposes_the_record_key() {
        let item = Item::List(ListRecord {
            key: "queue".to_string(),
            items: vec!["a".to_string()],
            expire_at: EXPIRE_FOREVER,
        });
        assert_eq!(item.key(), "queue");
    }
}
