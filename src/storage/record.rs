//! Versioned envelope for everything the tiers persist, plus the in-process
//! deadline index used for TTL checks.
//!
//! On disk every payload looks like
//! `{"schema":"cache_entry","version":1,"created_at":"...","ttl_ms":600000,"body":{...}}`.
//! A reader rejects an unknown schema tag or a newer version instead of guessing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{StorageError, StorageResult};

pub const RECORD_VERSION: u16 = 1;

pub mod schema {
    pub const CACHE_ENTRY: &str = "cache_entry";
    pub const EPHEMERAL_ARTIFACT: &str = "ephemeral_artifact";
    pub const INDEXED_DOCUMENT: &str = "indexed_document";
    pub const VECTOR_COLLECTION: &str = "vector_collection";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record<T> {
    pub schema: String,
    pub version: u16,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    pub body: T,
}

#[derive(Deserialize)]
struct Header {
    schema: String,
    version: u16,
}

impl<T> Record<T> {
    pub fn new(schema: &str, body: T, ttl: Option<Duration>) -> Self {
        Self {
            schema: schema.to_string(),
            version: RECORD_VERSION,
            created_at: Utc::now(),
            ttl_ms: ttl.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            body,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    /// Wall-clock remaining lifetime, for records written by an earlier process.
    /// `None` when the record never expires; zero when it already has.
    pub fn wall_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let ttl = self.ttl()?;
        let age = (now - self.created_at).to_std().unwrap_or(Duration::ZERO);
        Some(ttl.saturating_sub(age))
    }
}

impl<T: Serialize> Record<T> {
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> Record<T> {
    pub fn decode(expected_schema: &str, bytes: &[u8]) -> StorageResult<Self> {
        let h: Header = serde_json::from_slice(bytes)?;
        if h.schema != expected_schema || h.version > RECORD_VERSION || h.version == 0 {
            return Err(StorageError::Schema {
                schema: h.schema,
                version: h.version,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Monotonic deadlines for keys this process wrote or has already seen.
///
/// Expired means `now >= deadline`, so a zero TTL is expired right away.
#[derive(Debug, Default)]
pub struct Deadlines {
    /// key -> (created_at of the record the deadline belongs to, deadline)
    map: Mutex<HashMap<String, (DateTime<Utc>, Instant)>>,
}

impl Deadlines {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (DateTime<Utc>, Instant)>> {
        self.map.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remember the deadline of a record this process just wrote.
    pub fn track<T>(&self, key: &str, record: &Record<T>) {
        match record.ttl() {
            Some(ttl) => {
                let deadline = Instant::now() + ttl;
                self.lock()
                    .insert(key.to_string(), (record.created_at, deadline));
            }
            None => self.forget(key),
        }
    }

    pub fn forget(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Whether the record stored under `key` is past its TTL.
    ///
    /// Keys without a known deadline fall back to the record's wall-clock age once,
    /// then get a monotonic deadline so later checks ignore clock adjustments.
    pub fn is_expired<T>(&self, key: &str, record: &Record<T>) -> bool {
        self.overdue(key, record).is_some()
    }

    /// How long ago the record's deadline passed; `None` while it is still live.
    pub fn overdue<T>(&self, key: &str, record: &Record<T>) -> Option<Duration> {
        let now = Instant::now();
        let mut map = self.lock();
        let deadline = match map.get(key) {
            Some((created, deadline)) if *created == record.created_at => *deadline,
            _ => {
                let wall_now = Utc::now();
                let left = record.wall_remaining(wall_now)?;
                // Carry over how long ago it expired, so tombstone windows still line up.
                let past = match (left.is_zero(), record.ttl()) {
                    (true, Some(ttl)) => (wall_now - record.created_at)
                        .to_std()
                        .map(|age| age.saturating_sub(ttl))
                        .unwrap_or(Duration::ZERO),
                    _ => Duration::ZERO,
                };
                let deadline = now.checked_sub(past).unwrap_or(now) + left;
                map.insert(key.to_string(), (record.created_at, deadline));
                deadline
            }
        };
        if now >= deadline {
            Some(now - deadline)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_schema_and_future_version() {
        let r = Record::new(schema::CACHE_ENTRY, 42u32, None);
        let bytes = r.encode().unwrap();
        assert!(Record::<u32>::decode(schema::CACHE_ENTRY, &bytes).is_ok());
        assert!(matches!(
            Record::<u32>::decode(schema::EPHEMERAL_ARTIFACT, &bytes),
            Err(StorageError::Schema { .. })
        ));

        let future = br#"{"schema":"cache_entry","version":9,"created_at":"2024-01-01T00:00:00Z","body":1}"#;
        assert!(matches!(
            Record::<u32>::decode(schema::CACHE_ENTRY, future),
            Err(StorageError::Schema { version: 9, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_at_ttl() {
        let d = Deadlines::new();
        let r = Record::new(schema::CACHE_ENTRY, (), Some(Duration::from_secs(10)));
        d.track("k", &r);
        assert!(!d.is_expired("k", &r));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(d.is_expired("k", &r));
    }

    #[test]
    fn unknown_key_uses_wall_clock_age() {
        let d = Deadlines::new();
        let mut r = Record::new(schema::CACHE_ENTRY, (), Some(Duration::from_secs(60)));
        r.created_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(d.is_expired("old", &r));

        let fresh = Record::new(schema::CACHE_ENTRY, (), Some(Duration::from_secs(60)));
        assert!(!d.is_expired("fresh", &fresh));
    }
}
