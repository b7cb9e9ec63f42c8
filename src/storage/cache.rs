//! Cache Tier: TTL'd key/value entries in front of the Fetch Orchestrator.
//!
//! Concurrent misses on one key coalesce: the first caller computes while the
//! rest wait on a per-key lock and then re-read the tier. Unrelated keys never
//! share a lock. A failed computation is not cached, so waiters behind a
//! failing leader compute again themselves.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StorageError, StorageResult};
use crate::storage::backend::DynBackend;
use crate::storage::record::{schema, Deadlines, Record};

const KEY_PREFIX: &str = "cache.";

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("firs_cache_hits_total", "Cache Tier reads answered from a live entry.");
        describe_counter!("firs_cache_misses_total", "Cache Tier reads that found nothing live.");
        describe_counter!(
            "firs_cache_coalesced_total",
            "Misses that waited on another caller's in-flight computation."
        );
    });
}

/// Result of a plain `get`. Not an error: a miss is ordinary control flow.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Hit(T),
    Miss,
}

impl<T> CacheLookup<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            CacheLookup::Hit(v) => Some(v),
            CacheLookup::Miss => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// Where a value handed back by the tier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Cache,
    Fresh,
}

/// What kind of answer is cached for a subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryShape {
    /// Merged multi-source snapshot.
    Snapshot,
    /// Compiled report for the subject.
    Report,
    Custom(String),
}

/// Deterministic key derived from (subject, query shape).
///
/// Subjects are compared case-insensitively; refresh flags never take part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(subject: &str, shape: &QueryShape) -> Self {
        let shape = match shape {
            QueryShape::Snapshot => "snapshot".to_string(),
            QueryShape::Report => "report".to_string(),
            QueryShape::Custom(s) => format!("custom:{s}"),
        };
        let canonical = format!("v1|{}|{}", subject.trim().to_ascii_uppercase(), shape);
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn storage_key(&self) -> String {
        format!("{KEY_PREFIX}{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct CacheTier {
    backend: DynBackend,
    default_ttl: Duration,
    deadlines: Deadlines,
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl CacheTier {
    pub fn new(backend: DynBackend, default_ttl: Duration) -> Self {
        ensure_metrics_described();
        Self {
            backend,
            default_ttl,
            deadlines: Deadlines::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn medium(&self) -> String {
        self.backend.describe()
    }

    fn key_lock(&self, storage_key: &str) -> KeyLock {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = locks.get(storage_key).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, w| w.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(storage_key.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Live value under `key`, or `Miss`. Expired entries read as `Miss`
    /// and are left for `purge_expired`.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> StorageResult<CacheLookup<T>> {
        let skey = key.storage_key();
        let lookup = self.read_live(&skey).await?;
        if lookup.is_hit() {
            counter!("firs_cache_hits_total").increment(1);
        } else {
            counter!("firs_cache_misses_total").increment(1);
        }
        tracing::debug!(key = %key, hit = lookup.is_hit(), "cache get");
        Ok(lookup)
    }

    async fn read_live<T: DeserializeOwned>(&self, skey: &str) -> StorageResult<CacheLookup<T>> {
        let Some(bytes) = self.backend.read(skey).await? else {
            return Ok(CacheLookup::Miss);
        };
        let record: Record<T> = Record::decode(schema::CACHE_ENTRY, &bytes)?;
        if self.deadlines.is_expired(skey, &record) {
            return Ok(CacheLookup::Miss);
        }
        Ok(CacheLookup::Hit(record.body))
    }

    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> StorageResult<()> {
        let skey = key.storage_key();
        let lock = self.key_lock(&skey);
        let _guard = lock.lock().await;
        self.write(&skey, value, ttl).await
    }

    async fn write<T: Serialize>(&self, skey: &str, value: &T, ttl: Duration) -> StorageResult<()> {
        let record = Record::new(schema::CACHE_ENTRY, value, Some(ttl));
        self.backend.write(skey, &record.encode()?).await?;
        self.deadlines.track(skey, &record);
        tracing::debug!(key = skey, ttl_ms = ttl.as_millis() as u64, "cache put");
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub async fn invalidate(&self, key: &CacheKey) -> StorageResult<bool> {
        let skey = key.storage_key();
        let removed = self.backend.remove(&skey).await?;
        self.deadlines.forget(&skey);
        Ok(removed)
    }

    /// Read-through with single-flight. `compute` runs at most once per key at a time.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<(T, Origin), E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StorageError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let CacheLookup::Hit(v) = self.get(key).await? {
            return Ok((v, Origin::Cache));
        }

        let skey = key.storage_key();
        let lock = self.key_lock(&skey);
        let (_guard, waited) = match lock.try_lock() {
            Ok(g) => (g, false),
            Err(_) => (lock.lock().await, true),
        };

        // A leader may have filled the entry between our read and the lock.
        if let CacheLookup::Hit(v) = self.read_live(&skey).await? {
            if waited {
                counter!("firs_cache_coalesced_total").increment(1);
                tracing::debug!(key = %key, "coalesced onto in-flight computation");
            }
            return Ok((v, Origin::Cache));
        }

        let value = compute().await?;
        self.write(&skey, &value, ttl).await?;
        Ok((value, Origin::Fresh))
    }

    /// Recompute and overwrite regardless of what is cached.
    ///
    /// `compute` receives the current live value (if any) so it can fall back on it.
    /// Returning `Ok((v, false))` hands `v` back without writing it.
    pub async fn refresh_with<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<(T, Origin), E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StorageError>,
        F: FnOnce(Option<T>) -> Fut,
        Fut: Future<Output = Result<(T, bool), E>>,
    {
        let skey = key.storage_key();
        let lock = self.key_lock(&skey);
        let _guard = lock.lock().await;

        let current = self.read_live::<T>(&skey).await?.into_option();
        let (value, store) = compute(current).await?;
        if store {
            self.write(&skey, &value, ttl).await?;
            Ok((value, Origin::Fresh))
        } else {
            Ok((value, Origin::Cache))
        }
    }

    /// Remove every expired entry. Keys with a computation in flight are skipped.
    pub async fn purge_expired(&self) -> StorageResult<usize> {
        let mut purged = 0;
        for skey in self.backend.keys().await? {
            if !skey.starts_with(KEY_PREFIX) {
                continue;
            }
            let lock = self.key_lock(&skey);
            let Ok(_guard) = lock.try_lock() else {
                continue;
            };
            let Some(bytes) = self.backend.read(&skey).await? else {
                continue;
            };
            let expired = match Record::<serde::de::IgnoredAny>::decode(schema::CACHE_ENTRY, &bytes) {
                Ok(record) => self.deadlines.is_expired(&skey, &record),
                Err(e) => {
                    tracing::warn!(key = %skey, error = %e, "unreadable cache entry, dropping");
                    true
                }
            };
            if expired {
                self.backend.remove(&skey).await?;
                self.deadlines.forget(&skey);
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "cache purge");
        }
        Ok(purged)
    }

    /// Number of stored entries, live or not yet purged.
    pub async fn entry_count(&self) -> StorageResult<usize> {
        Ok(self
            .backend
            .keys()
            .await?
            .iter()
            .filter(|k| k.starts_with(KEY_PREFIX))
            .count())
    }

    pub async fn clear(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for skey in self.backend.keys().await? {
            if skey.starts_with(KEY_PREFIX) && self.backend.remove(&skey).await? {
                removed += 1;
            }
        }
        self.deadlines.clear();
        Ok(removed)
    }
}
