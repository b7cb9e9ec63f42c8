//! Ephemeral Store: write-once artifacts with their own TTL.
//!
//! Purging an expired artifact leaves a tombstone behind, so `load` keeps
//! answering `ArtifactExpired` (not `ArtifactNotFound`) for a retention window
//! after expiry. Tombstones older than that are removed for good.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::storage::backend::DynBackend;
use crate::storage::record::{schema, Deadlines, Record};

const KEY_PREFIX: &str = "eph.";
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "firs_ephemeral_purged_total",
            "Ephemeral artifacts whose payload was dropped after expiry."
        );
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    fn storage_key(&self) -> String {
        format!("{KEY_PREFIX}{}", self.0.simple())
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ArtifactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum Stored {
    Live {
        key: String,
        content_type: String,
        payload: Vec<u8>,
    },
    Purged {
        key: String,
        purged_at: DateTime<Utc>,
    },
}

/// A loaded, still-live artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub key: String,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

pub struct EphemeralStore {
    backend: DynBackend,
    default_ttl: Duration,
    tombstone_retention: Duration,
    deadlines: Deadlines,
    purge_lock: tokio::sync::Mutex<()>,
}

impl EphemeralStore {
    pub fn new(backend: DynBackend, default_ttl: Duration) -> Self {
        ensure_metrics_described();
        Self {
            backend,
            default_ttl,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
            deadlines: Deadlines::new(),
            purge_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn medium(&self) -> String {
        self.backend.describe()
    }

    /// Store `payload` under a fresh id. `key` is a caller-side label, not an address.
    pub async fn store(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> StorageResult<ArtifactId> {
        self.store_typed(key, "application/octet-stream", payload, ttl)
            .await
    }

    pub async fn store_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> StorageResult<ArtifactId> {
        let payload = serde_json::to_vec(value)?;
        self.store_typed(key, "application/json", payload, ttl).await
    }

    async fn store_typed(
        &self,
        key: &str,
        content_type: &str,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<ArtifactId> {
        let id = ArtifactId::generate();
        let skey = id.storage_key();
        let size = payload.len();
        let record = Record::new(
            schema::EPHEMERAL_ARTIFACT,
            Stored::Live {
                key: key.to_string(),
                content_type: content_type.to_string(),
                payload,
            },
            Some(ttl),
        );
        self.backend.write(&skey, &record.encode()?).await?;
        self.deadlines.track(&skey, &record);
        tracing::debug!(artifact = %id, key, bytes = size, ttl_ms = ttl.as_millis() as u64, "artifact stored");
        Ok(id)
    }

    pub async fn load(&self, id: &ArtifactId) -> StorageResult<Artifact> {
        let skey = id.storage_key();
        let Some(bytes) = self.backend.read(&skey).await? else {
            return Err(StorageError::ArtifactNotFound(*id));
        };
        let record: Record<Stored> = Record::decode(schema::EPHEMERAL_ARTIFACT, &bytes)?;
        if self.deadlines.is_expired(&skey, &record) {
            return Err(StorageError::ArtifactExpired(*id));
        }
        match record.body {
            Stored::Live {
                key,
                content_type,
                payload,
            } => Ok(Artifact {
                id: *id,
                key,
                content_type,
                payload,
                created_at: record.created_at,
            }),
            Stored::Purged { .. } => Err(StorageError::ArtifactExpired(*id)),
        }
    }

    pub async fn load_json<T: DeserializeOwned>(&self, id: &ArtifactId) -> StorageResult<T> {
        let artifact = self.load(id).await?;
        Ok(serde_json::from_slice(&artifact.payload)?)
    }

    /// Drop payloads past TTL (keeping a tombstone) and tombstones past retention.
    /// Idempotent; returns the number of payloads dropped by this call.
    pub async fn purge_expired(&self) -> StorageResult<usize> {
        let _serial = self.purge_lock.lock().await;
        let mut purged = 0;
        let mut forgotten = 0;
        for skey in self.backend.keys().await? {
            if !skey.starts_with(KEY_PREFIX) {
                continue;
            }
            let Some(bytes) = self.backend.read(&skey).await? else {
                continue;
            };
            let record: Record<Stored> = match Record::decode(schema::EPHEMERAL_ARTIFACT, &bytes) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(key = %skey, error = %e, "unreadable artifact, dropping");
                    self.backend.remove(&skey).await?;
                    continue;
                }
            };
            let Some(overdue) = self.deadlines.overdue(&skey, &record) else {
                continue;
            };
            match record.body {
                Stored::Live { key, .. } if overdue < self.tombstone_retention => {
                    let tombstone = Record {
                        body: Stored::Purged {
                            key,
                            purged_at: Utc::now(),
                        },
                        ..record
                    };
                    self.backend.write(&skey, &tombstone.encode()?).await?;
                    purged += 1;
                }
                Stored::Live { .. } => {
                    self.backend.remove(&skey).await?;
                    self.deadlines.forget(&skey);
                    purged += 1;
                }
                Stored::Purged { .. } if overdue >= self.tombstone_retention => {
                    self.backend.remove(&skey).await?;
                    self.deadlines.forget(&skey);
                    forgotten += 1;
                }
                Stored::Purged { .. } => {}
            }
        }
        counter!("firs_ephemeral_purged_total").increment(purged as u64);
        if purged + forgotten > 0 {
            tracing::info!(purged, tombstones_dropped = forgotten, "ephemeral purge");
        }
        Ok(purged)
    }

    /// Stored artifacts, tombstones included.
    pub async fn artifact_count(&self) -> StorageResult<usize> {
        Ok(self
            .backend
            .keys()
            .await?
            .iter()
            .filter(|k| k.starts_with(KEY_PREFIX))
            .count())
    }
}
