//! Key-value media the tiers persist through.
//!
//! `MemoryBackend` lives as long as the process. `FileBackend` keeps one JSON
//! file per key under a directory and survives restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::BackendError;

pub type BackendResult<T> = Result<T, BackendError>;

/// Byte store keyed by flat strings.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn read(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;
    async fn write(&self, key: &str, bytes: &[u8]) -> BackendResult<()>;
    /// Returns whether the key existed.
    async fn remove(&self, key: &str) -> BackendResult<bool>;
    async fn keys(&self) -> BackendResult<Vec<String>>;
    /// Short label for logs ("memory", "file:/var/lib/firs/cache").
    fn describe(&self) -> String;
}

pub type DynBackend = Arc<dyn KvBackend>;

/// Keys are restricted so they map 1:1 onto file names on every platform.
pub fn validate_key(key: &str) -> BackendResult<()> {
    let ok = !key.is_empty()
        && key.len() <= 200
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if ok {
        Ok(())
    } else {
        Err(BackendError::InvalidKey(key.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Test hook: when set every call fails with `Unavailable`.
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> DynBackend {
        Arc::new(Self::new())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> BackendResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("memory backend set offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn read(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        self.check()?;
        validate_key(key)?;
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> BackendResult<()> {
        self.check()?;
        validate_key(key)?;
        self.map.write().await.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> BackendResult<bool> {
        self.check()?;
        validate_key(key)?;
        Ok(self.map.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> BackendResult<Vec<String>> {
        self.check()?;
        Ok(self.map.read().await.keys().cloned().collect())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Creates `dir` if needed.
    pub async fn open(dir: impl AsRef<Path>) -> BackendResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KvBackend for FileBackend {
    async fn read(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match tokio::fs::read(self.path(key)).await {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temp file, then rename over the target.
    async fn write(&self, key: &str, bytes: &[u8]) -> BackendResult<()> {
        validate_key(key)?;
        let path = self.path(key);
        let tmp = self
            .dir
            .join(format!(".{key}.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> BackendResult<bool> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> BackendResult<Vec<String>> {
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                out.push(key.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.dir.display())
    }
}

/// Memory when `dir` is None, otherwise a file backend rooted there.
pub async fn open_backend(dir: Option<&Path>) -> BackendResult<DynBackend> {
    match dir {
        None => Ok(MemoryBackend::shared()),
        Some(d) => Ok(Arc::new(FileBackend::open(d).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_rules() {
        assert!(validate_key("cache.ab12").is_ok());
        assert!(validate_key("raw_AAPL_finnhub-1").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key(".hidden").is_err());
    }

    #[tokio::test]
    async fn file_backend_roundtrip_and_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let b = FileBackend::open(tmp.path()).await.unwrap();
        b.write("k1", b"one").await.unwrap();
        b.write("k2", b"two").await.unwrap();
        b.write("k1", b"uno").await.unwrap();
        assert_eq!(b.read("k1").await.unwrap().as_deref(), Some(&b"uno"[..]));
        assert_eq!(b.keys().await.unwrap(), vec!["k1", "k2"]);
        assert!(b.remove("k2").await.unwrap());
        assert!(!b.remove("k2").await.unwrap());
        assert_eq!(b.read("k2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn offline_memory_backend_reports_unavailable() {
        let b = MemoryBackend::new();
        b.set_offline(true);
        assert!(matches!(
            b.read("k").await,
            Err(BackendError::Unavailable(_))
        ));
    }
}
