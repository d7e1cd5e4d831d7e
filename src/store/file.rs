use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{Clock, KvStore, StoreError, SystemClock, expiry, is_live};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    entries: BTreeMap<String, StoredValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredValue {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

/// Identifies one version of the file on disk. Size is included because
/// back-to-back writes can land within one mtime tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: SystemTime,
    len: u64,
}

impl Fingerprint {
    fn of(meta: &std::fs::Metadata) -> std::io::Result<Self> {
        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
        })
    }
}

/// What this process last read from disk.
#[derive(Debug, Default)]
struct Snapshot {
    state: StateFile,
    version: Option<Fingerprint>,
}

/// JSON-file backed store that survives restarts and can be shared between
/// processes (the running gateway and the credentials CLI).
///
/// Every mutation holds an advisory lock on a sibling `.lock` file, reloads the
/// current file, applies the change and writes it back through a temporary file
/// followed by a rename. Reads reuse the cached snapshot until the file's mtime
/// or size moves.
pub struct FileStore {
    path: PathBuf,
    cached: Mutex<Snapshot>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = blocking({
            let path = path.clone();
            move || load(&path)
        })
        .await?;
        Ok(Self {
            path,
            cached: Mutex::new(snapshot),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `read` against a snapshot that is current with the file on disk.
    async fn read<T>(&self, read: impl FnOnce(&StateFile) -> T) -> Result<T, StoreError> {
        let mut cached = self.cached.lock().await;
        let version = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Some(Fingerprint::of(&meta)?),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        if version != cached.version {
            *cached = blocking({
                let path = self.path.clone();
                move || load(&path)
            })
            .await?;
        }
        Ok(read(&cached.state))
    }

    /// Reloads, applies `apply` and persists under the cross-process lock.
    /// `apply` reports whether it changed anything; unchanged state is not rewritten.
    /// The cached snapshot is only replaced once the new file is on disk.
    async fn update<T, F>(&self, apply: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StateFile) -> (T, bool) + Send + 'static,
    {
        let mut cached = self.cached.lock().await;
        let path = self.path.clone();
        let (value, snapshot) = blocking(move || {
            let _lock = lock_exclusive(&path)?;
            let mut next = load(&path)?;
            let (value, changed) = apply(&mut next.state);
            if changed {
                next.version = Some(persist(&path, &next.state)?);
            }
            Ok((value, next))
        })
        .await?;
        *cached = snapshot;
        Ok(value)
    }
}

async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::Io(std::io::Error::other(err)))?
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Held for the lifetime of the returned handle; closing it releases the lock.
fn lock_exclusive(path: &Path) -> Result<File, StoreError> {
    ensure_parent(path)?;
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(path))?;
    lock.lock_exclusive()?;
    Ok(lock)
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<Snapshot, StoreError> {
    let version = match std::fs::metadata(path) {
        Ok(meta) => Fingerprint::of(&meta)?,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Snapshot::default()),
        Err(err) => return Err(err.into()),
    };
    let state = match std::fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => StateFile::default(),
        Ok(raw) => serde_json::from_str(&raw)?,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Snapshot::default()),
        Err(err) => return Err(err.into()),
    };
    Ok(Snapshot {
        state,
        version: Some(version),
    })
}

/// Returns the version of the freshly written file.
fn persist(path: &Path, state: &StateFile) -> Result<Fingerprint, StoreError> {
    ensure_parent(path)?;
    let payload = serde_json::to_vec_pretty(state)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &payload)?;
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(Fingerprint::of(&std::fs::metadata(path)?)?)
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        self.read(|state| {
            state
                .entries
                .get(key)
                .filter(|stored| is_live(stored.expires_at_ms, now))
                .map(|stored| stored.value.clone())
        })
        .await
    }

    async fn set(&self, key: &str, value: String, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let key = key.to_string();
        self.update(move |state| {
            state
                .entries
                .retain(|_, stored| is_live(stored.expires_at_ms, now));
            state.entries.insert(
                key,
                StoredValue {
                    value,
                    expires_at_ms: expiry(now, ttl_ms),
                },
            );
            ((), true)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let key = key.to_string();
        self.update(move |state| match state.entries.remove(&key) {
            Some(removed) => (is_live(removed.expires_at_ms, now), true),
            None => (false, false),
        })
        .await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_millis();
        self.read(|state| {
            state
                .entries
                .iter()
                .filter(|(key, stored)| {
                    key.starts_with(prefix) && is_live(stored.expires_at_ms, now)
                })
                .map(|(key, _)| key.clone())
                .collect()
        })
        .await
    }
}
