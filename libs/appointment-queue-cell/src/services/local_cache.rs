// libs/appointment-queue-cell/src/services/local_cache.rs
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::CacheError;

/// Emitted after every write, to every session attached to the same cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSignal {
    pub key: String,
    /// Session that performed the write.
    pub writer: Uuid,
}

/// The per-client durable cache. Reads and writes are synchronous.
pub trait LocalStore: Send + Sync {
    /// Identifies this session ("tab") among those sharing the cache.
    fn session_id(&self) -> Uuid;

    fn read(&self, key: &str) -> Result<Vec<Value>, CacheError>;

    fn write(&self, key: &str, records: Vec<Value>) -> Result<(), CacheError>;

    /// Read-modify-write of one key. No write from any session attached to
    /// the same storage lands between the read and the write. Nothing is
    /// written when `change` returns false. `change` must not call back into
    /// the store.
    fn update(&self, key: &str, change: &mut dyn FnMut(&mut Vec<Value>) -> bool) -> Result<(), CacheError>;

    /// Change signals from this session and every other attached session.
    fn signals(&self) -> broadcast::Receiver<CacheSignal>;
}

enum Backend {
    Memory(Mutex<HashMap<String, Vec<Value>>>),
    /// One JSON array per key under this directory.
    File(PathBuf),
}

struct Shared {
    backend: Backend,
    signals: broadcast::Sender<CacheSignal>,
    write_guard: Mutex<()>,
}

#[derive(Clone)]
pub struct LocalCache {
    shared: Arc<Shared>,
    session: Uuid,
}

impl LocalCache {
    pub fn in_memory() -> Self {
        Self::with_backend(Backend::Memory(Mutex::new(HashMap::new())))
    }

    /// Opens (creating if needed) a file-backed cache rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!("Local cache opened at {}", dir.display());
        Ok(Self::with_backend(Backend::File(dir)))
    }

    /// Another session over the same storage, as a second browser tab would be.
    pub fn attach(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            session: Uuid::new_v4(),
        }
    }

    fn with_backend(backend: Backend) -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                backend,
                signals,
                write_guard: Mutex::new(()),
            }),
            session: Uuid::new_v4(),
        }
    }

    /// Caller holds `write_guard`.
    fn store(&self, key: &str, records: Vec<Value>) -> Result<(), CacheError> {
        match &self.shared.backend {
            Backend::Memory(entries) => {
                lock(entries)?.insert(key.to_string(), records);
            }
            Backend::File(dir) => {
                let path = Self::file_path(dir, key);
                let staging = path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));
                let bytes = serde_json::to_vec(&records).map_err(|source| CacheError::Corrupt {
                    key: key.to_string(),
                    source,
                })?;
                fs::write(&staging, bytes)?;
                fs::rename(&staging, &path)?;
            }
        }
        Ok(())
    }

    fn notify(&self, key: &str) {
        trace!("Local cache key '{}' written by session {}", key, self.session);
        // No receivers is fine: nobody is listening yet.
        let _ = self.shared.signals.send(CacheSignal {
            key: key.to_string(),
            writer: self.session,
        });
    }

    fn file_path(dir: &Path, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{}.json", safe))
    }
}

impl LocalStore for LocalCache {
    fn session_id(&self) -> Uuid {
        self.session
    }

    fn read(&self, key: &str) -> Result<Vec<Value>, CacheError> {
        match &self.shared.backend {
            Backend::Memory(entries) => Ok(lock(entries)?.get(key).cloned().unwrap_or_default()),
            Backend::File(dir) => {
                let path = Self::file_path(dir, key);
                match fs::read(&path) {
                    Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| CacheError::Corrupt {
                        key: key.to_string(),
                        source,
                    }),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn write(&self, key: &str, records: Vec<Value>) -> Result<(), CacheError> {
        {
            let _guard = lock(&self.shared.write_guard)?;
            self.store(key, records)?;
        }
        self.notify(key);
        Ok(())
    }

    fn update(&self, key: &str, change: &mut dyn FnMut(&mut Vec<Value>) -> bool) -> Result<(), CacheError> {
        {
            let _guard = lock(&self.shared.write_guard)?;
            let mut records = self.read(key)?;
            if !change(&mut records) {
                trace!("Local cache key '{}' left unchanged", key);
                return Ok(());
            }
            self.store(key, records)?;
        }
        self.notify(key);
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<CacheSignal> {
        self.shared.signals.subscribe()
    }
}

/// Typed front end for [`LocalStore::update`]. `change` runs once under the
/// store's write lock; when it fails the key is left untouched.
pub fn update_records<T, E>(
    store: &dyn LocalStore,
    key: &str,
    change: impl FnOnce(&mut Vec<Value>) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<CacheError>,
{
    let mut change = Some(change);
    let mut outcome = None;
    store.update(key, &mut |records: &mut Vec<Value>| match change.take() {
        Some(change) => {
            let result = change(records);
            let commit = result.is_ok();
            outcome = Some(result);
            commit
        }
        None => false,
    })?;
    outcome.unwrap_or_else(|| Err(CacheError::UpdateSkipped(key.to_string()).into()))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, CacheError> {
    mutex.lock().map_err(|_| CacheError::Poisoned)
}
