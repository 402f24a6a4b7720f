// libs/appointment-queue-cell/src/services/store.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::services::locks::lock;

/// Equality predicate on one record field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<String>) -> Self {
        Self { field: field.to_string(), value: value.into() }
    }

    /// Exact match, the way a document store evaluates it.
    pub fn matches(&self, record: &Value) -> bool {
        match record.get(&self.field) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Number(n)) => n.to_string() == self.value,
            Some(Value::Bool(b)) => b.to_string() == self.value,
            _ => false,
        }
    }
}

/// Splits filters into the ones sent to the store and the ones the caller
/// must apply itself; stores are only trusted with `server_limit` predicates.
pub fn split_filters(filters: &[Filter], server_limit: usize) -> (Vec<Filter>, Vec<Filter>) {
    let cut = server_limit.min(filters.len());
    (filters[..cut].to_vec(), filters[cut..].to_vec())
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Full, possibly over-broad, result set for the subscription's filters.
    Snapshot(Vec<Value>),
    /// The push channel broke; consumers fall back to local data.
    Failed(StoreError),
}

pub type RemoteCallback = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

/// Live remote subscription. Cancelling is idempotent and also happens on drop.
pub struct RemoteSubscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl RemoteSubscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Mutex::new(Some(Box::new(cancel))) }
    }

    pub fn cancel(&self) {
        let cancel = match self.cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        match self.cancel.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The authoritative store. Filters are equality-only and may be applied
/// loosely; callers re-filter whatever comes back.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError>;

    /// Stores a new record and returns the id the store assigned to it.
    async fn add(&self, collection: &str, record: Value) -> Result<String, StoreError>;

    /// Field-level overwrite; the last writer wins.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError>;

    async fn subscribe(
        &self,
        collection: &str,
        filters: &[Filter],
        callback: RemoteCallback,
    ) -> Result<RemoteSubscription, StoreError>;
}

// ==============================================================================
// IN-MEMORY STORE
// ==============================================================================

struct Subscriber {
    collection: String,
    filters: Vec<Filter>,
    callback: RemoteCallback,
}

struct MemoryInner {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    available: AtomicBool,
}

/// In-process remote store: pushes a fresh snapshot to every matching
/// subscriber after each write, and can be switched offline to exercise
/// degraded mode.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                collections: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Taking the store offline also breaks every open push channel.
    pub fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        if was && !available {
            info!("Memory remote store switched offline");
            let callbacks: Vec<RemoteCallback> = lock(&self.inner.subscribers)
                .values()
                .map(|s| s.callback.clone())
                .collect();
            for callback in callbacks {
                callback(RemoteEvent::Failed(StoreError::Unavailable("store offline".to_string())));
            }
        } else if !was && available {
            info!("Memory remote store back online");
            let collections: Vec<String> = lock(&self.inner.subscribers)
                .values()
                .map(|s| s.collection.clone())
                .collect();
            for collection in collections {
                self.notify(&collection);
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Inserts records verbatim, bypassing id assignment.
    pub fn seed(&self, collection: &str, records: Vec<Value>) {
        lock(&self.inner.collections)
            .entry(collection.to_string())
            .or_default()
            .extend(records);
        self.notify(collection);
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        lock(&self.inner.collections)
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store offline".to_string()))
        }
    }

    fn snapshot(&self, collection: &str, filters: &[Filter]) -> Vec<Value> {
        lock(&self.inner.collections)
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| filters.iter().all(|f| f.matches(record)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notify(&self, collection: &str) {
        if !self.is_available() {
            return;
        }
        let targets: Vec<(RemoteCallback, Vec<Filter>)> = lock(&self.inner.subscribers)
            .values()
            .filter(|s| s.collection == collection)
            .map(|s| (s.callback.clone(), s.filters.clone()))
            .collect();
        for (callback, filters) in targets {
            callback(RemoteEvent::Snapshot(self.snapshot(collection, &filters)));
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        self.ensure_available()?;
        Ok(self.snapshot(collection, filters))
    }

    async fn add(&self, collection: &str, record: Value) -> Result<String, StoreError> {
        self.ensure_available()?;
        let Value::Object(mut fields) = record else {
            return Err(StoreError::Rejected("records must be JSON objects".to_string()));
        };
        let id = Uuid::new_v4().to_string();
        fields.insert("id".to_string(), Value::String(id.clone()));

        lock(&self.inner.collections)
            .entry(collection.to_string())
            .or_default()
            .push(Value::Object(fields));
        debug!("Memory store added {}/{}", collection, id);

        self.notify(collection);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError> {
        self.ensure_available()?;
        let Value::Object(patch) = patch else {
            return Err(StoreError::Rejected("patches must be JSON objects".to_string()));
        };
        {
            let mut collections = lock(&self.inner.collections);
            let record = collections
                .get_mut(collection)
                .and_then(|records| {
                    records
                        .iter_mut()
                        .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
                })
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if let Value::Object(fields) = record {
                for (key, value) in patch {
                    fields.insert(key, value);
                }
            }
        }
        debug!("Memory store updated {}/{}", collection, id);

        self.notify(collection);
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: &str,
        filters: &[Filter],
        callback: RemoteCallback,
    ) -> Result<RemoteSubscription, StoreError> {
        self.ensure_available()?;
        let key = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscribers).insert(
            key,
            Subscriber {
                collection: collection.to_string(),
                filters: filters.to_vec(),
                callback: callback.clone(),
            },
        );

        callback(RemoteEvent::Snapshot(self.snapshot(collection, filters)));

        let inner = Arc::downgrade(&self.inner);
        Ok(RemoteSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                lock(&inner.subscribers).remove(&key);
                debug!("Memory store subscription {} cancelled", key);
            }
        }))
    }
}
