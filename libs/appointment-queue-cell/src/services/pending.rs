// libs/appointment-queue-cell/src/services/pending.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{PendingOperation, PendingStatus, PendingWrite};
use crate::services::local_cache::{update_records, LocalStore};

/// Writes that reached the local cache but not the remote store. The registry
/// lives in the local cache itself so it survives restarts.
#[derive(Clone)]
pub struct PendingWrites {
    local: Arc<dyn LocalStore>,
    key: String,
}

impl PendingWrites {
    pub fn new(local: Arc<dyn LocalStore>, cache_key: &str) -> Self {
        Self {
            local,
            key: format!("{}-pending", cache_key),
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.key
    }

    pub fn list(&self) -> Result<Vec<PendingWrite>, QueueError> {
        Ok(decode_writes(self.local.read(&self.key)?))
    }

    pub fn unresolved(&self) -> Result<Vec<PendingWrite>, QueueError> {
        Ok(self.list()?.into_iter().filter(PendingWrite::is_unresolved).collect())
    }

    pub fn register_booking(&self, local_id: &str, now: DateTime<Utc>) -> Result<String, QueueError> {
        self.modify(|writes| {
            let write = new_write(
                PendingOperation::Booking { local_id: local_id.to_string() },
                now,
            );
            let id = write.id.clone();
            writes.push(write);
            id
        })
    }

    /// Patches for the same appointment fold into one entry so replay keeps
    /// the latest value of every field.
    pub fn register_patch(
        &self,
        appointment_id: &str,
        patch: Value,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<String, QueueError> {
        self.modify(|writes| {
            let existing = writes.iter_mut().find(|w| {
                w.is_unresolved()
                    && matches!(&w.operation, PendingOperation::Patch { appointment_id: id, .. } if id == appointment_id)
            });

            if let Some(write) = existing {
                if let (PendingOperation::Patch { patch: merged, .. }, Value::Object(fields)) =
                    (&mut write.operation, &patch)
                {
                    if let Value::Object(target) = merged {
                        for (key, value) in fields {
                            target.insert(key.clone(), value.clone());
                        }
                    }
                }
                write.status = PendingStatus::RemoteFailed { reason: reason.to_string() };
                write.updated_at = now;
                return write.id.clone();
            }

            let mut write = new_write(
                PendingOperation::Patch {
                    appointment_id: appointment_id.to_string(),
                    patch,
                },
                now,
            );
            write.status = PendingStatus::RemoteFailed { reason: reason.to_string() };
            write.attempts = 1;
            let id = write.id.clone();
            writes.push(write);
            id
        })
    }

    pub fn mark_failed(&self, pending_id: &str, reason: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.modify(|writes| {
            if let Some(write) = writes.iter_mut().find(|w| w.id == pending_id) {
                write.status = PendingStatus::RemoteFailed { reason: reason.to_string() };
                write.attempts += 1;
                write.updated_at = now;
            }
        })
    }

    pub fn mark_conflicted(
        &self,
        pending_id: &str,
        holder: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.modify(|writes| {
            if let Some(write) = writes.iter_mut().find(|w| w.id == pending_id) {
                write.status = PendingStatus::Conflicted { holder };
                write.attempts += 1;
                write.updated_at = now;
            }
        })
    }

    pub fn resolve(&self, pending_id: &str) -> Result<(), QueueError> {
        self.modify(|writes| {
            writes.retain(|w| w.id != pending_id);
        })?;
        debug!("Pending write {} resolved", pending_id);
        Ok(())
    }

    /// One atomic cache update across every session on the same storage.
    fn modify<T>(&self, change: impl FnOnce(&mut Vec<PendingWrite>) -> T) -> Result<T, QueueError> {
        update_records(self.local.as_ref(), &self.key, |entries| {
            let mut writes = decode_writes(std::mem::take(entries));
            let result = change(&mut writes);
            *entries = writes
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(result)
        })
    }
}

fn decode_writes(entries: Vec<Value>) -> Vec<PendingWrite> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<PendingWrite>(entry) {
            Ok(write) => Some(write),
            Err(e) => {
                warn!("Skipping unreadable pending write entry: {}", e);
                None
            }
        })
        .collect()
}

fn new_write(operation: PendingOperation, now: DateTime<Utc>) -> PendingWrite {
    PendingWrite {
        id: Uuid::new_v4().to_string(),
        operation,
        status: PendingStatus::LocalOnly,
        attempts: 0,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::local_cache::LocalCache;
    use chrono::TimeZone;
    use serde_json::json;

    fn registry() -> PendingWrites {
        PendingWrites::new(Arc::new(LocalCache::in_memory()), "appointments")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn patches_for_one_appointment_are_folded() {
        let pending = registry();
        let first = pending
            .register_patch("a1", json!({ "queueStatus": "in-progress" }), "offline", now())
            .unwrap();
        let second = pending
            .register_patch("a1", json!({ "queueStatus": "completed", "completedAt": "x" }), "offline", now())
            .unwrap();

        assert_eq!(first, second);
        let writes = pending.list().unwrap();
        assert_eq!(writes.len(), 1);
        match &writes[0].operation {
            PendingOperation::Patch { patch, .. } => {
                assert_eq!(patch["queueStatus"], "completed");
                assert_eq!(patch["completedAt"], "x");
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn conflicted_writes_are_not_unresolved() {
        let pending = registry();
        let id = pending.register_booking("local-1", now()).unwrap();
        assert_eq!(pending.unresolved().unwrap().len(), 1);

        pending.mark_conflicted(&id, Some("a9".into()), now()).unwrap();
        assert!(pending.unresolved().unwrap().is_empty());
        assert_eq!(pending.list().unwrap().len(), 1);

        pending.resolve(&id).unwrap();
        assert!(pending.list().unwrap().is_empty());
    }

    #[test]
    fn registrations_from_attached_sessions_are_all_kept() {
        let cache = LocalCache::in_memory();
        let workers: Vec<_> = (0..8)
            .map(|n| {
                let pending = PendingWrites::new(Arc::new(cache.attach()), "appointments");
                std::thread::spawn(move || {
                    for i in 0..25 {
                        pending.register_booking(&format!("local-{}-{}", n, i), now()).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let pending = PendingWrites::new(Arc::new(cache), "appointments");
        assert_eq!(pending.list().unwrap().len(), 200);
    }
}
