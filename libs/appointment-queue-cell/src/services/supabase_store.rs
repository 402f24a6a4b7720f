// libs/appointment-queue-cell/src/services/supabase_store.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use shared_database::supabase::SupabaseClient;

use crate::error::StoreError;
use crate::services::store::{Filter, RemoteCallback, RemoteEvent, RemoteStore, RemoteSubscription};

/// Remote store backed by Supabase's PostgREST API. Push is emulated by
/// polling, emitting a snapshot only when the result set changed.
pub struct SupabaseRemoteStore {
    client: Arc<SupabaseClient>,
    poll_interval: Duration,
}

impl SupabaseRemoteStore {
    pub fn new(client: Arc<SupabaseClient>, poll_interval: Duration) -> Self {
        Self { client, poll_interval }
    }

    async fn select(client: &SupabaseClient, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        let pairs: Vec<(String, String)> = filters
            .iter()
            .map(|f| (f.field.clone(), f.value.clone()))
            .collect();
        client
            .select(collection, &pairs)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for SupabaseRemoteStore {
    async fn get(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        Self::select(&self.client, collection, filters).await
    }

    async fn add(&self, collection: &str, record: Value) -> Result<String, StoreError> {
        let row = self
            .client
            .insert(collection, record)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        match row.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(StoreError::Rejected(format!("insert into {} returned no id", collection))),
        }
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError> {
        let rows = self
            .client
            .patch_by_id(collection, id, patch)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: &str,
        filters: &[Filter],
        callback: RemoteCallback,
    ) -> Result<RemoteSubscription, StoreError> {
        let initial = Self::select(&self.client, collection, filters).await?;
        callback(RemoteEvent::Snapshot(initial.clone()));

        let client = self.client.clone();
        let collection = collection.to_string();
        let filters = filters.to_vec();
        let period = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut last = Some(initial);
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match Self::select(&client, &collection, &filters).await {
                    Ok(snapshot) => {
                        if last.as_ref() != Some(&snapshot) {
                            debug!("Remote {} changed ({} records)", collection, snapshot.len());
                            callback(RemoteEvent::Snapshot(snapshot.clone()));
                            last = Some(snapshot);
                        }
                    }
                    Err(e) => {
                        // Report once per outage; the next success re-emits.
                        if last.take().is_some() {
                            warn!("Polling {} failed: {}", collection, e);
                            callback(RemoteEvent::Failed(e));
                        }
                    }
                }
            }
        });

        Ok(RemoteSubscription::new(move || task.abort()))
    }
}
