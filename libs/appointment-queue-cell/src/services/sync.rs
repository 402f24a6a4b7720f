// libs/appointment-queue-cell/src/services/sync.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::models::{QueueUpdate, RawAppointment, SubscriptionRequest};
use crate::services::controller::build_update;
use crate::services::local_cache::CacheSignal;
use crate::services::locks::lock;
use crate::services::normalizer::decode_records;
use crate::services::planes::{AppointmentQuery, DataPlanes};
use crate::services::queue::QueueStateMachine;
use crate::services::store::{split_filters, RemoteEvent, RemoteSubscription};

pub type QueueUpdateCallback = Arc<dyn Fn(QueueUpdate) + Send + Sync>;

type Registry = Arc<Mutex<HashMap<String, usize>>>;

/// Keeps queue consumers current by listening to both data planes.
///
/// Each subscription owns one task. Remote snapshots arrive through an mpsc
/// channel fed by the store callback; local changes arrive as cache signals.
/// Either trigger re-reconciles and pushes a fresh `QueueUpdate`.
pub struct SyncController {
    planes: Arc<DataPlanes>,
    machine: QueueStateMachine,
    registry: Registry,
}

impl SyncController {
    pub fn new(planes: Arc<DataPlanes>) -> Self {
        let machine = QueueStateMachine::new(&planes.settings);
        Self {
            planes,
            machine,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts listening. The initial update is delivered before this
    /// returns; remote failures only mark updates as degraded.
    pub async fn subscribe(&self, request: SubscriptionRequest, on_update: QueueUpdateCallback) -> SubscriptionHandle {
        let key = request.key();
        let query = AppointmentQuery::from(&request);
        let (server_filters, client_filters) =
            split_filters(&query.remote_filters(), self.planes.settings.server_filter_limit);
        debug!(
            "Subscribing {} with {} server-side and {} client-side filters",
            key,
            server_filters.len(),
            client_filters.len()
        );

        // Subscribe to local signals first so no write between the initial
        // read and the loop start is missed.
        let local_signals = self.planes.local.signals();

        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel::<RemoteEvent>();
        let callback = Arc::new(move |event: RemoteEvent| {
            let _ = remote_tx.send(event);
        });
        let remote = match self
            .planes
            .remote
            .subscribe(self.planes.collection(), &server_filters, callback)
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!("Remote subscription for {} failed, continuing on local data: {}", key, e);
                None
            }
        };

        let mut worker = SyncWorker {
            planes: self.planes.clone(),
            machine: self.machine.clone(),
            request,
            query,
            on_update,
            latest_remote: Vec::new(),
            degraded: remote.is_none(),
        };
        worker.absorb_initial(remote_rx_drain(&mut remote_rx));
        worker.emit();

        let task = tokio::spawn(worker.run(remote_rx, local_signals));

        *lock(&self.registry).entry(key.clone()).or_insert(0) += 1;
        info!("Queue subscription {} active", key);

        SubscriptionHandle {
            key,
            registry: self.registry.clone(),
            state: Mutex::new(Some(HandleState { remote, task })),
        }
    }

    /// Keys of every subscription still open.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.registry).keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn remote_rx_drain(rx: &mut mpsc::UnboundedReceiver<RemoteEvent>) -> Vec<RemoteEvent> {
    // Stores deliver the initial snapshot synchronously from `subscribe`.
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

struct HandleState {
    remote: Option<RemoteSubscription>,
    task: JoinHandle<()>,
}

/// Owner of one live subscription. Unsubscribing is idempotent and also
/// happens on drop.
pub struct SubscriptionHandle {
    key: String,
    registry: Registry,
    state: Mutex<Option<HandleState>>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).is_some()
    }

    pub fn unsubscribe(&self) {
        let Some(state) = lock(&self.state).take() else {
            trace!("Subscription {} already closed", self.key);
            return;
        };

        if let Some(remote) = state.remote {
            remote.cancel();
        }
        state.task.abort();

        let mut registry = lock(&self.registry);
        if let Some(count) = registry.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                registry.remove(&self.key);
            }
        }
        info!("Queue subscription {} closed", self.key);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct SyncWorker {
    planes: Arc<DataPlanes>,
    machine: QueueStateMachine,
    request: SubscriptionRequest,
    query: AppointmentQuery,
    on_update: QueueUpdateCallback,
    latest_remote: Vec<RawAppointment>,
    degraded: bool,
}

impl SyncWorker {
    fn absorb_initial(&mut self, events: Vec<RemoteEvent>) {
        for event in events {
            self.absorb(event);
        }
    }

    fn absorb(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Snapshot(values) => {
                if self.degraded {
                    info!("Remote plane back for {}", self.request.key());
                }
                self.latest_remote = decode_records(&values);
                self.degraded = false;
            }
            RemoteEvent::Failed(e) => {
                warn!("Remote push for {} failed, falling back to local data: {}", self.request.key(), e);
                self.latest_remote.clear();
                self.degraded = true;
            }
        }
    }

    async fn run(
        mut self,
        mut remote_rx: mpsc::UnboundedReceiver<RemoteEvent>,
        mut local_signals: broadcast::Receiver<CacheSignal>,
    ) {
        let session = self.planes.local.session_id();
        let mut remote_open = true;

        loop {
            tokio::select! {
                biased;

                event = remote_rx.recv(), if remote_open => match event {
                    Some(event) => self.absorb(event),
                    None => {
                        debug!("Remote channel for {} closed", self.request.key());
                        remote_open = false;
                        continue;
                    }
                },

                signal = local_signals.recv() => match signal {
                    Ok(signal) if signal.key == self.planes.cache_key() => {
                        if signal.writer == session {
                            trace!("Local write in this session");
                        } else {
                            debug!("Local write from session {}", signal.writer);
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Skipped {} local signals; recomputing once", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }

            self.emit();
        }
    }

    fn emit(&self) {
        let canonical = self.planes.merge(&self.latest_remote, &self.query);
        let snapshot = self
            .machine
            .snapshot(&canonical, &self.request.doctor_id, self.planes.today());
        let update = build_update(
            &self.machine,
            &snapshot,
            &self.request.viewer,
            self.degraded,
            self.planes.now(),
        );
        (self.on_update)(update);
    }
}
