//! Shared application state for the console server.

use std::sync::{Arc, Mutex, PoisonError};

use autoapply::io::intervention::InterventionGate;
use autoapply::io::monitor::{AgentEvent, MonitorHandle};
use autoapply::io::store::JobStore;
use tokio::sync::broadcast;
use tokio::task::JoinError;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection used by the API only; workers hold their own.
    store: Arc<Mutex<JobStore>>,
    pub gate: InterventionGate,
    pub monitor: MonitorHandle,
    /// Monitor events re-broadcast to SSE clients.
    pub event_tx: Arc<broadcast::Sender<AgentEvent>>,
}

impl AppState {
    pub fn new(store: JobStore, gate: InterventionGate, monitor: MonitorHandle) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            store: Arc::new(Mutex::new(store)),
            gate,
            monitor,
            event_tx: Arc::new(event_tx),
        }
    }

    /// Run `f` against the store on the blocking pool.
    pub async fn with_store<T, F>(&self, f: F) -> Result<T, JoinError>
    where
        F: FnOnce(&mut JobStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
    }
}
