//! Worker global scope
//!
//! Everything a running worker can reach: its origin, Cache Storage, the
//! network, clients and notifications, plus the `skip_waiting` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use url::Url;

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::fetch::{FetchError, Network, Request};
use crate::lifecycle::{ServiceWorkerId, ServiceWorkerState, SharedState};
use crate::notification::Notifications;

/// The global scope of one worker instance
pub struct WorkerGlobalScope {
    id: ServiceWorkerId,
    state: SharedState,
    origin: Url,
    caches: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<dyn Clients>,
    notifications: Arc<dyn Notifications>,
    skip_waiting: AtomicBool,
}

impl WorkerGlobalScope {
    pub fn new(
        id: ServiceWorkerId,
        state: SharedState,
        origin: Url,
        caches: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<dyn Clients>,
        notifications: Arc<dyn Notifications>,
    ) -> Self {
        Self {
            id,
            state,
            origin,
            caches,
            network,
            clients,
            notifications,
            skip_waiting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    /// Current lifecycle state of this worker
    pub fn state(&self) -> ServiceWorkerState {
        *self.state.read()
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn caches(&self) -> &Arc<CacheStorage> {
        &self.caches
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub fn clients(&self) -> &Arc<dyn Clients> {
        &self.clients
    }

    pub fn notifications(&self) -> &Arc<dyn Notifications> {
        &self.notifications
    }

    /// Ask to be activated as soon as installation finishes, without
    /// waiting for the clients of the current worker to close.
    pub fn skip_waiting(&self) {
        if !self.skip_waiting.swap(true, Ordering::SeqCst) {
            log::info!("[SW Scope] {} requested skip_waiting", self.id);
        }
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Resolve a root-relative path against the origin
    pub fn resolve(&self, path: &str) -> Result<Url, FetchError> {
        self.origin
            .join(path)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", path, e)))
    }

    /// Request for a root-relative path
    pub fn request(&self, path: &str) -> Result<Request, FetchError> {
        Ok(Request::new(self.resolve(path)?.to_string()))
    }

    /// Whether `url` shares this worker's origin
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }
}

impl core::fmt::Debug for WorkerGlobalScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerGlobalScope")
            .field("id", &self.id)
            .field("origin", &self.origin.as_str())
            .field("skip_waiting", &self.skip_waiting_requested())
            .finish()
    }
}
