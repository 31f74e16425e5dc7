//! NovaCore Offline Cache Worker
//!
//! This crate provides the offline layer of the NovaCore storefront: a
//! service worker that precaches the app bundle, answers requests
//! cache-first with an app shell for navigations, keeps a runtime cache of
//! successful responses, shows push notifications and runs background
//! sync tasks.
//!
//! There is no browser underneath, so the crate also carries the host side
//! of the service-worker contract: event delivery with explicit lifetime
//! extension, Cache Storage, clients, notifications and the registration
//! that drives install and activation. The network is supplied by the
//! embedder through [`fetch::Network`].
//!
//! # Architecture
//!
//! - `worker`: The offline cache worker (install/activate/fetch/push/sync/message handlers)
//! - `registration`: Lifecycle driver and event routing (install → waiting → active)
//! - `events`: Event types, `wait_until` lifetime contract, dispatch table
//! - `fetch`: Request/response model, fetch event, `Network` trait
//! - `cache`: Cache Storage (named caches, shared byte quota)
//! - `clients`: Client registry and the worker-facing `Clients` API
//! - `notification`: Notification options and the host notification center
//! - `sync`: Background sync registrations, retry policy and tasks
//! - `lifecycle`: Worker IDs, state machine, lifecycle event log
//! - `scope`: Worker global scope
//! - `config`: TOML configuration

pub mod cache;
pub mod clients;
pub mod config;
pub mod events;
pub mod fetch;
pub mod lifecycle;
pub mod notification;
pub mod registration;
pub mod scope;
pub mod sync;
pub mod worker;

pub use cache::{Cache, CacheError, CacheMatchOptions, CacheStorage};
pub use clients::{ClientError, ClientInfo, ClientRegistry, Clients};
pub use config::{ConfigError, WorkerConfig};
pub use events::{EventDispatcher, EventType, ExtendLifetime, ExtendableEvent, WorkerEvent};
pub use fetch::{FetchError, FetchOutcome, Network, NetworkError, Request, Response};
pub use lifecycle::{LifecycleEvent, ServiceWorkerId, ServiceWorkerState};
pub use notification::{Notification, NotificationCenter, NotificationError, Notifications};
pub use registration::{ServiceWorkerRegistration, WorkerScript};
pub use scope::WorkerGlobalScope;
pub use sync::{BackgroundSync, SyncError, SyncState};
pub use worker::{offline_placeholder, OfflineCacheScript, OfflineCacheWorker};

/// Failure of the work an event was extended with.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Registration-level errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ServiceWorkerError {
    #[error("script evaluation failed: {0}")]
    ScriptEvalFailed(String),

    #[error("install failed: {0}")]
    InstallFailed(#[source] WorkerError),

    #[error("activation failed: {0}")]
    ActivateFailed(#[source] WorkerError),

    #[error("{} event failed: {}", .event.as_str(), .source)]
    EventFailed {
        event: EventType,
        #[source]
        source: WorkerError,
    },

    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: ServiceWorkerState,
        to: ServiceWorkerState,
    },

    #[error("no active worker")]
    NoActiveWorker,

    #[error("no waiting worker")]
    NoWaitingWorker,
}
