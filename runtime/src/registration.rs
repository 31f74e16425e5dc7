//! Service Worker Registration
//!
//! Drives workers through install, waiting and activation for one origin
//! and routes host events to the active (or waiting) worker.

use std::sync::Arc;

use spin::RwLock;
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{ClientInfo, ClientRegistry, WorkerClients};
use crate::events::{
    ActivateEvent, EventDispatcher, EventType, InstallEvent, MessageEvent, NotificationClickEvent,
    PushEvent, WorkerEvent,
};
use crate::fetch::{FetchEvent, FetchOutcome, Network, Request};
use crate::lifecycle::{
    LifecycleEvent, LifecycleManager, ServiceWorkerId, ServiceWorkerState, SharedState,
};
use crate::notification::{Notification, NotificationCenter, Notifications};
use crate::scope::WorkerGlobalScope;
use crate::sync::{SyncEvent, SyncId, SyncManager, SyncState};
use crate::{ServiceWorkerError, WorkerError};

/// Worker code: turns a fresh global scope into a dispatch table.
pub trait WorkerScript: Send + Sync {
    fn evaluate(&self, scope: Arc<WorkerGlobalScope>) -> Result<EventDispatcher, ServiceWorkerError>;
}

/// A worker instance owned by the registration
struct WorkerInstance {
    id: ServiceWorkerId,
    state: SharedState,
    scope: Arc<WorkerGlobalScope>,
    dispatcher: EventDispatcher,
}

impl WorkerInstance {
    fn state(&self) -> ServiceWorkerState {
        *self.state.read()
    }

    async fn run(&self, event: WorkerEvent) -> Result<(), WorkerError> {
        self.dispatcher.dispatch(event).settle().await
    }
}

/// A service worker registration
///
/// Owns the host side of one origin: Cache Storage, the client registry,
/// notifications, sync registrations and the installing, waiting and
/// active workers.
pub struct ServiceWorkerRegistration {
    origin: Url,
    caches: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<ClientRegistry>,
    notifications: Arc<dyn Notifications>,
    lifecycle: LifecycleManager,
    sync: SyncManager,
    waiting: Option<WorkerInstance>,
    active: Option<WorkerInstance>,
}

impl ServiceWorkerRegistration {
    /// Create a registration for `origin`
    pub fn new(origin: Url, network: Arc<dyn Network>) -> Self {
        Self {
            caches: Arc::new(CacheStorage::new(origin.as_str())),
            origin,
            network,
            clients: Arc::new(ClientRegistry::new()),
            notifications: Arc::new(NotificationCenter::default()),
            lifecycle: LifecycleManager::new(),
            sync: SyncManager::new(),
            waiting: None,
            active: None,
        }
    }

    /// Use a specific notification sink
    pub fn with_notifications(mut self, notifications: Arc<dyn Notifications>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn caches(&self) -> &Arc<CacheStorage> {
        &self.caches
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut LifecycleManager {
        &mut self.lifecycle
    }

    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync
    }

    /// Active worker ID
    pub fn active(&self) -> Option<ServiceWorkerId> {
        self.active.as_ref().map(|w| w.id)
    }

    /// Waiting worker ID
    pub fn waiting(&self) -> Option<ServiceWorkerId> {
        self.waiting.as_ref().map(|w| w.id)
    }

    /// State of a worker this registration still holds
    pub fn state_of(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        [&self.active, &self.waiting]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
            .map(WorkerInstance::state)
    }

    /// A page loaded under this registration's active worker
    pub fn connect_client(&self, url: impl Into<String>) -> ClientInfo {
        self.clients.connect(url, self.active())
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Evaluate and install a new worker.
    ///
    /// On success the worker is activated right away when there is no
    /// active worker or it asked to skip waiting; otherwise it waits.
    pub async fn install(&mut self, script: &dyn WorkerScript) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let worker = self.spawn(script)?;
        let id = worker.id;

        self.lifecycle
            .transition_state(id, &worker.state, ServiceWorkerState::Installing)?;
        log::info!("[SW Registration] installing {}", id);

        if let Err(err) = worker.run(WorkerEvent::Install(InstallEvent::new(id))).await {
            log::warn!("[SW Registration] install of {} failed: {}", id, err);
            self.lifecycle
                .transition_state(id, &worker.state, ServiceWorkerState::Redundant)?;
            return Err(ServiceWorkerError::InstallFailed(err));
        }
        self.lifecycle
            .transition_state(id, &worker.state, ServiceWorkerState::Installed)?;

        if let Some(replaced) = self.waiting.take() {
            log::info!("[SW Registration] {} replaces waiting {}", id, replaced.id);
            self.lifecycle
                .transition_state(replaced.id, &replaced.state, ServiceWorkerState::Redundant)?;
        }

        let skip_waiting = worker.scope.skip_waiting_requested();
        self.waiting = Some(worker);

        if self.active.is_none() || skip_waiting {
            self.activate().await?;
        } else {
            log::info!("[SW Registration] {} installed, waiting", id);
        }
        Ok(id)
    }

    /// Promote the waiting worker to active.
    ///
    /// Clients of the previous active worker move to the new one before the
    /// activate event fires. The previous worker only becomes redundant once
    /// activation succeeds; on failure it keeps its clients and stays active.
    pub async fn activate(&mut self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let worker = self.waiting.take().ok_or(ServiceWorkerError::NoWaitingWorker)?;
        let id = worker.id;
        let previous = self.active.take();

        let moved = previous
            .as_ref()
            .map_or(0, |previous| self.clients.replace_controller(previous.id, id));

        self.lifecycle
            .transition_state(id, &worker.state, ServiceWorkerState::Activating)?;
        log::info!("[SW Registration] activating {}", id);

        // The worker may claim clients while its activate event runs, so
        // count controlled clients around it.
        let controlled_before = self.clients.controlled_by(id);
        if let Err(err) = worker.run(WorkerEvent::Activate(ActivateEvent::new(id))).await {
            log::warn!("[SW Registration] activation of {} failed: {}", id, err);
            match &previous {
                Some(previous) => {
                    self.clients.replace_controller(id, previous.id);
                }
                None => {
                    self.clients.release_controller(id);
                }
            }
            self.active = previous;
            self.lifecycle
                .transition_state(id, &worker.state, ServiceWorkerState::Redundant)?;
            return Err(ServiceWorkerError::ActivateFailed(err));
        }

        if let Some(previous) = previous {
            self.lifecycle
                .transition_state(previous.id, &previous.state, ServiceWorkerState::Redundant)?;
        }
        let claimed = self.clients.controlled_by(id).saturating_sub(controlled_before);
        if moved + claimed > 0 {
            self.lifecycle.dispatch(LifecycleEvent::ControllerChange {
                worker_id: id,
                clients: moved + claimed,
            });
        }

        self.lifecycle
            .transition_state(id, &worker.state, ServiceWorkerState::Activated)?;
        self.active = Some(worker);
        Ok(id)
    }

    /// Clients of the active worker went away: a waiting worker takes over.
    ///
    /// Returns the newly active worker, if one was promoted.
    pub async fn release_clients(&mut self) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        let Some(active) = self.active() else {
            return Ok(None);
        };
        if self.waiting.is_none() || self.clients.controlled_by(active) > 0 {
            return Ok(None);
        }
        self.activate().await.map(Some)
    }

    fn spawn(&self, script: &dyn WorkerScript) -> Result<WorkerInstance, ServiceWorkerError> {
        let id = ServiceWorkerId::new();
        let state: SharedState = Arc::new(RwLock::new(ServiceWorkerState::Parsed));
        let clients = WorkerClients::new(
            id,
            Arc::clone(&state),
            self.origin.clone(),
            Arc::clone(&self.clients),
        );
        let scope = Arc::new(WorkerGlobalScope::new(
            id,
            Arc::clone(&state),
            self.origin.clone(),
            Arc::clone(&self.caches),
            Arc::clone(&self.network),
            Arc::new(clients),
            Arc::clone(&self.notifications),
        ));
        let dispatcher = script.evaluate(Arc::clone(&scope))?;
        Ok(WorkerInstance {
            id,
            state,
            scope,
            dispatcher,
        })
    }

    fn active_worker(&self) -> Result<&WorkerInstance, ServiceWorkerError> {
        self.active.as_ref().ok_or(ServiceWorkerError::NoActiveWorker)
    }

    // ── Functional events ───────────────────────────────────────

    /// Route a request through the active worker.
    ///
    /// Without an active worker the request is not intercepted.
    pub async fn fetch(&self, request: Request) -> FetchOutcome {
        let Some(worker) = self.active.as_ref() else {
            log::debug!("[SW Registration] no active worker for {}", request.url);
            return FetchOutcome::Passthrough;
        };
        match worker.dispatcher.dispatch(WorkerEvent::Fetch(FetchEvent::new(request))) {
            WorkerEvent::Fetch(event) => event.settle().await,
            other => {
                if let Err(err) = other.settle().await {
                    log::warn!("[SW Registration] fetch dispatch failed: {}", err);
                }
                FetchOutcome::Passthrough
            }
        }
    }

    /// Deliver a push message
    pub async fn push(&self, data: Option<Vec<u8>>) -> Result<(), ServiceWorkerError> {
        self.active_worker()?
            .run(WorkerEvent::Push(PushEvent::new(data)))
            .await
            .map_err(|source| event_failed(EventType::Push, source))
    }

    /// The user clicked a notification (or one of its actions)
    pub async fn notification_click(
        &self,
        notification: Notification,
        action: Option<&str>,
    ) -> Result<(), ServiceWorkerError> {
        let mut event = NotificationClickEvent::new(notification);
        if let Some(action) = action {
            event = event.with_action(action);
        }
        self.active_worker()?
            .run(WorkerEvent::NotificationClick(event))
            .await
            .map_err(|source| event_failed(EventType::NotificationClick, source))
    }

    /// Register a background sync for `tag`
    pub fn register_sync(&mut self, tag: impl Into<String>) -> SyncId {
        self.sync.register(tag)
    }

    /// Fire the sync registered for `tag` and record the outcome.
    ///
    /// A rejected completion is returned as an error; the registration then
    /// stays queued until it runs out of attempts.
    pub async fn sync(&mut self, tag: &str) -> Result<SyncState, ServiceWorkerError> {
        self.active_worker()?;
        let event = self
            .sync
            .fire(tag)
            .map_err(|err| event_failed(EventType::Sync, err.into()))?;
        self.run_sync(tag, event).await
    }

    /// Fire every due sync registration, e.g. once connectivity returns
    pub async fn sync_pending(&mut self) -> Vec<(String, Result<SyncState, ServiceWorkerError>)> {
        if self.active.is_none() {
            return Vec::new();
        }
        let mut results = Vec::new();
        for event in self.sync.fire_pending() {
            let tag = event.tag.clone();
            let result = self.run_sync(&tag, event).await;
            results.push((tag, result));
        }
        results
    }

    async fn run_sync(
        &mut self,
        tag: &str,
        event: SyncEvent,
    ) -> Result<SyncState, ServiceWorkerError> {
        let outcome = self.active_worker()?.run(WorkerEvent::Sync(event)).await;
        let state = self.sync.complete(tag, outcome.is_ok());
        match outcome {
            Ok(()) => Ok(state.unwrap_or(SyncState::Success)),
            Err(source) => Err(event_failed(EventType::Sync, source)),
        }
    }

    /// Post a message to the active worker
    pub async fn post_message(
        &self,
        data: serde_json::Value,
        source: Option<&str>,
    ) -> Result<(), ServiceWorkerError> {
        let event = self.message_event(data, source);
        self.active_worker()?
            .run(WorkerEvent::Message(event))
            .await
            .map_err(|source| event_failed(EventType::Message, source))
    }

    /// Post a message to the waiting worker.
    ///
    /// If the worker asks to skip waiting in response, it is activated
    /// immediately and its ID returned.
    pub async fn post_message_to_waiting(
        &mut self,
        data: serde_json::Value,
        source: Option<&str>,
    ) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        let event = self.message_event(data, source);
        let worker = self.waiting.as_ref().ok_or(ServiceWorkerError::NoWaitingWorker)?;
        worker
            .run(WorkerEvent::Message(event))
            .await
            .map_err(|source| event_failed(EventType::Message, source))?;

        if worker.scope.skip_waiting_requested() {
            return self.activate().await.map(Some);
        }
        Ok(None)
    }

    fn message_event(&self, data: serde_json::Value, source: Option<&str>) -> MessageEvent {
        let mut event = MessageEvent::new(data, self.origin.origin().ascii_serialization());
        if let Some(source) = source {
            event.set_source(source);
        }
        event
    }
}

fn event_failed(event: EventType, source: WorkerError) -> ServiceWorkerError {
    ServiceWorkerError::EventFailed { event, source }
}

impl core::fmt::Debug for ServiceWorkerRegistration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceWorkerRegistration")
            .field("origin", &self.origin.as_str())
            .field("active", &self.active())
            .field("waiting", &self.waiting())
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::events::ExtendableEvent;
    use crate::fetch::{NetworkError, Response};
    use async_trait::async_trait;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Offline;

    #[async_trait]
    impl Network for Offline {
        async fn fetch(&self, _request: &Request) -> Result<Response, NetworkError> {
            Err(NetworkError::Offline)
        }
    }

    /// Script whose install succeeds or fails on demand
    #[derive(Default)]
    struct TestScript {
        fail_install: bool,
        fail_activate: bool,
        skip_waiting: bool,
    }

    impl WorkerScript for TestScript {
        fn evaluate(&self, scope: Arc<WorkerGlobalScope>) -> Result<EventDispatcher, ServiceWorkerError> {
            let mut dispatcher = EventDispatcher::new();
            let fail = self.fail_install;
            let skip = self.skip_waiting;
            let install_scope = Arc::clone(&scope);
            dispatcher.on_install(move |event| {
                if skip {
                    install_scope.skip_waiting();
                }
                if fail {
                    event.wait_until(async {
                        Err(WorkerError::from(CacheError::InvalidResponse))
                    });
                }
            });
            let fail_activate = self.fail_activate;
            let activate_scope = Arc::clone(&scope);
            dispatcher.on_activate(move |event| {
                let scope = Arc::clone(&activate_scope);
                event.wait_until(async move {
                    scope.clients().claim().await?;
                    if fail_activate {
                        return Err(WorkerError::from(CacheError::InvalidResponse));
                    }
                    Ok::<(), WorkerError>(())
                });
            });
            let message_scope = scope;
            dispatcher.on_message(move |event| {
                if event.control().is_some() {
                    message_scope.skip_waiting();
                }
            });
            Ok(dispatcher)
        }
    }

    fn registration() -> ServiceWorkerRegistration {
        ServiceWorkerRegistration::new(Url::parse("https://store.test").unwrap(), Arc::new(Offline))
    }

    #[test]
    fn test_first_install_activates() {
        let mut reg = registration();
        let id = block_on(reg.install(&TestScript::default())).unwrap();
        assert_eq!(reg.active(), Some(id));
        assert_eq!(reg.waiting(), None);
        assert_eq!(reg.state_of(id), Some(ServiceWorkerState::Activated));
    }

    #[test]
    fn test_failed_install_is_redundant() {
        let mut reg = registration();
        let result = block_on(reg.install(&TestScript {
            fail_install: true,
            ..Default::default()
        }));
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert_eq!(reg.active(), None);
        let last = reg.lifecycle().events().last().cloned();
        assert!(matches!(
            last,
            Some(LifecycleEvent::StateChange(change)) if change.new_state == ServiceWorkerState::Redundant
        ));
    }

    #[test]
    fn test_update_waits_while_clients_open() {
        let mut reg = registration();
        let v1 = block_on(reg.install(&TestScript::default())).unwrap();
        let client = reg.connect_client("https://store.test/");
        assert_eq!(client.controller, Some(v1));

        let v2 = block_on(reg.install(&TestScript::default())).unwrap();
        assert_eq!(reg.active(), Some(v1));
        assert_eq!(reg.waiting(), Some(v2));
        assert_eq!(reg.state_of(v2), Some(ServiceWorkerState::Installed));

        // Still controlled: nothing happens
        assert_eq!(block_on(reg.release_clients()).unwrap(), None);

        reg.clients().disconnect(&client.id);
        assert_eq!(block_on(reg.release_clients()).unwrap(), Some(v2));
        assert_eq!(reg.active(), Some(v2));
        assert_eq!(reg.state_of(v1), None);
    }

    #[test]
    fn test_skip_waiting_on_install_takes_over() {
        let mut reg = registration();
        let v1 = block_on(reg.install(&TestScript::default())).unwrap();
        let client = reg.connect_client("https://store.test/");

        let v2 = block_on(reg.install(&TestScript {
            skip_waiting: true,
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(reg.active(), Some(v2));
        assert_eq!(reg.clients().get(&client.id).unwrap().controller, Some(v2));
        assert!(reg.lifecycle().events().iter().any(|e| matches!(
            e,
            LifecycleEvent::ControllerChange { worker_id, clients: 1 } if *worker_id == v2
        )));
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_failed_activation_keeps_previous_worker() {
        let mut reg = registration();
        let v1 = block_on(reg.install(&TestScript::default())).unwrap();
        let client = reg.connect_client("https://store.test/");

        let result = block_on(reg.install(&TestScript {
            fail_activate: true,
            skip_waiting: true,
            ..Default::default()
        }));
        assert!(matches!(result, Err(ServiceWorkerError::ActivateFailed(_))));
        assert_eq!(reg.active(), Some(v1));
        assert_eq!(reg.waiting(), None);
        assert_eq!(reg.state_of(v1), Some(ServiceWorkerState::Activated));
        assert_eq!(reg.clients().get(&client.id).unwrap().controller, Some(v1));
        assert!(!reg
            .lifecycle()
            .events()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::ControllerChange { .. })));
    }

    #[test]
    fn test_failed_first_activation_releases_clients() {
        let mut reg = registration();
        let client = reg.connect_client("https://store.test/");
        let result = block_on(reg.install(&TestScript {
            fail_activate: true,
            ..Default::default()
        }));
        assert!(matches!(result, Err(ServiceWorkerError::ActivateFailed(_))));
        assert_eq!(reg.active(), None);
        assert_eq!(reg.clients().get(&client.id).unwrap().controller, None);
    }

    #[test]
    fn test_message_to_waiting_worker() {
        let mut reg = registration();
        block_on(reg.install(&TestScript::default())).unwrap();
        reg.connect_client("https://store.test/");
        let v2 = block_on(reg.install(&TestScript::default())).unwrap();

        let promoted = block_on(reg.post_message_to_waiting(
            serde_json::json!({ "type": "SKIP_WAITING" }),
            None,
        ))
        .unwrap();
        assert_eq!(promoted, Some(v2));
        assert_eq!(reg.active(), Some(v2));
    }

    #[test]
    fn test_newer_install_replaces_waiting() {
        let mut reg = registration();
        block_on(reg.install(&TestScript::default())).unwrap();
        reg.connect_client("https://store.test/");
        let v2 = block_on(reg.install(&TestScript::default())).unwrap();
        let v3 = block_on(reg.install(&TestScript::default())).unwrap();
        assert_eq!(reg.waiting(), Some(v3));
        assert_eq!(reg.state_of(v2), None);
    }

    #[test]
    fn test_events_need_active_worker() {
        let mut reg = registration();
        assert!(block_on(reg.fetch(Request::new("https://store.test/"))).is_passthrough());
        assert_eq!(block_on(reg.push(None)), Err(ServiceWorkerError::NoActiveWorker));
        assert_eq!(block_on(reg.activate()), Err(ServiceWorkerError::NoWaitingWorker));
        reg.register_sync("sync-cart");
        assert_eq!(block_on(reg.sync("sync-cart")), Err(ServiceWorkerError::NoActiveWorker));
        assert!(block_on(reg.sync_pending()).is_empty());
    }

    #[test]
    fn test_lifecycle_listener_sees_activation() {
        let mut reg = registration();
        let activated = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&activated);
        reg.lifecycle_mut().add_listener(Box::new(move |event: &LifecycleEvent| {
            if let LifecycleEvent::StateChange(change) = event {
                if change.new_state == ServiceWorkerState::Activated {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        }));
        block_on(reg.install(&TestScript::default())).unwrap();
        assert!(activated.load(Ordering::SeqCst));
    }
}
