//! Service Worker Events
//!
//! Event types delivered by the host, the "extend lifetime" contract
//! (`wait_until`), and the dispatch table that routes each event type to
//! the listeners a worker registered.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde::Deserialize;
use spin::Mutex;

use crate::fetch::FetchEvent;
use crate::lifecycle::ServiceWorkerId;
use crate::notification::Notification;
use crate::sync::SyncEvent;
use crate::WorkerError;

/// Event type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    /// Install event
    Install,
    /// Activate event
    Activate,
    /// Fetch event
    Fetch,
    /// Push event
    Push,
    /// Sync event
    Sync,
    /// Notification click event
    NotificationClick,
    /// Message event
    Message,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Activate => "activate",
            Self::Fetch => "fetch",
            Self::Push => "push",
            Self::Sync => "sync",
            Self::NotificationClick => "notificationclick",
            Self::Message => "message",
        }
    }
}

/// A unit of asynchronous work that keeps an event alive.
pub type LifetimeTask = BoxFuture<'static, Result<(), WorkerError>>;

/// The set of tasks an event is waiting on.
///
/// Cloning yields a handle to the same set, so a task that is already
/// running (a fetch response, say) can extend the event further. The host
/// must [`settle`](ExtendLifetime::settle) it before considering the event
/// handled, otherwise in-flight work like cache writes is cut short.
#[derive(Clone, Default)]
pub struct ExtendLifetime {
    pending: Arc<Mutex<Vec<LifetimeTask>>>,
    extensions: Arc<AtomicUsize>,
}

impl ExtendLifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the event alive until `task` completes
    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        self.pending.lock().push(Box::pin(task));
        self.extensions.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of `wait_until` calls so far
    pub fn extensions(&self) -> usize {
        self.extensions.load(Ordering::SeqCst)
    }

    /// Number of tasks not yet awaited
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Await every task, including tasks registered while settling.
    ///
    /// All tasks run to completion; the first failure is returned.
    pub async fn settle(&self) -> Result<(), WorkerError> {
        let mut first_error = None;
        loop {
            let batch: Vec<LifetimeTask> = core::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                break;
            }
            for result in join_all(batch).await {
                if let Err(err) = result {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl core::fmt::Debug for ExtendLifetime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtendLifetime")
            .field("extensions", &self.extensions())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Extendable event trait
pub trait ExtendableEvent {
    /// Get event type
    fn event_type(&self) -> EventType;

    /// Lifetime handle of this event
    fn lifetime(&self) -> &ExtendLifetime;

    /// Wait until a task completes before the event counts as handled
    fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = Result<(), WorkerError>> + Send + 'static,
        Self: Sized,
    {
        self.lifetime().wait_until(task);
    }

    /// Check if wait_until was called
    fn has_wait_until(&self) -> bool {
        self.lifetime().extensions() > 0
    }

    /// Tasks registered but not yet settled
    fn pending_count(&self) -> usize {
        self.lifetime().pending_count()
    }
}

macro_rules! extendable_event {
    ($ty:ty, $kind:expr) => {
        impl ExtendableEvent for $ty {
            fn event_type(&self) -> EventType {
                $kind
            }

            fn lifetime(&self) -> &ExtendLifetime {
                &self.lifetime
            }
        }
    };
}

/// Install event
#[derive(Debug)]
pub struct InstallEvent {
    /// Worker being installed
    pub worker_id: ServiceWorkerId,
    lifetime: ExtendLifetime,
}

impl InstallEvent {
    pub fn new(worker_id: ServiceWorkerId) -> Self {
        Self {
            worker_id,
            lifetime: ExtendLifetime::new(),
        }
    }
}

extendable_event!(InstallEvent, EventType::Install);

/// Activate event
#[derive(Debug)]
pub struct ActivateEvent {
    /// Worker being activated
    pub worker_id: ServiceWorkerId,
    lifetime: ExtendLifetime,
}

impl ActivateEvent {
    pub fn new(worker_id: ServiceWorkerId) -> Self {
        Self {
            worker_id,
            lifetime: ExtendLifetime::new(),
        }
    }
}

extendable_event!(ActivateEvent, EventType::Activate);

/// Control messages a page can post to the worker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate a waiting worker without waiting for clients to close
    SkipWaiting,
}

/// Message event data
#[derive(Debug)]
pub struct MessageEvent {
    /// Message data
    data: serde_json::Value,
    /// Origin
    origin: String,
    /// Source client ID
    source: Option<String>,
    lifetime: ExtendLifetime,
}

impl MessageEvent {
    /// Create new message event
    pub fn new(data: serde_json::Value, origin: impl Into<String>) -> Self {
        Self {
            data,
            origin: origin.into(),
            source: None,
            lifetime: ExtendLifetime::new(),
        }
    }

    /// Get data
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Get origin
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Get source
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Set source
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    /// Decode the data as a control message
    pub fn control(&self) -> Option<ControlMessage> {
        ControlMessage::deserialize(&self.data).ok()
    }
}

extendable_event!(MessageEvent, EventType::Message);

/// Push event data
#[derive(Debug)]
pub struct PushEvent {
    /// Push data
    data: Option<Vec<u8>>,
    lifetime: ExtendLifetime,
}

impl PushEvent {
    /// Create new push event
    pub fn new(data: Option<Vec<u8>>) -> Self {
        Self {
            data,
            lifetime: ExtendLifetime::new(),
        }
    }

    /// Get data
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Get data as text
    pub fn text(&self) -> Option<String> {
        self.data
            .as_deref()
            .and_then(|d| core::str::from_utf8(d).ok())
            .map(str::to_string)
    }
}

extendable_event!(PushEvent, EventType::Push);

/// Notification click event
#[derive(Debug)]
pub struct NotificationClickEvent {
    /// The clicked notification
    notification: Notification,
    /// Action clicked, `None` for the notification body
    action: Option<String>,
    lifetime: ExtendLifetime,
}

impl NotificationClickEvent {
    /// Create new notification click event
    pub fn new(notification: Notification) -> Self {
        Self {
            notification,
            action: None,
            lifetime: ExtendLifetime::new(),
        }
    }

    /// Set action
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn notification(&self) -> &Notification {
        &self.notification
    }

    /// Get action
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }
}

extendable_event!(NotificationClickEvent, EventType::NotificationClick);

/// An event as delivered to the dispatch table
#[derive(Debug)]
pub enum WorkerEvent {
    Install(InstallEvent),
    Activate(ActivateEvent),
    Fetch(FetchEvent),
    Push(PushEvent),
    Sync(SyncEvent),
    NotificationClick(NotificationClickEvent),
    Message(MessageEvent),
}

impl WorkerEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Install(e) => e.event_type(),
            Self::Activate(e) => e.event_type(),
            Self::Fetch(e) => e.event_type(),
            Self::Push(e) => e.event_type(),
            Self::Sync(e) => e.event_type(),
            Self::NotificationClick(e) => e.event_type(),
            Self::Message(e) => e.event_type(),
        }
    }

    pub fn lifetime(&self) -> &ExtendLifetime {
        match self {
            Self::Install(e) => e.lifetime(),
            Self::Activate(e) => e.lifetime(),
            Self::Fetch(e) => e.lifetime(),
            Self::Push(e) => e.lifetime(),
            Self::Sync(e) => e.lifetime(),
            Self::NotificationClick(e) => e.lifetime(),
            Self::Message(e) => e.lifetime(),
        }
    }

    /// Await every lifetime extension. Fetch events should be settled
    /// through [`FetchEvent::settle`] to obtain the response.
    pub async fn settle(self) -> Result<(), WorkerError> {
        self.lifetime().settle().await
    }
}

/// A registered event listener
pub type Listener = Box<dyn Fn(&mut WorkerEvent) + Send + Sync>;

/// Event dispatcher
///
/// Dispatch table from event type to the listeners registered for it.
/// Listeners run synchronously and in registration order; asynchronous
/// work is attached to the event through `wait_until` / `respond_with`.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: BTreeMap<EventType, Vec<Listener>>,
}

macro_rules! typed_listener {
    ($(#[$meta:meta])* $name:ident, $variant:ident, $event:ty) => {
        $(#[$meta])*
        pub fn $name<F>(&mut self, listener: F)
        where
            F: Fn(&mut $event) + Send + Sync + 'static,
        {
            self.add_listener(
                EventType::$variant,
                Box::new(move |event: &mut WorkerEvent| {
                    if let WorkerEvent::$variant(inner) = event {
                        listener(inner);
                    }
                }),
            );
        }
    };
}

impl EventDispatcher {
    /// Create new dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw listener for an event type
    pub fn add_listener(&mut self, event_type: EventType, listener: Listener) {
        self.listeners.entry(event_type).or_default().push(listener);
    }

    typed_listener!(
        /// Listen for `install`
        on_install, Install, InstallEvent
    );
    typed_listener!(
        /// Listen for `activate`
        on_activate, Activate, ActivateEvent
    );
    typed_listener!(
        /// Listen for `fetch`
        on_fetch, Fetch, FetchEvent
    );
    typed_listener!(on_push, Push, PushEvent);
    typed_listener!(on_sync, Sync, SyncEvent);
    typed_listener!(on_notification_click, NotificationClick, NotificationClickEvent);
    typed_listener!(on_message, Message, MessageEvent);

    /// Whether any listener handles this type
    pub fn has_listeners(&self, event_type: EventType) -> bool {
        self.listeners
            .get(&event_type)
            .is_some_and(|listeners| !listeners.is_empty())
    }

    /// Number of listeners for an event type
    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.listeners.get(&event_type).map_or(0, Vec::len)
    }

    /// Run every listener for the event and hand the event back for settling
    pub fn dispatch(&self, mut event: WorkerEvent) -> WorkerEvent {
        let event_type = event.event_type();
        match self.listeners.get(&event_type) {
            Some(listeners) => {
                log::debug!(
                    "[SW Events] dispatching {} to {} listener(s)",
                    event_type.as_str(),
                    listeners.len()
                );
                for listener in listeners {
                    listener(&mut event);
                }
            }
            None => log::debug!("[SW Events] no listener for {}", event_type.as_str()),
        }
        event
    }
}
