//! Clients API
//!
//! Pages (windows) that a worker can see, focus, open, and claim. The
//! [`ClientRegistry`] is the host-side record; each worker gets a
//! [`WorkerClients`] view bound to its own identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use spin::RwLock;
use url::Url;

use crate::lifecycle::{ServiceWorkerId, ServiceWorkerState, SharedState};

/// Client type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    /// Window client
    #[default]
    Window,
    /// All types
    All,
}

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    /// Auxiliary (opened via window.open)
    Auxiliary,
    /// Top-level
    #[default]
    TopLevel,
}

/// Visibility state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisibilityState {
    /// Hidden
    Hidden,
    /// Visible
    #[default]
    Visible,
}

/// Client info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client ID
    pub id: String,
    /// Client type
    pub client_type: ClientType,
    /// URL
    pub url: String,
    /// Frame type
    pub frame_type: FrameType,
    /// Visibility state
    pub visibility: VisibilityState,
    /// Whether focused
    pub focused: bool,
    /// Worker currently controlling this client
    pub controller: Option<ServiceWorkerId>,
}

/// Options for matchAll
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAllOptions {
    /// Include uncontrolled clients
    pub include_uncontrolled: bool,
    /// Client type filter
    pub client_type: ClientType,
}

/// Client API errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("client not found: {0}")]
    NotFound(String),

    #[error("worker is not active")]
    NotActive,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("cannot open {0}: outside the worker origin")]
    CrossOrigin(String),
}

/// The `clients` object as a worker sees it
#[async_trait]
pub trait Clients: Send + Sync {
    /// Clients matching the options
    async fn match_all(&self, options: MatchAllOptions) -> Vec<ClientInfo>;

    /// Open a new window at `url` (absolute or root-relative)
    async fn open_window(&self, url: &str) -> Result<ClientInfo, ClientError>;

    /// Focus an existing window
    async fn focus(&self, id: &str) -> Result<ClientInfo, ClientError>;

    /// Take control of every client in scope
    async fn claim(&self) -> Result<(), ClientError>;
}

/// Host-side record of all clients of an origin
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<Vec<ClientInfo>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A page was loaded; it starts under `controller` (if any)
    pub fn connect(&self, url: impl Into<String>, controller: Option<ServiceWorkerId>) -> ClientInfo {
        let id = format!("client-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let client = ClientInfo {
            id,
            client_type: ClientType::Window,
            url: url.into(),
            frame_type: FrameType::TopLevel,
            visibility: VisibilityState::Visible,
            focused: false,
            controller,
        };
        self.clients.write().push(client.clone());
        client
    }

    /// A page was closed
    pub fn disconnect(&self, id: &str) -> bool {
        let mut clients = self.clients.write();
        let len_before = clients.len();
        clients.retain(|c| c.id != id);
        clients.len() != len_before
    }

    /// Get a client by ID
    pub fn get(&self, id: &str) -> Option<ClientInfo> {
        self.clients.read().iter().find(|c| c.id == id).cloned()
    }

    pub fn all(&self) -> Vec<ClientInfo> {
        self.clients.read().clone()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of clients controlled by `worker`
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .read()
            .iter()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    /// Point every client at `worker`; returns how many changed
    pub fn set_controller_all(&self, worker: ServiceWorkerId) -> usize {
        let mut changed = 0;
        for client in self.clients.write().iter_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                changed += 1;
            }
        }
        changed
    }

    /// Move clients of `old` to `new`; returns how many moved
    pub fn replace_controller(&self, old: ServiceWorkerId, new: ServiceWorkerId) -> usize {
        let mut moved = 0;
        for client in self.clients.write().iter_mut() {
            if client.controller == Some(old) {
                client.controller = Some(new);
                moved += 1;
            }
        }
        moved
    }

    /// Drop `worker` as controller; returns how many clients it controlled
    pub fn release_controller(&self, worker: ServiceWorkerId) -> usize {
        let mut released = 0;
        for client in self.clients.write().iter_mut() {
            if client.controller == Some(worker) {
                client.controller = None;
                released += 1;
            }
        }
        released
    }

    fn focus(&self, id: &str) -> Option<ClientInfo> {
        let mut clients = self.clients.write();
        let mut focused = None;
        for client in clients.iter_mut() {
            client.focused = client.id == id;
            if client.focused {
                client.visibility = VisibilityState::Visible;
                focused = Some(client.clone());
            }
        }
        focused
    }

    fn open(&self, url: String, controller: Option<ServiceWorkerId>) -> ClientInfo {
        let client = self.connect(url, controller);
        if let Some(c) = self.clients.write().iter_mut().find(|c| c.id == client.id) {
            c.frame_type = FrameType::Auxiliary;
        }
        self.focus(&client.id).unwrap_or(client)
    }
}

/// A worker's view of the client registry
pub struct WorkerClients {
    worker_id: ServiceWorkerId,
    state: SharedState,
    origin: Url,
    registry: Arc<ClientRegistry>,
}

impl WorkerClients {
    pub fn new(
        worker_id: ServiceWorkerId,
        state: SharedState,
        origin: Url,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            worker_id,
            state,
            origin,
            registry,
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            *self.state.read(),
            ServiceWorkerState::Activating | ServiceWorkerState::Activated
        )
    }
}

#[async_trait]
impl Clients for WorkerClients {
    async fn match_all(&self, options: MatchAllOptions) -> Vec<ClientInfo> {
        self.registry
            .all()
            .into_iter()
            .filter(|client| {
                options.client_type == ClientType::All || client.client_type == options.client_type
            })
            .filter(|client| {
                options.include_uncontrolled || client.controller == Some(self.worker_id)
            })
            .collect()
    }

    async fn open_window(&self, url: &str) -> Result<ClientInfo, ClientError> {
        let target = self
            .origin
            .join(url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", url, e)))?;
        if target.origin() != self.origin.origin() {
            return Err(ClientError::CrossOrigin(target.to_string()));
        }
        let controller = self.is_active().then_some(self.worker_id);
        let client = self.registry.open(target.to_string(), controller);
        log::debug!("[SW Clients] opened window {} at {}", client.id, client.url);
        Ok(client)
    }

    async fn focus(&self, id: &str) -> Result<ClientInfo, ClientError> {
        self.registry
            .focus(id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    async fn claim(&self) -> Result<(), ClientError> {
        if !self.is_active() {
            return Err(ClientError::NotActive);
        }
        let changed = self.registry.set_controller_all(self.worker_id);
        log::debug!("[SW Clients] {} claimed {} client(s)", self.worker_id, changed);
        Ok(())
    }
}
