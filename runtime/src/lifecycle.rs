//! Service Worker Lifecycle Management
//!
//! Worker identities, the state machine, and the log of lifecycle events
//! the registration emits while driving it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use spin::RwLock;

use crate::ServiceWorkerError;

/// Service Worker global ID counter
static NEXT_SW_ID: AtomicU64 = AtomicU64::new(1);

/// Service Worker ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    /// Create a new unique ID
    pub fn new() -> Self {
        Self(NEXT_SW_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get raw value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "sw#{}", self.0)
    }
}

/// Service Worker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceWorkerState {
    /// Initial state, script evaluated
    #[default]
    Parsed,
    /// Installing (install event fired)
    Installing,
    /// Installed, waiting to activate
    Installed,
    /// Activating (activate event fired)
    Activating,
    /// Active and controlling pages
    Activated,
    /// Marked for removal
    Redundant,
}

/// State cell shared between the registration and the worker's scope
pub type SharedState = Arc<RwLock<ServiceWorkerState>>;

/// State change event data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeEvent {
    /// Worker ID
    pub worker_id: ServiceWorkerId,
    /// Old state
    pub old_state: ServiceWorkerState,
    /// New state
    pub new_state: ServiceWorkerState,
}

/// Lifecycle event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// State change
    StateChange(StateChangeEvent),
    /// Clients switched to a new controller
    ControllerChange {
        worker_id: ServiceWorkerId,
        clients: usize,
    },
}

/// Lifecycle manager
#[derive(Default)]
pub struct LifecycleManager {
    /// Emitted events, oldest first
    events: Vec<LifecycleEvent>,
    /// Event listeners
    listeners: Vec<Box<dyn Fn(&LifecycleEvent) + Send + Sync>>,
}

impl LifecycleManager {
    /// Create new lifecycle manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add event listener
    pub fn add_listener(&mut self, listener: Box<dyn Fn(&LifecycleEvent) + Send + Sync>) {
        self.listeners.push(listener);
    }

    /// Dispatch an event
    pub fn dispatch(&mut self, event: LifecycleEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
        self.events.push(event);
    }

    /// Events emitted so far
    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    /// Transition worker state
    pub fn transition_state(
        &mut self,
        worker_id: ServiceWorkerId,
        state: &SharedState,
        new_state: ServiceWorkerState,
    ) -> Result<(), ServiceWorkerError> {
        let old_state = {
            let mut current = state.write();
            let old_state = *current;
            if !is_valid_transition(old_state, new_state) {
                return Err(ServiceWorkerError::InvalidStateTransition {
                    from: old_state,
                    to: new_state,
                });
            }
            *current = new_state;
            old_state
        };

        log::debug!(
            "[SW Lifecycle] {}: {:?} -> {:?}",
            worker_id,
            old_state,
            new_state
        );
        self.dispatch(LifecycleEvent::StateChange(StateChangeEvent {
            worker_id,
            old_state,
            new_state,
        }));

        Ok(())
    }
}

/// Check if a state transition is valid
pub fn is_valid_transition(from: ServiceWorkerState, to: ServiceWorkerState) -> bool {
    use ServiceWorkerState::*;

    matches!(
        (from, to),
        // Normal lifecycle
        (Parsed, Installing) |
        (Installing, Installed) |
        (Installing, Redundant) |  // Install failed
        (Installed, Activating) |
        (Installed, Redundant) |   // Replaced while waiting
        (Activating, Activated) |
        (Activating, Redundant) |  // Activate failed
        (Activated, Redundant) // Replaced by new worker
    )
}
