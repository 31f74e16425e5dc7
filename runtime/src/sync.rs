//! Background Sync API
//!
//! Sync registrations and the host's retry policy, the `sync` event, and
//! the tasks a worker runs when a tag fires.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::events::{EventType, ExtendLifetime, ExtendableEvent};

/// Sync event ID counter
static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(1);

/// Attempts before a registration is dropped
pub const MAX_SYNC_ATTEMPTS: u32 = 3;

/// Sync registration ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncId(u64);

impl SyncId {
    fn new() -> Self {
        Self(NEXT_SYNC_ID.fetch_add(1, Ordering::SeqCst))
    }
}

/// Sync registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Waiting for connectivity
    #[default]
    Pending,
    /// Sync event being dispatched
    Firing,
    /// Failed, will retry
    Reregistering,
    /// Completed successfully
    Success,
    /// Out of attempts
    Failed,
}

/// Sync task errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync task failed: {0}")]
    Failed(String),

    #[error("no sync registration for tag '{0}'")]
    NotRegistered(String),
}

/// Sync registration
#[derive(Debug, Clone)]
pub struct SyncRegistration {
    id: SyncId,
    /// Tag (unique within the registration)
    tag: String,
    state: SyncState,
    attempts: u32,
    max_attempts: u32,
    last_chance: bool,
    created_at: DateTime<Utc>,
    last_fired_at: Option<DateTime<Utc>>,
}

impl SyncRegistration {
    /// Create new registration
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            id: SyncId::new(),
            tag: tag.into(),
            state: SyncState::Pending,
            attempts: 0,
            max_attempts: MAX_SYNC_ATTEMPTS,
            last_chance: false,
            created_at: Utc::now(),
            last_fired_at: None,
        }
    }

    pub fn id(&self) -> SyncId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the current attempt is the final one
    pub fn last_chance(&self) -> bool {
        self.last_chance
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_fired_at(&self) -> Option<DateTime<Utc>> {
        self.last_fired_at
    }

    /// Whether the registration is due to fire
    pub fn is_ready(&self) -> bool {
        matches!(self.state, SyncState::Pending | SyncState::Reregistering)
    }

    /// Start an attempt
    pub fn mark_firing(&mut self) {
        self.attempts += 1;
        self.last_chance = self.attempts >= self.max_attempts;
        self.state = SyncState::Firing;
        self.last_fired_at = Some(Utc::now());
    }

    pub fn mark_success(&mut self) {
        self.state = SyncState::Success;
    }

    /// Record a failed attempt; returns true if it will be retried
    pub fn mark_failed(&mut self) -> bool {
        if self.last_chance {
            self.state = SyncState::Failed;
            false
        } else {
            self.state = SyncState::Reregistering;
            true
        }
    }
}

/// Sync event
pub struct SyncEvent {
    /// Registration tag
    pub tag: String,
    /// Whether this is the final attempt
    pub last_chance: bool,
    lifetime: ExtendLifetime,
}

impl SyncEvent {
    /// Create new sync event
    pub fn new(tag: impl Into<String>, last_chance: bool) -> Self {
        Self {
            tag: tag.into(),
            last_chance,
            lifetime: ExtendLifetime::new(),
        }
    }
}

impl ExtendableEvent for SyncEvent {
    fn event_type(&self) -> EventType {
        EventType::Sync
    }

    fn lifetime(&self) -> &ExtendLifetime {
        &self.lifetime
    }
}

impl core::fmt::Debug for SyncEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncEvent")
            .field("tag", &self.tag)
            .field("last_chance", &self.last_chance)
            .finish()
    }
}

/// Sync registrations of one service worker registration
#[derive(Debug, Default)]
pub struct SyncManager {
    /// Registrations by tag
    registrations: BTreeMap<String, SyncRegistration>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sync; an existing registration for the tag is reused
    pub fn register(&mut self, tag: impl Into<String>) -> SyncId {
        let tag = tag.into();
        if let Some(existing) = self.registrations.get(&tag) {
            return existing.id();
        }

        log::debug!("[SW Sync] registered '{}'", tag);
        let registration = SyncRegistration::new(tag.clone());
        let id = registration.id();
        self.registrations.insert(tag, registration);
        id
    }

    pub fn get(&self, tag: &str) -> Option<&SyncRegistration> {
        self.registrations.get(tag)
    }

    /// Registered tags
    pub fn tags(&self) -> Vec<String> {
        self.registrations.keys().cloned().collect()
    }

    pub fn unregister(&mut self, tag: &str) -> bool {
        self.registrations.remove(tag).is_some()
    }

    /// Registrations due to fire
    pub fn pending(&self) -> impl Iterator<Item = &SyncRegistration> {
        self.registrations.values().filter(|r| r.is_ready())
    }

    /// Start an attempt for one tag
    pub fn fire(&mut self, tag: &str) -> Result<SyncEvent, SyncError> {
        let registration = self
            .registrations
            .get_mut(tag)
            .ok_or_else(|| SyncError::NotRegistered(tag.to_string()))?;
        registration.mark_firing();
        Ok(SyncEvent::new(tag, registration.last_chance))
    }

    /// Start an attempt for every due registration
    pub fn fire_pending(&mut self) -> Vec<SyncEvent> {
        self.registrations
            .values_mut()
            .filter(|r| r.is_ready())
            .map(|registration| {
                registration.mark_firing();
                SyncEvent::new(registration.tag.clone(), registration.last_chance)
            })
            .collect()
    }

    /// Record the outcome of an attempt and return the resulting state.
    ///
    /// Finished registrations (success or out of attempts) are removed.
    pub fn complete(&mut self, tag: &str, success: bool) -> Option<SyncState> {
        let registration = self.registrations.get_mut(tag)?;
        if success {
            registration.mark_success();
        } else if registration.mark_failed() {
            log::warn!(
                "[SW Sync] '{}' failed (attempt {}), will retry",
                tag,
                registration.attempts
            );
            return Some(SyncState::Reregistering);
        } else {
            log::warn!("[SW Sync] '{}' failed on its last attempt", tag);
        }

        let state = registration.state;
        self.registrations.remove(tag);
        Some(state)
    }
}

/// A background task run when its sync tag fires
#[async_trait]
pub trait BackgroundSync: Send + Sync {
    async fn run(&self) -> Result<(), SyncError>;
}

/// Replays wishlist changes made while offline
#[derive(Debug, Default, Clone, Copy)]
pub struct WishlistSync;

#[async_trait]
impl BackgroundSync for WishlistSync {
    async fn run(&self) -> Result<(), SyncError> {
        // Stub: nothing is queued offline yet.
        log::info!("[SW Sync] syncing wishlist");
        Ok(())
    }
}

/// Replays cart changes made while offline
#[derive(Debug, Default, Clone, Copy)]
pub struct CartSync;

#[async_trait]
impl BackgroundSync for CartSync {
    async fn run(&self) -> Result<(), SyncError> {
        log::info!("[SW Sync] syncing cart");
        Ok(())
    }
}
