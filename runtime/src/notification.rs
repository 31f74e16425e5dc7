//! Notification API
//!
//! What a worker needs to show and close user-facing notifications, and
//! the host-side [`NotificationCenter`] that records them.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spin::RwLock;

// ── Permission ──────────────────────────────────────────────

/// Notification permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationPermission {
    /// User hasn't been asked yet.
    #[default]
    Default,
    /// User granted permission.
    Granted,
    /// User denied permission.
    Denied,
}

// ── Notification Options ────────────────────────────────────

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    /// Identifier reported back in `notificationclick`.
    pub action: String,
    /// Button label.
    pub title: String,
    /// Button icon URL.
    #[serde(default)]
    pub icon: Option<String>,
}

/// Options passed to `showNotification(title, options)`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NotificationOptions {
    /// Body text.
    pub body: String,
    /// Icon URL.
    pub icon: Option<String>,
    /// Badge URL.
    pub badge: Option<String>,
    /// Tag (de-duplication key).
    pub tag: Option<String>,
    /// Vibration pattern in milliseconds.
    pub vibrate: Vec<u32>,
    /// Arbitrary data carried to the click handler.
    pub data: serde_json::Value,
    /// Action buttons.
    pub actions: Vec<NotificationAction>,
}

/// A notification that was shown.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Host-assigned ID.
    pub id: u64,
    /// Title.
    pub title: String,
    /// Options it was shown with.
    pub options: NotificationOptions,
}

impl Notification {
    /// Whether the notification offers an action with this ID.
    pub fn has_action(&self, action: &str) -> bool {
        self.options.actions.iter().any(|a| a.action == action)
    }
}

/// Notification errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification permission denied")]
    PermissionDenied,

    #[error("notification {0} not found")]
    NotFound(u64),
}

/// Notification display provided by the host.
#[async_trait]
pub trait Notifications: Send + Sync {
    /// Show a notification. A notification with the same tag replaces the
    /// previous one.
    async fn show(&self, title: &str, options: NotificationOptions) -> Result<Notification, NotificationError>;

    /// Close a notification.
    async fn close(&self, id: u64) -> Result<(), NotificationError>;
}

// ── Center ──────────────────────────────────────────────────

/// In-process notification center.
#[derive(Debug)]
pub struct NotificationCenter {
    permission: RwLock<NotificationPermission>,
    active: RwLock<Vec<Notification>>,
    next_id: AtomicU64,
}

impl NotificationCenter {
    /// Create a center with the given permission state.
    pub fn new(permission: NotificationPermission) -> Self {
        Self {
            permission: RwLock::new(permission),
            active: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn permission(&self) -> NotificationPermission {
        *self.permission.read()
    }

    pub fn set_permission(&self, permission: NotificationPermission) {
        *self.permission.write() = permission;
    }

    /// Notifications currently displayed, oldest first.
    pub fn active(&self) -> Vec<Notification> {
        self.active.read().clone()
    }

    pub fn get(&self, id: u64) -> Option<Notification> {
        self.active.read().iter().find(|n| n.id == id).cloned()
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new(NotificationPermission::Granted)
    }
}

#[async_trait]
impl Notifications for NotificationCenter {
    async fn show(&self, title: &str, options: NotificationOptions) -> Result<Notification, NotificationError> {
        if self.permission() != NotificationPermission::Granted {
            log::warn!("[SW Notification] permission not granted, dropping '{}'", title);
            return Err(NotificationError::PermissionDenied);
        }

        let notification = Notification {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            title: title.to_string(),
            options,
        };

        let mut active = self.active.write();
        if let Some(tag) = &notification.options.tag {
            active.retain(|n| n.options.tag.as_ref() != Some(tag));
        }
        active.push(notification.clone());
        log::debug!("[SW Notification] showing #{} '{}'", notification.id, title);
        Ok(notification)
    }

    async fn close(&self, id: u64) -> Result<(), NotificationError> {
        let mut active = self.active.write();
        let len_before = active.len();
        active.retain(|n| n.id != id);
        if active.len() == len_before {
            return Err(NotificationError::NotFound(id));
        }
        Ok(())
    }
}
