//! Offline cache worker
//!
//! The NovaCore offline worker: precaches the app bundle on install, purges
//! stale caches on activate, and answers fetches cache-first with an app
//! shell for navigations and a placeholder for images that cannot be
//! loaded. It also shows push notifications and runs the background-sync
//! tasks registered for its tags.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::CacheMatchOptions;
use crate::clients::{ClientInfo, ClientType, MatchAllOptions};
use crate::config::WorkerConfig;
use crate::events::{
    ActivateEvent, ControlMessage, EventDispatcher, ExtendLifetime, ExtendableEvent, InstallEvent,
    MessageEvent, NotificationClickEvent, PushEvent,
};
use crate::fetch::{
    FetchError, FetchEvent, Request, RequestDestination, RequestMethod, Response, ResponseType,
};
use crate::notification::{NotificationAction, NotificationOptions};
use crate::registration::WorkerScript;
use crate::scope::WorkerGlobalScope;
use crate::sync::{BackgroundSync, CartSync, SyncEvent, WishlistSync};
use crate::{ServiceWorkerError, WorkerError};

/// Action that opens the storefront from a notification
pub const ACTION_EXPLORE: &str = "explore";
/// Action that only dismisses the notification
pub const ACTION_CLOSE: &str = "close";

const OFFLINE_IMAGE_SVG: &str = concat!(
    r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200">"##,
    r##"<rect width="200" height="200" fill="#1e1e2e"/>"##,
    r##"<text x="100" y="105" fill="#a6adc8" font-family="sans-serif" font-size="18" text-anchor="middle">Offline</text>"##,
    r##"</svg>"##
);

/// Image served when an image request misses the cache and the network is
/// unreachable.
pub fn offline_placeholder() -> Response {
    Response::new(200)
        .with_header("Content-Type", "image/svg+xml")
        .with_header("Cache-Control", "no-store")
        .with_body(OFFLINE_IMAGE_SVG.as_bytes())
}

/// Script that evaluates to an [`OfflineCacheWorker`]
pub struct OfflineCacheScript {
    config: Arc<WorkerConfig>,
    sync_tasks: BTreeMap<String, Arc<dyn BackgroundSync>>,
}

impl OfflineCacheScript {
    /// Script with the built-in wishlist and cart sync tasks
    pub fn new(config: WorkerConfig) -> Self {
        let mut sync_tasks: BTreeMap<String, Arc<dyn BackgroundSync>> = BTreeMap::new();
        sync_tasks.insert(config.sync.wishlist_tag.clone(), Arc::new(WishlistSync));
        sync_tasks.insert(config.sync.cart_tag.clone(), Arc::new(CartSync));
        Self {
            config: Arc::new(config),
            sync_tasks,
        }
    }

    /// Run `task` when `tag` fires, replacing any task for that tag
    pub fn with_sync_task(mut self, tag: impl Into<String>, task: impl BackgroundSync + 'static) -> Self {
        self.sync_tasks.insert(tag.into(), Arc::new(task));
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

impl Default for OfflineCacheScript {
    fn default() -> Self {
        Self::new(WorkerConfig::default())
    }
}

impl WorkerScript for OfflineCacheScript {
    fn evaluate(&self, scope: Arc<WorkerGlobalScope>) -> Result<EventDispatcher, ServiceWorkerError> {
        self.config
            .validate()
            .map_err(|e| ServiceWorkerError::ScriptEvalFailed(e.to_string()))?;

        let worker = Arc::new(OfflineCacheWorker {
            scope,
            config: Arc::clone(&self.config),
            sync_tasks: self.sync_tasks.clone(),
        });
        Ok(worker.listeners())
    }
}

/// A running instance of the offline worker
pub struct OfflineCacheWorker {
    scope: Arc<WorkerGlobalScope>,
    config: Arc<WorkerConfig>,
    sync_tasks: BTreeMap<String, Arc<dyn BackgroundSync>>,
}

impl OfflineCacheWorker {
    /// Build the dispatch table for this instance
    pub fn listeners(self: &Arc<Self>) -> EventDispatcher {
        let mut dispatcher = EventDispatcher::new();

        let worker = Arc::clone(self);
        dispatcher.on_install(move |event| worker.on_install(event));
        let worker = Arc::clone(self);
        dispatcher.on_activate(move |event| worker.on_activate(event));
        let worker = Arc::clone(self);
        dispatcher.on_fetch(move |event| worker.on_fetch(event));
        let worker = Arc::clone(self);
        dispatcher.on_push(move |event| worker.on_push(event));
        let worker = Arc::clone(self);
        dispatcher.on_notification_click(move |event| worker.on_notification_click(event));
        let worker = Arc::clone(self);
        dispatcher.on_sync(move |event| worker.on_sync(event));
        let worker = Arc::clone(self);
        dispatcher.on_message(move |event| worker.on_message(event));

        dispatcher
    }

    // ── install / activate ──────────────────────────────────────

    fn on_install(&self, event: &mut InstallEvent) {
        let scope = Arc::clone(&self.scope);
        let config = Arc::clone(&self.config);
        event.wait_until(async move {
            let requests = config
                .precache
                .iter()
                .map(|path| scope.request(path))
                .collect::<Result<Vec<_>, _>>()?;

            scope.caches().set_quota(config.quota_bytes);
            let cache = scope.caches().open(&config.static_cache_name());
            cache.add_all(scope.network().as_ref(), requests).await?;
            log::info!(
                "[SW Install] precached {} assets into {}",
                config.precache.len(),
                cache.name()
            );

            if config.skip_waiting_on_install {
                scope.skip_waiting();
            }
            Ok::<(), WorkerError>(())
        });
    }

    fn on_activate(&self, event: &mut ActivateEvent) {
        let scope = Arc::clone(&self.scope);
        let config = Arc::clone(&self.config);
        event.wait_until(async move {
            for name in scope.caches().keys() {
                if !config.is_current_cache(&name) {
                    log::info!("[SW Activate] deleting stale cache {}", name);
                    scope.caches().delete(&name);
                }
            }
            scope.clients().claim().await?;
            Ok::<(), WorkerError>(())
        });
    }

    // ── fetch ───────────────────────────────────────────────────

    fn on_fetch(&self, event: &mut FetchEvent) {
        let request = event.request().clone();
        let url = match request.parsed_url() {
            Ok(url) => url,
            Err(err) => {
                log::debug!("[SW Fetch] not intercepting: {}", err);
                return;
            }
        };
        if !self.scope.is_same_origin(&url) {
            log::debug!("[SW Fetch] passthrough (cross-origin) {}", request.url);
            return;
        }
        if request.method != RequestMethod::Get {
            log::debug!("[SW Fetch] passthrough ({}) {}", request.method.as_str(), request.url);
            return;
        }

        let scope = Arc::clone(&self.scope);
        let config = Arc::clone(&self.config);
        if request.is_navigation() {
            event.respond_with(serve_navigation(scope, config, request));
        } else {
            let lifetime = event.lifetime().clone();
            event.respond_with(serve_cache_first(scope, config, request, lifetime));
        }
    }

    // ── push / notifications ────────────────────────────────────

    /// Notification shown for a push carrying `text`
    pub fn push_notification(&self, text: Option<String>) -> NotificationOptions {
        let push = &self.config.push;
        NotificationOptions {
            body: text.unwrap_or_else(|| push.default_body.clone()),
            icon: Some(push.icon.clone()),
            badge: Some(push.badge.clone()),
            tag: None,
            vibrate: push.vibrate.clone(),
            data: serde_json::json!({
                "date_of_arrival": chrono::Utc::now().timestamp_millis(),
                "primary_key": 1,
            }),
            actions: vec![
                NotificationAction {
                    action: ACTION_EXPLORE.into(),
                    title: "Explore".into(),
                    icon: Some(push.icon.clone()),
                },
                NotificationAction {
                    action: ACTION_CLOSE.into(),
                    title: "Close".into(),
                    icon: None,
                },
            ],
        }
    }

    fn on_push(&self, event: &mut PushEvent) {
        let options = self.push_notification(event.text());
        let title = self.config.push.title.clone();
        let scope = Arc::clone(&self.scope);
        event.wait_until(async move {
            scope.notifications().show(&title, options).await?;
            Ok::<(), WorkerError>(())
        });
    }

    fn on_notification_click(&self, event: &mut NotificationClickEvent) {
        let id = event.notification().id;
        let explore = event.action() == Some(ACTION_EXPLORE);
        let scope = Arc::clone(&self.scope);
        event.wait_until(async move {
            if let Err(err) = scope.notifications().close(id).await {
                log::debug!("[SW Notification] close: {}", err);
            }
            if explore {
                let client = open_root(&scope).await?;
                log::info!("[SW Notification] opened {} in {}", client.url, client.id);
            }
            Ok::<(), WorkerError>(())
        });
    }

    // ── sync / message ──────────────────────────────────────────

    fn on_sync(&self, event: &mut SyncEvent) {
        match self.sync_tasks.get(&event.tag) {
            Some(task) => {
                let task = Arc::clone(task);
                let tag = event.tag.clone();
                event.wait_until(async move {
                    task.run().await?;
                    log::debug!("[SW Sync] '{}' done", tag);
                    Ok::<(), WorkerError>(())
                });
            }
            None => log::debug!("[SW Sync] ignoring unknown tag '{}'", event.tag),
        }
    }

    fn on_message(&self, event: &mut MessageEvent) {
        match event.control() {
            Some(ControlMessage::SkipWaiting) => self.scope.skip_waiting(),
            None => log::debug!("[SW Message] ignoring message {}", event.data()),
        }
    }
}

/// Navigations get the app shell: static cache, then network, then the
/// static cache once more.
async fn serve_navigation(
    scope: Arc<WorkerGlobalScope>,
    config: Arc<WorkerConfig>,
    request: Request,
) -> Result<Response, FetchError> {
    let static_cache = config.static_cache_name();
    let shell = scope.request(&config.app_shell)?;

    if let Some(response) = scope.caches().match_in(&static_cache, &shell) {
        return Ok(response);
    }

    match scope.network().fetch(&request).await {
        Ok(response) => Ok(response),
        Err(err) => {
            log::warn!("[SW Fetch] navigation to {} failed: {}", request.url, err);
            scope
                .caches()
                .match_in(&static_cache, &shell)
                .ok_or(FetchError::Network(err))
        }
    }
}

async fn serve_cache_first(
    scope: Arc<WorkerGlobalScope>,
    config: Arc<WorkerConfig>,
    request: Request,
    lifetime: ExtendLifetime,
) -> Result<Response, FetchError> {
    if let Some(cached) = scope.caches().match_request(&request, &CacheMatchOptions::default()) {
        log::debug!("[SW Fetch] cache hit {}", request.url);
        return Ok(cached);
    }

    let response = match scope.network().fetch(&request).await {
        Ok(response) => response,
        Err(err) if request.destination == RequestDestination::Image => {
            log::warn!("[SW Fetch] image {} unavailable ({}), serving placeholder", request.url, err);
            return Ok(offline_placeholder());
        }
        Err(err) => return Err(err.into()),
    };

    if response.status == 200 && response.response_type == ResponseType::Basic {
        match response.try_clone() {
            Ok(copy) => {
                let runtime = scope.caches().open(&config.runtime_cache_name());
                lifetime.wait_until(async move {
                    if let Err(err) = runtime.put(&request, copy) {
                        log::warn!("[SW Fetch] could not cache {}: {}", request.url, err);
                    }
                    Ok::<(), WorkerError>(())
                });
            }
            Err(err) => log::warn!("[SW Fetch] could not clone {}: {}", request.url, err),
        }
    }

    Ok(response)
}

/// Focus a window already showing the root, or open one
async fn open_root(scope: &WorkerGlobalScope) -> Result<ClientInfo, WorkerError> {
    let root = scope.resolve("/")?;
    let windows = scope
        .clients()
        .match_all(MatchAllOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        })
        .await;

    match windows.into_iter().find(|client| client.url == root.as_str()) {
        Some(existing) => Ok(scope.clients().focus(&existing.id).await?),
        None => Ok(scope.clients().open_window(root.as_str()).await?),
    }
}
