//! Shared fixtures for integration tests: a scriptable network and a
//! registration wired to it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::executor::block_on;
use spin::{Mutex, RwLock};
use url::Url;

use novacore_sw::fetch::ResponseType;
use novacore_sw::{
    FetchOutcome, Network, NetworkError, OfflineCacheScript, Request, Response, ServiceWorkerId,
    ServiceWorkerRegistration, WorkerConfig,
};

pub const ORIGIN: &str = "https://novacore.test";

/// Absolute URL for a root-relative path
pub fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
}

#[derive(Debug, Clone)]
struct Route {
    status: u16,
    content_type: String,
    body: Vec<u8>,
    response_type: Option<ResponseType>,
}

/// In-memory network. Unknown URLs answer 404; offline mode fails every
/// request.
#[derive(Debug)]
pub struct MockNetwork {
    routes: RwLock<BTreeMap<String, Route>>,
    online: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(BTreeMap::new()),
            online: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Network serving every asset of the default precache manifest
    pub fn storefront() -> Self {
        let network = Self::new();
        network.route("/", 200, "text/html", "<html>home</html>");
        network.route("/index.html", 200, "text/html", "<html>app shell</html>");
        network.route("/manifest.json", 200, "application/json", r#"{"name":"NovaCore"}"#);
        network.route("/favicon.ico", 200, "image/x-icon", vec![0u8, 0, 1, 0]);
        network.route("/logo192.png", 200, "image/png", vec![0x89, b'P', b'N', b'G', 1]);
        network.route("/logo512.png", 200, "image/png", vec![0x89, b'P', b'N', b'G', 2]);
        network
    }

    /// Serve `body` at a root-relative path or absolute URL
    pub fn route(&self, target: &str, status: u16, content_type: &str, body: impl Into<Vec<u8>>) {
        self.insert_route(target, status, content_type, body.into(), None);
    }

    /// Like [`MockNetwork::route`], but answer with a fixed response type
    /// instead of the one implied by the URL's origin
    pub fn route_typed(
        &self,
        target: &str,
        status: u16,
        content_type: &str,
        body: impl Into<Vec<u8>>,
        response_type: ResponseType,
    ) {
        self.insert_route(target, status, content_type, body.into(), Some(response_type));
    }

    fn insert_route(
        &self,
        target: &str,
        status: u16,
        content_type: &str,
        body: Vec<u8>,
        response_type: Option<ResponseType>,
    ) {
        let key = if target.starts_with('/') { url(target) } else { target.to_string() };
        self.routes.write().insert(
            key,
            Route {
                status,
                content_type: content_type.to_string(),
                body,
                response_type,
            },
        );
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of requests seen
    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// URLs requested, oldest first
    pub fn requested(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        self.calls.lock().push(request.url.clone());
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetworkError::Offline);
        }

        let mut response_type = if request.url.starts_with(ORIGIN) {
            ResponseType::Basic
        } else {
            ResponseType::Cors
        };
        let route = self.routes.read().get(&request.url).cloned();
        let response = match route {
            Some(route) => {
                response_type = route.response_type.unwrap_or(response_type);
                Response::new(route.status)
                    .with_header("Content-Type", route.content_type)
                    .with_body(route.body)
            }
            None => Response::new(404).with_body("not found"),
        };
        Ok(response.with_type(response_type).with_url(request.url.clone()))
    }
}

/// Registration for [`ORIGIN`] backed by `network`
pub fn registration(network: &Arc<MockNetwork>) -> ServiceWorkerRegistration {
    let network: Arc<dyn Network> = network.clone();
    ServiceWorkerRegistration::new(Url::parse(ORIGIN).unwrap(), network)
}

/// Install the stock worker and return its ID
pub fn install_default(reg: &mut ServiceWorkerRegistration) -> ServiceWorkerId {
    block_on(reg.install(&OfflineCacheScript::default())).unwrap()
}

/// Install the worker built from `config`
pub fn install_with(reg: &mut ServiceWorkerRegistration, config: WorkerConfig) -> ServiceWorkerId {
    block_on(reg.install(&OfflineCacheScript::new(config))).unwrap()
}

/// Route a request through the registration and expect a response
pub fn respond(reg: &ServiceWorkerRegistration, request: Request) -> Response {
    match block_on(reg.fetch(request)) {
        FetchOutcome::Responded(response) => response,
        other => panic!("expected a response, got {:?}", other),
    }
}
