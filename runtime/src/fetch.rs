//! Fetch Event Handling
//!
//! Request/response model, the host network contract, and the fetch event
//! a worker answers with `respond_with`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use url::Url;

use crate::events::{EventType, ExtendLifetime, ExtendableEvent};

/// Fetch event ID counter
static NEXT_FETCH_ID: AtomicU64 = AtomicU64::new(1);

/// Fetch event ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchEventId(u64);

impl FetchEventId {
    /// Create a new ID
    pub fn new() -> Self {
        Self(NEXT_FETCH_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for FetchEventId {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl RequestMethod {
    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

/// Request destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestDestination {
    /// Unknown (fetch/XHR)
    #[default]
    Empty,
    Audio,
    Document,
    Font,
    Image,
    Manifest,
    Script,
    Style,
    Video,
    Worker,
}

/// Request mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Same-origin only
    SameOrigin,
    /// No CORS
    NoCors,
    /// CORS
    #[default]
    Cors,
    /// Top-level or frame navigation
    Navigate,
}

/// Fetch request
#[derive(Debug, Clone)]
pub struct Request {
    /// Absolute request URL
    pub url: String,
    /// HTTP method
    pub method: RequestMethod,
    /// Request headers, keyed by lowercase name
    pub headers: BTreeMap<String, String>,
    /// Request body (if any)
    pub body: Option<Vec<u8>>,
    /// Request destination
    pub destination: RequestDestination,
    /// Request mode
    pub mode: RequestMode,
    /// Client ID
    pub client_id: Option<String>,
}

impl Request {
    /// Create a new `GET` request
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: RequestMethod::Get,
            headers: BTreeMap::new(),
            body: None,
            destination: RequestDestination::Empty,
            mode: RequestMode::Cors,
            client_id: None,
        }
    }

    /// Create a navigation request for a document
    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            destination: RequestDestination::Document,
            mode: RequestMode::Navigate,
            ..Self::new(url)
        }
    }

    pub fn with_method(mut self, method: RequestMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether this is a navigation request
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Parse the request URL
    pub fn parsed_url(&self) -> Result<Url, FetchError> {
        Url::parse(&self.url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", self.url, e)))
    }
}

/// Response type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response
    Basic,
    /// Valid cross-origin response
    Cors,
    /// Synthesized by a worker
    #[default]
    Default,
    /// Network error
    Error,
    /// Cross-origin no-cors response
    Opaque,
    /// Opaque redirect
    OpaqueRedirect,
}

/// Fetch response
///
/// The body is a single-read stream: once consumed with [`Response::bytes`]
/// the response can no longer be cloned or stored, so anything that needs
/// the body twice must call [`Response::try_clone`] first.
#[derive(Debug)]
pub struct Response {
    /// Response type
    pub response_type: ResponseType,
    /// Final URL
    pub url: String,
    /// Redirected
    pub redirected: bool,
    /// Status code
    pub status: u16,
    /// Status text
    pub status_text: String,
    /// Response headers, keyed by lowercase name
    pub headers: BTreeMap<String, String>,
    body: Option<Vec<u8>>,
    body_used: bool,
}

impl Response {
    /// Create a new response
    pub fn new(status: u16) -> Self {
        Self {
            response_type: ResponseType::Default,
            url: String::new(),
            redirected: false,
            status,
            status_text: status_text_for(status).to_string(),
            headers: BTreeMap::new(),
            body: None,
            body_used: false,
        }
    }

    /// Create error response
    pub fn error() -> Self {
        Self {
            response_type: ResponseType::Error,
            status: 0,
            status_text: String::new(),
            ..Self::new(0)
        }
    }

    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self.body_used = false;
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Content type header, if set
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Check if response is OK
    pub fn ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Whether the body was already read
    pub fn body_used(&self) -> bool {
        self.body_used
    }

    /// Body length without consuming it
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }

    /// Clone the response, including an unread body
    pub fn try_clone(&self) -> Result<Response, FetchError> {
        if self.body_used {
            return Err(FetchError::BodyUsed);
        }
        Ok(Response {
            response_type: self.response_type,
            url: self.url.clone(),
            redirected: self.redirected,
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            body_used: false,
        })
    }

    /// Consume the body
    pub fn bytes(&mut self) -> Result<Vec<u8>, FetchError> {
        if self.body_used {
            return Err(FetchError::BodyUsed);
        }
        self.body_used = true;
        Ok(self.body.take().unwrap_or_default())
    }

    /// Consume the body as UTF-8 text
    pub fn text(&mut self) -> Result<String, FetchError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|_| FetchError::InvalidBody)
    }
}

/// Get status text for status code
pub(crate) fn status_text_for(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Network-level failure reported by the host
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network unreachable")]
    Offline,

    #[error("request to {url} failed: {reason}")]
    Failed { url: String, reason: String },
}

/// Failure of a fetch as seen by the page
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("response body already used")]
    BodyUsed,

    #[error("response body is not valid UTF-8")]
    InvalidBody,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Network access provided by the host runtime.
///
/// The worker never retries or times out on its own; whatever the host
/// implementation does is the only policy.
#[async_trait]
pub trait Network: Send + Sync {
    /// Fetch a request from the network
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Result of settling a fetch event
#[derive(Debug)]
pub enum FetchOutcome {
    /// The worker answered the request
    Responded(Response),
    /// The worker answered with a failure
    Failed(FetchError),
    /// The worker did not call `respond_with`; default handling applies
    Passthrough,
}

impl FetchOutcome {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough)
    }

    /// The response, if the worker produced one
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Responded(response) => Some(response),
            _ => None,
        }
    }
}

type PendingResponse = BoxFuture<'static, Result<Response, FetchError>>;

/// Fetch event
pub struct FetchEvent {
    /// Event ID
    id: FetchEventId,
    /// Request
    request: Request,
    /// Client ID
    client_id: Option<String>,
    /// Response promise (if respondWith was called)
    response: Option<PendingResponse>,
    /// Extended lifetime
    lifetime: ExtendLifetime,
}

impl FetchEvent {
    /// Create a new fetch event
    pub fn new(request: Request) -> Self {
        let client_id = request.client_id.clone();
        Self {
            id: FetchEventId::new(),
            request,
            client_id,
            response: None,
            lifetime: ExtendLifetime::new(),
        }
    }

    /// Get the event ID
    pub fn id(&self) -> FetchEventId {
        self.id
    }

    /// Get the request
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Get client ID
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Check if respondWith was called
    pub fn responded(&self) -> bool {
        self.response.is_some()
    }

    /// Respond with a future response. Only the first call counts.
    pub fn respond_with<F>(&mut self, response: F)
    where
        F: Future<Output = Result<Response, FetchError>> + Send + 'static,
    {
        if self.response.is_none() {
            self.response = Some(Box::pin(response));
        } else {
            log::warn!("[SW Fetch] respond_with called twice for {}", self.request.url);
        }
    }

    /// Await the response, then every task that extended the event.
    ///
    /// Lifetime extensions registered while the response was produced
    /// (e.g. cache writes) are awaited too.
    pub async fn settle(self) -> FetchOutcome {
        let outcome = match self.response {
            Some(pending) => match pending.await {
                Ok(response) => FetchOutcome::Responded(response),
                Err(err) => FetchOutcome::Failed(err),
            },
            None => FetchOutcome::Passthrough,
        };

        if let Err(err) = self.lifetime.settle().await {
            log::warn!(
                "[SW Fetch] lifetime task for {} failed: {}",
                self.request.url,
                err
            );
        }

        outcome
    }
}

impl core::fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FetchEvent")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("responded", &self.responded())
            .finish()
    }
}

impl ExtendableEvent for FetchEvent {
    fn event_type(&self) -> EventType {
        EventType::Fetch
    }

    fn lifetime(&self) -> &ExtendLifetime {
        &self.lifetime
    }
}
