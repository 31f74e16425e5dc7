//! Cache API Implementation
//!
//! Named caches of request/response snapshots, grouped in a per-origin
//! [`CacheStorage`] with a shared byte quota.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use spin::RwLock;
use url::Url;

use crate::fetch::{Network, NetworkError, Request, RequestMethod, Response, ResponseType};

/// Default quota across all caches of a storage (50 MB)
pub const DEFAULT_QUOTA: usize = 50 * 1024 * 1024;

/// Cache error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache quota exceeded ({used} + {requested} > {quota} bytes)")]
    QuotaExceeded {
        used: usize,
        requested: usize,
        quota: usize,
    },

    #[error("only GET requests can be cached, got {0}")]
    UnsupportedMethod(&'static str),

    #[error("response body already used")]
    BodyUsed,

    #[error("network error responses cannot be cached")]
    InvalidResponse,

    #[error("fetching {url} failed: {source}")]
    Fetch { url: String, source: NetworkError },

    #[error("fetching {url} returned status {status}")]
    BadStatus { url: String, status: u16 },
}

/// Cache match options
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMatchOptions {
    /// Ignore search (query string)
    pub ignore_search: bool,
    /// Ignore method
    pub ignore_method: bool,
}

/// Immutable snapshot of a response body and metadata
#[derive(Debug, Clone)]
struct StoredResponse {
    response_type: ResponseType,
    url: String,
    status: u16,
    status_text: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl StoredResponse {
    fn capture(mut response: Response) -> Result<Self, CacheError> {
        if response.response_type == ResponseType::Error {
            return Err(CacheError::InvalidResponse);
        }
        let body = response.bytes().map_err(|_| CacheError::BodyUsed)?;
        Ok(Self {
            response_type: response.response_type,
            url: core::mem::take(&mut response.url),
            status: response.status,
            status_text: core::mem::take(&mut response.status_text),
            headers: core::mem::take(&mut response.headers),
            body,
        })
    }

    fn to_response(&self) -> Response {
        let mut response = Response::new(self.status)
            .with_type(self.response_type)
            .with_url(self.url.clone())
            .with_body(self.body.clone());
        response.status_text = self.status_text.clone();
        response.headers = self.headers.clone();
        response
    }

    fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A cached request-response pair
#[derive(Debug, Clone)]
struct CacheEntry {
    /// The request
    request: Request,
    /// The response snapshot
    response: StoredResponse,
    /// Timestamp when cached (ms since epoch)
    cached_at: i64,
    /// Size in bytes
    size: usize,
}

impl CacheEntry {
    fn new(request: Request, response: StoredResponse) -> Self {
        let size = response.size() + request.url.len();
        Self {
            request,
            response,
            cached_at: chrono::Utc::now().timestamp_millis(),
            size,
        }
    }
}

/// Byte accounting shared by every cache of one storage
#[derive(Debug)]
struct Quota {
    limit: AtomicUsize,
    used: AtomicUsize,
}

impl Quota {
    /// Swap `release` bytes for `reserve` bytes, failing if over the limit
    fn exchange(&self, release: usize, reserve: usize) -> Result<(), CacheError> {
        let limit = self.limit.load(Ordering::SeqCst);
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.saturating_sub(release) + reserve;
                (next <= limit).then_some(next)
            })
            .map(|_| ())
            .map_err(|used| CacheError::QuotaExceeded {
                used: used.saturating_sub(release),
                requested: reserve,
                quota: limit,
            })
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    /// Cached entries (`METHOD url` -> entry)
    entries: BTreeMap<String, CacheEntry>,
    /// Total size in bytes
    total_size: usize,
}

/// A named cache
#[derive(Debug)]
pub struct Cache {
    name: String,
    inner: RwLock<CacheInner>,
    quota: Arc<Quota>,
    /// Set once the cache is deleted from its storage
    detached: AtomicBool,
}

impl Cache {
    fn new(name: &str, quota: Arc<Quota>) -> Self {
        Self {
            name: name.to_string(),
            inner: RwLock::new(CacheInner::default()),
            quota,
            detached: AtomicBool::new(false),
        }
    }

    /// Get cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request
    pub fn match_request(&self, request: &Request, options: &CacheMatchOptions) -> Option<Response> {
        let inner = self.inner.read();
        if !options.ignore_search && !options.ignore_method {
            return inner
                .entries
                .get(&make_key(request))
                .map(|e| e.response.to_response());
        }
        inner
            .entries
            .values()
            .find(|e| request_matches(&e.request, request, options))
            .map(|e| e.response.to_response())
    }

    /// Store a request/response pair, replacing any previous entry
    pub fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        ensure_cacheable(request)?;
        let stored = StoredResponse::capture(response)?;
        self.insert_batch(vec![(request.clone(), stored)])
    }

    /// Fetch every request and store all responses, or none.
    ///
    /// Any network failure or non-OK status aborts the whole operation
    /// before anything is written.
    pub async fn add_all(&self, network: &dyn Network, requests: Vec<Request>) -> Result<(), CacheError> {
        for request in &requests {
            ensure_cacheable(request)?;
        }

        let fetches = requests.into_iter().map(|request| async move {
            let response = network.fetch(&request).await.map_err(|source| CacheError::Fetch {
                url: request.url.clone(),
                source,
            })?;
            if !response.ok() {
                return Err(CacheError::BadStatus {
                    url: request.url.clone(),
                    status: response.status,
                });
            }
            let stored = StoredResponse::capture(response)?;
            Ok::<_, CacheError>((request, stored))
        });

        let batch = try_join_all(fetches).await?;
        log::debug!("[SW Cache] {}: storing {} fetched entries", self.name, batch.len());
        self.insert_batch(batch)
    }

    fn insert_batch(&self, batch: Vec<(Request, StoredResponse)>) -> Result<(), CacheError> {
        let mut inner = self.inner.write();

        let keyed: Vec<(String, CacheEntry)> = batch
            .into_iter()
            .map(|(request, stored)| (make_key(&request), CacheEntry::new(request, stored)))
            .collect();

        // Later duplicates in the batch overwrite earlier ones
        let mut incoming: BTreeMap<String, CacheEntry> = BTreeMap::new();
        for (key, entry) in keyed {
            incoming.insert(key, entry);
        }

        let reserve: usize = incoming.values().map(|e| e.size).sum();
        let release: usize = incoming
            .keys()
            .filter_map(|key| inner.entries.get(key))
            .map(|e| e.size)
            .sum();

        if !self.detached.load(Ordering::SeqCst) {
            self.quota.exchange(release, reserve)?;
        }

        inner.total_size = inner.total_size.saturating_sub(release) + reserve;
        inner.entries.extend(incoming);
        Ok(())
    }

    /// Delete a cached request
    pub fn delete(&self, request: &Request, options: &CacheMatchOptions) -> bool {
        let mut inner = self.inner.write();
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| request_matches(&e.request, request, options))
            .map(|(k, _)| k.clone())
            .collect();

        let mut freed = 0;
        for key in &keys {
            if let Some(entry) = inner.entries.remove(key) {
                freed += entry.size;
            }
        }
        inner.total_size = inner.total_size.saturating_sub(freed);
        if !self.detached.load(Ordering::SeqCst) {
            self.quota.release(freed);
        }
        !keys.is_empty()
    }

    /// Get all cached requests
    pub fn keys(&self) -> Vec<Request> {
        self.inner
            .read()
            .entries
            .values()
            .map(|e| e.request.clone())
            .collect()
    }

    /// Timestamp (ms since epoch) at which a request was stored
    pub fn cached_at(&self, request: &Request) -> Option<i64> {
        self.inner
            .read()
            .entries
            .get(&make_key(request))
            .map(|e| e.cached_at)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get total size
    pub fn size(&self) -> usize {
        self.inner.read().total_size
    }

    /// Stop counting against the storage quota
    fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            self.quota.release(self.size());
        }
    }
}

fn ensure_cacheable(request: &Request) -> Result<(), CacheError> {
    if request.method != RequestMethod::Get {
        return Err(CacheError::UnsupportedMethod(request.method.as_str()));
    }
    Ok(())
}

/// Make a cache key from a request
fn make_key(request: &Request) -> String {
    format!("{} {}", request.method.as_str(), normalize_url(&request.url, false))
}

/// URL as the cache compares it: never the fragment, and without the
/// query when `ignore_search` is set. Unparseable URLs compare verbatim.
fn normalize_url(raw: &str, ignore_search: bool) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            if ignore_search {
                url.set_query(None);
            }
            url.into()
        }
        Err(_) => raw.to_string(),
    }
}

fn request_matches(stored: &Request, query: &Request, options: &CacheMatchOptions) -> bool {
    if !options.ignore_method && stored.method != query.method {
        return false;
    }
    normalize_url(&stored.url, options.ignore_search) == normalize_url(&query.url, options.ignore_search)
}

/// Cache storage (manages multiple caches for one origin)
pub struct CacheStorage {
    /// Origin
    origin: String,
    /// Caches in creation order
    caches: RwLock<Vec<Arc<Cache>>>,
    quota: Arc<Quota>,
}

impl CacheStorage {
    /// Create new cache storage with the default quota
    pub fn new(origin: impl Into<String>) -> Self {
        Self::with_quota(origin, DEFAULT_QUOTA)
    }

    pub fn with_quota(origin: impl Into<String>, quota: usize) -> Self {
        Self {
            origin: origin.into(),
            caches: RwLock::new(Vec::new()),
            quota: Arc::new(Quota {
                limit: AtomicUsize::new(quota),
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// Open or create a cache
    pub fn open(&self, name: &str) -> Arc<Cache> {
        if let Some(cache) = self.get(name) {
            return cache;
        }
        let mut caches = self.caches.write();
        // Another opener may have won the race between the two locks
        if let Some(cache) = caches.iter().find(|c| c.name == name) {
            return Arc::clone(cache);
        }
        log::debug!("[SW Cache] creating cache {}", name);
        let cache = Arc::new(Cache::new(name, Arc::clone(&self.quota)));
        caches.push(Arc::clone(&cache));
        cache
    }

    /// Existing cache by name, without creating it
    pub fn get(&self, name: &str) -> Option<Arc<Cache>> {
        self.caches.read().iter().find(|c| c.name == name).cloned()
    }

    /// Check if a cache exists
    pub fn has(&self, name: &str) -> bool {
        self.caches.read().iter().any(|c| c.name == name)
    }

    /// Delete a cache. Handles already opened keep working but no longer
    /// count against the quota.
    pub fn delete(&self, name: &str) -> bool {
        let removed = {
            let mut caches = self.caches.write();
            caches
                .iter()
                .position(|c| c.name == name)
                .map(|pos| caches.remove(pos))
        };
        match removed {
            Some(cache) => {
                cache.detach();
                log::debug!("[SW Cache] deleted cache {}", name);
                true
            }
            None => false,
        }
    }

    /// Get all cache names in creation order
    pub fn keys(&self) -> Vec<String> {
        self.caches.read().iter().map(|c| c.name.clone()).collect()
    }

    /// Match across all caches, oldest cache first
    pub fn match_request(&self, request: &Request, options: &CacheMatchOptions) -> Option<Response> {
        let caches: Vec<Arc<Cache>> = self.caches.read().clone();
        caches
            .iter()
            .find_map(|cache| cache.match_request(request, options))
    }

    /// Match in one named cache without creating it
    pub fn match_in(&self, name: &str, request: &Request) -> Option<Response> {
        self.get(name)?
            .match_request(request, &CacheMatchOptions::default())
    }

    /// Get quota
    pub fn quota(&self) -> usize {
        self.quota.limit.load(Ordering::SeqCst)
    }

    /// Change the byte quota. Entries already stored are kept even if
    /// usage now exceeds it; later writes must fit.
    pub fn set_quota(&self, quota: usize) {
        self.quota.limit.store(quota, Ordering::SeqCst);
    }

    /// Get usage
    pub fn usage(&self) -> usize {
        self.quota.used.load(Ordering::SeqCst)
    }

    /// Get origin
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl core::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheStorage")
            .field("origin", &self.origin)
            .field("caches", &self.keys())
            .field("usage", &self.usage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::executor::block_on;

    fn ok(body: &str) -> Response {
        Response::new(200)
            .with_type(ResponseType::Basic)
            .with_body(body.as_bytes().to_vec())
    }

    struct FakeNetwork;

    #[async_trait]
    impl Network for FakeNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
            if request.url.ends_with("/missing.png") {
                return Ok(Response::new(404));
            }
            if request.url.ends_with("/offline.js") {
                return Err(NetworkError::Offline);
            }
            Ok(ok(&request.url))
        }
    }

    #[test]
    fn test_put_and_match() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("static");
        let req = Request::new("https://a.test/style.css");
        cache.put(&req, ok("body{}")).unwrap();

        let mut hit = cache.match_request(&req, &CacheMatchOptions::default()).unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.bytes().unwrap(), b"body{}");
        assert!(cache.cached_at(&req).is_some());
    }

    #[test]
    fn test_put_overwrites_wholesale() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("runtime");
        let req = Request::new("https://a.test/app.js");
        cache.put(&req, ok("v1").with_header("X-Version", "1")).unwrap();
        cache.put(&req, ok("version-two")).unwrap();

        let mut hit = cache.match_request(&req, &CacheMatchOptions::default()).unwrap();
        assert_eq!(hit.header("x-version"), None);
        assert_eq!(hit.text().unwrap(), "version-two");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_rejects_non_get() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("runtime");
        let req = Request::new("https://a.test/api").with_method(RequestMethod::Post);
        assert_eq!(cache.put(&req, ok("x")), Err(CacheError::UnsupportedMethod("POST")));
    }

    #[test]
    fn test_put_rejects_used_body() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("runtime");
        let mut response = ok("x");
        response.bytes().unwrap();
        assert_eq!(
            cache.put(&Request::new("https://a.test/x"), response),
            Err(CacheError::BodyUsed)
        );
    }

    #[test]
    fn test_match_ignore_search() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("runtime");
        cache.put(&Request::new("https://a.test/img.png?v=2"), ok("png")).unwrap();

        let query = Request::new("https://a.test/img.png");
        assert!(cache.match_request(&query, &CacheMatchOptions::default()).is_none());
        let opts = CacheMatchOptions {
            ignore_search: true,
            ..Default::default()
        };
        assert!(cache.match_request(&query, &opts).is_some());
    }

    #[test]
    fn test_fragment_is_not_part_of_the_key() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("static");
        cache.put(&Request::new("https://a.test/logo.png"), ok("png")).unwrap();

        let with_fragment = Request::new("https://a.test/logo.png#large");
        assert!(cache.match_request(&with_fragment, &CacheMatchOptions::default()).is_some());
        assert!(cache.cached_at(&with_fragment).is_some());

        cache.put(&with_fragment, ok("png2")).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ignore_search_with_fragment_before_query() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("runtime");
        cache.put(&Request::new("https://a.test/a"), ok("a")).unwrap();

        let opts = CacheMatchOptions {
            ignore_search: true,
            ..Default::default()
        };
        // Everything after '#' is fragment, including the '?'
        assert!(cache.match_request(&Request::new("https://a.test/a#f?x"), &opts).is_some());
        assert!(cache.match_request(&Request::new("https://a.test/a?x#f"), &opts).is_some());
    }

    #[test]
    fn test_set_quota_applies_to_later_writes() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("runtime");
        cache.put(&Request::new("https://a.test/small"), ok("x")).unwrap();

        storage.set_quota(64);
        assert_eq!(storage.quota(), 64);
        let big = "x".repeat(128);
        assert!(matches!(
            cache.put(&Request::new("https://a.test/big"), ok(&big)),
            Err(CacheError::QuotaExceeded { quota: 64, .. })
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_rejects_error_response() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("runtime");
        assert_eq!(
            cache.put(&Request::new("https://a.test/x"), Response::error()),
            Err(CacheError::InvalidResponse)
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_delete_entry_releases_usage() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("runtime");
        let req = Request::new("https://a.test/a.js");
        cache.put(&req, ok("aaaa")).unwrap();
        assert!(storage.usage() > 0);

        assert!(cache.delete(&req, &CacheMatchOptions::default()));
        assert!(!cache.delete(&req, &CacheMatchOptions::default()));
        assert_eq!(storage.usage(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_quota_exceeded() {
        let storage = CacheStorage::with_quota("https://a.test", 64);
        let cache = storage.open("runtime");
        let big = "x".repeat(128);
        let err = cache.put(&Request::new("https://a.test/big"), ok(&big)).unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { quota: 64, .. }));
        assert!(cache.is_empty());
        assert_eq!(storage.usage(), 0);
    }

    #[test]
    fn test_storage_open_is_idempotent() {
        let storage = CacheStorage::new("https://a.test");
        let a = storage.open("static-v1");
        let b = storage.open("static-v1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(storage.keys(), vec!["static-v1".to_string()]);
    }

    #[test]
    fn test_storage_delete_and_orphan_handle() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("old");
        cache.put(&Request::new("https://a.test/x"), ok("x")).unwrap();
        let used = storage.usage();
        assert!(used > 0);

        assert!(storage.delete("old"));
        assert!(!storage.has("old"));
        assert!(!storage.delete("old"));
        assert_eq!(storage.usage(), 0);

        // The orphaned handle still works
        cache.put(&Request::new("https://a.test/y"), ok("y")).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(storage.usage(), 0);
    }

    #[test]
    fn test_storage_match_oldest_cache_first() {
        let storage = CacheStorage::new("https://a.test");
        let req = Request::new("https://a.test/logo.png");
        storage.open("b-first").put(&req, ok("first")).unwrap();
        storage.open("a-second").put(&req, ok("second")).unwrap();

        let mut hit = storage.match_request(&req, &CacheMatchOptions::default()).unwrap();
        assert_eq!(hit.text().unwrap(), "first");
        assert!(storage.match_in("a-second", &req).is_some());
        assert!(storage.match_in("missing", &req).is_none());
        assert!(!storage.has("missing"));
    }

    #[test]
    fn test_add_all_stores_everything() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("static");
        let requests = vec![
            Request::new("https://a.test/"),
            Request::new("https://a.test/index.html"),
        ];
        block_on(cache.add_all(&FakeNetwork, requests)).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_add_all_is_all_or_nothing() {
        let storage = CacheStorage::new("https://a.test");
        let cache = storage.open("static");
        let requests = vec![
            Request::new("https://a.test/index.html"),
            Request::new("https://a.test/missing.png"),
        ];
        let err = block_on(cache.add_all(&FakeNetwork, requests)).unwrap_err();
        assert!(matches!(err, CacheError::BadStatus { status: 404, .. }));
        assert!(cache.is_empty());

        let requests = vec![
            Request::new("https://a.test/index.html"),
            Request::new("https://a.test/offline.js"),
        ];
        let err = block_on(cache.add_all(&FakeNetwork, requests)).unwrap_err();
        assert!(matches!(err, CacheError::Fetch { source: NetworkError::Offline, .. }));
        assert!(cache.is_empty());
    }
}
