//! On-disk HTTP response cache for the reverse proxy.
//!
//! Successful GET responses are kept per request URL with an expiry. The
//! whole map is rewritten to a JSON file in the background after every
//! request that reached the upstream.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::capture::{CapturedResponse, ResponseCapture};
use crate::error::TunnelError;
use crate::proxy::{full, is_hop_header, BoxError, ProxyBody};

/// Response header telling the client whether the cache answered.
pub const CACHE_HEADER: &str = "x-sshrelay-cache";
pub const CACHE_HIT: &str = "hit";
pub const CACHE_MISS: &str = "miss";

/// Owner read/write, readable by everyone else.
#[cfg(unix)]
const CACHE_FILE_MODE: u32 = 0o644;

/// Cache for a workday.
pub const DEFAULT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// One stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub body: String,
    #[serde(rename = "response_code")]
    pub status_code: u16,
    pub expires_at: DateTime<Utc>,
    pub headers: BTreeMap<String, Vec<String>>,
}

impl CacheEntry {
    /// Build an entry from a captured response. Bodies that are not valid
    /// UTF-8 cannot be stored in the cache file and yield `None`.
    pub fn from_captured(captured: &CapturedResponse, expires_at: DateTime<Utc>) -> Option<Self> {
        let body = String::from_utf8(captured.body.to_vec()).ok()?;

        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &captured.headers {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        Some(Self {
            body,
            status_code: captured.status.as_u16(),
            expires_at,
            headers,
        })
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Replay the entry as a response, flagged as a cache hit.
    pub fn to_response(&self) -> Response<ProxyBody> {
        let mut response = Response::new(full(self.body.clone()));
        *response.status_mut() = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);

        let headers = response.headers_mut();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            // The body length is recomputed from what we replay.
            if name == CONTENT_LENGTH || is_hop_header(&name) {
                continue;
            }
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }
        headers.insert(CACHE_HEADER, HeaderValue::from_static(CACHE_HIT));
        response
    }
}

/// Only these statuses are worth replaying.
pub fn is_cacheable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED
    )
}

pub struct ResponseCache {
    path: PathBuf,
    ttl: Duration,
    serve_stale: bool,
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Serializes writers of the cache file.
    flush_lock: tokio::sync::Mutex<()>,
}

impl ResponseCache {
    /// Load the cache stored at `path`. A missing file starts an empty cache;
    /// a file that does not parse is an error rather than silently discarded.
    pub fn load(
        path: impl Into<PathBuf>,
        ttl: Duration,
        serve_stale: bool,
    ) -> Result<Self, TunnelError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|source| TunnelError::CacheParse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No cache file at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(source) => return Err(TunnelError::CacheIo { path, source }),
        };

        Ok(Self {
            path,
            ttl,
            serve_stale,
            entries: Mutex::new(entries),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The stored entry for `key`, fresh or not.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries().get(key).cloned()
    }

    /// Store `entry` under `key`, replacing whatever was there.
    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) {
        self.entries().insert(key.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// The entry to serve for `key`, if any.
    ///
    /// Expired entries are not served unless serving stale reads was asked
    /// for, but they stay in the map until a fresh response replaces them.
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries();
        let Some(entry) = entries.get(key) else {
            debug!("Cache miss for {}", key);
            return None;
        };

        if self.serve_stale {
            debug!("Serving stale cache read for {}", key);
            return Some(entry.clone());
        }

        if entry.is_fresh(Utc::now()) {
            debug!("Serving fresh cache read for {}", key);
            return Some(entry.clone());
        }

        debug!("Cached {} expired, forcing refresh", key);
        None
    }

    fn expiry(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Answer `req` from the cache, or pass it to `next` and remember what
    /// came back.
    pub async fn handle<ReqB, B, F, Fut>(
        self: &Arc<Self>,
        req: Request<ReqB>,
        next: F,
    ) -> Response<ProxyBody>
    where
        F: FnOnce(Request<ReqB>) -> Fut,
        Fut: Future<Output = Response<B>>,
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let is_get = req.method() == Method::GET;
        let key = req.uri().to_string();

        if is_get {
            if let Some(entry) = self.lookup(&key) {
                return entry.to_response();
            }
        }

        let response = next(req).await;

        let cache = Arc::clone(self);
        let mut response = ResponseCapture::wrap(response, move |captured| {
            cache.record(key, is_get, captured);
        });
        if is_get {
            response
                .headers_mut()
                .insert(CACHE_HEADER, HeaderValue::from_static(CACHE_MISS));
        }
        response.map(|body| body.map_err(Into::into).boxed_unsync())
    }

    /// Called once the upstream response body is done with.
    fn record(self: &Arc<Self>, key: String, is_get: bool, captured: CapturedResponse) {
        if is_get && captured.complete && is_cacheable(captured.status) {
            match CacheEntry::from_captured(&captured, self.expiry()) {
                Some(entry) => {
                    debug!("Caching {} response for {}", captured.status, key);
                    self.put(key, entry);
                }
                None => debug!("Not caching {}: body is not UTF-8", key),
            }
        }
        self.schedule_flush();
    }

    /// Flush in a detached task. Failures are only logged.
    pub fn schedule_flush(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = cache.flush().await {
                        warn!("Could not dump cache to disk: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to flush the cache on"),
        }
    }

    /// Write the whole cache to its file.
    ///
    /// The map is serialized under the lock; the file is written outside of
    /// it, to a temporary sibling that is then renamed over the cache file.
    pub async fn flush(&self) -> Result<(), TunnelError> {
        let _writer = self.flush_lock.lock().await;
        debug!("Flushing cache to {}", self.path.display());

        let snapshot = {
            let entries = self.entries();
            let encoded = serde_json::to_vec(&*entries);
            encoded
        }
        .map_err(|e| TunnelError::CacheIo {
            path: self.path.clone(),
            source: e.into(),
        })?;

        let tmp_path = self.path.with_extension("tmp");
        let io_error = |source| TunnelError::CacheIo {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp_path, &snapshot).await.map_err(io_error)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(CACHE_FILE_MODE))
                .await
                .map_err(io_error)?;
        }
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(io_error)?;
        Ok(())
    }
}
