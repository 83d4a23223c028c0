//! Client-side cache of remote resources, exposed through the same
//! lookup shape used for purely local files. A wish-list records what
//! we are searching for; once a source is known, a single background
//! worker fetches one resource at a time and lands it in the cache
//! directory with a temp-file-then-rename sequence.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::MAX_QUEUED_DOWNLOADS;
use crate::error::NetError;

/// Upper bound on the response head we are willing to buffer while
/// scanning for the blank line.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Issues a resource search on behalf of the cache when a lookup
/// misses. Implemented by the network layer; the cache holds it weakly
/// and validates the reference on every callback.
pub trait ResourceRequester: Send + Sync {
    fn need_resource(&self, resource: &str);
}

/// One pending fetch. Consumed exactly once by the worker; no retry
/// record survives a failure.
#[derive(Clone, Debug)]
pub struct Download {
    pub resource: String,
    pub url: String,
    pub addr: IpAddr,
    pub port: u16,
}

/// Result of a local resource lookup. `exists` with no size means
/// "known, not yet fetched" — callers poll again later, there is no
/// blocking wait for the fetch to land.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceStatus {
    pub exists: bool,
    pub size: Option<u64>,
    pub path: Option<PathBuf>,
}

impl ResourceStatus {
    fn not_found() -> Self {
        Self {
            exists: false,
            size: None,
            path: None,
        }
    }

    fn placeholder() -> Self {
        Self {
            exists: true,
            size: None,
            path: None,
        }
    }
}

#[derive(Default)]
struct CacheState {
    wishlist: HashSet<String>,
    queue: VecDeque<Download>,
    in_flight: Option<String>,
}

pub struct ClientCacheManager {
    cache_dir: PathBuf,
    state: Mutex<CacheState>,
    work: Notify,
    shutdown: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    requester: Mutex<Weak<dyn ResourceRequester>>,
}

impl ClientCacheManager {
    pub fn new(cache_dir: PathBuf) -> Result<Arc<Self>, NetError> {
        std::fs::create_dir_all(&cache_dir)?;
        let unattached: Weak<dyn ResourceRequester> = Weak::<NullRequester>::new();
        Ok(Arc::new(Self {
            cache_dir,
            state: Mutex::new(CacheState::default()),
            work: Notify::new(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
            requester: Mutex::new(unattached),
        }))
    }

    /// Spawn the background download worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            this.worker_loop().await;
        }));
    }

    pub fn attach_requester(&self, requester: Weak<dyn ResourceRequester>) {
        *self.requester.lock() = requester;
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Add `resource` to the wish-list. Idempotent.
    pub fn need_file(&self, resource: &str) {
        self.state.lock().wishlist.insert(resource.to_owned());
    }

    pub fn is_wished(&self, resource: &str) -> bool {
        self.state.lock().wishlist.contains(resource)
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Enqueue a fetch for a wish-listed resource. A no-op unless the
    /// resource is currently wish-listed; duplicate in-progress jobs
    /// for the same id are dropped. Returns whether a job was enqueued.
    pub fn start_download(&self, resource: &str, url: &str, addr: IpAddr, port: u16) -> bool {
        let mut state = self.state.lock();
        if !state.wishlist.remove(resource) {
            return false;
        }
        let duplicate = state.in_flight.as_deref() == Some(resource)
            || state.queue.iter().any(|d| d.resource == resource);
        if duplicate {
            return false;
        }
        if state.queue.len() >= MAX_QUEUED_DOWNLOADS {
            tracing::warn!(resource, "download queue full, refusing job");
            return false;
        }
        state.queue.push_back(Download {
            resource: resource.to_owned(),
            url: url.to_owned(),
            addr,
            port,
        });
        drop(state);
        self.work.notify_one();
        true
    }

    /// Does the cache currently hold this resource?
    pub fn has_local(&self, resource: &str) -> bool {
        match resolve_cache_path(&self.cache_dir, resource) {
            Ok(path) => path.is_file(),
            Err(_) => false,
        }
    }

    /// Look up a resource in the local cache. On a miss, re-issues a
    /// network search as a side effect and returns the "known, not yet
    /// fetched" placeholder.
    pub fn get_resource(&self, resource: &str) -> ResourceStatus {
        let Ok(path) = resolve_cache_path(&self.cache_dir, resource) else {
            return ResourceStatus::not_found();
        };
        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.is_file() {
                return ResourceStatus {
                    exists: true,
                    size: Some(meta.len()),
                    path: Some(path),
                };
            }
        }
        // no lock held here: the requester calls back into need_file
        let requester = self.requester.lock().upgrade();
        match requester {
            Some(requester) => {
                requester.need_resource(resource);
                ResourceStatus::placeholder()
            }
            None => ResourceStatus::not_found(),
        }
    }

    /// Same lookup for a caller that already knows the relative path a
    /// resource should land at.
    pub fn get_path_to_local_resource(&self, resource: &str, rel_path: &str) -> ResourceStatus {
        let Ok(path) = resolve_cache_path(&self.cache_dir, rel_path) else {
            return ResourceStatus::not_found();
        };
        if path.is_file() {
            let size = std::fs::metadata(&path).ok().map(|m| m.len());
            return ResourceStatus {
                exists: true,
                size,
                path: Some(path),
            };
        }
        let requester = self.requester.lock().upgrade();
        match requester {
            Some(requester) => {
                requester.need_resource(resource);
                ResourceStatus::placeholder()
            }
            None => ResourceStatus::not_found(),
        }
    }

    /// Stop the worker and delete the cache directory. The only point
    /// at which cached content is ever evicted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.work.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                tracing::error!("download worker panicked");
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.cache_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "failed to remove cache directory");
            }
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let job = self.state.lock().queue.pop_front();
            let Some(job) = job else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.work.notified() => continue,
                }
            };
            self.state.lock().in_flight = Some(job.resource.clone());
            match fetch_one(&self.cache_dir, &job).await {
                Ok(path) => {
                    tracing::info!(resource = %job.resource, path = %path.display(), "resource fetched");
                }
                Err(e) => {
                    // not retried: the resource stays unreached until
                    // something re-issues the search
                    tracing::warn!(resource = %job.resource, error = %e, "resource fetch failed");
                }
            }
            self.state.lock().in_flight = None;
        }
    }
}

/// Placeholder target for the requester slot before a network attaches.
struct NullRequester;

impl ResourceRequester for NullRequester {
    fn need_resource(&self, _resource: &str) {}
}

/// Map a resource id to its path inside the cache directory. Resource
/// ids are relative paths; absolute paths and parent traversal are
/// rejected before they touch the filesystem.
fn resolve_cache_path(cache_dir: &Path, resource: &str) -> Result<PathBuf, NetError> {
    if resource.is_empty() {
        return Err(NetError::InvalidArgument("empty resource id".into()));
    }
    let rel = Path::new(resource);
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(NetError::InvalidArgument(format!(
                    "resource id must be a plain relative path: {resource}"
                )))
            }
        }
    }
    Ok(cache_dir.join(rel))
}

/// One unconditional HTTP/1.0 GET. No keep-alive, no redirects; the
/// body starts immediately after the first blank line and runs to EOF.
async fn fetch_one(cache_dir: &Path, job: &Download) -> Result<PathBuf, NetError> {
    let target = resolve_cache_path(cache_dir, &job.resource)?;

    let mut stream = TcpStream::connect((job.addr, job.port))
        .await
        .map_err(|e| NetError::DownloadFailed(format!("connect {}:{}: {e}", job.addr, job.port)))?;

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}:{}\r\nConnection: close\r\n\r\n",
        job.url, job.addr, job.port
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| NetError::DownloadFailed(format!("send request: {e}")))?;

    // buffer until the header/body separator, then spill the remainder
    let mut head = Vec::new();
    let mut chunk = [0u8; 4096];
    let body_start = loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| NetError::DownloadFailed(format!("read response: {e}")))?;
        if n == 0 {
            return Err(NetError::DownloadFailed("connection closed in header".into()));
        }
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_body_start(&head) {
            break pos;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(NetError::DownloadFailed("response head too large".into()));
        }
    };

    let status = parse_status(&head)?;
    if status != 200 {
        return Err(NetError::HttpStatus(status));
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = target.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&head[body_start..]).await?;
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| NetError::DownloadFailed(format!("read body: {e}")))?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n]).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp, &target).await?;
    Ok(target)
}

/// Index of the first body byte, if the blank line separating header
/// from body is present. Tolerates bare-LF servers.
fn find_body_start(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

fn parse_status(head: &[u8]) -> Result<u16, NetError> {
    let line_end = head
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(head.len());
    let line = String::from_utf8_lossy(&head[..line_end]);
    line.split_ascii_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| NetError::DownloadFailed(format!("malformed status line: {line}")))
}
