//! Content-addressed artifact cache.
//!
//! Objects live at `<dir>/objects/<sha[..2]>/<sha>`; downloads stream into
//! `<dir>/tmp` while hashing and are renamed into place only after the
//! checksum and size check out. The index only learns about an object after
//! that rename, so no resolver can observe a partial file.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use caia_core::{retry_async, RetryConfig};

use crate::error::{EngineError, Result};
use crate::metrics;

mod index;
mod source;

pub use index::CacheIndex;
pub use source::{ArtifactLocation, ArtifactSource, ByteStream, DefaultSource};

const INDEX_FILE: &str = "index.json";
const RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout: Duration,
    pub retry: RetryConfig,
    pub s3_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveRequest {
    pub artifact_uri: String,
    #[serde(default, alias = "sha256")]
    pub expected_sha256: Option<String>,
    #[serde(default, alias = "size_bytes")]
    pub expected_size: Option<u64>,
    /// Bounds the caller's wait; when this caller starts the fetch it also
    /// bounds the fetch itself.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ResolveRequest {
    pub fn new(artifact_uri: impl Into<String>) -> Self {
        Self { artifact_uri: artifact_uri.into(), ..Default::default() }
    }

    pub fn expect(mut self, sha256: Option<String>, size: Option<u64>) -> Self {
        self.expected_sha256 = sha256;
        self.expected_size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedArtifact {
    pub artifact_uri: String,
    pub local_path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub dir: PathBuf,
    pub entries: usize,
    pub used_bytes: u64,
    pub reserved_bytes: u64,
    pub max_bytes: u64,
    pub pinned: usize,
    pub in_flight: usize,
}

/// Keeps one object out of eviction until dropped.
pub struct ArtifactPin {
    sha256: String,
    inner: Arc<CacheInner>,
}

impl ArtifactPin {
    pub fn sha256(&self) -> &str { &self.sha256 }
}

impl Drop for ArtifactPin {
    fn drop(&mut self) { self.inner.index.lock().unpin(&self.sha256); }
}

impl std::fmt::Debug for ArtifactPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactPin").field("sha256", &self.sha256).finish()
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<ResolvedArtifact>>>;

/// Callers share a download only when they would accept the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    uri: String,
    sha256: Option<String>,
    size: Option<u64>,
}

impl FlightKey {
    fn of(req: &ResolveRequest) -> Self {
        Self { uri: req.artifact_uri.clone(), sha256: req.expected_sha256.clone(), size: req.expected_size }
    }
}

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
}

struct CacheInner {
    settings: CacheSettings,
    source: Arc<dyn ArtifactSource>,
    index: Mutex<CacheIndex>,
    in_flight: Mutex<HashMap<FlightKey, InFlight>>,
    fetch_permits: Semaphore,
    generation: AtomicU64,
    save_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<CacheInner>,
}

fn normalize_sha(sha: Option<String>) -> Result<Option<String>> {
    let Some(sha) = sha.map(|s| s.trim().to_ascii_lowercase()).filter(|s| !s.is_empty()) else { return Ok(None) };
    if sha.len() != 64 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::bad_request(format!("expected sha256 must be 64 hex characters, got '{sha}'")));
    }
    Ok(Some(sha))
}

impl ArtifactCache {
    /// Prepare the directory layout, sweep temp files left by a crashed
    /// process, and reload the persisted index.
    pub fn open(settings: CacheSettings, source: Arc<dyn ArtifactSource>) -> Result<Self> {
        if settings.max_bytes == 0 || settings.max_concurrent_fetches == 0 {
            return Err(EngineError::bad_request("cache needs a positive byte budget and fetch concurrency"));
        }
        let objects = settings.dir.join("objects");
        let tmp = settings.dir.join("tmp");
        std::fs::create_dir_all(&objects).map_err(|e| EngineError::storage("create objects dir", e))?;
        std::fs::create_dir_all(&tmp).map_err(|e| EngineError::storage("create tmp dir", e))?;

        let mut swept = 0usize;
        for entry in std::fs::read_dir(&tmp).map_err(|e| EngineError::storage("scan tmp dir", e))?.flatten() {
            if std::fs::remove_file(entry.path()).is_ok() { swept += 1; }
        }

        let objects_dir = objects.clone();
        let index = CacheIndex::load(&settings.dir.join(INDEX_FILE), |sha| object_path_in(&objects_dir, sha))?;
        info!(dir = %settings.dir.display(), entries = index.len(), used_bytes = index.used_bytes(), swept, "artifact cache opened");

        let permits = settings.max_concurrent_fetches;
        Ok(Self {
            inner: Arc::new(CacheInner {
                settings,
                source,
                index: Mutex::new(index),
                in_flight: Mutex::new(HashMap::new()),
                fetch_permits: Semaphore::new(permits),
                generation: AtomicU64::new(0),
                save_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn settings(&self) -> &CacheSettings { &self.inner.settings }

    pub fn stats(&self) -> CacheStats {
        let index = self.inner.index.lock();
        CacheStats {
            dir: self.inner.settings.dir.clone(),
            entries: index.len(),
            used_bytes: index.used_bytes(),
            reserved_bytes: index.reserved_bytes(),
            max_bytes: self.inner.settings.max_bytes,
            pinned: index.pinned_count(),
            in_flight: self.inner.in_flight.lock().len(),
        }
    }

    pub fn is_pinned(&self, sha256: &str) -> bool { self.inner.index.lock().is_pinned(sha256) }

    pub async fn resolve(&self, req: ResolveRequest) -> Result<ResolvedArtifact> {
        let (resolved, _pin) = self.resolve_pinned(req).await?;
        Ok(resolved)
    }

    /// Resolve and keep the object pinned for as long as the returned guard lives.
    #[instrument(skip(self, req), fields(artifact_uri = %req.artifact_uri))]
    pub async fn resolve_pinned(&self, req: ResolveRequest) -> Result<(ResolvedArtifact, ArtifactPin)> {
        let result = self.resolve_inner(req).await;
        let outcome = match &result {
            Ok((r, _)) if r.cached => "cached",
            Ok(_) => "fetched",
            Err(_) => "error",
        };
        metrics::ARTIFACT_RESOLVES.with_label_values(&[outcome]).inc();
        result
    }

    async fn resolve_inner(&self, mut req: ResolveRequest) -> Result<(ResolvedArtifact, ArtifactPin)> {
        req.artifact_uri = req.artifact_uri.trim().to_string();
        req.expected_sha256 = normalize_sha(req.expected_sha256.take())?;
        let fingerprinted = req.expected_sha256.is_some() && req.expected_size.is_some();
        let location = ArtifactLocation::parse(&req.artifact_uri, self.inner.settings.s3_endpoint.as_deref(), fingerprinted)?;

        for _ in 0..RESOLVE_ATTEMPTS {
            if let Some(hit) = self.lookup_cached(&req).await? {
                return Ok(hit);
            }
            let fetched = self.join_fetch(&req, &location).await?;
            // the object can be evicted between install and our pin; go around again
            if let Some(pin) = self.pin(&fetched.sha256, &req.artifact_uri) {
                return Ok((fetched, pin));
            }
            debug!(sha256 = %fetched.sha256, "fetched object evicted before pin, retrying");
        }
        Err(EngineError::CacheStorageError {
            reason: format!("{} was evicted repeatedly before it could be pinned", req.artifact_uri),
        })
    }

    fn pin(&self, sha256: &str, uri: &str) -> Option<ArtifactPin> {
        if self.inner.index.lock().touch_and_pin(sha256, uri) {
            Some(ArtifactPin { sha256: sha256.to_string(), inner: self.inner.clone() })
        } else {
            None
        }
    }

    /// Fast path. Trusts the index when the on-disk length agrees and falls
    /// back to re-hashing the object when it does not.
    async fn lookup_cached(&self, req: &ResolveRequest) -> Result<Option<(ResolvedArtifact, ArtifactPin)>> {
        let candidate = {
            let index = self.inner.index.lock();
            match &req.expected_sha256 {
                Some(sha) => index.get(sha).map(|e| (sha.clone(), e.size_bytes)),
                None => index.sha_for_uri(&req.artifact_uri).and_then(|sha| index.get(sha).map(|e| (sha.to_string(), e.size_bytes))),
            }
        };
        let Some((sha, indexed_size)) = candidate else { return Ok(None) };
        let Some(pin) = self.pin(&sha, &req.artifact_uri) else { return Ok(None) };

        if let Some(expected) = req.expected_size {
            if expected != indexed_size {
                return Err(EngineError::IntegrityMismatch {
                    artifact_uri: req.artifact_uri.clone(),
                    expected_sha256: req.expected_sha256.clone(),
                    actual_sha256: sha,
                    expected_size: Some(expected),
                    actual_size: indexed_size,
                });
            }
        }

        let path = self.object_path(&sha);
        let on_disk = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                warn!(sha256 = %sha, "indexed object missing on disk, refetching");
                drop(pin);
                self.forget(&sha).await;
                return Ok(None);
            }
        };
        if on_disk != indexed_size {
            warn!(sha256 = %sha, indexed_size, on_disk, "index and storage disagree, re-verifying");
            let (actual_sha, actual_size) = hash_file(&path).await?;
            if actual_sha != sha {
                drop(pin);
                let _ = tokio::fs::remove_file(&path).await;
                self.forget(&sha).await;
                return Ok(None);
            }
            self.inner.index.lock().set_size(&sha, actual_size);
        }

        debug!(sha256 = %sha, "artifact cache hit");
        let resolved = ResolvedArtifact { artifact_uri: req.artifact_uri.clone(), local_path: path, sha256: sha, size_bytes: on_disk, cached: true };
        Ok(Some((resolved, pin)))
    }

    async fn forget(&self, sha256: &str) {
        self.inner.index.lock().remove(sha256);
        self.save_index().await;
    }

    /// Single-flight join. The first caller for a URI and expectation spawns
    /// the fetch; later callers with the same key await the shared result.
    async fn join_fetch(&self, req: &ResolveRequest, location: &ArtifactLocation) -> Result<ResolvedArtifact> {
        let key = FlightKey::of(req);
        let fetch = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(artifact_uri = %req.artifact_uri, "joining in-flight fetch");
                    existing.fetch.clone()
                }
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let cache = self.clone();
                    let (req, location, task_key) = (req.clone(), location.clone(), key.clone());
                    let task = tokio::spawn(async move {
                        let result = cache.fetch(&req, &location).await;
                        let mut in_flight = cache.inner.in_flight.lock();
                        if in_flight.get(&task_key).map(|f| f.generation) == Some(generation) {
                            in_flight.remove(&task_key);
                        }
                        result
                    });
                    let fetch = async move { task.await.map_err(|e| EngineError::storage("fetch task", e))? }.boxed().shared();
                    in_flight.insert(key, InFlight { generation, fetch: fetch.clone() });
                    fetch
                }
            }
        };
        match req.timeout {
            Some(limit) => tokio::time::timeout(limit, fetch).await.map_err(|_| EngineError::Timeout {
                operation: format!("resolve {}", req.artifact_uri),
                after_secs: limit.as_secs(),
            })?,
            None => fetch.await,
        }
    }

    async fn fetch(&self, req: &ResolveRequest, location: &ArtifactLocation) -> Result<ResolvedArtifact> {
        let limit = req.timeout.unwrap_or(self.inner.settings.fetch_timeout);
        let _permit = self.inner.fetch_permits.acquire().await.map_err(|e| EngineError::storage("fetch permits", e))?;
        let attempts = retry_async("artifact_fetch", &self.inner.settings.retry, EngineError::is_retryable, |attempt| {
            self.fetch_once(req, location, attempt)
        });
        match tokio::time::timeout(limit, attempts).await {
            Ok(result) => result,
            Err(_) => {
                warn!(artifact_uri = %req.artifact_uri, after_secs = limit.as_secs(), "artifact fetch timed out");
                Err(EngineError::Timeout { operation: format!("fetch {}", req.artifact_uri), after_secs: limit.as_secs() })
            }
        }
    }

    async fn fetch_once(&self, req: &ResolveRequest, location: &ArtifactLocation, attempt: usize) -> Result<ResolvedArtifact> {
        let uri = req.artifact_uri.as_str();
        let tmp = tempfile::Builder::new()
            .prefix("fetch-")
            .tempfile_in(self.inner.settings.dir.join("tmp"))
            .map_err(|e| EngineError::storage("create temp file", e))?;
        let (file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut stream = self.inner.source.open(uri, location).await.map_err(|e| with_attempts(e, attempt))?;
        let budget = self.inner.settings.max_bytes;
        let limit = req.expected_size.map_or(budget, |expected| expected.min(budget));
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk.map_err(|e| with_attempts(e, attempt))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            if size > limit {
                warn!(artifact_uri = uri, size, limit, "download exceeds its limit, aborting");
                return Err(match req.expected_size {
                    // digest and size describe the prefix read so far
                    Some(expected) if size > expected => EngineError::IntegrityMismatch {
                        artifact_uri: uri.to_string(),
                        expected_sha256: req.expected_sha256.clone(),
                        actual_sha256: hex::encode(hasher.finalize()),
                        expected_size: Some(expected),
                        actual_size: size,
                    },
                    _ => EngineError::CacheStorageError {
                        reason: format!("{uri} exceeds cache budget of {budget} bytes"),
                    },
                });
            }
            file.write_all(&chunk).await.map_err(|e| EngineError::storage("write temp file", e))?;
        }
        file.flush().await.map_err(|e| EngineError::storage("flush temp file", e))?;
        file.sync_all().await.map_err(|e| EngineError::storage("sync temp file", e))?;
        drop(file);
        let sha256 = hex::encode(hasher.finalize());

        let sha_ok = req.expected_sha256.as_deref().map(|e| e == sha256).unwrap_or(true);
        let size_ok = req.expected_size.map(|e| e == size).unwrap_or(true);
        if !sha_ok || !size_ok {
            warn!(artifact_uri = uri, expected = ?req.expected_sha256, actual = %sha256, size, "integrity mismatch, discarding download");
            return Err(EngineError::IntegrityMismatch {
                artifact_uri: uri.to_string(),
                expected_sha256: req.expected_sha256.clone(),
                actual_sha256: sha256,
                expected_size: req.expected_size,
                actual_size: size,
            });
        }

        self.install(uri, &sha256, size, tmp_path).await?;
        metrics::ARTIFACT_FETCHED_BYTES.inc_by(size);
        info!(artifact_uri = uri, sha256 = %sha256, size, "artifact installed");
        Ok(ResolvedArtifact { artifact_uri: uri.to_string(), local_path: self.object_path(&sha256), sha256, size_bytes: size, cached: false })
    }

    async fn install(&self, uri: &str, sha256: &str, size: u64, tmp_path: tempfile::TempPath) -> Result<()> {
        let final_path = self.object_path(sha256);
        if self.claim_space(uri, sha256, size, &final_path)? {
            // same content arrived under another reference
            self.save_index().await;
            return Ok(());
        }

        let placed = async {
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| EngineError::storage("create object dir", e))?;
            }
            tmp_path.persist(&final_path).map_err(|e| EngineError::storage("install object", e.error))
        }
        .await;

        {
            let mut index = self.inner.index.lock();
            index.release(size);
            if placed.is_ok() { index.insert(uri, sha256, size); }
        }
        placed?;
        self.save_index().await;
        Ok(())
    }

    /// Returns true when the object is already installed. Otherwise reserves
    /// `size` bytes, deleting evicted objects while the index lock is held so
    /// a concurrent install of the same content cannot lose its file.
    fn claim_space(&self, uri: &str, sha256: &str, size: u64, final_path: &Path) -> Result<bool> {
        let mut index = self.inner.index.lock();
        if index.get(sha256).is_some() && final_path.exists() {
            index.insert(uri, sha256, size);
            return Ok(true);
        }
        let victims = index.reserve(size, self.inner.settings.max_bytes)?;
        for victim in victims {
            match std::fs::remove_file(self.object_path(&victim)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(sha256 = %victim, error = %e, "failed to delete evicted object"),
            }
            metrics::ARTIFACT_EVICTIONS.inc();
            info!(sha256 = %victim, "evicted cache entry");
        }
        Ok(false)
    }

    /// Write the index through a temp file and rename. Failures are logged;
    /// the objects on disk remain authoritative.
    async fn save_index(&self) {
        let _guard = self.inner.save_lock.lock().await;
        let encoded = self.inner.index.lock().to_json();
        let dir = self.inner.settings.dir.clone();
        let result = match encoded {
            Ok(bytes) => tokio::task::spawn_blocking(move || write_atomic(&dir, INDEX_FILE, &bytes))
                .await
                .map_err(|e| EngineError::storage("index writer", e))
                .and_then(|r| r),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist cache index");
        }
    }

    pub fn object_path(&self, sha256: &str) -> PathBuf { object_path_in(&self.inner.settings.dir.join("objects"), sha256) }
}

fn object_path_in(objects: &Path, sha256: &str) -> PathBuf {
    let shard = sha256.get(..2).unwrap_or("xx");
    objects.join(shard).join(sha256)
}

fn with_attempts(err: EngineError, attempt: usize) -> EngineError {
    match err {
        EngineError::FetchFailed { artifact_uri, reason, retryable, .. } => {
            EngineError::FetchFailed { artifact_uri, reason, attempts: attempt + 1, retryable }
        }
        other => other,
    }
}

pub(crate) fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| EngineError::storage("create temp file", e))?;
    tmp.write_all(bytes).map_err(|e| EngineError::storage("write temp file", e))?;
    tmp.as_file().sync_all().map_err(|e| EngineError::storage("sync temp file", e))?;
    tmp.persist(dir.join(name)).map_err(|e| EngineError::storage("rename temp file", e.error))?;
    Ok(())
}

async fn hash_file(path: &Path) -> Result<(String, u64)> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await.map_err(|e| EngineError::storage("open object", e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(|e| EngineError::storage("read object", e))?;
        if n == 0 { break; }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}
