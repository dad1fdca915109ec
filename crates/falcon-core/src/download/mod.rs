//! Download coordination.
//!
//! [`DownloadCoordinator`] moves image bytes from sites to the local disk or
//! into memory for the blob cache:
//! - transfers are bounded by a semaphore sized from `network.concurrent_downloads`
//! - concurrent requests for one URL share a single transfer
//! - transient failures are retried with backoff, each attempt under its own timeout
//! - files stream into `<target>.part` and are linked into place on success
//! - the concurrency permit is held per attempt, never through a backoff sleep
//!
//! Target names come from a [`FilenameTemplate`]; an existing file is never
//! overwritten, a `_N` suffix is appended instead.

mod template;

pub use template::{sanitize, FilenameFields, FilenameTemplate};

use crate::cache::{Flight, FlightGroup};
use crate::cancel::CancellationToken;
use crate::config::{DownloadSettings, NetworkConfig, NetworkSettings};
use crate::error::{FalconError, Result};
use crate::network::{retry_async_with_hint, HttpClient, RetryConfig};
use crate::persist::atomic_write_json;
use crate::site::SearchResult;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const DEFAULT_EXTENSION: &str = "jpg";

/// One file to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub site_id: String,
    pub item_id: String,
    pub title: Option<String>,
    /// Written to the sidecar when `download.save_metadata` is on.
    pub metadata: BTreeMap<String, String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, site_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            site_id: site_id.into(),
            item_id: item_id.into(),
            title: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Download the full image of a search result.
    pub fn for_result(result: &SearchResult) -> Self {
        Self {
            url: result.full_ref.clone(),
            site_id: result.site_id.clone(),
            item_id: result.item_id.clone(),
            title: result.title().map(str::to_owned),
            metadata: result.metadata.clone(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// File extension taken from the URL path, `jpg` when absent.
    pub fn extension(&self) -> String {
        let ext = url::Url::parse(&self.url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_owned))
            })
            .and_then(|name| name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()))
            .map(|ext| ext.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>())
            .unwrap_or_default();
        if ext.is_empty() || ext.len() > 5 {
            DEFAULT_EXTENSION.to_string()
        } else {
            ext
        }
    }
}

/// Paths handed out but not yet renamed into place.
#[derive(Debug, Default)]
struct Reservations {
    paths: Mutex<HashSet<PathBuf>>,
}

struct Reservation {
    owner: Arc<Reservations>,
    path: PathBuf,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Ok(mut paths) = self.owner.paths.lock() {
            paths.remove(&self.path);
        }
    }
}

impl Reservations {
    /// Claim the first free `<stem>[_N].<ext>` in `dir`.
    fn claim(self: &Arc<Self>, dir: &Path, stem: &str, ext: &str) -> Result<Reservation> {
        let mut paths = self
            .paths
            .lock()
            .map_err(|_| FalconError::Other("download reservations poisoned".to_string()))?;

        let mut n = 0u32;
        loop {
            let name = if n == 0 {
                format!("{}.{}", stem, ext)
            } else {
                format!("{}_{}.{}", stem, n, ext)
            };
            let candidate = dir.join(name);
            if !paths.contains(&candidate) && !candidate.exists() && !part_path(&candidate).exists() {
                paths.insert(candidate.clone());
                return Ok(Reservation {
                    owner: self.clone(),
                    path: candidate,
                });
            }
            n += 1;
        }
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(NetworkConfig::DOWNLOAD_TEMP_SUFFIX);
    PathBuf::from(name)
}

fn sidecar_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Bounded, de-duplicating, retrying downloader. Cheap to clone; clones
/// share the concurrency bound and the in-flight tables.
#[derive(Clone)]
pub struct DownloadCoordinator {
    http: Arc<HttpClient>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    retry: RetryConfig,
    attempt_timeout: Duration,
    settings: DownloadSettings,
    template: FilenameTemplate,
    target_dir: PathBuf,
    file_flights: FlightGroup<PathBuf>,
    byte_flights: FlightGroup<Bytes>,
    reservations: Arc<Reservations>,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("concurrency", &self.concurrency)
            .field("target_dir", &self.target_dir)
            .field("template", &self.template.as_str())
            .finish()
    }
}

impl DownloadCoordinator {
    /// Build a coordinator writing under `target_dir`.
    pub fn new(
        http: Arc<HttpClient>,
        network: &NetworkSettings,
        settings: &DownloadSettings,
        target_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let template = FilenameTemplate::parse(&settings.filename_format)?;
        let concurrency = network.concurrent_downloads.max(1);
        Ok(Self {
            http,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            retry: RetryConfig::new().with_max_attempts(network.max_retries),
            attempt_timeout: network.timeout(),
            settings: settings.clone(),
            template,
            target_dir: target_dir.into(),
            file_flights: FlightGroup::new(),
            byte_flights: FlightGroup::new(),
            reservations: Arc::new(Reservations::default()),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Download `request` to disk using the configured filename template.
    pub async fn fetch(&self, request: &DownloadRequest) -> Result<PathBuf> {
        self.fetch_with_template(request, &self.template).await
    }

    /// Download `request` to disk, naming the file with `template`.
    ///
    /// A second request for a URL already being downloaded receives the
    /// first request's path instead of starting another transfer.
    pub async fn fetch_with_template(
        &self,
        request: &DownloadRequest,
        template: &FilenameTemplate,
    ) -> Result<PathBuf> {
        match self.file_flights.join(&request.url, || Ok(None))? {
            Flight::Ready(path) => Ok(path),
            Flight::Wait(waiter) => {
                debug!("Joining in-flight download of {}", request.url);
                waiter.wait().await
            }
            Flight::Lead(leader) => {
                let waiter = leader.waiter();
                let this = self.clone();
                let request = request.clone();
                let template = template.clone();
                tokio::spawn(async move {
                    let result = this.download_to_disk(&request, &template).await;
                    leader.complete(result);
                });
                waiter.wait().await
            }
        }
    }

    /// Fetch `url` into memory. Used to fill the blob cache.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Bytes> {
        match self.byte_flights.join(url, || Ok(None))? {
            Flight::Ready(bytes) => Ok(bytes),
            Flight::Wait(waiter) => waiter.wait().await,
            Flight::Lead(leader) => {
                let waiter = leader.waiter();
                let this = self.clone();
                let url = url.to_string();
                tokio::spawn(async move {
                    let result = this.download_to_memory(&url).await;
                    leader.complete(result);
                });
                waiter.wait().await
            }
        }
    }

    /// Download a batch, at most `concurrency` at a time, results in input
    /// order. Once `cancel` fires no further transfer is started; those
    /// requests report [`FalconError::Cancelled`].
    pub async fn fetch_all(
        &self,
        requests: Vec<DownloadRequest>,
        cancel: &CancellationToken,
    ) -> Vec<Result<PathBuf>> {
        futures::stream::iter(requests)
            .map(|request| async move {
                cancel.check()?;
                self.fetch(&request).await
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn download_to_disk(&self, request: &DownloadRequest, template: &FilenameTemplate) -> Result<PathBuf> {
        let dir = if self.settings.create_subfolder {
            self.target_dir.join(sanitize(&request.site_id))
        } else {
            self.target_dir.clone()
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FalconError::io_with_path(e, &dir))?;

        let stem = template.render(&FilenameFields {
            site: &request.site_id,
            id: &request.item_id,
            title: request.title.as_deref(),
        });
        let reservation = self.reservations.claim(&dir, &stem, &request.extension())?;
        let temp = part_path(&reservation.path);

        let (url, part) = (request.url.as_str(), temp.as_path());
        let (result, stats) = retry_async_with_hint(
            &self.retry,
            move || async move {
                let _permit = self.permit().await?;
                self.attempt_to_file(url, part).await
            },
            FalconError::is_retryable,
            FalconError::retry_after,
        )
        .await;

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                remove_quietly(&temp).await;
                return Err(download_error(&request.url, stats.attempts, e));
            }
        };

        let (reservation, target) = match self.persist(reservation, &temp, &dir, &stem, request).await {
            Ok(placed) => placed,
            Err(e) => {
                remove_quietly(&temp).await;
                return Err(e);
            }
        };

        if self.settings.save_metadata {
            let sidecar = sidecar_path(&target);
            let mut metadata = request.metadata.clone();
            metadata.insert("site".to_string(), request.site_id.clone());
            metadata.insert("id".to_string(), request.item_id.clone());
            metadata.insert("url".to_string(), request.url.clone());
            if let Err(e) = atomic_write_json(&sidecar, &metadata, false) {
                warn!("Failed to write metadata sidecar {}: {}", sidecar.display(), e);
            }
        }

        info!("Downloaded {} bytes to {}", bytes, target.display());
        drop(reservation);
        Ok(target)
    }

    /// Move the finished `.part` file to the reserved name without ever
    /// replacing an existing file. A name taken by another process since the
    /// reservation was made moves the file to the next free suffix.
    async fn persist(
        &self,
        mut reservation: Reservation,
        temp: &Path,
        dir: &Path,
        stem: &str,
        request: &DownloadRequest,
    ) -> Result<(Reservation, PathBuf)> {
        loop {
            let target = reservation.path.clone();
            match tokio::fs::hard_link(temp, &target).await {
                Ok(()) => {
                    remove_quietly(temp).await;
                    return Ok((reservation, target));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    warn!("{} appeared during download, picking another name", target.display());
                    let next = self.reservations.claim(dir, stem, &request.extension())?;
                    reservation = next;
                }
                Err(e) => return Err(FalconError::io_with_path(e, &target)),
            }
        }
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| FalconError::Other("download coordinator shut down".to_string()))
    }

    async fn download_to_memory(&self, url: &str) -> Result<Bytes> {
        let (result, stats) = retry_async_with_hint(
            &self.retry,
            move || async move {
                let _permit = self.permit().await?;
                self.attempt_to_memory(url).await
            },
            FalconError::is_retryable,
            FalconError::retry_after,
        )
        .await;

        result.map_err(|e| download_error(url, stats.attempts, e))
    }

    /// One attempt: request plus body under a single timeout. The partial
    /// file is removed when the attempt fails.
    async fn attempt_to_file(&self, url: &str, temp: &Path) -> Result<u64> {
        let outcome = tokio::time::timeout(self.attempt_timeout, self.stream_to_file(url, temp)).await;
        let result = outcome.unwrap_or(Err(FalconError::Timeout(self.attempt_timeout)));
        if result.is_err() {
            remove_quietly(temp).await;
        }
        result
    }

    async fn stream_to_file(&self, url: &str, temp: &Path) -> Result<u64> {
        let mut response = self.http.get(url).await?;
        self.check_declared_size(response.content_length())?;

        let mut file = tokio::fs::File::create(temp)
            .await
            .map_err(|e| FalconError::io_with_path(e, temp))?;

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| self.http.map_send_error(e, url))? {
            written += chunk.len() as u64;
            self.check_received_size(written)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FalconError::io_with_path(e, temp))?;
        }

        file.flush().await.map_err(|e| FalconError::io_with_path(e, temp))?;
        file.sync_all().await.map_err(|e| FalconError::io_with_path(e, temp))?;
        Ok(written)
    }

    async fn attempt_to_memory(&self, url: &str) -> Result<Bytes> {
        tokio::time::timeout(self.attempt_timeout, self.read_to_memory(url))
            .await
            .unwrap_or(Err(FalconError::Timeout(self.attempt_timeout)))
    }

    async fn read_to_memory(&self, url: &str) -> Result<Bytes> {
        let mut response = self.http.get(url).await?;
        self.check_declared_size(response.content_length())?;

        let mut buf = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.http.map_send_error(e, url))? {
            self.check_received_size((buf.len() + chunk.len()) as u64)?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    fn size_limit(&self) -> Option<u64> {
        (self.settings.max_file_size_mb > 0).then(|| self.settings.max_file_size_mb * 1024 * 1024)
    }

    fn check_declared_size(&self, declared: Option<u64>) -> Result<()> {
        match (self.size_limit(), declared) {
            (Some(limit), Some(len)) if len > limit => Err(size_error(len, limit)),
            _ => Ok(()),
        }
    }

    fn check_received_size(&self, received: u64) -> Result<()> {
        match self.size_limit() {
            Some(limit) if received > limit => Err(size_error(received, limit)),
            _ => Ok(()),
        }
    }
}

fn size_error(size: u64, limit: u64) -> FalconError {
    FalconError::Validation {
        field: "max_file_size_mb".to_string(),
        message: format!("{} bytes exceeds the {} byte limit", size, limit),
    }
}

fn download_error(url: &str, attempts: u32, cause: FalconError) -> FalconError {
    match cause {
        FalconError::Cancelled => FalconError::Cancelled,
        other => FalconError::Download {
            url: url.to_string(),
            attempts,
            cause: other.to_string(),
        },
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn coordinator(dir: &Path) -> DownloadCoordinator {
        let http = Arc::new(HttpClient::new().unwrap());
        DownloadCoordinator::new(http, &NetworkSettings::default(), &DownloadSettings::default(), dir)
            .unwrap()
            .with_retry(
                RetryConfig::new()
                    .with_max_attempts(2)
                    .with_base_delay(Duration::from_millis(10))
                    .with_jitter(false),
            )
            .with_attempt_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_extension_from_url() {
        let req = DownloadRequest::new("https://cdn.example/data/ab/cd.PNG?x=1", "danbooru", "1");
        assert_eq!(req.extension(), "png");
        let req = DownloadRequest::new("https://cdn.example/data/noext", "danbooru", "1");
        assert_eq!(req.extension(), "jpg");
    }

    #[test]
    fn test_collision_suffix() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("danbooru_1.jpg"), b"old").unwrap();

        let reservations = Arc::new(Reservations::default());
        let first = reservations.claim(temp.path(), "danbooru_1", "jpg").unwrap();
        let second = reservations.claim(temp.path(), "danbooru_1", "jpg").unwrap();
        assert_eq!(first.path, temp.path().join("danbooru_1_1.jpg"));
        assert_eq!(second.path, temp.path().join("danbooru_1_2.jpg"));

        drop(first);
        let third = reservations.claim(temp.path(), "danbooru_1", "jpg").unwrap();
        assert_eq!(third.path, temp.path().join("danbooru_1_1.jpg"));
    }

    #[tokio::test]
    async fn test_persist_never_replaces_a_file_created_mid_download() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(temp.path());
        let request = DownloadRequest::new("https://cdn.example/1.jpg", "danbooru", "1");

        let reservation = coordinator.reservations.claim(temp.path(), "danbooru_1", "jpg").unwrap();
        let part = part_path(&reservation.path);
        std::fs::write(&part, b"new").unwrap();
        // another process takes the reserved name before the transfer finishes
        std::fs::write(temp.path().join("danbooru_1.jpg"), b"theirs").unwrap();

        let (_reservation, placed) = coordinator
            .persist(reservation, &part, temp.path(), "danbooru_1", &request)
            .await
            .unwrap();
        assert_eq!(placed, temp.path().join("danbooru_1_1.jpg"));
        assert_eq!(std::fs::read(&placed).unwrap(), b"new");
        assert_eq!(std::fs::read(temp.path().join("danbooru_1.jpg")).unwrap(), b"theirs");
        assert!(!part.exists());
    }

    #[test]
    fn test_size_limit() {
        let temp = TempDir::new().unwrap();
        let mut coordinator = coordinator(temp.path());
        assert!(coordinator.check_declared_size(Some(u64::MAX)).is_ok());

        coordinator.settings.max_file_size_mb = 1;
        assert!(coordinator.check_declared_size(Some(2 * 1024 * 1024)).is_err());
        assert!(coordinator.check_received_size(1024).is_ok());
        assert!(!size_error(2, 1).is_retryable());
    }

    #[tokio::test]
    async fn test_offline_download_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(temp.path());
        let request = DownloadRequest::new("http://127.0.0.1:1/image.png", "danbooru", "42");

        let (a, b) = tokio::join!(coordinator.fetch(&request), coordinator.fetch(&request));
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(matches!(a, FalconError::Download { attempts: 2, .. }));
        assert_eq!(a.to_string(), b.to_string());

        let site_dir = temp.path().join("danbooru");
        let leftovers: Vec<_> = std::fs::read_dir(&site_dir).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_batch_starts_nothing() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(temp.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let requests = vec![
            DownloadRequest::new("http://127.0.0.1:1/a.jpg", "danbooru", "1"),
            DownloadRequest::new("http://127.0.0.1:1/b.jpg", "danbooru", "2"),
        ];
        let results = coordinator.fetch_all(requests, &cancel).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| matches!(r, Err(FalconError::Cancelled))));
    }
}
