//! HTTP downloads with mirror racing, progress and cancellation

use crate::progress::{DownloadProgress, ProgressSlot};
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);
const SPEED_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Downloads are disabled and no local copy of {0} exists")]
    Disabled(String),

    #[error("No download source for {0}")]
    NoSource(String),

    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Incomplete download of {label}: got {written} of {expected} bytes")]
    Incomplete {
        label: String,
        written: u64,
        expected: u64,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("All mirrors failed for {label}: {last}")]
    AllMirrorsFailed { label: String, last: String },

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The transfer [`Downloader::cancel_active`] aborts
#[derive(Debug)]
struct ActiveTransfer {
    id: Uuid,
    token: CancellationToken,
}

/// Streams files to disk.
///
/// Only the most recently started transfer is reachable through
/// [`cancel_active`](Self::cancel_active); an older transfer finishing late
/// never clears it.
#[derive(Debug)]
pub struct Downloader {
    client: reqwest::Client,
    probe_timeout: Duration,
    progress: Arc<ProgressSlot>,
    active: Mutex<Option<ActiveTransfer>>,
}

impl Downloader {
    pub fn new(progress: Arc<ProgressSlot>, probe_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            probe_timeout,
            progress,
            active: Mutex::new(None),
        }
    }

    pub fn progress(&self) -> &Arc<ProgressSlot> {
        &self.progress
    }

    /// Orders mirrors by HEAD latency.
    ///
    /// Duplicates are dropped. Mirrors that fail or time out keep their
    /// relative order and go after every responder.
    pub async fn probe_fastest_mirror(&self, urls: &[String]) -> Vec<String> {
        let mut unique: Vec<String> = Vec::new();
        for url in urls {
            if !unique.contains(url) {
                unique.push(url.clone());
            }
        }
        if unique.len() < 2 {
            return unique;
        }

        let probes = unique.iter().map(|url| {
            let client = self.client.clone();
            let timeout = self.probe_timeout;
            async move {
                let started = Instant::now();
                match tokio::time::timeout(timeout, client.head(url.as_str()).send()).await {
                    Ok(Ok(resp)) if resp.status().is_success() || resp.status().is_redirection() => {
                        Some(started.elapsed())
                    }
                    Ok(Ok(resp)) => {
                        debug!(url = %url, status = resp.status().as_u16(), "Mirror rejected probe");
                        None
                    }
                    Ok(Err(e)) => {
                        debug!(url = %url, error = %e, "Mirror probe failed");
                        None
                    }
                    Err(_) => {
                        debug!(url = %url, "Mirror probe timed out");
                        None
                    }
                }
            }
        });
        let latencies = join_all(probes).await;

        let mut responders: Vec<(Duration, String)> = Vec::new();
        let mut silent: Vec<String> = Vec::new();
        for (url, latency) in unique.into_iter().zip(latencies) {
            match latency {
                Some(elapsed) => responders.push((elapsed, url)),
                None => silent.push(url),
            }
        }
        responders.sort_by_key(|(elapsed, _)| *elapsed);

        let ordered: Vec<String> = responders
            .into_iter()
            .map(|(_, url)| url)
            .chain(silent)
            .collect();
        debug!(order = ?ordered, "Mirror order");
        ordered
    }

    /// Tries each mirror in latency order until one succeeds
    pub async fn download_from_mirrors(
        &self,
        urls: &[String],
        dest: &Path,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        if urls.is_empty() {
            return Err(DownloadError::NoSource(label.to_string()));
        }
        let ordered = self.probe_fastest_mirror(urls).await;
        let mut last_error: Option<DownloadError> = None;

        for url in &ordered {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            match self.download_to_file(url, dest, label, cancel).await {
                Ok(bytes) => return Ok(bytes),
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(e) => {
                    warn!(url = %url, error = %e, "Mirror failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(DownloadError::AllMirrorsFailed {
            label: label.to_string(),
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no mirrors".to_string()),
        })
    }

    /// Streams `url` into `dest` through a `.part` file of its own.
    ///
    /// The partial file is removed on any failure, including cancellation.
    pub async fn download_to_file(
        &self,
        url: &str,
        dest: &Path,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let id = Uuid::new_v4();
        let token = cancel.child_token();
        self.set_active(ActiveTransfer {
            id,
            token: token.clone(),
        });
        let part = part_path(dest, id);
        let result = self.stream_to(url, &part, label, &token).await;
        if self.clear_active(id) {
            self.progress.clear();
        }

        match result {
            Ok(written) => {
                tokio::fs::rename(&part, dest)
                    .await
                    .map_err(|e| DownloadError::io(dest, e))?;
                info!(label, bytes = written, "Download complete");
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    /// Aborts whatever transfer is in flight; no-op when idle
    pub fn cancel_active(&self) {
        if let Some(transfer) = self.active().as_ref() {
            debug!(transfer = %transfer.id, "Cancelling active download");
            transfer.token.cancel();
        }
    }

    fn set_active(&self, transfer: ActiveTransfer) {
        *self.active() = Some(transfer);
    }

    /// Forgets transfer `id` unless a newer one has replaced it.
    /// Returns whether it was still the active one.
    fn clear_active(&self, id: Uuid) -> bool {
        let mut active = self.active();
        if active.as_ref().is_some_and(|t| t.id == id) {
            *active = None;
            true
        } else {
            false
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveTransfer>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn stream_to(
        &self,
        url: &str,
        part: &Path,
        label: &str,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let response = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            resp = self.client.get(url).send() => resp.map_err(|source| DownloadError::Http {
                url: url.to_string(),
                source,
            })?,
        };
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let total = response.content_length();
        info!(label, url, total_bytes = ?total, "Downloading");

        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }
        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| DownloadError::io(part, e))?;

        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut meter = SpeedMeter::new();
        let mut last_publish = Instant::now();

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(source)) => {
                    return Err(DownloadError::Http {
                        url: url.to_string(),
                        source,
                    })
                }
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(part, e))?;
            written += chunk.len() as u64;
            meter.record(chunk.len() as u64);

            if last_publish.elapsed() >= PROGRESS_INTERVAL {
                last_publish = Instant::now();
                self.progress.publish(DownloadProgress {
                    written_bytes: written,
                    total_bytes: total,
                    label: label.to_string(),
                    speed_bytes_per_sec: meter.speed(),
                });
            }
        }

        file.flush().await.map_err(|e| DownloadError::io(part, e))?;
        drop(file);

        if let Some(expected) = total {
            if written != expected {
                return Err(DownloadError::Incomplete {
                    label: label.to_string(),
                    written,
                    expected,
                });
            }
        }
        Ok(written)
    }
}

/// Temporary sibling of `dest`, unique per transfer so two writers of the
/// same file never share one
pub(crate) fn part_path(dest: &Path, id: Uuid) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.part", id.simple()));
    dest.with_file_name(name)
}

/// Bytes per second over a sliding one-second window
struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    last_speed: Option<f64>,
}

impl SpeedMeter {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            last_speed: None,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= SPEED_WINDOW {
            self.last_speed = Some(self.window_bytes as f64 / elapsed.as_secs_f64());
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    fn speed(&self) -> Option<f64> {
        self.last_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering every request with `body`
    async fn serve(body: Vec<u8>, declared_len: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let is_head = buf[..n].starts_with(b"HEAD");
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        declared_len
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    if !is_head {
                        let _ = socket.write_all(&body).await;
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}/file.bin", addr)
    }

    fn downloader() -> Downloader {
        Downloader::new(Arc::new(ProgressSlot::new()), Duration::from_secs(2))
    }

    /// Answers with headers and the first chunk of a `declared_len` body,
    /// then stalls
    async fn serve_stalled(declared_len: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                        declared_len
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(b"GGUF").await;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });
        format!("http://{}/slow.bin", addr)
    }

    fn part_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "part"))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn wait_for_parts(dir: &Path, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while part_files(dir).len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transfer never started writing");
    }

    #[test]
    fn test_part_path_is_unique_per_transfer() {
        let dest = Path::new("/a/model.gguf");
        let first = part_path(dest, Uuid::new_v4());
        let second = part_path(dest, Uuid::new_v4());
        assert_ne!(first, second);
        for part in [&first, &second] {
            assert_eq!(part.parent(), Some(Path::new("/a")));
            let name = part.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with("model.gguf."));
            assert!(name.ends_with(".part"));
        }
    }

    #[tokio::test]
    async fn test_cancel_active_aborts_transfer_in_flight() {
        let url = serve_stalled(1024).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let downloader = Arc::new(downloader());

        let transfer = {
            let downloader = downloader.clone();
            let dest = dest.clone();
            tokio::spawn(async move {
                downloader
                    .download_to_file(&url, &dest, "slow", &CancellationToken::new())
                    .await
            })
        };
        wait_for_parts(dir.path(), 1).await;

        downloader.cancel_active();
        let result = tokio::time::timeout(Duration::from_secs(5), transfer)
            .await
            .expect("transfer ignored cancel_active")
            .unwrap();
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(!dest.exists());
        assert!(part_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_late_finishing_transfer_leaves_newer_one_alone() {
        let url = serve_stalled(1024).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("model.gguf");
        let downloader = Arc::new(downloader());

        let start = |cancel: CancellationToken| {
            let downloader = downloader.clone();
            let dest = dest.clone();
            let url = url.clone();
            tokio::spawn(async move {
                downloader
                    .download_to_file(&url, &dest, "model", &cancel)
                    .await
            })
        };
        let old_cancel = CancellationToken::new();
        let old = start(old_cancel.clone());
        wait_for_parts(dir.path(), 1).await;
        let new = start(CancellationToken::new());
        wait_for_parts(dir.path(), 2).await;

        // the old transfer unwinds after the new one has started
        old_cancel.cancel();
        assert!(matches!(
            old.await.unwrap(),
            Err(DownloadError::Cancelled)
        ));
        assert_eq!(part_files(dir.path()).len(), 1);

        downloader.cancel_active();
        let result = tokio::time::timeout(Duration::from_secs(5), new)
            .await
            .expect("newer transfer no longer reachable by cancel_active")
            .unwrap();
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(part_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_download_to_file() {
        let url = serve(b"hello world".to_vec(), 11).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");

        let written = downloader()
            .download_to_file(&url, &dest, "test", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert!(part_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_files() {
        let url = serve(b"data".to_vec(), 4).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = downloader()
            .download_to_file(&url, &dest, "test", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        assert!(!dest.exists());
        assert!(part_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_mirrors_keep_order_after_responders() {
        let live = serve(Vec::new(), 0).await;
        let dead_a = "http://127.0.0.1:1/a".to_string();
        let dead_b = "http://127.0.0.1:1/b".to_string();
        let ordered = downloader()
            .probe_fastest_mirror(&[dead_a.clone(), live.clone(), dead_b.clone(), live.clone()])
            .await;
        assert_eq!(ordered, vec![live, dead_a, dead_b]);
    }

    #[tokio::test]
    async fn test_falls_through_to_working_mirror() {
        let live = serve(b"payload".to_vec(), 7).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");

        let written = downloader()
            .download_from_mirrors(
                &["http://127.0.0.1:1/x".to_string(), live],
                &dest,
                "test",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(written, 7);
    }

    #[tokio::test]
    async fn test_no_mirrors_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = downloader()
            .download_from_mirrors(&[], &dir.path().join("x"), "x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NoSource(_)));
    }

    #[test]
    fn test_speed_meter_starts_empty() {
        let meter = SpeedMeter::new();
        assert!(meter.speed().is_none());
    }
}
