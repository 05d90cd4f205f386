//! HTTP transfers with stall detection.
//!
//! Archive downloads use an *inactivity* timeout: every read waits at most
//! `read_timeout` for the next chunk, so a slow but live connection keeps
//! going while a stalled one is aborted. Small metadata fetches use a short
//! absolute timeout instead.
//!
//! Async reqwest runs on a shared tokio runtime behind a sync interface so
//! rayon workers can drive transfers directly.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, OnceLock};
use std::task::Context;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use indicatif::ProgressBar;
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{ErrorCategory, categorize_io, categorize_message};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Copy buffer for archive downloads (256KB)
const DOWNLOAD_BUF_SIZE: usize = 256 * 1024;

/// Runtime HTTP behaviour, installed once per process.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Max silence between two received chunks before a download is aborted.
    pub read_timeout: Duration,
    /// Absolute timeout for small metadata documents.
    pub metadata_timeout: Duration,
    /// Retry attempts for retryable transfer failures.
    pub max_retries: u32,
    /// Delay between parallel worker starts.
    pub stagger_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(10),
            max_retries: 3,
            stagger_ms: 0,
        }
    }
}

static HTTP_CONFIG: OnceLock<HttpConfig> = OnceLock::new();

/// Install HTTP settings. Later calls are ignored (first writer wins).
pub fn set_http_config(config: HttpConfig) {
    if HTTP_CONFIG.set(config).is_err() {
        log::debug!("HTTP config already installed, keeping the first one");
    }
}

/// Current HTTP settings (defaults if never installed).
pub fn http_config() -> &'static HttpConfig {
    HTTP_CONFIG.get_or_init(HttpConfig::default)
}

/// Transfer failure with enough detail to categorize it.
#[derive(Debug)]
pub enum StreamError {
    /// HTTP-level failure, with status when the server answered
    Http {
        status: Option<u16>,
        message: String,
    },
    /// Socket or local file failure
    Io(io::Error),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl StreamError {
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Io(io::Error::new(io::ErrorKind::TimedOut, e.to_string()));
        }
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }

    /// HTTP status, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => *status,
            Self::Io(_) => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Http {
                status: Some(404 | 410),
                ..
            } => ErrorCategory::NotFound,
            Self::Http {
                status: Some(s), ..
            } if *s >= 500 || matches!(s, 408 | 429) => ErrorCategory::Transport,
            Self::Http {
                status: Some(_), ..
            } => ErrorCategory::Refused,
            Self::Http {
                status: None,
                message,
            } => categorize_message(message).unwrap_or(ErrorCategory::Transport),
            Self::Io(e) => categorize_io(e),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            // 408 request timeout and 429 rate limit are worth another try;
            // any other client error will fail the same way again
            Self::Http {
                status: Some(s), ..
            } => *s >= 500 || matches!(s, 408 | 429),
            Self::Http { status: None, .. } => true,
            Self::Io(e) => e.kind() != io::ErrorKind::StorageFull,
        }
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(8)
        .user_agent(concat!("taxaline/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to build HTTP client")
});

pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Shared byte counter for progress tracking
pub type ByteCounter = Arc<AtomicU64>;

/// Buffered reader over an HTTP response body with byte counting
pub type BodyReader = BufReader<CountingReader<TimeoutReader>>;

/// HTTP GET → buffered body reader with stall detection.
///
/// Returns (reader, byte_counter, total_bytes)
pub fn open_reader(url: &str) -> Result<(BodyReader, ByteCounter, Option<u64>), StreamError> {
    let read_timeout = http_config().read_timeout;

    let (reader, total_bytes) = SHARED_RUNTIME.handle().block_on(async {
        let response = SHARED_CLIENT
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| StreamError::from_reqwest(&e))?;

        let total_bytes = response.content_length();
        let stream = response.bytes_stream();
        let async_reader = tokio_util::io::StreamReader::new(
            stream.map(|result| result.map_err(io::Error::other)),
        );

        Ok::<_, StreamError>((
            TimeoutReader::new(Box::pin(async_reader), read_timeout),
            total_bytes,
        ))
    })?;

    let counter = Arc::new(AtomicU64::new(0));
    let counting = CountingReader {
        inner: reader,
        count: counter.clone(),
    };
    Ok((
        BufReader::with_capacity(DOWNLOAD_BUF_SIZE, counting),
        counter,
        total_bytes,
    ))
}

/// Statistics for one completed download
#[derive(Debug, Clone, Copy)]
pub struct DownloadStats {
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Download `url` into `dest`, writing through `dest.part` and renaming on success.
pub fn download_to_file(
    url: &str,
    dest: &Path,
    pb: &ProgressBar,
) -> Result<DownloadStats, StreamError> {
    let start = Instant::now();
    let (mut reader, counter, total) = open_reader(url)?;
    if let Some(total) = total {
        crate::progress::upgrade_to_bar(pb, total);
    }

    let part = dest.with_extension("part");
    let mut file = File::create(&part)?;
    let mut buf = vec![0u8; DOWNLOAD_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        pb.set_position(counter.load(Ordering::Relaxed));
    }
    file.sync_all()?;
    drop(file);
    fs::rename(&part, dest)?;

    Ok(DownloadStats {
        bytes: counter.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
    })
}

/// Fetch a small text document with an absolute timeout.
pub fn fetch_text(url: &str) -> Result<String, StreamError> {
    let timeout = http_config().metadata_timeout;
    SHARED_RUNTIME.handle().block_on(async {
        let request = async {
            SHARED_CLIENT
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())?
                .text()
                .await
        };
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => Err(StreamError::from_reqwest(&e)),
            Err(_) => Err(StreamError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("metadata fetch exceeded {}s", timeout.as_secs()),
            ))),
        }
    })
}

/// Reader wrapper that tracks bytes read
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Async-to-sync bridge with a per-read inactivity timeout.
///
/// The timer restarts on every read, so only silence is bounded, not the
/// total transfer time.
pub struct TimeoutReader {
    inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
    timeout: Duration,
}

impl TimeoutReader {
    fn new(inner: Pin<Box<dyn AsyncRead + Send + Sync>>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = self.timeout;
        SHARED_RUNTIME.handle().block_on(async {
            let read_future = async {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx: &mut Context<'_>| {
                    Pin::as_mut(&mut self.inner).poll_read(cx, &mut read_buf)
                })
                .await?;
                Ok::<_, io::Error>(read_buf.filled().len())
            };

            match tokio::time::timeout(timeout, read_future).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data received for {}s", timeout.as_secs()),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_err(status: u16) -> StreamError {
        StreamError::Http {
            status: Some(status),
            message: "test".to_string(),
        }
    }

    #[test]
    fn http_404_is_not_found() {
        assert_eq!(http_err(404).category(), ErrorCategory::NotFound);
        assert_eq!(http_err(410).category(), ErrorCategory::NotFound);
    }

    #[test]
    fn http_503_is_transport() {
        assert_eq!(http_err(503).category(), ErrorCategory::Transport);
        assert_eq!(http_err(429).category(), ErrorCategory::Transport);
        assert_eq!(http_err(408).category(), ErrorCategory::Transport);
    }

    #[test]
    fn http_403_is_not_transport() {
        assert_eq!(http_err(403).category(), ErrorCategory::Refused);
        assert_eq!(http_err(401).category(), ErrorCategory::Refused);
        assert_eq!(http_err(400).category(), ErrorCategory::Refused);
        assert!(!http_err(403).category().is_clean_skip());
    }

    #[test]
    fn statusless_message_sniffed() {
        let err = StreamError::Http {
            status: None,
            message: "error sending request: connection reset by peer".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Transport);
    }

    #[test]
    fn io_timeout_is_transport() {
        let err = StreamError::Io(io::Error::new(io::ErrorKind::TimedOut, "stall"));
        assert_eq!(err.category(), ErrorCategory::Transport);
    }

    #[test]
    fn http_404_not_retryable() {
        assert!(!http_err(404).is_retryable());
    }

    #[test]
    fn http_429_and_500_retryable() {
        assert!(http_err(429).is_retryable());
        assert!(http_err(500).is_retryable());
    }

    #[test]
    fn io_storage_full_not_retryable() {
        let err = StreamError::Io(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn status_accessor() {
        assert_eq!(http_err(404).status(), Some(404));
        assert_eq!(StreamError::Io(io::Error::other("x")).status(), None);
    }

    #[test]
    fn display_http_with_status() {
        assert_eq!(format!("{}", http_err(404)), "HTTP 404: test");
    }

    #[test]
    fn default_http_config() {
        let cfg = HttpConfig::default();
        assert!(cfg.metadata_timeout < cfg.read_timeout);
        assert_eq!(cfg.max_retries, 3);
    }
}
