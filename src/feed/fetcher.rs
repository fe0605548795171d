//! HTTP access for feed documents and enclosures.
//!
//! One [`Fetcher`] wraps a pooled `reqwest` client. Feed bodies are read into
//! memory under a size cap; enclosures stream to disk through a `.part` file.
//! Every URL, redirect targets included, must pass the fetcher's
//! [`HostPolicy`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::redirect::Policy;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::model::FeedParseResult;
use super::parser::parse_feed;
use crate::error::ErrorCode;
use crate::util::{HostPolicy, UrlRejected};

const MAX_REDIRECTS: usize = 3;

/// Errors from the network collaborator.
///
/// Callers that only report a task result use [`FetchError::code`]; the
/// variants keep the detail for logging.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Refusing to fetch {url}: {reason}")]
    Blocked {
        url: String,
        #[source]
        reason: UrlRejected,
    },
    /// Connect, TLS, or request setup failure.
    #[error("Request failed: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The connection broke while the body was being read.
    #[error("Read failed: {0}")]
    Body(#[source] reqwest::Error),
    #[error("Response too large")]
    ResponseTooLarge,
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: u64 },
    #[error("Cancelled")]
    Cancelled,
    #[error("Failed to write {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FetchError::InvalidUrl(_)
            | FetchError::Blocked { .. }
            | FetchError::Connect(_)
            | FetchError::HttpStatus(_) => ErrorCode::IoOpenUrl,
            FetchError::Body(_)
            | FetchError::ResponseTooLarge
            | FetchError::IncompleteResponse { .. } => ErrorCode::IoNet,
            FetchError::Cancelled => ErrorCode::Interrupted,
            FetchError::File { .. } => ErrorCode::IoFile,
        }
    }
}

impl From<FetchError> for ErrorCode {
    fn from(err: FetchError) -> Self {
        err.code()
    }
}

fn redirect_policy(hosts: HostPolicy) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects (max 3)");
        }
        let url = attempt.url();
        if let Err(reason) = hosts.check(url) {
            tracing::warn!(to = %url, error = %reason, "Redirect blocked by host policy");
            return attempt.error(reason);
        }
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }
        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

/// Fetches feed documents and enclosures.
///
/// Every operation races the caller's [`CancellationToken`]. Cancelling
/// drops the in-flight request future, which closes the connection at once
/// instead of waiting for a read timeout.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_feed_bytes: usize,
    hosts: HostPolicy,
}

impl Fetcher {
    /// Builds a fetcher with its own connection pool.
    ///
    /// `timeout` bounds a whole feed fetch. Downloads are only bounded per
    /// read so large enclosures can take as long as they need.
    pub fn new(
        timeout: Duration,
        user_agent: &str,
        max_feed_bytes: usize,
        hosts: HostPolicy,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(redirect_policy(hosts))
            .user_agent(user_agent)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, timeout, max_feed_bytes).with_host_policy(hosts))
    }

    /// Wraps an existing client. The host policy starts as
    /// [`HostPolicy::PublicOnly`] and is only applied to the request URL;
    /// redirects follow whatever policy `client` was built with.
    pub fn with_client(client: reqwest::Client, timeout: Duration, max_feed_bytes: usize) -> Self {
        Self {
            client,
            timeout,
            max_feed_bytes,
            hosts: HostPolicy::PublicOnly,
        }
    }

    pub fn with_host_policy(mut self, hosts: HostPolicy) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn host_policy(&self) -> HostPolicy {
        self.hosts
    }

    /// Fetches a feed document into memory.
    ///
    /// # Errors
    ///
    /// Bodies over the configured limit fail with
    /// [`FetchError::ResponseTooLarge`]. A body shorter than its
    /// Content-Length fails with [`FetchError::IncompleteResponse`].
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        let request = async {
            let response = self.send(url, Some(self.timeout)).await?;
            read_limited_bytes(response, self.max_feed_bytes).await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(url = %url, "Feed fetch cancelled");
                Err(FetchError::Cancelled)
            }
            result = request => result,
        }
    }

    /// Streams `url` into `dest`, reporting `(received, total)` after every
    /// chunk.
    ///
    /// The body is written to a `.part` file next to `dest` and renamed once
    /// complete; on any failure, cancellation included, the partial file is
    /// removed. Returns the number of bytes written.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        mut progress: F,
    ) -> Result<u64, FetchError>
    where
        F: FnMut(u64, Option<u64>) + Send,
    {
        let part = part_path(dest);
        let transfer = async {
            let response = self.send(url, None).await?;
            let total = response.content_length();
            let mut file = tokio::fs::File::create(&part)
                .await
                .map_err(|source| file_error(&part, source))?;
            let mut received: u64 = 0;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(FetchError::Body)?;
                file.write_all(&chunk)
                    .await
                    .map_err(|source| file_error(&part, source))?;
                received = received.saturating_add(chunk.len() as u64);
                progress(received, total);
            }
            file.flush()
                .await
                .map_err(|source| file_error(&part, source))?;
            if let Some(expected) = total {
                if received < expected {
                    return Err(FetchError::IncompleteResponse { expected, received });
                }
            }
            Ok(received)
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = transfer => result,
        };

        match result {
            Ok(received) => {
                tokio::fs::rename(&part, dest)
                    .await
                    .map_err(|source| file_error(dest, source))?;
                tracing::debug!(url = %url, bytes = received, path = %dest.display(), "Download complete");
                Ok(received)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&part).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %part.display(), error = %rm, "Failed to remove partial download");
                    }
                }
                Err(e)
            }
        }
    }

    async fn send(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, FetchError> {
        let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        self.hosts.check(&parsed).map_err(|reason| FetchError::Blocked {
            url: url.to_string(),
            reason,
        })?;
        let mut request = self.client.get(parsed);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(FetchError::Connect)?;
        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }
        Ok(response)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn file_error(path: &Path, source: std::io::Error) -> FetchError {
    FetchError::File {
        path: path.to_path_buf(),
        source,
    }
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Body)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len() as u64,
            });
        }
    }

    Ok(bytes)
}

/// Fetches and parses a feed in one step.
pub async fn parse_url(
    fetcher: &Fetcher,
    url: &str,
    cancel: &CancellationToken,
) -> Result<FeedParseResult, ErrorCode> {
    let bytes = fetcher.fetch(url, cancel).await.map_err(|e| {
        tracing::debug!(url = %url, error = %e, "Feed fetch failed");
        e.code()
    })?;
    parse_feed(&bytes, Some(cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Test</title>
    <item><guid>1</guid><title>Test</title><link>http://e/1</link></item>
</channel></rss>"#;

    // wiremock listens on 127.0.0.1.
    fn fetcher(max: usize) -> Fetcher {
        Fetcher::with_client(reqwest::Client::new(), Duration::from_secs(5), max)
            .with_host_policy(HostPolicy::AllowPrivate)
    }

    #[tokio::test]
    async fn test_parse_url_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&server)
            .await;

        let result = parse_url(
            &fetcher(1 << 20),
            &format!("{}/feed", server.uri()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.channel.title, "Test");
        assert_eq!(result.items.len(), 1);
    }

    #[tokio::test]
    async fn test_404_is_io_open_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher(1 << 20)
            .fetch(&format!("{}/feed", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
        assert_eq!(err.code(), ErrorCode::IoOpenUrl);
    }

    #[tokio::test]
    async fn test_no_retry_on_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(1 << 20)
            .fetch(&format!("{}/feed", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::IoOpenUrl);
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&server)
            .await;

        let err = fetcher(16)
            .fetch(&format!("{}/feed", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
        assert_eq!(err.code(), ErrorCode::IoNet);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = fetcher(16)
            .fetch("not a url", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::IoOpenUrl);
    }

    #[tokio::test]
    async fn test_cancel_drops_slow_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = parse_url(&fetcher(1 << 20), &format!("{}/feed", server.uri()), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ErrorCode::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_malformed_feed_is_unsupported_format() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
            .mount(&server)
            .await;

        let err = parse_url(
            &fetcher(1 << 20),
            &format!("{}/feed", server.uri()),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, ErrorCode::UnsupportedFormat);
    }

    #[tokio::test]
    async fn test_download_writes_file_and_reports_progress() {
        let server = MockServer::start().await;
        let body = vec![7u8; 4096];
        Mock::given(method("GET"))
            .and(path("/a.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("feedline-dl-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let dest = dir.join("a.mp3");

        let mut last = (0, None);
        let written = fetcher(16)
            .download(
                &format!("{}/a.mp3", server.uri()),
                &dest,
                &CancellationToken::new(),
                |received, total| last = (received, total),
            )
            .await
            .unwrap();

        assert_eq!(written, 4096);
        assert_eq!(last, (4096, Some(4096)));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
        assert!(!part_path(&dest).exists());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 16])
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("feedline-dlc-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let dest = dir.join("b.bin");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetcher(16)
            .download(&format!("{}/b.bin", server.uri()), &dest, &cancel, |_, _| {})
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Interrupted);
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_public_only_refuses_loopback_without_connecting() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(0)
            .mount(&server)
            .await;

        let strict = Fetcher::with_client(reqwest::Client::new(), Duration::from_secs(5), 1 << 20);
        assert_eq!(strict.host_policy(), HostPolicy::PublicOnly);
        let err = strict
            .fetch(&format!("{}/feed", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Blocked {
                reason: UrlRejected::PrivateHost(_),
                ..
            }
        ));
        assert_eq!(err.code(), ErrorCode::IoOpenUrl);

        let err = strict
            .download(
                "http://169.254.169.254/latest/meta-data",
                &std::env::temp_dir().join("feedline-never-written"),
                &CancellationToken::new(),
                |_, _| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Blocked { .. }));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_redirect_into_private_network_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "http://10.0.0.1/admin"),
            )
            .mount(&server)
            .await;

        // The start URL is allowed through; only the hop is checked against
        // the public policy.
        let client = reqwest::Client::builder()
            .redirect(redirect_policy(HostPolicy::PublicOnly))
            .build()
            .unwrap();
        let fetcher = Fetcher::with_client(client, Duration::from_secs(5), 1 << 20)
            .with_host_policy(HostPolicy::AllowPrivate);
        let err = fetcher
            .fetch(&format!("{}/feed", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Connect(_)), "got {err:?}");
        assert_eq!(err.code(), ErrorCode::IoOpenUrl);
    }
}
