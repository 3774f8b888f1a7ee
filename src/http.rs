use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::Settings;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },
    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transient { .. } => true,
            FetchError::Status { status, .. } => is_retryable_status(*status),
            FetchError::Request { .. } | FetchError::Client(_) | FetchError::Io { .. } => false,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Rate-limited client that sends the declared user agent on every request
/// and retries transient failures with exponential backoff.
pub struct Fetcher {
    client: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl Fetcher {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.http.timeout_secs))
            .build()
            .map_err(FetchError::Client)?;
        let per_second =
            NonZeroU32::new(settings.http.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Ok(Fetcher {
            client,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            max_retries: settings.http.max_retries,
            base_backoff_ms: settings.http.base_backoff_ms,
        })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.with_retry(url, |resp| async move {
            resp.text().await.map_err(|e| transient(url, e))
        })
        .await
    }

    /// Stream `url` into `dest` through a `.part` file, renaming on success.
    /// Returns the number of bytes written.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let name = dest.file_name().and_then(|n| n.to_str()).unwrap_or("download");
        let part = dest.with_file_name(format!("{}.part", name));
        let written = self
            .with_retry(url, |resp| {
                let part = part.clone();
                async move { stream_to_file(url, resp, &part).await }
            })
            .await?;
        tokio::fs::rename(&part, dest).await.map_err(|e| io_error(dest, e))?;
        Ok(written)
    }

    async fn with_retry<T, F, Fut>(&self, url: &str, mut body: F) -> Result<T, FetchError>
    where
        F: FnMut(Response) -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            let result = match self.send(url).await {
                Ok(resp) => body(resp).await,
                Err(e) => Err(e),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let backoff = Duration::from_millis(self.base_backoff_ms * 2u64.pow(attempt));
                    warn!(
                        "{} (attempt {}/{}), backing off {:.1}s",
                        e,
                        attempt + 1,
                        self.max_retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send(&self, url: &str) -> Result<Response, FetchError> {
        self.limiter.until_ready().await;
        debug!("GET {}", url);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| send_error(url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(resp)
    }
}

async fn stream_to_file(url: &str, mut resp: Response, part: &Path) -> Result<u64, FetchError> {
    let mut file = tokio::fs::File::create(part)
        .await
        .map_err(|e| io_error(part, e))?;
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await.map_err(|e| transient(url, e))? {
        file.write_all(&chunk).await.map_err(|e| io_error(part, e))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| io_error(part, e))?;
    Ok(written)
}

fn transient(url: &str, e: reqwest::Error) -> FetchError {
    FetchError::Transient {
        url: url.to_string(),
        reason: e.to_string(),
    }
}

/// Timeouts and connection or protocol failures are worth another attempt;
/// a request that could not be built (bad URL, bad header) is not.
fn send_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        transient(url, e)
    } else {
        FetchError::Request {
            url: url.to_string(),
            source: e,
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.display().to_string(),
        source,
    }
}
