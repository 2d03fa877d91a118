use crate::error::{LivecapError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Progress callback: `(bytes_downloaded, total_bytes_if_known)`
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// HTTP collaborator used by the manifest fetcher, downloader and update check
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url` into memory
    ///
    /// Fails with `Network` on transport errors, timeouts and non-2xx responses.
    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String>;

    /// GET `url`, streaming the body into `sink`
    ///
    /// Returns the number of bytes written. Fails with `Network` when no
    /// successful response was obtained and with `DownloadFailed` when the
    /// transfer breaks off part way.
    async fn get_to_sink(
        &self,
        url: &str,
        timeout: Duration,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: Option<&ProgressFn>,
    ) -> Result<u64>;
}

/// `reqwest` implementation following redirects
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("client", &"Client { ... }")
            .finish()
    }
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("livecap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LivecapError::Other(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    async fn send(&self, url: &str, timeout: Duration) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| LivecapError::Network(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LivecapError::Network(format!("GET {url}: HTTP {status}")));
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String> {
        let response = self.send(url, timeout).await?;
        response
            .text()
            .await
            .map_err(|e| LivecapError::Network(format!("GET {url}: failed to read body: {e}")))
    }

    async fn get_to_sink(
        &self,
        url: &str,
        timeout: Duration,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: Option<&ProgressFn>,
    ) -> Result<u64> {
        let response = self.send(url, timeout).await?;
        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        if let Some(report) = progress {
            report(0, total);
        }

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                LivecapError::DownloadFailed(format!("transfer interrupted after {downloaded} bytes: {e}"))
            })?;
            sink.write_all(&chunk).await.map_err(|e| {
                LivecapError::DownloadFailed(format!("failed to write downloaded data: {e}"))
            })?;
            downloaded += chunk.len() as u64;

            if let Some(report) = progress {
                report(downloaded, total);
            }
        }

        if let Some(expected) = total {
            if downloaded != expected {
                return Err(LivecapError::DownloadFailed(format!(
                    "incomplete transfer: {downloaded} of {expected} bytes"
                )));
            }
        }

        Ok(downloaded)
    }
}
