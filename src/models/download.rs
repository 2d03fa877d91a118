use crate::error::{LivecapError, Result};
use crate::models::manifest::RemoteModel;
use crate::transport::{ProgressFn, Transport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Headroom kept free on top of the model size
const DISK_SPACE_MARGIN: u64 = 100 * 1_024 * 1_024;

/// Streams model files into the install directory
///
/// Bytes land in `<filename>.part` and are renamed to `<filename>` only after
/// the transfer completed, so the final path never holds a partial file.
#[derive(Clone)]
pub struct ModelDownloader {
    models_dir: PathBuf,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl std::fmt::Debug for ModelDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDownloader")
            .field("models_dir", &self.models_dir)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ModelDownloader {
    #[must_use]
    pub fn new(models_dir: PathBuf, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            models_dir,
            transport,
            timeout,
        }
    }

    /// Final location of a model file
    #[must_use]
    pub fn target_path(&self, filename: &str) -> PathBuf {
        self.models_dir.join(filename)
    }

    /// Temporary location used while downloading
    #[must_use]
    pub fn part_path(&self, filename: &str) -> PathBuf {
        self.models_dir.join(format!("{filename}.part"))
    }

    /// Download `remote` and return the published path
    pub async fn download(
        &self,
        remote: &RemoteModel,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        if !remote.is_valid() {
            return Err(LivecapError::DownloadFailed(format!(
                "manifest entry '{}' has no usable url/filename",
                remote.id
            )));
        }

        tokio::fs::create_dir_all(&self.models_dir).await?;
        if remote.size_bytes > 0 {
            self.check_disk_space(remote.size_bytes)?;
        }

        let part_path = self.part_path(&remote.filename);
        let target_path = self.target_path(&remote.filename);

        tracing::info!(
            "Downloading '{}' ({}) from {}",
            remote.id,
            format_bytes(remote.size_bytes),
            remote.url
        );

        if let Err(e) = self.fetch_to(&remote.url, &part_path, progress).await {
            discard(&part_path).await;
            tracing::warn!("Download of '{}' failed: {e}", remote.id);
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&part_path, &target_path).await {
            discard(&part_path).await;
            return Err(LivecapError::FinalizeFailed(format!(
                "could not move {} into place: {e}",
                target_path.display()
            )));
        }

        tracing::info!("Downloaded '{}' to {}", remote.id, target_path.display());
        Ok(target_path)
    }

    async fn fetch_to(
        &self,
        url: &str,
        part_path: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(part_path).await.map_err(|e| {
            LivecapError::DownloadFailed(format!("cannot create {}: {e}", part_path.display()))
        })?;

        let bytes = self
            .transport
            .get_to_sink(url, self.timeout, &mut file, progress)
            .await?;

        file.flush().await?;
        file.sync_all().await?;
        tracing::debug!("Wrote {bytes} bytes to {}", part_path.display());
        Ok(())
    }

    /// Check if enough disk space is available
    #[cfg(unix)]
    fn check_disk_space(&self, required_bytes: u64) -> Result<()> {
        let stats = nix::sys::statvfs::statvfs(&self.models_dir)
            .map_err(|e| LivecapError::Other(format!("Failed to check disk space: {e}")))?;

        #[allow(clippy::unnecessary_cast, clippy::useless_conversion)]
        let available_bytes = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        let required_with_margin = required_bytes.saturating_add(DISK_SPACE_MARGIN);

        if available_bytes < required_with_margin {
            return Err(LivecapError::DownloadFailed(format!(
                "Not enough disk space: {} required, {} available",
                format_bytes(required_with_margin),
                format_bytes(available_bytes)
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_disk_space(&self, _required_bytes: u64) -> Result<()> {
        Ok(())
    }
}

async fn discard(part_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(part_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove partial file {}: {e}", part_path.display());
        }
    }
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
