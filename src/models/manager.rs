use crate::config::ModelsConfig;
use crate::error::{LivecapError, Result};
use crate::models::download::ModelDownloader;
use crate::models::manifest::{fetch_manifest, RemoteModel};
use crate::models::registry::{InstallRegistry, InstalledModel, Removal};
use crate::task::TaskSlot;
use crate::transport::Transport;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// File extensions the caption engine can load
pub const SUPPORTED_EXTENSIONS: &[&str] = &["april", "onnx", "ort"];

/// A manifest entry whose version differs from the installed one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNotice {
    pub id: String,
    pub name: String,
    pub installed_version: String,
    pub available_version: String,
}

/// Install state of a manifest entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    /// Not on disk, not tracked
    Available,
    /// Tracked at the manifest's version
    Installed,
    /// Tracked at a different version
    UpdateAvailable { installed: String },
    /// A file with this name exists but was not installed through the manifest
    Untracked,
}

/// Result of a finished download task
#[derive(Debug)]
pub struct InstallOutcome {
    pub remote: RemoteModel,
    pub result: Result<PathBuf>,
}

/// Result of a finished removal task
#[derive(Debug)]
pub struct RemoveOutcome {
    pub id: String,
    pub result: Result<Removal>,
}

/// Byte counters for the download in flight
#[derive(Debug, Default)]
pub struct DownloadProgress {
    downloaded: AtomicU64,
    total: AtomicU64,
}

impl DownloadProgress {
    fn reset(&self, expected: u64) {
        self.downloaded.store(0, Ordering::Relaxed);
        self.total.store(expected, Ordering::Relaxed);
    }

    fn update(&self, downloaded: u64, total: Option<u64>) {
        self.downloaded.store(downloaded, Ordering::Relaxed);
        if let Some(total) = total {
            self.total.store(total, Ordering::Relaxed);
        }
    }

    /// `(downloaded, total)`; total is 0 when unknown
    #[must_use]
    pub fn get(&self) -> (u64, u64) {
        (
            self.downloaded.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// Owns the install directory, the install registry and the background slots
///
/// Lives on the render/event thread. Long-running work is spawned onto the
/// tokio runtime; results are picked up with the non-blocking `poll_*`
/// methods, at most one in-flight task per kind.
pub struct ModelManager {
    models_dir: PathBuf,
    manifest_url: String,
    fetch_timeout: Duration,
    models: Vec<PathBuf>,
    registry: Arc<InstallRegistry>,
    downloader: ModelDownloader,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    progress: Arc<DownloadProgress>,
    fetch: TaskSlot<Result<Vec<RemoteModel>>>,
    download: TaskSlot<InstallOutcome>,
    remove: TaskSlot<RemoveOutcome>,
    update_scan: TaskSlot<Result<Vec<UpdateNotice>>>,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("models_dir", &self.models_dir)
            .field("manifest_url", &self.manifest_url)
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

impl ModelManager {
    /// Create the manager, creating the install directory and loading the registry
    pub fn new(
        config: &ModelsConfig,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Result<Self> {
        let models_dir = config.resolve_install_dir()?;
        fs::create_dir_all(&models_dir).map_err(|e| {
            LivecapError::Config(format!(
                "Cannot create models folder {}: {e}",
                models_dir.display()
            ))
        })?;

        let registry = Arc::new(InstallRegistry::load(&models_dir));
        let downloader = ModelDownloader::new(
            models_dir.clone(),
            Arc::clone(&transport),
            config.download_timeout(),
        );

        let mut manager = Self {
            models_dir,
            manifest_url: config.effective_manifest_url(),
            fetch_timeout: config.fetch_timeout(),
            models: Vec::new(),
            registry,
            downloader,
            transport,
            runtime,
            progress: Arc::new(DownloadProgress::default()),
            fetch: TaskSlot::new(),
            download: TaskSlot::new(),
            remove: TaskSlot::new(),
            update_scan: TaskSlot::new(),
        };
        manager.refresh();

        tracing::info!(
            "Model folder {} ({} model file(s), {} installed from manifest)",
            manager.models_dir.display(),
            manager.models.len(),
            manager.registry.snapshot().len()
        );

        Ok(manager)
    }

    /// Re-scan the install directory for loadable model files
    pub fn refresh(&mut self) {
        let mut collected: Vec<PathBuf> = match fs::read_dir(&self.models_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
                .map(|entry| entry.path())
                .filter(|path| is_supported(path))
                .collect(),
            Err(e) => {
                tracing::warn!("Cannot list {}: {e}", self.models_dir.display());
                Vec::new()
            }
        };
        collected.sort();
        collected.dedup();
        self.models = collected;
    }

    /// Present model files, sorted and deduplicated
    #[must_use]
    pub fn models(&self) -> &[PathBuf] {
        &self.models
    }

    #[must_use]
    pub fn install_dir(&self) -> &Path {
        &self.models_dir
    }

    #[must_use]
    pub fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    /// Installed map snapshot
    #[must_use]
    pub fn installed(&self) -> BTreeMap<String, InstalledModel> {
        self.registry.snapshot()
    }

    /// Shared handle to the install registry
    #[must_use]
    pub fn registry(&self) -> Arc<InstallRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn download_progress(&self) -> (u64, u64) {
        self.progress.get()
    }

    #[must_use]
    pub const fn fetch_in_flight(&self) -> bool {
        self.fetch.is_pending()
    }

    #[must_use]
    pub const fn download_in_flight(&self) -> bool {
        self.download.is_pending()
    }

    #[must_use]
    pub const fn remove_in_flight(&self) -> bool {
        self.remove.is_pending()
    }

    #[must_use]
    pub const fn update_scan_in_flight(&self) -> bool {
        self.update_scan.is_pending()
    }

    /// Start fetching the manifest; `false` if a fetch is already running
    pub fn fetch_manifest_async(&mut self) -> bool {
        let transport = Arc::clone(&self.transport);
        let url = self.manifest_url.clone();
        let timeout = self.fetch_timeout;

        self.fetch.start(&self.runtime, async move {
            fetch_manifest(transport.as_ref(), &url, timeout).await
        })
    }

    #[must_use]
    pub fn poll_fetch(&mut self) -> Option<Result<Vec<RemoteModel>>> {
        self.fetch.take_ready()
    }

    /// Start downloading and recording `remote`; `false` if a download is running
    ///
    /// When `remote` is the active model the caller must unload it first.
    pub fn download_async(&mut self, remote: RemoteModel) -> bool {
        if self.download.is_pending() {
            tracing::debug!("Download of '{}' rejected: another download in flight", remote.id);
            return false;
        }

        let downloader = self.downloader.clone();
        let registry = Arc::clone(&self.registry);
        let progress = Arc::clone(&self.progress);

        self.download.start(&self.runtime, async move {
            progress.reset(remote.size_bytes);
            let report = {
                let progress = Arc::clone(&progress);
                move |done: u64, total: Option<u64>| progress.update(done, total)
            };

            let result = match downloader.download(&remote, Some(&report)).await {
                Ok(path) => record(registry, remote.clone(), path).await,
                Err(e) => Err(e),
            };

            InstallOutcome { remote, result }
        })
    }

    #[must_use]
    pub fn poll_download(&mut self) -> Option<InstallOutcome> {
        self.download.take_ready()
    }

    /// Start removing `id`; `false` if a removal is running
    ///
    /// When `id` is the active model the caller must unload it first.
    pub fn remove_async(&mut self, id: &str) -> bool {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();

        self.remove.start(&self.runtime, async move {
            let task_id = id.clone();
            let result = tokio::task::spawn_blocking(move || registry.remove_installed(&task_id))
                .await
                .unwrap_or_else(|e| Err(LivecapError::Other(format!("Removal task failed: {e}"))));
            RemoveOutcome { id, result }
        })
    }

    #[must_use]
    pub fn poll_remove(&mut self) -> Option<RemoveOutcome> {
        self.remove.take_ready()
    }

    /// Start a background update scan; reads the registry, never writes it
    pub fn scan_updates_async(&mut self) -> bool {
        let transport = Arc::clone(&self.transport);
        let registry = Arc::clone(&self.registry);
        let url = self.manifest_url.clone();
        let timeout = self.fetch_timeout;

        self.update_scan.start(&self.runtime, async move {
            let manifest = fetch_manifest(transport.as_ref(), &url, timeout).await?;
            let updates = find_updates(&manifest, &registry.snapshot());
            for update in &updates {
                tracing::info!(
                    "Update available for '{}': {} -> {}",
                    update.id,
                    update.installed_version,
                    update.available_version
                );
            }
            Ok::<_, LivecapError>(updates)
        })
    }

    #[must_use]
    pub fn poll_update_scan(&mut self) -> Option<Result<Vec<UpdateNotice>>> {
        self.update_scan.take_ready()
    }

    /// Whether `remote` is the model currently loaded from `active`
    ///
    /// Matches the manifest filename as well as the filename recorded for
    /// the same id, so a version that renames its file is still detected.
    #[must_use]
    pub fn is_active_remote(&self, remote: &RemoteModel, active: Option<&Path>) -> bool {
        let Some(active_name) = active.and_then(file_name) else {
            return false;
        };
        if active_name == remote.filename {
            return true;
        }
        self.registry
            .get(&remote.id)
            .is_some_and(|installed| installed.filename == active_name)
    }

    /// Whether the installed model `id` is the one loaded from `active`
    #[must_use]
    pub fn is_active_id(&self, id: &str, active: Option<&Path>) -> bool {
        let Some(active_name) = active.and_then(file_name) else {
            return false;
        };
        self.registry
            .get(id)
            .is_some_and(|installed| installed.filename == active_name)
    }

    /// Install state of a manifest entry
    #[must_use]
    pub fn model_status(&self, remote: &RemoteModel) -> ModelStatus {
        match self.registry.get(&remote.id) {
            Some(installed) if installed.version != remote.version => {
                ModelStatus::UpdateAvailable {
                    installed: installed.version,
                }
            }
            Some(_) => ModelStatus::Installed,
            None if self
                .models
                .iter()
                .any(|p| file_name(p).is_some_and(|name| name == remote.filename)) =>
            {
                ModelStatus::Untracked
            }
            None => ModelStatus::Available,
        }
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub(crate) const fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) const fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Await every background task ever started
    pub async fn shutdown(&mut self) {
        self.fetch.join().await;
        self.download.join().await;
        self.remove.join().await;
        self.update_scan.join().await;
        tracing::debug!("Model manager workers joined");
    }
}

async fn record(registry: Arc<InstallRegistry>, remote: RemoteModel, path: PathBuf) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || {
        registry.record_install(&remote, &path)?;
        Ok(path)
    })
    .await
    .unwrap_or_else(|e| Err(LivecapError::Other(format!("Install record task failed: {e}"))))
}

/// Manifest entries whose version differs from the installed one
///
/// Ids that are not installed are install candidates, not updates.
#[must_use]
pub fn find_updates(
    manifest: &[RemoteModel],
    installed: &BTreeMap<String, InstalledModel>,
) -> Vec<UpdateNotice> {
    manifest
        .iter()
        .filter_map(|remote| {
            let current = installed.get(&remote.id)?;
            (current.version != remote.version).then(|| UpdateNotice {
                id: remote.id.clone(),
                name: remote.display_name().to_string(),
                installed_version: current.version.clone(),
                available_version: remote.version.clone(),
            })
        })
        .collect()
}

/// Whether `path` has one of the supported model extensions (case-insensitive)
#[must_use]
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}

/// Language code from a model file name such as `general_fr.april`
///
/// Defaults to `en` unless the suffix after the last `_` is 2-3 characters.
#[must_use]
pub fn language_from_filename(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match stem.rsplit_once('_') {
        Some((_, code)) if (2..=3).contains(&code.chars().count()) => code.to_string(),
        _ => "en".to_string(),
    }
}

/// Closest manifest id within two edits, for "did you mean" hints
#[must_use]
pub fn suggest<'a>(id: &str, manifest: &'a [RemoteModel]) -> Option<&'a str> {
    if id.is_empty() {
        return None;
    }

    manifest
        .iter()
        .map(|m| (m.id.as_str(), levenshtein_distance(id, &m.id)))
        .min_by_key(|(_, dist)| *dist)
        .filter(|(_, dist)| *dist <= 2)
        .map(|(model_id, _)| model_id)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|f| f.to_string_lossy().into_owned())
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for (i, c1) in s1.chars().enumerate() {
        for (j, c2) in s2.chars().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
