//! Frame-driven bridge between a render loop and the model manager.
//!
//! The render loop calls [`ModelBridge::tick`] once per frame. It never
//! blocks: each background slot is checked with a zero-timeout poll and a
//! result is applied only once it is ready. Requests that would replace or
//! delete the model the caption engine has open first shut the engine down
//! through [`CaptionHost`] and reload once the task finishes.

use crate::app_update::{check_latest_release, ReleaseCheck};
use crate::config::UpdatesConfig;
use crate::error::{LivecapError, Result};
use crate::models::manager::{InstallOutcome, ModelManager, RemoveOutcome, UpdateNotice};
use crate::models::manifest::RemoteModel;
use crate::task::TaskSlot;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The caption side of the application: audio capture, ASR engine, caption view
pub trait CaptionHost {
    /// Path of the model the engine currently has loaded
    fn active_model(&self) -> Option<PathBuf>;
    fn stop_audio(&mut self);
    fn stop_engine(&mut self);
    fn clear_captions(&mut self);
    /// Forget the active model reference
    fn release_active(&mut self);
    /// Load and start the engine on `path`; `false` if it failed
    fn load_model(&mut self, path: &Path) -> bool;
    fn start_audio(&mut self);
}

/// Failure carried by a [`BridgeEvent`]; two failures are equal when their messages are
#[derive(Debug, Clone)]
pub struct EventError(Arc<LivecapError>);

impl EventError {
    #[must_use]
    pub fn error(&self) -> &LivecapError {
        &self.0
    }

    /// Take the typed error back out
    #[must_use]
    pub fn into_error(self) -> LivecapError {
        Arc::try_unwrap(self.0).unwrap_or_else(|shared| LivecapError::Other(shared.to_string()))
    }
}

impl From<LivecapError> for EventError {
    fn from(error: LivecapError) -> Self {
        Self(Arc::new(error))
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl PartialEq for EventError {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_string() == other.0.to_string()
    }
}

impl Eq for EventError {}

/// Something the UI should surface after a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    ManifestLoaded { count: usize },
    ManifestFailed { error: EventError },
    Installed { id: String, path: PathBuf },
    InstallFailed { id: String, error: EventError },
    Removed { id: String, file_warning: Option<String> },
    RemoveFailed { id: String, error: EventError },
    UpdatesFound { updates: Vec<UpdateNotice> },
    UpdateScanFailed { error: EventError },
    ReleaseChecked { check: ReleaseCheck },
    ReleaseCheckFailed { error: EventError },
    ModelLoaded { path: PathBuf },
    ModelLoadFailed { path: PathBuf },
    NoModelAvailable,
}

/// Model to bring back once a task that required unloading has finished
#[derive(Debug, Clone)]
struct PendingReload {
    /// What was loaded before the engine was stopped
    previous: PathBuf,
    /// Preferred path after success (the freshly installed file)
    preferred: Option<PathBuf>,
}

/// Per-frame driver owning the manager and the latest results
pub struct ModelBridge {
    manager: ModelManager,
    release_url: String,
    current_version: String,
    auto_check: bool,
    app_update: TaskSlot<Result<ReleaseCheck>>,
    manifest: Vec<RemoteModel>,
    manifest_error: Option<String>,
    updates: Vec<UpdateNotice>,
    release: Option<ReleaseCheck>,
    reload_after_download: Option<PendingReload>,
    reload_after_remove: Option<PendingReload>,
}

impl std::fmt::Debug for ModelBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBridge")
            .field("manager", &self.manager)
            .field("manifest", &self.manifest.len())
            .field("updates", &self.updates)
            .finish_non_exhaustive()
    }
}

impl ModelBridge {
    #[must_use]
    pub fn new(manager: ModelManager, updates: &UpdatesConfig) -> Self {
        Self {
            manager,
            release_url: updates.release_url.clone(),
            current_version: updates.current_version.clone(),
            auto_check: updates.auto_check,
            app_update: TaskSlot::new(),
            manifest: Vec::new(),
            manifest_error: None,
            updates: Vec::new(),
            release: None,
            reload_after_download: None,
            reload_after_remove: None,
        }
    }

    #[must_use]
    pub const fn manager(&self) -> &ModelManager {
        &self.manager
    }

    /// Last successfully fetched manifest
    #[must_use]
    pub fn manifest(&self) -> &[RemoteModel] {
        &self.manifest
    }

    /// Error text of the last failed fetch, cleared on success
    #[must_use]
    pub fn manifest_error(&self) -> Option<&str> {
        self.manifest_error.as_deref()
    }

    #[must_use]
    pub fn updates(&self) -> &[UpdateNotice] {
        &self.updates
    }

    #[must_use]
    pub const fn release(&self) -> Option<&ReleaseCheck> {
        self.release.as_ref()
    }

    #[must_use]
    pub const fn app_update_in_flight(&self) -> bool {
        self.app_update.is_pending()
    }

    /// Any background work outstanding
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.manager.fetch_in_flight()
            || self.manager.download_in_flight()
            || self.manager.remove_in_flight()
            || self.manager.update_scan_in_flight()
            || self.app_update_in_flight()
    }

    /// Whether the engine is waiting to be reloaded
    #[must_use]
    pub const fn reload_pending(&self) -> bool {
        self.reload_after_download.is_some() || self.reload_after_remove.is_some()
    }

    /// Start (or retry) the manifest fetch
    pub fn request_fetch(&mut self) -> bool {
        self.manager.fetch_manifest_async()
    }

    pub fn request_update_scan(&mut self) -> bool {
        self.manager.scan_updates_async()
    }

    pub fn request_app_update_check(&mut self) -> bool {
        let transport = self.manager.transport();
        let url = self.release_url.clone();
        let current = self.current_version.clone();
        let timeout = self.manager.fetch_timeout();
        let runtime = self.manager.runtime().clone();

        self.app_update.start(&runtime, async move {
            check_latest_release(transport.as_ref(), &url, &current, timeout).await
        })
    }

    /// Startup checks: model update scan, plus the release check when enabled
    pub fn start_background_checks(&mut self) {
        self.request_update_scan();
        if self.auto_check {
            self.request_app_update_check();
        }
    }

    /// Install or reinstall `remote`
    ///
    /// Rejected while another download is in flight. If `remote` is the
    /// active model the engine is shut down before the download starts.
    pub fn request_install(&mut self, remote: RemoteModel, host: &mut dyn CaptionHost) -> bool {
        if self.manager.download_in_flight() {
            return false;
        }

        let active = host.active_model();
        let reload = match active {
            Some(previous) if self.manager.is_active_remote(&remote, Some(previous.as_path())) => {
                unload_active(host);
                Some(PendingReload {
                    previous,
                    preferred: Some(self.manager.install_dir().join(&remote.filename)),
                })
            }
            _ => None,
        };

        let started = self.manager.download_async(remote);
        if started {
            self.reload_after_download = reload;
        }
        started
    }

    /// Remove installed model `id`
    ///
    /// Rejected while another removal is in flight. If `id` is the active
    /// model the engine is shut down before the removal starts.
    pub fn request_remove(&mut self, id: &str, host: &mut dyn CaptionHost) -> bool {
        if self.manager.remove_in_flight() {
            return false;
        }

        let active = host.active_model();
        let reload = match active {
            Some(previous) if self.manager.is_active_id(id, Some(previous.as_path())) => {
                unload_active(host);
                Some(PendingReload {
                    previous,
                    preferred: None,
                })
            }
            _ => None,
        };

        let started = self.manager.remove_async(id);
        if started {
            self.reload_after_remove = reload;
        }
        started
    }

    /// Pick up externally added or deleted files
    ///
    /// When nothing is loaded, or the loaded file vanished from the folder,
    /// the engine is restarted on the first present model. An empty folder
    /// shuts the engine down. Skipped while a task is waiting to reload.
    pub fn on_focus_regained(&mut self, host: &mut dyn CaptionHost) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        self.manager.refresh();
        if self.reload_pending() {
            return events;
        }

        let active = host.active_model();
        if active
            .as_ref()
            .is_some_and(|path| self.manager.models().contains(path))
        {
            return events;
        }

        match self.manager.models().first().cloned() {
            Some(first) => {
                if let Some(gone) = &active {
                    tracing::warn!("Active model {} disappeared", gone.display());
                }
                unload_active(host);
                self.reload(host, &first, &mut events);
            }
            None => {
                unload_active(host);
                tracing::error!(
                    "No caption models found. Add .april/.onnx/.ort files to {}",
                    self.manager.install_dir().display()
                );
                events.push(BridgeEvent::NoModelAvailable);
            }
        }
        events
    }

    /// Drain every ready result; call once per frame
    pub fn tick(&mut self, host: &mut dyn CaptionHost) -> Vec<BridgeEvent> {
        let mut events = Vec::new();

        if let Some(result) = self.manager.poll_fetch() {
            match result {
                Ok(models) => {
                    events.push(BridgeEvent::ManifestLoaded {
                        count: models.len(),
                    });
                    self.manifest = models;
                    self.manifest_error = None;
                }
                Err(e) => {
                    tracing::error!("Manifest fetch failed: {e}");
                    self.manifest_error = Some(e.to_string());
                    events.push(BridgeEvent::ManifestFailed { error: e.into() });
                }
            }
        }

        if let Some(outcome) = self.manager.poll_download() {
            self.apply_download(outcome, host, &mut events);
        }

        if let Some(outcome) = self.manager.poll_remove() {
            self.apply_remove(outcome, host, &mut events);
        }

        if let Some(result) = self.manager.poll_update_scan() {
            match result {
                Ok(updates) => {
                    self.updates.clone_from(&updates);
                    events.push(BridgeEvent::UpdatesFound { updates });
                }
                Err(e) => events.push(BridgeEvent::UpdateScanFailed { error: e.into() }),
            }
        }

        if let Some(result) = self.app_update.take_ready() {
            match result {
                Ok(check) => {
                    self.release = Some(check.clone());
                    events.push(BridgeEvent::ReleaseChecked { check });
                }
                Err(e) => events.push(BridgeEvent::ReleaseCheckFailed { error: e.into() }),
            }
        }

        events
    }

    fn apply_download(
        &mut self,
        outcome: InstallOutcome,
        host: &mut dyn CaptionHost,
        events: &mut Vec<BridgeEvent>,
    ) {
        let InstallOutcome { remote, result } = outcome;
        self.manager.refresh();
        let reload = self.reload_after_download.take();

        let target = match result {
            Ok(path) => {
                self.updates.retain(|u| u.id != remote.id);
                events.push(BridgeEvent::Installed {
                    id: remote.id,
                    path,
                });
                reload.map(|r| r.preferred.unwrap_or(r.previous))
            }
            Err(e) => {
                tracing::error!("Install of '{}' failed: {e}", remote.id);
                events.push(BridgeEvent::InstallFailed {
                    id: remote.id,
                    error: e.into(),
                });
                // The final path is untouched on failure, so the old file is still usable
                reload.map(|r| r.previous)
            }
        };

        if let Some(path) = target {
            self.reload(host, &path, events);
        }
    }

    fn apply_remove(
        &mut self,
        outcome: RemoveOutcome,
        host: &mut dyn CaptionHost,
        events: &mut Vec<BridgeEvent>,
    ) {
        let RemoveOutcome { id, result } = outcome;
        self.manager.refresh();
        let reload = self.reload_after_remove.take();

        match result {
            Ok(removal) => {
                self.updates.retain(|u| u.id != id);
                let file_warning = removal.file_error.as_ref().map(ToString::to_string);
                events.push(BridgeEvent::Removed {
                    id,
                    file_warning,
                });
                if reload.is_some() {
                    let next = self
                        .manager
                        .models()
                        .iter()
                        .find(|p| **p != removal.path)
                        .cloned();
                    match next {
                        Some(path) => self.reload(host, &path, events),
                        None => {
                            tracing::warn!("No caption models left after removing the active one");
                            events.push(BridgeEvent::NoModelAvailable);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Removal of '{id}' failed: {e}");
                events.push(BridgeEvent::RemoveFailed { id, error: e.into() });
                if let Some(r) = reload {
                    self.reload(host, &r.previous, events);
                }
            }
        }
    }

    fn reload(
        &self,
        host: &mut dyn CaptionHost,
        path: &Path,
        events: &mut Vec<BridgeEvent>,
    ) {
        let candidate = if path.exists() {
            Some(path)
        } else {
            self.manager.models().first().map(PathBuf::as_path)
        };

        let Some(candidate) = candidate else {
            events.push(BridgeEvent::NoModelAvailable);
            return;
        };

        if host.load_model(candidate) {
            tracing::info!("Loaded model: {}", candidate.display());
            host.start_audio();
            events.push(BridgeEvent::ModelLoaded {
                path: candidate.to_path_buf(),
            });
        } else {
            tracing::error!("Failed to load model: {}", candidate.display());
            events.push(BridgeEvent::ModelLoadFailed {
                path: candidate.to_path_buf(),
            });
        }
    }

    /// Join every background worker (bridge and manager)
    pub async fn shutdown(&mut self) {
        self.app_update.join().await;
        self.manager.shutdown().await;
    }
}

/// Stop everything holding the active model open, in dependency order
fn unload_active(host: &mut dyn CaptionHost) {
    if let Some(active) = host.active_model() {
        tracing::info!("Unloading active model {} before replacing it", active.display());
    }
    host.stop_audio();
    host.stop_engine();
    host.clear_captions();
    host.release_active();
}

