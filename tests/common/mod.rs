#![allow(dead_code)]

use async_trait::async_trait;
use livecap::config::{ModelsConfig, UpdatesConfig};
use livecap::error::{LivecapError, Result};
use livecap::models::ModelManager;
use livecap::transport::{ProgressFn, Transport};
use livecap::{BridgeEvent, CaptionHost, ModelBridge};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::Notify;

pub const MANIFEST_URL: &str = "https://models.test/manifest.json";
pub const RELEASE_URL: &str = "https://releases.test/latest";

/// Scripted HTTP: one manifest, one release document, per-URL file bodies
#[derive(Default)]
pub struct FakeTransport {
    manifest: Mutex<String>,
    release: Mutex<String>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    fail_downloads: AtomicBool,
    gate: Option<Arc<Notify>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Downloads wait for `gate` to be notified before sending any bytes
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn set_manifest(&self, body: &str) {
        *self.manifest.lock().unwrap() = body.to_string();
    }

    pub fn set_release(&self, body: &str) {
        *self.release.lock().unwrap() = body.to_string();
    }

    pub fn serve(&self, url: &str, body: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_vec());
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get_text(&self, url: &str, _timeout: Duration) -> Result<String> {
        let body = match url {
            MANIFEST_URL => self.manifest.lock().unwrap().clone(),
            RELEASE_URL => self.release.lock().unwrap().clone(),
            _ => return Err(LivecapError::Network(format!("GET {url}: HTTP 404"))),
        };
        Ok(body)
    }

    async fn get_to_sink(
        &self,
        url: &str,
        _timeout: Duration,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: Option<&ProgressFn>,
    ) -> Result<u64> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let body = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| LivecapError::Network(format!("GET {url}: HTTP 404")))?;

        if self.fail_downloads.load(Ordering::SeqCst) {
            sink.write_all(&body[..body.len() / 2]).await?;
            return Err(LivecapError::DownloadFailed(
                "connection reset by peer".to_string(),
            ));
        }

        sink.write_all(&body).await?;
        if let Some(report) = progress {
            report(body.len() as u64, Some(body.len() as u64));
        }
        Ok(body.len() as u64)
    }
}

/// Caption host that records every call in order
#[derive(Debug)]
pub struct RecordingHost {
    pub active: Option<PathBuf>,
    pub calls: Vec<String>,
    pub load_succeeds: bool,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self {
            active: None,
            calls: Vec::new(),
            load_succeeds: true,
        }
    }
}

impl RecordingHost {
    pub fn with_active(path: PathBuf) -> Self {
        Self {
            active: Some(path),
            ..Self::default()
        }
    }
}

impl CaptionHost for RecordingHost {
    fn active_model(&self) -> Option<PathBuf> {
        self.active.clone()
    }

    fn stop_audio(&mut self) {
        self.calls.push("stop_audio".to_string());
    }

    fn stop_engine(&mut self) {
        self.calls.push("stop_engine".to_string());
    }

    fn clear_captions(&mut self) {
        self.calls.push("clear_captions".to_string());
    }

    fn release_active(&mut self) {
        self.calls.push("release_active".to_string());
        self.active = None;
    }

    fn load_model(&mut self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.push(format!("load_model {name}"));
        if self.load_succeeds {
            self.active = Some(path.to_path_buf());
        }
        self.load_succeeds
    }

    fn start_audio(&mut self) {
        self.calls.push("start_audio".to_string());
    }
}

pub fn models_config(dir: &Path) -> ModelsConfig {
    ModelsConfig {
        manifest_url: MANIFEST_URL.to_string(),
        dev_manifest_url: None,
        install_dir: Some(dir.to_path_buf()),
        fetch_timeout_secs: 5,
        download_timeout_secs: 5,
    }
}

pub fn updates_config() -> UpdatesConfig {
    UpdatesConfig {
        auto_check: false,
        release_url: RELEASE_URL.to_string(),
        current_version: "0.3.0".to_string(),
    }
}

pub fn bridge(dir: &Path, transport: Arc<FakeTransport>) -> ModelBridge {
    let manager = ModelManager::new(&models_config(dir), transport, Handle::current())
        .expect("Failed to create manager");
    ModelBridge::new(manager, &updates_config())
}

/// Manifest entry JSON for `id` served from `https://models.test/<filename>`
pub fn entry(id: &str, version: &str, filename: &str) -> String {
    format!(
        r#"{{"id": "{id}", "version": "{version}", "language": "en", "url": "https://models.test/{filename}", "filename": "{filename}", "size_bytes": 64, "name": "{id} model"}}"#
    )
}

pub fn manifest(entries: &[String]) -> String {
    format!(r#"{{"models": [{}]}}"#, entries.join(", "))
}

/// Tick like a render loop until all background work is drained
pub async fn drive(bridge: &mut ModelBridge, host: &mut dyn CaptionHost) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    for _ in 0..1000 {
        events.extend(bridge.tick(host));
        if !bridge.is_busy() {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("bridge still busy after 5 seconds");
}
