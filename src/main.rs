#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use livecap::config::Config;
use livecap::error::{LivecapError, Result};
use livecap::models::manager::{language_from_filename, suggest};
use livecap::models::{format_bytes, ModelManager, ModelStatus, RemoteModel};
use livecap::transport::ReqwestTransport;
use livecap::{BridgeEvent, CaptionHost, ModelBridge};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

/// One UI frame
const FRAME: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(name = "livecap")]
#[command(about = "Live caption model manager", long_about = None)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List model files in the install folder (default)
    List,
    /// Show models offered by the manifest
    Available,
    /// Install or reinstall a model from the manifest
    Install { id: String },
    /// Remove an installed model
    Remove { id: String },
    /// Check installed models against the manifest
    Updates,
    /// Check for a newer application release
    CheckUpdate,
    /// Print the install folder
    Dir,
}

/// Host without audio or engine; nothing is ever loaded
#[derive(Debug, Default)]
struct HeadlessHost;

impl CaptionHost for HeadlessHost {
    fn active_model(&self) -> Option<PathBuf> {
        None
    }

    fn stop_audio(&mut self) {}

    fn stop_engine(&mut self) {}

    fn clear_captions(&mut self) {}

    fn release_active(&mut self) {}

    fn load_model(&mut self, path: &Path) -> bool {
        tracing::debug!("Headless mode, not loading {}", path.display());
        false
    }

    fn start_audio(&mut self) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let transport = Arc::new(ReqwestTransport::new()?);
    let manager = ModelManager::new(&config.models, transport, Handle::current())?;
    let mut bridge = ModelBridge::new(manager, &config.updates);
    let mut host = HeadlessHost;

    let result = match cli.command {
        None | Some(Commands::List) => {
            list_local(&bridge);
            Ok(())
        }
        Some(Commands::Dir) => {
            println!("{}", bridge.manager().install_dir().display());
            Ok(())
        }
        Some(Commands::Available) => list_available(&mut bridge, &mut host).await,
        Some(Commands::Install { id }) => install(&mut bridge, &mut host, &id).await,
        Some(Commands::Remove { id }) => remove(&mut bridge, &mut host, &id).await,
        Some(Commands::Updates) => updates(&mut bridge, &mut host).await,
        Some(Commands::CheckUpdate) => check_update(&mut bridge, &mut host).await,
    };

    bridge.shutdown().await;

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

/// Tick the bridge once per frame until no background work is left
async fn drive(
    bridge: &mut ModelBridge,
    host: &mut HeadlessHost,
    bar: Option<&ProgressBar>,
) -> Vec<BridgeEvent> {
    let mut frame = tokio::time::interval(FRAME);
    let mut events = Vec::new();

    loop {
        frame.tick().await;
        events.extend(bridge.tick(host));

        if let Some(bar) = bar {
            let (done, total) = bridge.manager().download_progress();
            if total > 0 {
                bar.set_length(total);
            }
            bar.set_position(done);
        }

        if !bridge.is_busy() {
            return events;
        }
    }
}

fn list_local(bridge: &ModelBridge) {
    let manager = bridge.manager();
    let registry = manager.registry();

    if manager.models().is_empty() {
        println!("No models in {}", manager.install_dir().display());
        return;
    }

    for path in manager.models() {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tracked = registry.id_for_filename(&filename).and_then(|id| {
            registry
                .get(&id)
                .map(|model| format!("{id} v{}", model.version))
        });

        println!(
            "{filename:<32} [{}] {}",
            language_from_filename(path),
            tracked.unwrap_or_else(|| "untracked".to_string())
        );
    }
}

async fn fetch_manifest(
    bridge: &mut ModelBridge,
    host: &mut HeadlessHost,
) -> Result<Vec<RemoteModel>> {
    tracing::info!("Fetching manifest from {}", bridge.manager().manifest_url());
    bridge.request_fetch();
    for event in drive(bridge, host, None).await {
        if let BridgeEvent::ManifestFailed { error } = event {
            return Err(error.into_error());
        }
    }
    Ok(bridge.manifest().to_vec())
}

async fn list_available(bridge: &mut ModelBridge, host: &mut HeadlessHost) -> Result<()> {
    let manifest = fetch_manifest(bridge, host).await?;

    for remote in &manifest {
        let status = match bridge.manager().model_status(remote) {
            ModelStatus::Available => String::new(),
            ModelStatus::Installed => "installed".to_string(),
            ModelStatus::UpdateAvailable { installed } => {
                format!("update {installed} -> {}", remote.version)
            }
            ModelStatus::Untracked => "present, untracked".to_string(),
        };

        println!(
            "{:<20} {:<28} {:>10}  {}",
            remote.id,
            remote.display_name(),
            format_bytes(remote.size_bytes),
            status
        );
    }
    Ok(())
}

async fn install(bridge: &mut ModelBridge, host: &mut HeadlessHost, id: &str) -> Result<()> {
    let manifest = fetch_manifest(bridge, host).await?;
    let Some(remote) = manifest.iter().find(|m| m.id == id).cloned() else {
        let hint = suggest(id, &manifest)
            .map(|s| format!(" (did you mean '{s}'?)"))
            .unwrap_or_default();
        return Err(LivecapError::NotFound(format!("{id}{hint}")));
    };

    let bar = ProgressBar::new(remote.size_bytes);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    ) {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(remote.display_name().to_string());

    if !bridge.request_install(remote, host) {
        return Err(LivecapError::Other("A download is already running".to_string()));
    }

    let events = drive(bridge, host, Some(&bar)).await;
    bar.finish_and_clear();

    for event in events {
        match event {
            BridgeEvent::Installed { id, path } => {
                println!("Installed {id} to {}", path.display());
            }
            BridgeEvent::InstallFailed { error, .. } => {
                return Err(error.into_error());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn remove(bridge: &mut ModelBridge, host: &mut HeadlessHost, id: &str) -> Result<()> {
    if !bridge.request_remove(id, host) {
        return Err(LivecapError::Other("A removal is already running".to_string()));
    }

    for event in drive(bridge, host, None).await {
        match event {
            BridgeEvent::Removed { id, file_warning } => {
                println!("Removed {id}");
                if let Some(warning) = file_warning {
                    eprintln!("Warning: {warning}");
                }
            }
            BridgeEvent::RemoveFailed { error, .. } => {
                return Err(error.into_error());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn updates(bridge: &mut ModelBridge, host: &mut HeadlessHost) -> Result<()> {
    bridge.start_background_checks();

    let mut failure = None;
    for event in drive(bridge, host, None).await {
        match event {
            BridgeEvent::UpdatesFound { updates } if updates.is_empty() => {
                println!("All installed models are up to date");
            }
            BridgeEvent::UpdatesFound { updates } => {
                for update in updates {
                    println!(
                        "{:<20} {} -> {}",
                        update.id, update.installed_version, update.available_version
                    );
                }
            }
            BridgeEvent::UpdateScanFailed { error } => failure = Some(error),
            BridgeEvent::ReleaseChecked { check } if check.newer => {
                println!("New livecap release {}: {}", check.latest_tag, check.latest_url);
            }
            BridgeEvent::ReleaseCheckFailed { error } => {
                tracing::warn!("Release check failed: {error}");
            }
            _ => {}
        }
    }

    failure.map_or(Ok(()), |error| Err(error.into_error()))
}

async fn check_update(bridge: &mut ModelBridge, host: &mut HeadlessHost) -> Result<()> {
    bridge.request_app_update_check();

    for event in drive(bridge, host, None).await {
        match event {
            BridgeEvent::ReleaseChecked { check } if check.newer => {
                println!(
                    "New release {} (running {}): {}",
                    check.latest_tag, check.current_version, check.latest_url
                );
            }
            BridgeEvent::ReleaseChecked { check } => {
                println!("Up to date ({})", check.current_version);
            }
            BridgeEvent::ReleaseCheckFailed { error } => {
                return Err(error.into_error());
            }
            _ => {}
        }
    }
    Ok(())
}
