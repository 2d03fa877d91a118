use crate::error::{LivecapError, Result};
use crate::models::manifest::{is_bare_filename, RemoteModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Name of the durable install index inside the models directory
pub const INDEX_FILE_NAME: &str = "installed.json";

/// Installed version of a model, keyed by remote id in the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledModel {
    pub version: String,
    pub filename: String,
    #[serde(default)]
    pub installed_at: String,
}

/// On-disk shape of the index; unknown fields are ignored on read
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    models: Vec<IndexRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexRecord {
    id: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    installed_at: String,
}

/// Outcome of a successful `remove_installed`
///
/// The id is no longer tracked. `file_error` is set when the model file
/// could not be deleted afterwards and is left orphaned on disk.
#[derive(Debug)]
pub struct Removal {
    pub id: String,
    pub path: PathBuf,
    pub file_error: Option<LivecapError>,
}

impl Removal {
    #[must_use]
    pub const fn file_removed(&self) -> bool {
        self.file_error.is_none()
    }
}

/// Persisted map of installed models
///
/// The map and its durable file are guarded by one lock. Every mutation
/// writes the whole index (tmp + rename) before releasing it, so no reader
/// sees a state whose write has not been issued.
#[derive(Debug)]
pub struct InstallRegistry {
    models_dir: PathBuf,
    index_path: PathBuf,
    installed: Mutex<BTreeMap<String, InstalledModel>>,
}

impl InstallRegistry {
    /// Load the index from `models_dir`
    ///
    /// Never fails: a missing or unreadable index yields an empty registry.
    #[must_use]
    pub fn load(models_dir: &Path) -> Self {
        let index_path = models_dir.join(INDEX_FILE_NAME);
        let installed = read_index(&index_path);

        tracing::debug!(
            "Loaded install index {} ({} model(s))",
            index_path.display(),
            installed.len()
        );

        Self {
            models_dir: models_dir.to_path_buf(),
            index_path,
            installed: Mutex::new(installed),
        }
    }

    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Point-in-time copy of the installed map
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, InstalledModel> {
        self.lock().clone()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<InstalledModel> {
        self.lock().get(id).cloned()
    }

    #[must_use]
    pub fn is_installed(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Id whose installed filename is `filename`, if any
    #[must_use]
    pub fn id_for_filename(&self, filename: &str) -> Option<String> {
        self.lock()
            .iter()
            .find(|(_, m)| m.filename == filename)
            .map(|(id, _)| id.clone())
    }

    /// Record (or replace) the installed version of `remote`
    pub fn record_install(&self, remote: &RemoteModel, local_path: &Path) -> Result<()> {
        let filename = local_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| {
                LivecapError::Other(format!(
                    "Installed path has no file name: {}",
                    local_path.display()
                ))
            })?;

        let entry = InstalledModel {
            version: remote.version.clone(),
            filename,
            installed_at: chrono::Utc::now().to_rfc3339(),
        };

        let mut installed = self.lock();
        let previous = installed.insert(remote.id.clone(), entry);

        if let Err(e) = write_index(&self.index_path, &installed) {
            // Keep memory in step with the durable file
            match previous {
                Some(prev) => installed.insert(remote.id.clone(), prev),
                None => installed.remove(&remote.id),
            };
            return Err(e);
        }

        tracing::info!(
            "Recorded install of '{}' version '{}'",
            remote.id,
            remote.version
        );
        Ok(())
    }

    /// Stop tracking `id`, then delete its model file
    ///
    /// The index is persisted before the file is touched. A failed deletion
    /// still counts as success and is reported through `Removal::file_error`.
    pub fn remove_installed(&self, id: &str) -> Result<Removal> {
        let removed = {
            let mut installed = self.lock();
            let removed = installed
                .remove(id)
                .ok_or_else(|| LivecapError::NotFound(format!("Model '{id}' is not installed")))?;

            if let Err(e) = write_index(&self.index_path, &installed) {
                installed.insert(id.to_string(), removed);
                return Err(e);
            }
            removed
        };

        let path = self.models_dir.join(&removed.filename);
        let file_error = match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("Removed model '{id}' ({})", path.display());
                None
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Removed model '{id}' (file was already gone)");
                None
            }
            Err(e) => {
                tracing::warn!(
                    "Model '{id}' untracked but {} could not be deleted: {e}",
                    path.display()
                );
                Some(LivecapError::FileRemovalFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        Ok(Removal {
            id: id.to_string(),
            path,
            file_error,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, InstalledModel>> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_index(path: &Path) -> BTreeMap<String, InstalledModel> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            tracing::warn!("Failed to read install index {}: {e}", path.display());
            return BTreeMap::new();
        }
    };

    let index: IndexFile = match serde_json::from_str(&content) {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!(
                "Install index {} is malformed, treating as empty: {e}",
                path.display()
            );
            return BTreeMap::new();
        }
    };

    index
        .models
        .into_iter()
        .filter(|r| !r.id.is_empty() && !r.filename.is_empty())
        .filter(|r| {
            let bare = is_bare_filename(&r.filename);
            if !bare {
                tracing::warn!(
                    "Ignoring index entry '{}': filename '{}' points outside the models folder",
                    r.id,
                    r.filename
                );
            }
            bare
        })
        .map(|r| {
            (
                r.id,
                InstalledModel {
                    version: r.version,
                    filename: r.filename,
                    installed_at: r.installed_at,
                },
            )
        })
        .collect()
}

/// Write the whole index atomically (tmp + fsync + rename)
fn write_index(path: &Path, installed: &BTreeMap<String, InstalledModel>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let index = IndexFile {
        models: installed
            .iter()
            .map(|(id, m)| IndexRecord {
                id: id.clone(),
                version: m.version.clone(),
                filename: m.filename.clone(),
                installed_at: m.installed_at.clone(),
            })
            .collect(),
    };
    let content = serde_json::to_string_pretty(&index)
        .map_err(|e| LivecapError::Other(format!("Failed to serialize install index: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(content.as_bytes())?;
        file.sync_all()
    });
    if let Err(e) = written {
        fs::remove_file(&tmp_path).ok();
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        fs::remove_file(&tmp_path).ok();
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn remote(id: &str, version: &str, filename: &str) -> RemoteModel {
        RemoteModel {
            id: id.to_string(),
            version: version.to_string(),
            url: format!("https://x/{filename}"),
            filename: filename.to_string(),
            ..RemoteModel::default()
        }
    }

    #[test]
    fn test_load_missing_index_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_load_malformed_index_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(INDEX_FILE_NAME), "{ not json").unwrap();

        let registry = InstallRegistry::load(temp_dir.path());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_record_install_is_idempotent_upsert() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());
        let path = temp_dir.path().join("en.april");

        registry.record_install(&remote("en-base", "1", "en.april"), &path).unwrap();
        registry.record_install(&remote("en-base", "2", "en.april"), &path).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["en-base"].version, "2");
        assert_eq!(snapshot["en-base"].filename, "en.april");
        assert!(!snapshot["en-base"].installed_at.is_empty());
    }

    #[test]
    fn test_round_trip_through_reload() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());
        registry
            .record_install(&remote("en-base", "1", "en.april"), &temp_dir.path().join("en.april"))
            .unwrap();
        registry
            .record_install(&remote("fr", "3", "fr.onnx"), &temp_dir.path().join("fr.onnx"))
            .unwrap();

        let reloaded = InstallRegistry::load(temp_dir.path());
        assert_eq!(reloaded.snapshot(), registry.snapshot());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join(INDEX_FILE_NAME),
            r#"{"format": 2, "models": [{"id": "a", "version": "1", "filename": "a.april", "sha256": "ff"}]}"#,
        )
        .unwrap();

        let registry = InstallRegistry::load(temp_dir.path());
        let entry = registry.get("a").unwrap();
        assert_eq!(entry.version, "1");
        assert_eq!(entry.filename, "a.april");
        assert!(entry.installed_at.is_empty());
    }

    #[test]
    fn test_stale_tmp_file_does_not_affect_reload() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());
        registry
            .record_install(&remote("en-base", "1", "en.april"), &temp_dir.path().join("en.april"))
            .unwrap();

        // Crash after writing the tmp file but before the rename
        fs::write(temp_dir.path().join("installed.json.tmp"), "{\"models\": [").unwrap();

        let reloaded = InstallRegistry::load(temp_dir.path());
        assert_eq!(reloaded.get("en-base").unwrap().version, "1");
    }

    #[test]
    fn test_failed_persist_leaves_memory_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());

        // A non-empty directory at the index path makes the rename fail
        let blocker = temp_dir.path().join(INDEX_FILE_NAME);
        fs::create_dir_all(blocker.join("occupied")).unwrap();

        let result = registry.record_install(
            &remote("en-base", "1", "en.april"),
            &temp_dir.path().join("en.april"),
        );
        assert!(result.is_err());
        assert!(!registry.is_installed("en-base"));
        assert!(!temp_dir.path().join("installed.json.tmp").exists());
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());
        registry
            .record_install(&remote("en-base", "1", "en.april"), &temp_dir.path().join("en.april"))
            .unwrap();
        fs::write(temp_dir.path().join("en.april"), "model").unwrap();
        let before = fs::read_to_string(registry.index_path()).unwrap();

        let result = registry.remove_installed("nope");
        assert!(matches!(result, Err(LivecapError::NotFound(_))));
        assert!(registry.is_installed("en-base"));
        assert!(temp_dir.path().join("en.april").exists());
        assert_eq!(fs::read_to_string(registry.index_path()).unwrap(), before);
    }

    #[test]
    fn test_remove_deletes_file_and_entry() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());
        let path = temp_dir.path().join("en.april");
        fs::write(&path, "model").unwrap();
        registry.record_install(&remote("en-base", "1", "en.april"), &path).unwrap();

        let removal = registry.remove_installed("en-base").unwrap();
        assert!(removal.file_removed());
        assert_eq!(removal.path, path);
        assert!(!path.exists());
        assert!(!InstallRegistry::load(temp_dir.path()).is_installed("en-base"));
    }

    #[test]
    fn test_remove_succeeds_when_file_deletion_fails() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());
        // A directory in place of the model file cannot be removed with remove_file
        let path = temp_dir.path().join("en.april");
        fs::create_dir_all(path.join("locked")).unwrap();
        registry.record_install(&remote("en-base", "1", "en.april"), &path).unwrap();

        let removal = registry.remove_installed("en-base").unwrap();
        assert!(matches!(
            removal.file_error,
            Some(LivecapError::FileRemovalFailed { .. })
        ));
        assert!(!registry.is_installed("en-base"));
        assert!(!InstallRegistry::load(temp_dir.path()).is_installed("en-base"));
        assert!(path.exists());
    }

    #[test]
    fn test_id_for_filename() {
        let temp_dir = TempDir::new().unwrap();
        let registry = InstallRegistry::load(temp_dir.path());
        registry
            .record_install(&remote("fr", "1", "fr.onnx"), &temp_dir.path().join("fr.onnx"))
            .unwrap();

        assert_eq!(registry.id_for_filename("fr.onnx").as_deref(), Some("fr"));
        assert!(registry.id_for_filename("other.onnx").is_none());
    }

    #[test]
    fn test_index_entries_escaping_models_dir_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let models_dir = temp_dir.path().join("models");
        fs::create_dir_all(&models_dir).unwrap();
        let outside = temp_dir.path().join("keep.txt");
        fs::write(&outside, "not a model").unwrap();
        fs::write(
            models_dir.join(INDEX_FILE_NAME),
            r#"{"models": [
                {"id": "evil", "version": "1", "filename": "../keep.txt"},
                {"id": "ok", "version": "1", "filename": "ok.april"}
            ]}"#,
        )
        .unwrap();

        let registry = InstallRegistry::load(&models_dir);
        assert!(!registry.is_installed("evil"));
        assert!(registry.is_installed("ok"));
        assert!(matches!(
            registry.remove_installed("evil"),
            Err(LivecapError::NotFound(_))
        ));
        assert!(outside.exists());
    }

    #[test]
    fn test_concurrent_mutations_are_serialized() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        const WRITERS: usize = 8;
        let temp_dir = TempDir::new().unwrap();
        let registry = Arc::new(InstallRegistry::load(temp_dir.path()));

        // Odd ids start installed and get removed; even ids get installed
        for i in (1..WRITERS).step_by(2) {
            let filename = format!("m{i}.april");
            let path = temp_dir.path().join(&filename);
            fs::write(&path, "model").unwrap();
            registry.record_install(&remote(&format!("m{i}"), "1", &filename), &path).unwrap();
        }

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut reads = 0;
                loop {
                    let snapshot = registry.snapshot();
                    for (id, model) in &snapshot {
                        assert_eq!(model.filename, format!("{id}.april"));
                    }
                    reads += 1;
                    if done.load(Ordering::SeqCst) {
                        return reads;
                    }
                }
            })
        };

        let writers: Vec<_> = (0..WRITERS)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let dir = temp_dir.path().to_path_buf();
                std::thread::spawn(move || {
                    let id = format!("m{i}");
                    if i % 2 == 0 {
                        for version in 1..=5 {
                            let filename = format!("{id}.april");
                            registry
                                .record_install(&remote(&id, &version.to_string(), &filename), &dir.join(&filename))
                                .unwrap();
                        }
                    } else {
                        registry.remove_installed(&id).unwrap();
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        assert!(reader.join().unwrap() > 0);

        let expected: Vec<(String, String)> = (0..WRITERS)
            .step_by(2)
            .map(|i| (format!("m{i}"), "5".to_string()))
            .collect();
        let versions = |map: BTreeMap<String, InstalledModel>| -> Vec<(String, String)> {
            map.into_iter().map(|(id, m)| (id, m.version)).collect()
        };

        assert_eq!(versions(registry.snapshot()), expected);
        assert_eq!(versions(InstallRegistry::load(temp_dir.path()).snapshot()), expected);
        assert!(!temp_dir.path().join("installed.json.tmp").exists());
    }
}
