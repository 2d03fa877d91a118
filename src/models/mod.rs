pub mod download;
pub mod manager;
pub mod manifest;
pub mod registry;

pub use download::{format_bytes, ModelDownloader};
pub use manager::{find_updates, InstallOutcome, ModelManager, ModelStatus, RemoveOutcome, UpdateNotice};
pub use manifest::RemoteModel;
pub use registry::{InstallRegistry, InstalledModel, Removal};
