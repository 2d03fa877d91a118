#![allow(clippy::multiple_crate_versions)]

pub mod app_update;
pub mod bridge;
pub mod config;
pub mod error;
pub mod models;
pub mod task;
pub mod transport;

pub use bridge::{BridgeEvent, CaptionHost, EventError, ModelBridge};
pub use error::{LivecapError, Result};
