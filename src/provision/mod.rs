//! Getting runtime packages and model files onto disk

pub mod archive;
pub mod download;
mod error;
pub mod model;
pub mod runtime;

pub use download::{DownloadError, Downloader};
pub use error::ProvisionError;
pub use model::{InstalledModel, LocalModelStore, ModelProvisioner};
pub use runtime::{LocalRuntimeStore, RuntimeProvisioner, RuntimeTool};
