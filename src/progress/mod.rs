//! Progress reporting for setup operations

mod handler;
mod logging;
mod slot;

pub use handler::{NoOpHandler, ProgressEvent, ProgressHandler};
pub use logging::LoggingHandler;
pub use slot::{DownloadProgress, ProgressSlot};
