use super::download::DownloadError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Download(DownloadError),

    #[error("Failed to install {target}: {reason}")]
    Install { target: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not installed")]
    NotFound(String),

    #[error("{0} is used by the running service")]
    InUse(String),

    #[error("Provisioning cancelled")]
    Cancelled,
}

impl ProvisionError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn install(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Install {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvisionError::Cancelled)
    }

    /// Whether the failure came from fetching rather than installing
    pub fn is_download(&self) -> bool {
        matches!(self, ProvisionError::Download(_))
    }
}

impl From<DownloadError> for ProvisionError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::Cancelled => ProvisionError::Cancelled,
            other => ProvisionError::Download(other),
        }
    }
}
