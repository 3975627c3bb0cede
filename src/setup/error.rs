use super::session::SetupPhase;
use crate::bench::BenchmarkError;
use crate::provision::ProvisionError;
use crate::service::ServiceError;
use crate::settings::SettingsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Download failed: {0}")]
    Download(#[source] ProvisionError),

    #[error("Install failed: {0}")]
    Install(#[source] ProvisionError),

    #[error("Benchmark of {label} failed: {source}")]
    Benchmark {
        label: String,
        #[source]
        source: BenchmarkError,
    },

    #[error("All {attempted} compute candidates failed: {}", failures.join("; "))]
    AggregateBenchmarkFailure {
        attempted: usize,
        failures: Vec<String>,
    },

    #[error("Service failed to start: {0}")]
    ServiceStart(#[from] ServiceError),

    #[error("Setup cancelled")]
    Cancelled,

    #[error("A setup session is already running")]
    SessionActive,

    #[error("Cannot {action} while setup is {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: SetupPhase,
    },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Tier {0} does not exist")]
    InvalidTier(u8),

    #[error("No model has been set up yet")]
    NotConfigured,

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl SetupError {
    /// Failures the user can retry without starting over
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SetupError::Download(_)
                | SetupError::Install(_)
                | SetupError::AggregateBenchmarkFailure { .. }
                | SetupError::ServiceStart(_)
        )
    }
}

impl From<ProvisionError> for SetupError {
    fn from(e: ProvisionError) -> Self {
        if e.is_cancelled() {
            SetupError::Cancelled
        } else if e.is_download() {
            SetupError::Download(e)
        } else {
            SetupError::Install(e)
        }
    }
}
