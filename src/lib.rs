//! reader-llm - local inference engine setup and supervision
//!
//! This library finds the fastest way to run a local language model on the
//! current machine and keeps a llama.cpp server running for it. It probes the
//! host, benchmarks every usable compute backend with a small reference model,
//! maps the measured throughput to a model tier and installs and starts the
//! chosen model.
//!
//! # Core Concepts
//!
//! - **Compute candidates**: CPU, full GPU and hybrid configurations the host
//!   can plausibly run, each served by its own runtime build
//! - **Tiers**: six catalog models ordered by size; throughput and memory
//!   decide which one a machine gets
//! - **Setup session**: one cancellable run through detection, benchmarking,
//!   selection, installation and service start
//!
//! # Example Usage
//!
//! ```ignore
//! use reader_llm::setup::SetupOrchestrator;
//!
//! async fn run(orchestrator: SetupOrchestrator) -> anyhow::Result<()> {
//!     let session = orchestrator.start_setup().await?;
//!     println!("Recommended: {:?}", session.recommended_model_id);
//!
//!     let done = orchestrator.confirm_selection(None).await?;
//!     println!("Setup finished in phase {}", done.phase);
//!     Ok(())
//! }
//! ```
//!
//! # Project Structure
//!
//! - [`hardware`]: host probing
//! - [`engine`]: compute configurations, candidates, catalog and tiers
//! - [`provision`]: downloading and installing runtimes and models
//! - [`bench`]: throughput measurement
//! - [`service`]: the inference server process
//! - [`setup`]: the setup state machine tying it all together

pub mod bench;
pub mod cli;
pub mod config;
pub mod engine;
pub mod hardware;
pub mod progress;
pub mod provision;
pub mod service;
pub mod settings;
pub mod setup;
#[doc(hidden)]
pub mod testing;
pub mod util;

// Re-export key types for convenient access
pub use bench::{BenchmarkError, BenchmarkRunner, LlamaBenchRunner};
pub use config::{ConfigError, EngineConfig};
pub use engine::{
    ComputeCandidate, ComputeConfig, ComputeMode, CudaVersion, GpuBackend, LaunchConfig,
    TierSelector,
};
pub use hardware::{HardwareProbe, HardwareProfile, SystemProbe};
pub use progress::{DownloadProgress, ProgressEvent, ProgressHandler, ProgressSlot};
pub use provision::{ModelProvisioner, ProvisionError, RuntimeProvisioner};
pub use service::{ServiceController, ServiceError, ServiceState};
pub use settings::{DesiredConfig, SettingsStore};
pub use setup::{SetupError, SetupOrchestrator, SetupPhase, SetupSession};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_exists() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name_is_reader_llm() {
        assert_eq!(NAME, "reader-llm");
    }
}
