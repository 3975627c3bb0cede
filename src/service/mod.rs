//! The long-running inference server: start, stop, status and drift

mod launcher;

pub use launcher::{LaunchRequest, LlamaServerLauncher, ProcessLauncher, ServiceProcess};

use crate::engine::{ComputeConfig, LaunchConfig};
use crate::provision::{ModelProvisioner, ProvisionError, RuntimeProvisioner, RuntimeTool};
use crate::settings::DesiredConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Model {0} is not installed")]
    ModelMissing(String),

    #[error("Runtime {0} is not installed")]
    RuntimeMissing(String),

    #[error("No free port: {0}")]
    Port(#[source] std::io::Error),

    #[error("Failed to launch {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Inference server exited during startup ({0})")]
    Exited(String),

    #[error("Inference server did not open port {port} within {timeout_secs}s")]
    NotReady { port: u16, timeout_secs: u64 },

    #[error("Inference server start cancelled")]
    Cancelled,
}

impl ServiceError {
    /// Missing prerequisites; nothing was spawned
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ServiceError::ModelMissing(_) | ServiceError::RuntimeMissing(_)
        )
    }
}

/// Live state of the inference server relative to a desired configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub running: bool,
    /// Exact configuration of the last successful start
    pub started_config: Option<LaunchConfig>,
    pub running_model_id: Option<String>,
    pub base_url: Option<String>,
    pub running_this_model: bool,
    /// The running server differs from the desired configuration
    pub config_changed: bool,
}

impl ServiceState {
    fn stopped() -> Self {
        Self {
            running: false,
            started_config: None,
            running_model_id: None,
            base_url: None,
            running_this_model: false,
            config_changed: false,
        }
    }
}

struct RunningService {
    config: LaunchConfig,
    process: Box<dyn ServiceProcess>,
}

/// Owns at most one inference server process.
///
/// Never restarts on its own when the desired configuration drifts; callers
/// use [`apply_and_restart`](Self::apply_and_restart) explicitly.
pub struct ServiceController {
    runtimes: Arc<dyn RuntimeProvisioner>,
    models: Arc<dyn ModelProvisioner>,
    launcher: Arc<dyn ProcessLauncher>,
    ctx_size: u32,
    current: Mutex<Option<RunningService>>,
}

impl ServiceController {
    pub fn new(
        runtimes: Arc<dyn RuntimeProvisioner>,
        models: Arc<dyn ModelProvisioner>,
        launcher: Arc<dyn ProcessLauncher>,
        ctx_size: u32,
    ) -> Self {
        Self {
            runtimes,
            models,
            launcher,
            ctx_size,
            current: Mutex::new(None),
        }
    }

    /// Starts the server for `config`, replacing any running one.
    ///
    /// The model is checked before the runtime and nothing is spawned unless
    /// both are installed.
    pub async fn start(&self, config: LaunchConfig) -> Result<(), ServiceError> {
        self.start_cancellable(config, &CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), but gives up and kills the new process
    /// as soon as `cancel` fires.
    pub async fn start_cancellable(
        &self,
        config: LaunchConfig,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let model_path = self
            .models
            .model_path(&config.model_id)
            .ok_or_else(|| ServiceError::ModelMissing(config.model_id.clone()))?;
        let binary = self
            .runtimes
            .runtime_binary(&config.compute, RuntimeTool::Server)
            .ok_or_else(|| ServiceError::RuntimeMissing(config.compute.runtime_variant()))?;

        let mut current = self.current.lock().await;
        if let Some(mut old) = current.take() {
            debug!(model = %old.config.model_id, "Stopping previous inference server");
            old.process.shutdown().await;
        }

        let request = LaunchRequest {
            binary,
            model_path,
            gpu_layers: config.compute.effective_gpu_layers(config.gpu_layers),
            ctx_size: self.ctx_size,
        };
        let process = self.launcher.launch(&request, cancel).await?;
        info!(
            model = %config.model_id,
            compute = %config.compute,
            url = %process.base_url(),
            "Inference service started"
        );
        *current = Some(RunningService { config, process });
        Ok(())
    }

    /// Stops the server if one is running; always safe to call
    pub async fn stop(&self) {
        let mut current = self.current.lock().await;
        if let Some(mut running) = current.take() {
            running.process.shutdown().await;
            info!(model = %running.config.model_id, "Inference service stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.status(None).await.running
    }

    /// Current state, compared against `desired` when given
    pub async fn status(&self, desired: Option<&LaunchConfig>) -> ServiceState {
        let mut current = self.current.lock().await;
        let alive = match current.as_mut() {
            Some(running) => running.process.is_running(),
            None => return ServiceState::stopped(),
        };
        if !alive {
            warn!("Inference server exited unexpectedly");
            *current = None;
            return ServiceState::stopped();
        }
        let Some(running) = current.as_ref() else {
            return ServiceState::stopped();
        };

        let started = &running.config;
        let running_this_model = desired.is_some_and(|d| d.model_id == started.model_id);
        let config_changed = desired
            .is_some_and(|d| d.model_id != started.model_id || !d.same_hardware(started));

        ServiceState {
            running: true,
            started_config: Some(started.clone()),
            running_model_id: Some(started.model_id.clone()),
            base_url: Some(running.process.base_url()),
            running_this_model,
            config_changed,
        }
    }

    /// Stops the running server and starts it again with `desired`
    pub async fn apply_and_restart(&self, desired: LaunchConfig) -> Result<(), ServiceError> {
        self.stop().await;
        self.start(desired).await
    }

    /// Starts the persisted configuration when nothing is running and it is
    /// marked for auto-start. Returns whether a server was started.
    pub async fn serve_if_stopped(&self, desired: &DesiredConfig) -> Result<bool, ServiceError> {
        if !desired.auto_start || self.is_running().await {
            return Ok(false);
        }
        self.start(desired.launch_config()).await?;
        Ok(true)
    }

    /// Deletes a model file unless the server is using it
    pub async fn delete_model(&self, model_id: &str) -> Result<(), ProvisionError> {
        let state = self.status(None).await;
        if state.running_model_id.as_deref() == Some(model_id) {
            return Err(ProvisionError::InUse(model_id.to_string()));
        }
        self.models.delete_model(model_id).await
    }

    /// Deletes a runtime, stopping the server first if it runs on it
    pub async fn delete_runtime(&self, config: &ComputeConfig) -> Result<(), ProvisionError> {
        let variant = config.runtime_variant();
        let uses_runtime = self
            .status(None)
            .await
            .started_config
            .is_some_and(|c| c.compute.runtime_variant() == variant);
        if uses_runtime {
            self.stop().await;
        }
        self.runtimes.delete_runtime(config).await
    }
}
