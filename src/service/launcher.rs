use super::ServiceError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READY_POLL: Duration = Duration::from_millis(250);
const HOST: &str = "127.0.0.1";

/// Everything needed to spawn one inference server
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub binary: PathBuf,
    pub model_path: PathBuf,
    pub gpu_layers: u32,
    pub ctx_size: u32,
}

/// A live inference server process
#[async_trait]
pub trait ServiceProcess: Send + Sync {
    fn base_url(&self) -> String;

    /// False once the process has exited on its own
    fn is_running(&mut self) -> bool;

    /// Terminates the process and waits for it to exit
    async fn shutdown(&mut self);
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawns the server and returns once it accepts connections.
    ///
    /// When `cancel` fires first the process is killed and
    /// [`ServiceError::Cancelled`] is returned.
    async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ServiceProcess>, ServiceError>;
}

/// Launches `llama-server` on a free loopback port
#[derive(Debug, Clone)]
pub struct LlamaServerLauncher {
    start_timeout: Duration,
}

impl LlamaServerLauncher {
    pub fn new(start_timeout: Duration) -> Self {
        Self { start_timeout }
    }
}

async fn free_port() -> Result<u16, ServiceError> {
    let listener = TcpListener::bind((HOST, 0))
        .await
        .map_err(ServiceError::Port)?;
    let port = listener.local_addr().map_err(ServiceError::Port)?.port();
    Ok(port)
}

#[async_trait]
impl ProcessLauncher for LlamaServerLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ServiceProcess>, ServiceError> {
        let port = free_port().await?;

        let mut cmd = Command::new(&request.binary);
        cmd.arg("-m")
            .arg(&request.model_path)
            .args(["--host", HOST, "--port"])
            .arg(port.to_string())
            .arg("--ctx-size")
            .arg(request.ctx_size.to_string())
            .arg("--jinja")
            .arg("--n-gpu-layers")
            .arg(request.gpu_layers.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = request.binary.parent() {
            cmd.current_dir(dir);
        }
        debug!(binary = %request.binary.display(), port, "Spawning inference server");

        let child = cmd.spawn().map_err(|source| ServiceError::Spawn {
            binary: request.binary.clone(),
            source,
        })?;
        let mut process = LlamaServerProcess { child, port };

        match wait_ready(&mut process, self.start_timeout, cancel).await {
            Ok(()) => {
                info!(port, "Inference server ready");
                Ok(Box::new(process))
            }
            Err(e) => {
                debug!(port, error = %e, "Inference server not started, killing it");
                process.shutdown().await;
                Err(e)
            }
        }
    }
}

async fn wait_ready(
    process: &mut LlamaServerProcess,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), ServiceError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        if let Ok(Some(status)) = process.child.try_wait() {
            return Err(ServiceError::Exited(status.to_string()));
        }
        if TcpStream::connect((HOST, process.port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ServiceError::NotReady {
                port: process.port,
                timeout_secs: timeout.as_secs(),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
            _ = tokio::time::sleep(READY_POLL) => {}
        }
    }
}

struct LlamaServerProcess {
    child: Child,
    port: u16,
}

#[async_trait]
impl ServiceProcess for LlamaServerProcess {
    fn base_url(&self) -> String {
        format!("http://{}:{}", HOST, self.port)
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "Failed to kill inference server");
        }
    }
}
