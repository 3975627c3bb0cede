//! Scripted stand-ins for the I/O collaborators, used by unit and
//! integration tests to drive the setup flow without downloads, GPUs or
//! subprocesses.

use crate::bench::{BenchmarkError, BenchmarkOutcome, BenchmarkRequest, BenchmarkRunner};
use crate::engine::{ComputeConfig, RuntimeRecord, TierSelector};
use crate::hardware::{HardwareProbe, HardwareProfile};
use crate::provision::{
    DownloadError, InstalledModel, ModelProvisioner, ProvisionError, RuntimeProvisioner,
    RuntimeTool,
};
use crate::service::{LaunchRequest, ProcessLauncher, ServiceError, ServiceProcess};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns a fixed profile
pub struct FakeProbe {
    profile: HardwareProfile,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new(profile: HardwareProfile) -> Self {
        Self {
            profile,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HardwareProbe for FakeProbe {
    async fn probe(&self) -> HardwareProfile {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.profile.clone()
    }
}

/// Runtime store keyed by runtime variant
#[derive(Default)]
pub struct FakeRuntimes {
    installed: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    installs: AtomicUsize,
    cancels: AtomicUsize,
    root: Option<PathBuf>,
}

impl FakeRuntimes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime directories live under `root`, so tests can place real
    /// executables there
    pub fn rooted_at(root: impl Into<PathBuf>, configs: &[ComputeConfig]) -> Self {
        let fake = Self {
            root: Some(root.into()),
            ..Self::default()
        };
        lock(&fake.installed).extend(configs.iter().map(|c| c.runtime_variant()));
        fake
    }

    pub fn with_installed(configs: &[ComputeConfig]) -> Self {
        let fake = Self::new();
        lock(&fake.installed).extend(configs.iter().map(|c| c.runtime_variant()));
        fake
    }

    /// Every install of this configuration fails with an install error
    pub fn fail_for(&self, config: &ComputeConfig) {
        lock(&self.failing).insert(config.runtime_variant());
    }

    pub fn heal(&self, config: &ComputeConfig) {
        lock(&self.failing).remove(&config.runtime_variant());
    }

    pub fn is_installed(&self, config: &ComputeConfig) -> bool {
        lock(&self.installed).contains(&config.runtime_variant())
    }

    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn dir(&self, config: &ComputeConfig) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| PathBuf::from("/fake/runtime"))
            .join(config.runtime_variant())
    }
}

#[async_trait]
impl RuntimeProvisioner for FakeRuntimes {
    async fn install_runtime(
        &self,
        config: &ComputeConfig,
        _source: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RuntimeRecord, ProvisionError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        let variant = config.runtime_variant();
        if lock(&self.failing).contains(&variant) {
            return Err(ProvisionError::install(variant, "scripted failure"));
        }
        lock(&self.installed).insert(variant);
        Ok(self.runtime_status(config))
    }

    async fn delete_runtime(&self, config: &ComputeConfig) -> Result<(), ProvisionError> {
        lock(&self.installed).remove(&config.runtime_variant());
        Ok(())
    }

    fn runtime_status(&self, config: &ComputeConfig) -> RuntimeRecord {
        RuntimeRecord {
            config: config.normalized(),
            installed: self.is_installed(config),
            dir: self.dir(config),
        }
    }

    fn runtime_binary(&self, config: &ComputeConfig, tool: RuntimeTool) -> Option<PathBuf> {
        self.is_installed(config)
            .then(|| self.dir(config).join(tool.binary_name()))
    }

    fn cancel_active_download(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Model store keyed by model id
#[derive(Default)]
pub struct FakeModels {
    installed: Mutex<BTreeSet<String>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    installs: Mutex<HashMap<String, usize>>,
    cancels: AtomicUsize,
    hung: Notify,
}

impl FakeModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_installed(ids: &[&str]) -> Self {
        let fake = Self::new();
        lock(&fake.installed).extend(ids.iter().map(|id| id.to_string()));
        fake
    }

    /// Every install of this model fails with a download error
    pub fn fail_for(&self, model_id: &str) {
        lock(&self.failing).insert(model_id.to_string());
    }

    pub fn heal(&self, model_id: &str) {
        lock(&self.failing).remove(model_id);
        lock(&self.hanging).remove(model_id);
    }

    /// Installs of this model block until their cancellation token fires
    pub fn hang_for(&self, model_id: &str) {
        lock(&self.hanging).insert(model_id.to_string());
    }

    /// Resolves once an install scripted with [`hang_for`](Self::hang_for)
    /// has started
    pub async fn wait_until_hung(&self) {
        self.hung.notified().await;
    }

    /// Number of times `install_model` actually fetched this id
    pub fn fetches(&self, model_id: &str) -> usize {
        lock(&self.installs).get(model_id).copied().unwrap_or(0)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn path(model_id: &str) -> PathBuf {
        PathBuf::from("/fake/models").join(format!("{}.gguf", model_id))
    }
}

#[async_trait]
impl ModelProvisioner for FakeModels {
    async fn install_model(
        &self,
        model_id: &str,
        _source: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProvisionError> {
        if lock(&self.installed).contains(model_id) {
            return Ok(Self::path(model_id));
        }
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        *lock(&self.installs).entry(model_id.to_string()).or_default() += 1;
        if lock(&self.hanging).contains(model_id) {
            self.hung.notify_one();
            cancel.cancelled().await;
            return Err(ProvisionError::Cancelled);
        }
        if lock(&self.failing).contains(model_id) {
            return Err(DownloadError::AllMirrorsFailed {
                label: model_id.to_string(),
                last: "scripted failure".to_string(),
            }
            .into());
        }
        lock(&self.installed).insert(model_id.to_string());
        Ok(Self::path(model_id))
    }

    async fn delete_model(&self, model_id: &str) -> Result<(), ProvisionError> {
        if lock(&self.installed).remove(model_id) {
            Ok(())
        } else {
            Err(ProvisionError::NotFound(model_id.to_string()))
        }
    }

    fn list_installed_models(&self) -> Result<Vec<InstalledModel>, ProvisionError> {
        Ok(lock(&self.installed)
            .iter()
            .map(|id| InstalledModel {
                model_id: id.clone(),
                file_size_bytes: 1,
            })
            .collect())
    }

    fn model_path(&self, model_id: &str) -> Option<PathBuf> {
        lock(&self.installed)
            .contains(model_id)
            .then(|| Self::path(model_id))
    }

    fn cancel_active_download(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted result for one candidate label
#[derive(Debug, Clone)]
pub enum FakeBench {
    Throughput(f64),
    Fail(String),
    /// Blocks until the cancellation token fires
    Hang,
}

/// Benchmark runner answering from a per-label script
pub struct FakeBenchmarkRunner {
    script: Mutex<HashMap<String, FakeBench>>,
    selector: TierSelector,
    runs: Mutex<Vec<String>>,
    hung: Arc<Notify>,
}

impl Default for FakeBenchmarkRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBenchmarkRunner {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            selector: TierSelector::default(),
            runs: Mutex::new(Vec::new()),
            hung: Arc::new(Notify::new()),
        }
    }

    pub fn script(self, label: &str, result: FakeBench) -> Self {
        lock(&self.script).insert(label.to_string(), result);
        self
    }

    pub fn set(&self, label: &str, result: FakeBench) {
        lock(&self.script).insert(label.to_string(), result);
    }

    /// Labels in the order they were benchmarked
    pub fn runs(&self) -> Vec<String> {
        lock(&self.runs).clone()
    }

    /// Resolves once a [`FakeBench::Hang`] run has started
    pub async fn wait_until_hung(&self) {
        self.hung.notified().await;
    }
}

#[async_trait]
impl BenchmarkRunner for FakeBenchmarkRunner {
    async fn run_benchmark(
        &self,
        request: &BenchmarkRequest,
        cancel: &CancellationToken,
    ) -> Result<BenchmarkOutcome, BenchmarkError> {
        let label = request.candidate.label.clone();
        lock(&self.runs).push(label.clone());
        let scripted = lock(&self.script).get(&label).cloned();
        match scripted {
            Some(FakeBench::Throughput(tps)) => {
                Ok(BenchmarkOutcome::from_throughput(tps, &self.selector, request))
            }
            Some(FakeBench::Fail(reason)) => Err(BenchmarkError::Failed {
                status: "exit status: 1".to_string(),
                stderr: reason,
            }),
            Some(FakeBench::Hang) => {
                self.hung.notify_one();
                cancel.cancelled().await;
                Err(BenchmarkError::Cancelled)
            }
            None => Err(BenchmarkError::RuntimeMissing(label)),
        }
    }
}

/// How a [`FakeLauncher`] delays readiness
#[derive(Debug, Clone, Copy)]
enum Readiness {
    Immediate,
    /// Never ready; returns once the cancellation token fires
    Hang,
    /// Ready after the delay, without looking at the token
    Stall(Duration),
}

/// Launcher that counts spawns instead of running anything
pub struct FakeLauncher {
    launches: AtomicUsize,
    live: Arc<AtomicUsize>,
    fail_with: Mutex<Option<String>>,
    readiness: Mutex<Readiness>,
    hung: Notify,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            fail_with: Mutex::new(None),
            readiness: Mutex::new(Readiness::Immediate),
            hung: Notify::new(),
        }
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subsequent launches exit immediately with this status
    pub fn fail(&self, status: &str) {
        *lock(&self.fail_with) = Some(status.to_string());
    }

    pub fn heal(&self) {
        *lock(&self.fail_with) = None;
        *lock(&self.readiness) = Readiness::Immediate;
    }

    /// Subsequent launches never become ready and only end on cancellation
    pub fn hang(&self) {
        *lock(&self.readiness) = Readiness::Hang;
    }

    /// Subsequent launches take `delay` to become ready and ignore
    /// cancellation meanwhile
    pub fn stall(&self, delay: Duration) {
        *lock(&self.readiness) = Readiness::Stall(delay);
    }

    /// Resolves once a launch scripted with [`hang`](Self::hang) or
    /// [`stall`](Self::stall) has started waiting
    pub async fn wait_until_hung(&self) {
        self.hung.notified().await;
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Processes launched and not yet shut down
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ServiceProcess>, ServiceError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = lock(&self.fail_with).clone() {
            return Err(ServiceError::Exited(status));
        }
        let readiness = *lock(&self.readiness);
        match readiness {
            Readiness::Immediate => {}
            Readiness::Hang => {
                self.hung.notify_one();
                cancel.cancelled().await;
                return Err(ServiceError::Cancelled);
            }
            Readiness::Stall(delay) => {
                self.hung.notify_one();
                tokio::time::sleep(delay).await;
            }
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            port: 40000 + (request.gpu_layers % 1000) as u16,
            live: Some(self.live.clone()),
        }))
    }
}

struct FakeProcess {
    port: u16,
    live: Option<Arc<AtomicUsize>>,
}

#[async_trait]
impl ServiceProcess for FakeProcess {
    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn is_running(&mut self) -> bool {
        self.live.is_some()
    }

    async fn shutdown(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
