//! Compute configuration value types shared by every stage of setup

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Layer count passed to the runtime when every layer should be offloaded
pub const ALL_GPU_LAYERS: u32 = 999;

/// How inference work is split between CPU and GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeMode {
    Cpu,
    Gpu,
    Hybrid,
}

impl ComputeMode {
    pub fn uses_gpu(self) -> bool {
        matches!(self, ComputeMode::Gpu | ComputeMode::Hybrid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComputeMode::Cpu => "cpu",
            ComputeMode::Gpu => "gpu",
            ComputeMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ComputeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComputeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(ComputeMode::Cpu),
            "gpu" => Ok(ComputeMode::Gpu),
            "hybrid" => Ok(ComputeMode::Hybrid),
            other => Err(format!(
                "Invalid compute mode: {}. Valid options: cpu, gpu, hybrid",
                other
            )),
        }
    }
}

/// GPU acceleration API used by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    None,
    Cuda,
    Vulkan,
    Metal,
}

impl GpuBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            GpuBackend::None => "none",
            GpuBackend::Cuda => "cuda",
            GpuBackend::Vulkan => "vulkan",
            GpuBackend::Metal => "metal",
        }
    }

    /// Portable GPU backend for the current platform
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            GpuBackend::Metal
        } else {
            GpuBackend::Vulkan
        }
    }
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(GpuBackend::None),
            "cuda" => Ok(GpuBackend::Cuda),
            "vulkan" => Ok(GpuBackend::Vulkan),
            "metal" => Ok(GpuBackend::Metal),
            other => Err(format!(
                "Invalid GPU backend: {}. Valid options: none, cuda, vulkan, metal",
                other
            )),
        }
    }
}

/// CUDA toolkit generation the runtime package was built against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CudaVersion {
    #[default]
    #[serde(rename = "12.4")]
    V12_4,
    #[serde(rename = "13.1")]
    V13_1,
}

impl CudaVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            CudaVersion::V12_4 => "12.4",
            CudaVersion::V13_1 => "13.1",
        }
    }

    /// Unknown versions fall back to 12.4, the widest-compatible build
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("13.1") => CudaVersion::V13_1,
            _ => CudaVersion::V12_4,
        }
    }
}

impl fmt::Display for CudaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CudaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "12.4" => Ok(CudaVersion::V12_4),
            "13.1" => Ok(CudaVersion::V13_1),
            other => Err(format!(
                "Invalid CUDA version: {}. Valid options: 12.4, 13.1",
                other
            )),
        }
    }
}

/// The (compute mode, GPU backend, CUDA version) triple that selects a runtime build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeConfig {
    pub compute_mode: ComputeMode,
    pub gpu_backend: GpuBackend,
    pub cuda_version: CudaVersion,
}

impl ComputeConfig {
    pub fn cpu() -> Self {
        Self {
            compute_mode: ComputeMode::Cpu,
            gpu_backend: GpuBackend::None,
            cuda_version: CudaVersion::default(),
        }
    }

    pub fn gpu(backend: GpuBackend) -> Self {
        Self {
            compute_mode: ComputeMode::Gpu,
            gpu_backend: backend,
            cuda_version: CudaVersion::default(),
        }
    }

    pub fn hybrid(backend: GpuBackend) -> Self {
        Self {
            compute_mode: ComputeMode::Hybrid,
            gpu_backend: backend,
            cuda_version: CudaVersion::default(),
        }
    }

    pub fn with_cuda_version(mut self, version: CudaVersion) -> Self {
        self.cuda_version = version;
        self
    }

    /// Canonical form: CPU ignores the backend, non-CUDA backends ignore the CUDA version
    pub fn normalized(self) -> Self {
        match (self.compute_mode, self.gpu_backend) {
            (ComputeMode::Cpu, _) => Self::cpu(),
            (_, GpuBackend::Cuda) => self,
            (mode, backend) => Self {
                compute_mode: mode,
                gpu_backend: backend,
                cuda_version: CudaVersion::default(),
            },
        }
    }

    /// Directory name of the runtime build serving this configuration
    pub fn runtime_variant(&self) -> String {
        if !self.compute_mode.uses_gpu() {
            return "cpu".to_string();
        }
        match self.gpu_backend {
            GpuBackend::Cuda => format!("cuda-{}", self.cuda_version),
            GpuBackend::Metal => "metal".to_string(),
            GpuBackend::Vulkan | GpuBackend::None => "vulkan".to_string(),
        }
    }

    /// Layer count handed to the runtime for a requested hybrid layer count
    pub fn effective_gpu_layers(&self, requested: u32) -> u32 {
        match self.compute_mode {
            ComputeMode::Cpu => 0,
            ComputeMode::Gpu => ALL_GPU_LAYERS,
            ComputeMode::Hybrid => requested,
        }
    }
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for ComputeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.compute_mode, self.gpu_backend) {
            (ComputeMode::Cpu, _) => write!(f, "cpu"),
            (mode, GpuBackend::Cuda) => write!(f, "{}/cuda-{}", mode, self.cuda_version),
            (mode, backend) => write!(f, "{}/{}", mode, backend),
        }
    }
}

/// One compute configuration to try during the benchmark sweep
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeCandidate {
    pub label: String,
    #[serde(flatten)]
    pub config: ComputeConfig,
}

impl ComputeCandidate {
    pub fn new(label: impl Into<String>, config: ComputeConfig) -> Self {
        Self {
            label: label.into(),
            config,
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.config.compute_mode == ComputeMode::Cpu
    }
}

/// A benchmark result for one candidate, in the order it was measured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkEntry {
    pub candidate: ComputeCandidate,
    pub tokens_per_second: f64,
    pub recommended_tier: u8,
    pub recommended_model_id: String,
}

/// Everything the service needs to launch: which model, on which engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    pub model_id: String,
    #[serde(flatten)]
    pub compute: ComputeConfig,
    pub gpu_layers: u32,
}

impl LaunchConfig {
    pub fn new(model_id: impl Into<String>, compute: ComputeConfig, gpu_layers: u32) -> Self {
        Self {
            model_id: model_id.into(),
            compute,
            gpu_layers,
        }
    }

    /// Compares the hardware half of two launch configurations.
    ///
    /// Layer counts only matter in hybrid mode and the CUDA version only for
    /// the CUDA backend.
    pub fn same_hardware(&self, other: &LaunchConfig) -> bool {
        let a = self.compute.normalized();
        let b = other.compute.normalized();
        if a != b {
            return false;
        }
        a.compute_mode != ComputeMode::Hybrid || self.gpu_layers == other.gpu_layers
    }
}

/// Installation state of one runtime build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRecord {
    #[serde(flatten)]
    pub config: ComputeConfig,
    pub installed: bool,
    pub dir: std::path::PathBuf,
}
