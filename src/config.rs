//! Configuration management for reader-llm
//!
//! Settings are loaded from environment variables with sensible defaults.
//! They cover storage locations, runtime launch parameters and the candidate
//! policy used during setup.
//!
//! # Environment Variables
//!
//! - `READER_LLM_DATA_DIR`: Data root - default: platform data dir + "reader-llm"
//! - `READER_LLM_MODELS_DIR`: Model files - default: `<data>/llm/models`
//! - `READER_LLM_RESOURCE_DIR`: Bundled runtimes and models shipped with the app
//! - `READER_LLM_GPU_LAYERS`: Layers offloaded in hybrid mode - default: "20"
//! - `READER_LLM_CUDA_VERSION`: CUDA runtime build (12.4|13.1) - default: "12.4"
//! - `READER_LLM_PREFERRED_COMPUTE`: Mode to try first (cpu|gpu|hybrid)
//! - `READER_LLM_SKIP_WEAK_GPUS`: Skip integrated/virtual GPUs - default: "false"
//! - `READER_LLM_BENCH_TOKENS`: Tokens generated per benchmark - default: "64"
//! - `READER_LLM_CTX_SIZE`: Server context size - default: "4096"
//! - `READER_LLM_START_TIMEOUT`: Seconds to wait for the server port - default: "12"
//! - `READER_LLM_MIRROR_PROBE_TIMEOUT`: Seconds per mirror HEAD probe - default: "8"
//! - `READER_LLM_ALLOW_DOWNLOAD`: Allow network downloads - default: "true"
//!
//! # Example
//!
//! ```no_run
//! use reader_llm::EngineConfig;
//!
//! let config = EngineConfig::default();
//! config.validate().expect("Invalid configuration");
//! println!("{}", config.runtime_root().display());
//! ```

use crate::engine::{CandidatePolicy, ComputeMode, CudaVersion};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_GPU_LAYERS: u32 = 20;
const DEFAULT_BENCH_TOKENS: u32 = 64;
const DEFAULT_CTX_SIZE: u32 = 4096;
const DEFAULT_START_TIMEOUT_SECS: u64 = 12;
const DEFAULT_MIRROR_PROBE_TIMEOUT_SECS: u64 = 8;
const APP_DIR_NAME: &str = "reader-llm";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Failed to parse configuration value
    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },
}

/// Engine configuration
///
/// `Default::default()` reads the `READER_LLM_*` environment variables and
/// falls back to defaults for anything unset.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub resource_dir: Option<PathBuf>,
    pub gpu_layers: u32,
    pub cuda_version: CudaVersion,
    pub preferred_compute: Option<ComputeMode>,
    pub skip_weak_gpus: bool,
    pub bench_tokens: u32,
    pub ctx_size: u32,
    pub start_timeout_secs: u64,
    pub mirror_probe_timeout_secs: u64,
    pub allow_download: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = env::var("READER_LLM_DATA_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join(APP_DIR_NAME)
            });

        let models_dir = env::var("READER_LLM_MODELS_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("llm").join("models"));

        let resource_dir = env::var("READER_LLM_RESOURCE_DIR").ok().map(PathBuf::from);

        let cuda_version =
            CudaVersion::parse_lenient(env::var("READER_LLM_CUDA_VERSION").ok().as_deref());

        let preferred_compute = env::var("READER_LLM_PREFERRED_COMPUTE")
            .ok()
            .and_then(|v| v.parse::<ComputeMode>().ok());

        Self {
            data_dir,
            models_dir,
            resource_dir,
            gpu_layers: env_parse("READER_LLM_GPU_LAYERS").unwrap_or(DEFAULT_GPU_LAYERS),
            cuda_version,
            preferred_compute,
            skip_weak_gpus: env_parse("READER_LLM_SKIP_WEAK_GPUS").unwrap_or(false),
            bench_tokens: env_parse("READER_LLM_BENCH_TOKENS").unwrap_or(DEFAULT_BENCH_TOKENS),
            ctx_size: env_parse("READER_LLM_CTX_SIZE").unwrap_or(DEFAULT_CTX_SIZE),
            start_timeout_secs: env_parse("READER_LLM_START_TIMEOUT")
                .unwrap_or(DEFAULT_START_TIMEOUT_SECS),
            mirror_probe_timeout_secs: env_parse("READER_LLM_MIRROR_PROBE_TIMEOUT")
                .unwrap_or(DEFAULT_MIRROR_PROBE_TIMEOUT_SECS),
            allow_download: env_parse("READER_LLM_ALLOW_DOWNLOAD").unwrap_or(true),
        }
    }
}

impl EngineConfig {
    /// Configuration rooted at `data_dir`, ignoring the environment
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            models_dir: data_dir.join("llm").join("models"),
            data_dir,
            resource_dir: None,
            gpu_layers: DEFAULT_GPU_LAYERS,
            cuda_version: CudaVersion::default(),
            preferred_compute: None,
            skip_weak_gpus: false,
            bench_tokens: DEFAULT_BENCH_TOKENS,
            ctx_size: DEFAULT_CTX_SIZE,
            start_timeout_secs: DEFAULT_START_TIMEOUT_SECS,
            mirror_probe_timeout_secs: DEFAULT_MIRROR_PROBE_TIMEOUT_SECS,
            allow_download: true,
        }
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any value is out of range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bench_tokens == 0 || self.bench_tokens > 4096 {
            return Err(ConfigError::ValidationFailed(
                "Benchmark tokens must be between 1 and 4096".to_string(),
            ));
        }
        if self.ctx_size < 512 {
            return Err(ConfigError::ValidationFailed(
                "Context size must be at least 512".to_string(),
            ));
        }
        if self.start_timeout_secs == 0 || self.start_timeout_secs > 600 {
            return Err(ConfigError::ValidationFailed(
                "Start timeout must be between 1 second and 10 minutes".to_string(),
            ));
        }
        if self.mirror_probe_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "Mirror probe timeout must be at least 1 second".to_string(),
            ));
        }
        if self.gpu_layers > 999 {
            return Err(ConfigError::ParseError {
                field: "READER_LLM_GPU_LAYERS".to_string(),
                error: format!("{} exceeds the maximum of 999", self.gpu_layers),
            });
        }
        Ok(())
    }

    pub fn llm_dir(&self) -> PathBuf {
        self.data_dir.join("llm")
    }

    pub fn runtime_root(&self) -> PathBuf {
        self.llm_dir().join("runtime")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.llm_dir().join("settings.json")
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn mirror_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.mirror_probe_timeout_secs)
    }

    pub fn candidate_policy(&self) -> CandidatePolicy {
        CandidatePolicy {
            preferred: self.preferred_compute,
            skip_weak_gpus: self.skip_weak_gpus,
            cuda_version: self.cuda_version,
        }
    }

    pub fn to_display_map(&self) -> std::collections::BTreeMap<String, String> {
        let mut map = std::collections::BTreeMap::new();
        map.insert("data_dir".to_string(), self.data_dir.display().to_string());
        map.insert(
            "models_dir".to_string(),
            self.models_dir.display().to_string(),
        );
        if let Some(ref dir) = self.resource_dir {
            map.insert("resource_dir".to_string(), dir.display().to_string());
        }
        map.insert("gpu_layers".to_string(), self.gpu_layers.to_string());
        map.insert("cuda_version".to_string(), self.cuda_version.to_string());
        if let Some(mode) = self.preferred_compute {
            map.insert("preferred_compute".to_string(), mode.to_string());
        }
        map.insert(
            "skip_weak_gpus".to_string(),
            self.skip_weak_gpus.to_string(),
        );
        map.insert("bench_tokens".to_string(), self.bench_tokens.to_string());
        map.insert("ctx_size".to_string(), self.ctx_size.to_string());
        map.insert(
            "allow_download".to_string(),
            self.allow_download.to_string(),
        );
        map
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Engine Configuration:")?;
        writeln!(f, "  Data Dir: {}", self.data_dir.display())?;
        writeln!(f, "  Models Dir: {}", self.models_dir.display())?;
        if let Some(ref dir) = self.resource_dir {
            writeln!(f, "  Resource Dir: {}", dir.display())?;
        }
        writeln!(f, "  GPU Layers: {}", self.gpu_layers)?;
        writeln!(f, "  CUDA Version: {}", self.cuda_version)?;
        writeln!(f, "  Benchmark Tokens: {}", self.bench_tokens)?;
        writeln!(f, "  Context Size: {}", self.ctx_size)?;
        writeln!(f, "  Downloads: {}", if self.allow_download { "allowed" } else { "disabled" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        old_value: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old_value = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                old_value,
            }
        }

        fn unset(key: &str) -> Self {
            let old_value = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                old_value,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.old_value {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    #[serial]
    fn test_default_configuration() {
        let _guards = vec![
            EnvGuard::set("READER_LLM_DATA_DIR", "/tmp/reader-llm-test"),
            EnvGuard::unset("READER_LLM_MODELS_DIR"),
            EnvGuard::unset("READER_LLM_GPU_LAYERS"),
            EnvGuard::unset("READER_LLM_CUDA_VERSION"),
            EnvGuard::unset("READER_LLM_PREFERRED_COMPUTE"),
            EnvGuard::unset("READER_LLM_ALLOW_DOWNLOAD"),
        ];

        let config = EngineConfig::default();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/reader-llm-test"));
        assert_eq!(
            config.models_dir,
            PathBuf::from("/tmp/reader-llm-test/llm/models")
        );
        assert_eq!(config.gpu_layers, DEFAULT_GPU_LAYERS);
        assert_eq!(config.cuda_version, CudaVersion::V12_4);
        assert!(config.preferred_compute.is_none());
        assert!(config.allow_download);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_environment_variable_parsing() {
        let _guards = vec![
            EnvGuard::set("READER_LLM_DATA_DIR", "/tmp/data"),
            EnvGuard::set("READER_LLM_MODELS_DIR", "/tmp/models"),
            EnvGuard::set("READER_LLM_GPU_LAYERS", "32"),
            EnvGuard::set("READER_LLM_CUDA_VERSION", "13.1"),
            EnvGuard::set("READER_LLM_PREFERRED_COMPUTE", "hybrid"),
            EnvGuard::set("READER_LLM_SKIP_WEAK_GPUS", "true"),
            EnvGuard::set("READER_LLM_ALLOW_DOWNLOAD", "false"),
        ];

        let config = EngineConfig::default();

        assert_eq!(config.models_dir, PathBuf::from("/tmp/models"));
        assert_eq!(config.gpu_layers, 32);
        assert_eq!(config.cuda_version, CudaVersion::V13_1);
        assert_eq!(config.preferred_compute, Some(ComputeMode::Hybrid));
        assert!(config.skip_weak_gpus);
        assert!(!config.allow_download);

        let policy = config.candidate_policy();
        assert!(policy.skip_weak_gpus);
        assert_eq!(policy.cuda_version, CudaVersion::V13_1);
    }

    #[test]
    #[serial]
    fn test_unknown_cuda_version_falls_back() {
        let _guard = EnvGuard::set("READER_LLM_CUDA_VERSION", "11.8");
        assert_eq!(EngineConfig::default().cuda_version, CudaVersion::V12_4);
    }

    #[test]
    fn test_derived_paths() {
        let config = EngineConfig::with_data_dir("/data");
        assert_eq!(config.llm_dir(), PathBuf::from("/data/llm"));
        assert_eq!(config.runtime_root(), PathBuf::from("/data/llm/runtime"));
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/data/llm/settings.json")
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::with_data_dir("/data");
        config.bench_tokens = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::with_data_dir("/data");
        config.start_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::with_data_dir("/data");
        config.gpu_layers = 5000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_config_display() {
        let display = format!("{}", EngineConfig::with_data_dir("/data"));
        assert!(display.contains("Engine Configuration:"));
        assert!(display.contains("GPU Layers: 20"));
    }
}
