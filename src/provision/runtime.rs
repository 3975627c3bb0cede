//! Inference runtime packages, one directory per compute configuration

use super::archive::{self, ArchiveKind};
use super::download::{DownloadError, Downloader};
use super::ProvisionError;
use crate::engine::{ComputeConfig, ComputeMode, GpuBackend, RuntimeRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pinned llama.cpp release
pub const RUNTIME_RELEASE: &str = "b7966";

const MIRROR_BASES: [&str; 2] = [
    "https://www.modelscope.cn/datasets/Lissajous/llamacppforall/resolve/master/b7966",
    "https://github.com/ggml-org/llama.cpp/releases/download/b7966",
];

/// Oldest glibc the prebuilt Linux packages run on
const MIN_GLIBC: (u32, u32) = (2, 34);

/// Binaries shipped in a runtime package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeTool {
    Server,
    Bench,
}

impl RuntimeTool {
    pub fn binary_name(self) -> String {
        archive::exe_name(match self {
            RuntimeTool::Server => "llama-server",
            RuntimeTool::Bench => "llama-bench",
        })
    }
}

#[async_trait]
pub trait RuntimeProvisioner: Send + Sync {
    /// Ensures the runtime for `config` is installed.
    ///
    /// `source` overrides the default origin: an http(s) URL, a local archive
    /// or a local directory. Installing one configuration never touches
    /// another configuration's directory.
    async fn install_runtime(
        &self,
        config: &ComputeConfig,
        source: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RuntimeRecord, ProvisionError>;

    async fn delete_runtime(&self, config: &ComputeConfig) -> Result<(), ProvisionError>;

    fn runtime_status(&self, config: &ComputeConfig) -> RuntimeRecord;

    fn runtime_binary(&self, config: &ComputeConfig, tool: RuntimeTool) -> Option<PathBuf>;

    fn cancel_active_download(&self);
}

/// Runtimes stored under `<data>/llm/runtime/<variant>`
#[derive(Debug)]
pub struct LocalRuntimeStore {
    root: PathBuf,
    resource_dir: Option<PathBuf>,
    downloader: Arc<Downloader>,
    allow_download: bool,
}

impl LocalRuntimeStore {
    pub fn new(
        root: impl Into<PathBuf>,
        resource_dir: Option<PathBuf>,
        downloader: Arc<Downloader>,
        allow_download: bool,
    ) -> Self {
        Self {
            root: root.into(),
            resource_dir,
            downloader,
            allow_download,
        }
    }

    pub fn runtime_dir(&self, config: &ComputeConfig) -> PathBuf {
        self.root.join(config.runtime_variant())
    }

    /// Installs from a local archive or directory
    pub async fn import_runtime(
        &self,
        config: &ComputeConfig,
        path: &Path,
    ) -> Result<RuntimeRecord, ProvisionError> {
        let staging = self.staging_dir(config);
        reset_dir(&staging).await?;
        let result = self.stage_local(path, &staging).await;
        self.finish(config, &staging, result).await
    }

    fn staging_dir(&self, config: &ComputeConfig) -> PathBuf {
        self.root
            .join(format!(".{}.staging", config.runtime_variant()))
    }

    async fn stage_local(&self, path: &Path, staging: &Path) -> Result<(), ProvisionError> {
        if path.is_dir() {
            let (src, dest) = (path.to_path_buf(), staging.to_path_buf());
            tokio::task::spawn_blocking(move || archive::copy_dir(&src, &dest))
                .await
                .map_err(|e| ProvisionError::install("runtime", e))?
        } else if path.is_file() {
            archive::extract(path, staging).await
        } else {
            Err(ProvisionError::NotFound(path.display().to_string()))
        }
    }

    fn bundled_source(&self, config: &ComputeConfig) -> Option<PathBuf> {
        let runtime_dir = self.resource_dir.as_ref()?.join("runtime");
        let variant_dir = runtime_dir.join(config.runtime_variant());
        if variant_dir.is_dir() {
            return Some(variant_dir);
        }
        let names = archive_names(config, std::env::consts::OS, std::env::consts::ARCH).ok()?;
        names
            .first()
            .map(|name| runtime_dir.join(name))
            .filter(|p| p.is_file())
    }

    async fn stage_download(
        &self,
        config: &ComputeConfig,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let names = archive_names(config, std::env::consts::OS, std::env::consts::ARCH)
            .map_err(|reason| ProvisionError::install(config.runtime_variant(), reason))?;
        let downloads = self.root.join(".downloads");
        tokio::fs::create_dir_all(&downloads)
            .await
            .map_err(|e| ProvisionError::io(&downloads, e))?;

        for name in names {
            let urls: Vec<String> = MIRROR_BASES
                .iter()
                .map(|base| format!("{}/{}", base, name))
                .collect();
            let archive_path = downloads.join(&name);
            self.downloader
                .download_from_mirrors(&urls, &archive_path, &name, cancel)
                .await?;
            let extracted = archive::extract(&archive_path, staging).await;
            let _ = tokio::fs::remove_file(&archive_path).await;
            extracted?;
        }
        Ok(())
    }

    async fn stage_url(
        &self,
        url: &str,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let name = url
            .rsplit('/')
            .next()
            .filter(|n| ArchiveKind::from_path(Path::new(n)).is_some())
            .unwrap_or("runtime.tar.gz")
            .to_string();
        let downloads = self.root.join(".downloads");
        tokio::fs::create_dir_all(&downloads)
            .await
            .map_err(|e| ProvisionError::io(&downloads, e))?;
        let archive_path = downloads.join(&name);
        self.downloader
            .download_to_file(url, &archive_path, &name, cancel)
            .await?;
        let extracted = archive::extract(&archive_path, staging).await;
        let _ = tokio::fs::remove_file(&archive_path).await;
        extracted
    }

    /// Promotes a staged runtime once it contains a server binary
    async fn finish(
        &self,
        config: &ComputeConfig,
        staging: &Path,
        staged: Result<(), ProvisionError>,
    ) -> Result<RuntimeRecord, ProvisionError> {
        if let Err(e) = staged {
            let _ = tokio::fs::remove_dir_all(staging).await;
            return Err(e);
        }
        let server = RuntimeTool::Server.binary_name();
        if archive::find_file(staging, &server).is_none() {
            let _ = tokio::fs::remove_dir_all(staging).await;
            return Err(ProvisionError::install(
                config.runtime_variant(),
                format!("package does not contain {}", server),
            ));
        }
        archive::mark_executables(staging)?;

        let dir = self.runtime_dir(config);
        remove_dir_if_exists(&dir).await?;
        tokio::fs::rename(staging, &dir)
            .await
            .map_err(|e| ProvisionError::io(&dir, e))?;

        info!(runtime = %config.runtime_variant(), dir = %dir.display(), "Runtime installed");
        Ok(self.runtime_status(config))
    }
}

#[async_trait]
impl RuntimeProvisioner for LocalRuntimeStore {
    async fn install_runtime(
        &self,
        config: &ComputeConfig,
        source: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RuntimeRecord, ProvisionError> {
        let status = self.runtime_status(config);
        if status.installed && source.is_none() {
            debug!(runtime = %config.runtime_variant(), "Runtime already installed");
            return Ok(status);
        }
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }

        let staging = self.staging_dir(config);
        reset_dir(&staging).await?;

        let staged = match source {
            Some(url) if is_remote(url) => self.stage_url(url, &staging, cancel).await,
            Some(local) => self.stage_local(Path::new(local), &staging).await,
            None => match self.bundled_source(config) {
                Some(bundled) => {
                    info!(source = %bundled.display(), "Installing bundled runtime");
                    self.stage_local(&bundled, &staging).await
                }
                None if !self.allow_download => Err(DownloadError::Disabled(
                    format!("runtime {}", config.runtime_variant()),
                )
                .into()),
                None if !glibc_supports_prebuilt() => Err(ProvisionError::install(
                    config.runtime_variant(),
                    "system glibc is older than 2.34; import a runtime built for this system",
                )),
                None => self.stage_download(config, &staging, cancel).await,
            },
        };

        self.finish(config, &staging, staged).await
    }

    async fn delete_runtime(&self, config: &ComputeConfig) -> Result<(), ProvisionError> {
        remove_dir_if_exists(&self.runtime_dir(config)).await?;
        info!(runtime = %config.runtime_variant(), "Runtime deleted");
        Ok(())
    }

    fn runtime_status(&self, config: &ComputeConfig) -> RuntimeRecord {
        let dir = self.runtime_dir(config);
        let installed =
            dir.is_dir() && archive::find_file(&dir, &RuntimeTool::Server.binary_name()).is_some();
        RuntimeRecord {
            config: config.normalized(),
            installed,
            dir,
        }
    }

    fn runtime_binary(&self, config: &ComputeConfig, tool: RuntimeTool) -> Option<PathBuf> {
        archive::find_file(&self.runtime_dir(config), &tool.binary_name())
    }

    fn cancel_active_download(&self) {
        self.downloader.cancel_active();
    }
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), ProvisionError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProvisionError::io(dir, e)),
    }
}

async fn reset_dir(dir: &Path) -> Result<(), ProvisionError> {
    remove_dir_if_exists(dir).await?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ProvisionError::io(dir, e))
}

/// Release archives needed for `config` on a platform
pub fn archive_names(config: &ComputeConfig, os: &str, arch: &str) -> Result<Vec<String>, String> {
    let release = RUNTIME_RELEASE;
    let uses_gpu = config.compute_mode.uses_gpu();
    match os {
        "windows" => {
            let flavor = match (uses_gpu, config.gpu_backend) {
                (false, _) | (true, GpuBackend::None) => "cpu".to_string(),
                (true, GpuBackend::Cuda) => format!("cuda-{}", config.cuda_version),
                (true, GpuBackend::Vulkan) => "vulkan".to_string(),
                (true, GpuBackend::Metal) => {
                    return Err("Metal is not available on Windows".to_string())
                }
            };
            let mut names = vec![format!("llama-{}-bin-win-{}-x64.zip", release, flavor)];
            if uses_gpu && config.gpu_backend == GpuBackend::Cuda {
                names.push(format!(
                    "cudart-llama-bin-win-cuda-{}-x64.zip",
                    config.cuda_version
                ));
            }
            Ok(names)
        }
        "macos" => {
            let arch = if arch == "aarch64" { "arm64" } else { "x64" };
            Ok(vec![format!("llama-{}-bin-macos-{}.tar.gz", release, arch)])
        }
        "linux" => {
            if arch != "x86_64" {
                return Err(format!("no prebuilt runtime for linux/{}", arch));
            }
            let name = match config.compute_mode {
                ComputeMode::Cpu => format!("llama-{}-bin-ubuntu-x64.tar.gz", release),
                ComputeMode::Gpu | ComputeMode::Hybrid => {
                    format!("llama-{}-bin-ubuntu-vulkan-x64.tar.gz", release)
                }
            };
            Ok(vec![name])
        }
        other => Err(format!("no prebuilt runtime for {}", other)),
    }
}

/// Parses the version from the first line of `ldd --version`
pub fn parse_glibc_version(ldd_output: &str) -> Option<(u32, u32)> {
    let first = ldd_output.lines().next()?;
    let token = first.split_whitespace().last()?;
    let (major, minor) = token.split_once('.')?;
    let minor: String = minor.chars().take_while(|c| c.is_ascii_digit()).collect();
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn glibc_supports_prebuilt() -> bool {
    if !cfg!(target_os = "linux") {
        return true;
    }
    let output = match std::process::Command::new("ldd").arg("--version").output() {
        Ok(output) => output,
        Err(e) => {
            debug!(error = %e, "Cannot run ldd, assuming a modern glibc");
            return true;
        }
    };
    let text = String::from_utf8_lossy(&output.stdout);
    match parse_glibc_version(&text) {
        Some(version) if version < MIN_GLIBC => {
            warn!(
                glibc = format!("{}.{}", version.0, version.1),
                "glibc too old for prebuilt runtimes"
            );
            false
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CudaVersion;
    use crate::progress::ProgressSlot;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(root: &Path, resources: Option<PathBuf>, allow_download: bool) -> LocalRuntimeStore {
        let downloader = Arc::new(Downloader::new(
            Arc::new(ProgressSlot::new()),
            Duration::from_secs(1),
        ));
        LocalRuntimeStore::new(root.join("runtime"), resources, downloader, allow_download)
    }

    fn fake_runtime_dir(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(RuntimeTool::Server.binary_name()), b"server").unwrap();
        std::fs::write(dir.join(RuntimeTool::Bench.binary_name()), b"bench").unwrap();
    }

    #[test]
    fn test_archive_names_linux() {
        let cpu = archive_names(&ComputeConfig::cpu(), "linux", "x86_64").unwrap();
        assert_eq!(cpu, vec!["llama-b7966-bin-ubuntu-x64.tar.gz"]);
        let vk = archive_names(
            &ComputeConfig::hybrid(GpuBackend::Vulkan),
            "linux",
            "x86_64",
        )
        .unwrap();
        assert_eq!(vk, vec!["llama-b7966-bin-ubuntu-vulkan-x64.tar.gz"]);
        assert!(archive_names(&ComputeConfig::cpu(), "linux", "aarch64").is_err());
    }

    #[test]
    fn test_archive_names_windows_cuda_includes_cudart() {
        let config = ComputeConfig::gpu(GpuBackend::Cuda).with_cuda_version(CudaVersion::V13_1);
        let names = archive_names(&config, "windows", "x86_64").unwrap();
        assert_eq!(
            names,
            vec![
                "llama-b7966-bin-win-cuda-13.1-x64.zip",
                "cudart-llama-bin-win-cuda-13.1-x64.zip"
            ]
        );
    }

    #[test]
    fn test_archive_names_macos() {
        let names = archive_names(&ComputeConfig::gpu(GpuBackend::Metal), "macos", "aarch64").unwrap();
        assert_eq!(names, vec!["llama-b7966-bin-macos-arm64.tar.gz"]);
    }

    #[test]
    fn test_parse_glibc_version() {
        assert_eq!(
            parse_glibc_version("ldd (Ubuntu GLIBC 2.35-0ubuntu3.1) 2.35\nCopyright"),
            Some((2, 35))
        );
        assert_eq!(parse_glibc_version("ldd (GNU libc) 2.17\n"), Some((2, 17)));
        assert_eq!(parse_glibc_version("musl libc (x86_64)\n"), None);
        assert!((2, 17) < MIN_GLIBC);
    }

    #[tokio::test]
    async fn test_status_of_missing_runtime() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), None, true);
        let status = store.runtime_status(&ComputeConfig::cpu());
        assert!(!status.installed);
        assert!(status.dir.ends_with("runtime/cpu"));
    }

    #[tokio::test]
    async fn test_install_from_bundled_directory() {
        let dir = TempDir::new().unwrap();
        let resources = dir.path().join("resources");
        fake_runtime_dir(&resources.join("runtime/vulkan"));
        let store = store(dir.path(), Some(resources), false);
        let config = ComputeConfig::hybrid(GpuBackend::Vulkan);

        let record = store
            .install_runtime(&config, None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(record.installed);
        assert!(store.runtime_binary(&config, RuntimeTool::Bench).is_some());
        assert!(!store.runtime_status(&ComputeConfig::cpu()).installed);
    }

    #[tokio::test]
    async fn test_install_without_source_when_downloads_disabled() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path(), None, false);
        let err = store
            .install_runtime(&ComputeConfig::cpu(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_download());
        assert!(!store.runtime_dir(&ComputeConfig::cpu()).exists());
    }

    #[tokio::test]
    async fn test_import_rejects_package_without_server() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("readme.txt"), b"hi").unwrap();
        let store = store(dir.path(), None, false);

        let err = store
            .import_runtime(&ComputeConfig::cpu(), &src)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Install { .. }));
        assert!(!store.runtime_status(&ComputeConfig::cpu()).installed);
    }

    #[tokio::test]
    async fn test_install_keeps_other_records_and_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cpu_src = dir.path().join("cpu-src");
        let vk_src = dir.path().join("vk-src");
        fake_runtime_dir(&cpu_src);
        fake_runtime_dir(&vk_src);
        let store = store(dir.path(), None, false);
        let vulkan = ComputeConfig::hybrid(GpuBackend::Vulkan);

        store.import_runtime(&ComputeConfig::cpu(), &cpu_src).await.unwrap();
        store.import_runtime(&vulkan, &vk_src).await.unwrap();
        assert!(store.runtime_status(&ComputeConfig::cpu()).installed);
        assert!(store.runtime_status(&vulkan).installed);

        store.delete_runtime(&vulkan).await.unwrap();
        store.delete_runtime(&vulkan).await.unwrap();
        assert!(!store.runtime_status(&vulkan).installed);
        assert!(store.runtime_status(&ComputeConfig::cpu()).installed);
    }
}
