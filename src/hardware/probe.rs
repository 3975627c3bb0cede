//! Host capability probing
//!
//! Every sub-probe fails closed: a missing tool, an unreadable file or an
//! unparseable answer reports the capability as absent.

use super::profile::{is_virtual_adapter_name, HardwareProfile};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
enum ProbeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    Status { command: String, status: String },

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable answer from {0}")]
    NoAnswer(&'static str),
}

/// Source of hardware profiles
#[async_trait]
pub trait HardwareProbe: Send + Sync {
    async fn probe(&self) -> HardwareProfile;
}

/// Probes the real host through sysinfo and platform tools
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

#[async_trait]
impl HardwareProbe for SystemProbe {
    async fn probe(&self) -> HardwareProfile {
        match tokio::task::spawn_blocking(detect).await {
            Ok(profile) => profile,
            Err(e) => {
                debug!(error = %e, "Hardware probe task failed, assuming CPU only");
                HardwareProfile::cpu_only(1, 0)
            }
        }
    }
}

fn detect() -> HardwareProfile {
    let mut sys = System::new_all();
    sys.refresh_all();

    let cpu_cores = sys.cpus().len().max(1);
    let total_memory_bytes = sys.total_memory();
    let mut cpu_brand = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .unwrap_or_default();
    if cpu_brand.is_empty() {
        cpu_brand = settle(sysctl_cpu_brand()).unwrap_or_default();
    }

    let is_apple_silicon = cfg!(all(target_os = "macos", target_arch = "aarch64"));
    let has_metal = cfg!(target_os = "macos");
    let has_cuda = has_any_library(CUDA_LIBRARIES);
    let has_vulkan = has_any_library(VULKAN_LIBRARIES);

    let vram_bytes = settle(nvidia_smi_vram())
        .or_else(|| settle(sysfs_vram(Path::new("/sys/class/drm"))))
        .or_else(|| {
            if cfg!(target_os = "macos") {
                settle(system_profiler_vram()).or(Some(total_memory_bytes / 4 * 3))
            } else {
                None
            }
        });

    let gpu_name = settle(lspci_gpu_name())
        .or_else(|| settle(nvidia_smi_gpu_name()))
        .or_else(|| settle(system_profiler_chipset()))
        .or_else(|| {
            if is_apple_silicon && !cpu_brand.is_empty() {
                Some(cpu_brand.clone())
            } else {
                None
            }
        });

    let profile = HardwareProfile {
        cpu_cores,
        cpu_brand,
        total_memory_bytes,
        vram_bytes,
        gpu_name,
        has_cuda,
        has_vulkan,
        has_metal,
        is_apple_silicon,
    };

    info!(
        "Hardware detected: {} cores, {:.1}GB RAM, GPU: {}, VRAM: {}",
        profile.cpu_cores,
        profile.total_memory_gb(),
        profile.gpu_name.as_deref().unwrap_or("none"),
        profile
            .vram_gb()
            .map(|g| format!("{:.1}GB", g))
            .unwrap_or_else(|| "unknown".to_string())
    );
    debug!("Hardware profile: {:?}", profile);

    profile
}

fn settle<T>(result: Result<T, ProbeError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(error = %e, "Probe step found nothing");
            None
        }
    }
}

fn run(program: &str, args: &[&str]) -> Result<String, ProbeError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| ProbeError::Spawn {
            command: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(ProbeError::Status {
            command: program.to_string(),
            status: output.status.to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn nvidia_smi_vram() -> Result<u64, ProbeError> {
    let out = run(
        "nvidia-smi",
        &["--query-gpu=memory.total", "--format=csv,noheader,nounits"],
    )?;
    parse_nvidia_smi_memory(&out).ok_or(ProbeError::NoAnswer("nvidia-smi"))
}

fn nvidia_smi_gpu_name() -> Result<String, ProbeError> {
    let out = run("nvidia-smi", &["--query-gpu=name", "--format=csv,noheader"])?;
    out.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or(ProbeError::NoAnswer("nvidia-smi"))
}

fn lspci_gpu_name() -> Result<String, ProbeError> {
    if !cfg!(target_os = "linux") {
        return Err(ProbeError::NoAnswer("lspci"));
    }
    let out = run("lspci", &[])?;
    parse_lspci_gpu(&out).ok_or(ProbeError::NoAnswer("lspci"))
}

fn sysfs_vram(drm_root: &Path) -> Result<u64, ProbeError> {
    let entries = std::fs::read_dir(drm_root).map_err(|source| ProbeError::Read {
        path: drm_root.to_path_buf(),
        source,
    })?;
    entries
        .flatten()
        .filter_map(|entry| {
            let raw = std::fs::read_to_string(entry.path().join("device/mem_info_vram_total")).ok()?;
            raw.trim().parse::<u64>().ok()
        })
        .filter(|bytes| *bytes > 0)
        .max()
        .ok_or(ProbeError::NoAnswer("sysfs"))
}

fn system_profiler_vram() -> Result<u64, ProbeError> {
    if !cfg!(target_os = "macos") {
        return Err(ProbeError::NoAnswer("system_profiler"));
    }
    let out = run("system_profiler", &["SPDisplaysDataType"])?;
    parse_system_profiler_vram(&out).ok_or(ProbeError::NoAnswer("system_profiler"))
}

fn system_profiler_chipset() -> Result<String, ProbeError> {
    if !cfg!(target_os = "macos") {
        return Err(ProbeError::NoAnswer("system_profiler"));
    }
    let out = run("system_profiler", &["SPDisplaysDataType"])?;
    parse_system_profiler_chipset(&out).ok_or(ProbeError::NoAnswer("system_profiler"))
}

fn sysctl_cpu_brand() -> Result<String, ProbeError> {
    if !cfg!(target_os = "macos") {
        return Err(ProbeError::NoAnswer("sysctl"));
    }
    let out = run("sysctl", &["-n", "machdep.cpu.brand_string"])?;
    let brand = out.trim();
    if brand.is_empty() {
        Err(ProbeError::NoAnswer("sysctl"))
    } else {
        Ok(brand.to_string())
    }
}

#[cfg(target_os = "windows")]
const CUDA_LIBRARIES: &[&str] = &["nvcuda.dll"];
#[cfg(not(target_os = "windows"))]
const CUDA_LIBRARIES: &[&str] = &["libcuda.so.1", "libcuda.so"];

#[cfg(target_os = "windows")]
const VULKAN_LIBRARIES: &[&str] = &["vulkan-1.dll"];
#[cfg(target_os = "macos")]
const VULKAN_LIBRARIES: &[&str] = &[];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const VULKAN_LIBRARIES: &[&str] = &["libvulkan.so.1", "libvulkan.so"];

fn library_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let path_var = if cfg!(target_os = "windows") {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    };
    if let Some(paths) = std::env::var_os(path_var) {
        dirs.extend(std::env::split_paths(&paths));
    }
    if cfg!(target_os = "windows") {
        if let Some(root) = std::env::var_os("SystemRoot") {
            dirs.push(PathBuf::from(root).join("System32"));
        }
    } else {
        for dir in [
            "/usr/lib/x86_64-linux-gnu",
            "/usr/lib/aarch64-linux-gnu",
            "/usr/lib64",
            "/usr/lib",
            "/usr/local/lib",
            "/usr/lib/wsl/lib",
            "/lib/x86_64-linux-gnu",
            "/lib64",
        ] {
            dirs.push(PathBuf::from(dir));
        }
    }
    dirs
}

fn has_any_library(names: &[&str]) -> bool {
    if names.is_empty() {
        return false;
    }
    let dirs = library_dirs();
    let found = names
        .iter()
        .find(|name| dirs.iter().any(|dir| dir.join(name).exists()));
    if let Some(name) = found {
        debug!(library = name, "Found GPU loader library");
    }
    found.is_some()
}

fn parse_nvidia_smi_memory(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .filter_map(|l| l.trim().parse::<u64>().ok())
        .max()
        .map(|mib| mib * MIB)
}

fn parse_lspci_gpu(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("vga") || lower.contains("3d") || lower.contains("display")
        })
        .filter_map(|line| line.split_once(": ").map(|(_, name)| name.trim()))
        .find(|name| !name.is_empty() && !is_virtual_adapter_name(name))
        .map(str::to_string)
}

fn parse_size_with_unit(value: &str) -> Option<u64> {
    let mut parts = value.split_whitespace();
    let number: f64 = parts.next()?.parse().ok()?;
    let unit = parts.next().unwrap_or("MB").to_uppercase();
    let multiplier = match unit.as_str() {
        "GB" => 1024 * MIB,
        "MB" => MIB,
        _ => return None,
    };
    Some((number * multiplier as f64) as u64)
}

fn parse_system_profiler_vram(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("VRAM"))
        .filter_map(|l| l.split_once(':').map(|(_, v)| v.trim()))
        .filter_map(parse_size_with_unit)
        .max()
}

fn parse_system_profiler_chipset(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter_map(|l| l.strip_prefix("Chipset Model:"))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_string)
}
