use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;

/// Snapshot of the host's compute capabilities
///
/// Produced once per probe and never mutated afterwards; a re-probe replaces
/// the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfile {
    pub cpu_cores: usize,
    pub cpu_brand: String,
    pub total_memory_bytes: u64,
    pub vram_bytes: Option<u64>,
    pub gpu_name: Option<String>,
    pub has_cuda: bool,
    pub has_vulkan: bool,
    pub has_metal: bool,
    pub is_apple_silicon: bool,
}

impl HardwareProfile {
    /// A host with nothing but a CPU, used when probing fails entirely
    pub fn cpu_only(cpu_cores: usize, total_memory_bytes: u64) -> Self {
        Self {
            cpu_cores,
            cpu_brand: String::new(),
            total_memory_bytes,
            vram_bytes: None,
            gpu_name: None,
            has_cuda: false,
            has_vulkan: false,
            has_metal: false,
            is_apple_silicon: false,
        }
    }

    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_bytes as f64 / GIB as f64
    }

    pub fn vram_gb(&self) -> Option<f64> {
        self.vram_bytes.map(|v| v as f64 / GIB as f64)
    }

    pub fn has_any_gpu_api(&self) -> bool {
        self.has_cuda || self.has_vulkan || self.has_metal
    }

    /// Whether offloading to this GPU is likely to beat the CPU.
    ///
    /// Apple Silicon always qualifies. Tiny VRAM, Intel integrated graphics
    /// and virtual display adapters do not.
    pub fn is_gpu_worth_using(&self) -> bool {
        if self.is_apple_silicon {
            return true;
        }
        if matches!(self.vram_bytes, Some(v) if v < 2 * GIB) {
            return false;
        }
        match &self.gpu_name {
            Some(name) => !is_weak_adapter_name(name),
            None => true,
        }
    }
}

pub(crate) fn is_weak_adapter_name(name: &str) -> bool {
    let padded = format!(" {} ", name.to_lowercase());
    let intel_integrated = padded.contains("intel")
        && (padded.contains("uhd") || padded.contains(" hd ") || padded.contains("iris"));
    intel_integrated || is_virtual_adapter_name(name)
}

pub(crate) fn is_virtual_adapter_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["idddriver", "virtual", "remote", "basic display", "basic render"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(vram_gb: Option<u64>, gpu: Option<&str>) -> HardwareProfile {
        HardwareProfile {
            vram_bytes: vram_gb.map(|g| g * GIB),
            gpu_name: gpu.map(str::to_string),
            has_vulkan: true,
            ..HardwareProfile::cpu_only(8, 16 * GIB)
        }
    }

    #[test]
    fn test_memory_conversion() {
        let p = profile(Some(8), None);
        assert!((p.total_memory_gb() - 16.0).abs() < 0.01);
        assert!((p.vram_gb().unwrap() - 8.0).abs() < 0.01);
    }

    #[test]
    fn test_discrete_gpu_is_worth_using() {
        assert!(profile(Some(8), Some("NVIDIA GeForce RTX 3070")).is_gpu_worth_using());
        assert!(profile(None, None).is_gpu_worth_using());
    }

    #[test]
    fn test_small_vram_is_not_worth_using() {
        assert!(!profile(Some(1), Some("NVIDIA GeForce GT 710")).is_gpu_worth_using());
    }

    #[test]
    fn test_intel_integrated_is_not_worth_using() {
        assert!(!profile(Some(4), Some("Intel(R) UHD Graphics 620")).is_gpu_worth_using());
        assert!(!profile(Some(4), Some("Intel Iris Xe Graphics")).is_gpu_worth_using());
        assert!(!profile(Some(4), Some("Intel HD Graphics 530")).is_gpu_worth_using());
    }

    #[test]
    fn test_virtual_adapter_is_not_worth_using() {
        assert!(!profile(Some(4), Some("Microsoft Remote Display Adapter")).is_gpu_worth_using());
        assert!(!profile(Some(4), Some("Parsec Virtual Display")).is_gpu_worth_using());
        assert!(!profile(Some(4), Some("IddDriver Device")).is_gpu_worth_using());
    }

    #[test]
    fn test_apple_silicon_always_worth_using() {
        let mut p = profile(Some(1), Some("Apple M1"));
        p.is_apple_silicon = true;
        assert!(p.is_gpu_worth_using());
    }
}
