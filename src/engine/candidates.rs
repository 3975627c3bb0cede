//! Ordered list of compute backends to benchmark on a given host

use super::types::{ComputeCandidate, ComputeConfig, ComputeMode, CudaVersion, GpuBackend};
use crate::hardware::HardwareProfile;
use tracing::debug;

/// Knobs that narrow or reorder the default enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidatePolicy {
    /// Mode to try first; `Cpu` restricts the sweep to the CPU alone
    pub preferred: Option<ComputeMode>,
    /// Drop GPUs unlikely to beat the CPU
    pub skip_weak_gpus: bool,
    pub cuda_version: CudaVersion,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateEnumerator {
    policy: CandidatePolicy,
}

impl CandidateEnumerator {
    pub fn new(policy: CandidatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CandidatePolicy {
        &self.policy
    }

    /// Metal, CUDA, Vulkan in that order when present, then CPU.
    ///
    /// The result is never empty and CPU is always the single last entry.
    pub fn enumerate(&self, profile: &HardwareProfile) -> Vec<ComputeCandidate> {
        let mut gpus = Vec::new();

        let gpu_allowed = self.policy.preferred != Some(ComputeMode::Cpu)
            && (!self.policy.skip_weak_gpus || profile.is_gpu_worth_using());

        if gpu_allowed {
            if profile.is_apple_silicon || profile.has_metal {
                gpus.push(ComputeCandidate::new(
                    "Metal",
                    ComputeConfig::gpu(GpuBackend::Metal),
                ));
            }
            if profile.has_cuda {
                let config = ComputeConfig::gpu(GpuBackend::Cuda)
                    .with_cuda_version(self.policy.cuda_version);
                gpus.push(ComputeCandidate::new(
                    format!("CUDA {}", self.policy.cuda_version),
                    config,
                ));
            }
            if profile.has_vulkan {
                gpus.push(ComputeCandidate::new(
                    "Vulkan",
                    ComputeConfig::hybrid(GpuBackend::Vulkan),
                ));
            }
        } else if profile.has_any_gpu_api() {
            debug!(
                gpu = profile.gpu_name.as_deref().unwrap_or("unknown"),
                "GPU candidates skipped by policy"
            );
        }

        if let Some(preferred) = self.policy.preferred {
            // stable: relative order inside each group is kept
            gpus.sort_by_key(|c| c.config.compute_mode != preferred);
        }

        gpus.push(ComputeCandidate::new("CPU", ComputeConfig::cpu()));
        debug!(
            candidates = ?gpus.iter().map(|c| c.label.as_str()).collect::<Vec<_>>(),
            "Enumerated compute candidates"
        );
        gpus
    }
}
