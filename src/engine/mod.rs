//! Engine model: compute configurations, the model catalog, tiers and
//! candidate enumeration. Everything here is pure.

pub mod candidates;
pub mod catalog;
pub mod tier;
pub mod types;

pub use candidates::{CandidateEnumerator, CandidatePolicy};
pub use catalog::{ModelDescriptor, CATALOG, REFERENCE_MODEL_ID};
pub use tier::{ResourceCaps, TierRecommendation, TierRow, TierSelector};
pub use types::{
    BenchmarkEntry, ComputeCandidate, ComputeConfig, ComputeMode, CudaVersion, GpuBackend,
    LaunchConfig, RuntimeRecord,
};
