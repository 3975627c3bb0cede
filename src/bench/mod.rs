//! Throughput measurement for one compute candidate

mod llama_bench;

pub use llama_bench::{parse_bench_output, LlamaBenchRunner};

use crate::engine::{ComputeCandidate, ResourceCaps, TierSelector};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("Runtime for {0} is not installed")]
    RuntimeMissing(String),

    #[error("Reference model {0} is not installed")]
    ModelMissing(String),

    #[error("Failed to launch {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Benchmark exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Benchmark timed out after {0}s")]
    TimedOut(u64),

    #[error("Could not parse benchmark output: {0}")]
    Parse(String),

    #[error("Benchmark measured zero throughput")]
    ZeroThroughput,

    #[error("Benchmark cancelled")]
    Cancelled,
}

/// What to measure and how to interpret it
#[derive(Debug, Clone)]
pub struct BenchmarkRequest {
    pub candidate: ComputeCandidate,
    pub reference_model_id: String,
    /// Hybrid layer count; ignored for pure CPU or GPU candidates
    pub gpu_layers: u32,
    pub caps: ResourceCaps,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkOutcome {
    pub tokens_per_second: f64,
    pub recommended_tier: u8,
    pub recommended_model_id: String,
}

impl BenchmarkOutcome {
    /// Maps a measured throughput through the selector, capped by memory
    pub fn from_throughput(
        tokens_per_second: f64,
        selector: &TierSelector,
        request: &BenchmarkRequest,
    ) -> Self {
        let rec = selector.recommend_capped(
            tokens_per_second,
            &request.caps,
            request.candidate.config.compute_mode,
        );
        Self {
            tokens_per_second,
            recommended_tier: rec.tier,
            recommended_model_id: rec.model_id,
        }
    }
}

/// Runs a short fixed-length generation and reports throughput.
///
/// Requires the reference model and the candidate's runtime to be present.
/// Implementations must not leave a subprocess behind on failure or when
/// `cancel` fires.
#[async_trait]
pub trait BenchmarkRunner: Send + Sync {
    async fn run_benchmark(
        &self,
        request: &BenchmarkRequest,
        cancel: &CancellationToken,
    ) -> Result<BenchmarkOutcome, BenchmarkError>;
}
