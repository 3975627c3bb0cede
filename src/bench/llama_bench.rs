use super::{BenchmarkError, BenchmarkOutcome, BenchmarkRequest, BenchmarkRunner};
use crate::engine::TierSelector;
use crate::provision::{ModelProvisioner, RuntimeProvisioner, RuntimeTool};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const BENCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Benchmarks with the runtime's `llama-bench` tool
pub struct LlamaBenchRunner {
    runtimes: Arc<dyn RuntimeProvisioner>,
    models: Arc<dyn ModelProvisioner>,
    selector: TierSelector,
    tokens: u32,
    timeout: Duration,
}

impl LlamaBenchRunner {
    pub fn new(
        runtimes: Arc<dyn RuntimeProvisioner>,
        models: Arc<dyn ModelProvisioner>,
        selector: TierSelector,
        tokens: u32,
    ) -> Self {
        Self {
            runtimes,
            models,
            selector,
            tokens,
            timeout: BENCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct BenchRow {
    #[serde(default)]
    n_gen: u64,
    #[serde(default)]
    avg_ns: f64,
    #[serde(default)]
    avg_ts: f64,
}

/// Tokens per second of the generation row in `llama-bench -o json` output
pub fn parse_bench_output(stdout: &str) -> Result<f64, BenchmarkError> {
    // the tool may print log lines before the JSON array
    let start = stdout
        .find('[')
        .ok_or_else(|| BenchmarkError::Parse("no JSON array in output".to_string()))?;
    let rows: Vec<BenchRow> = serde_json::from_str(stdout[start..].trim())
        .map_err(|e| BenchmarkError::Parse(e.to_string()))?;

    let row = rows
        .iter()
        .find(|r| r.n_gen > 0)
        .ok_or_else(|| BenchmarkError::Parse("no generation row".to_string()))?;

    let tps = if row.avg_ts > 0.0 {
        row.avg_ts
    } else if row.avg_ns > 0.0 {
        row.n_gen as f64 / (row.avg_ns / 1e9)
    } else {
        0.0
    };

    if tps.is_finite() && tps > 0.0 {
        Ok(tps)
    } else {
        Err(BenchmarkError::ZeroThroughput)
    }
}

#[async_trait]
impl BenchmarkRunner for LlamaBenchRunner {
    async fn run_benchmark(
        &self,
        request: &BenchmarkRequest,
        cancel: &CancellationToken,
    ) -> Result<BenchmarkOutcome, BenchmarkError> {
        let config = &request.candidate.config;
        let model = self
            .models
            .model_path(&request.reference_model_id)
            .ok_or_else(|| BenchmarkError::ModelMissing(request.reference_model_id.clone()))?;
        let binary = self
            .runtimes
            .runtime_binary(config, RuntimeTool::Bench)
            .ok_or_else(|| BenchmarkError::RuntimeMissing(config.runtime_variant()))?;

        let ngl = config.effective_gpu_layers(request.gpu_layers);
        let mut cmd = Command::new(&binary);
        cmd.arg("-m")
            .arg(&model)
            .args(["-p", "0", "-n"])
            .arg(self.tokens.to_string())
            .args(["-r", "1", "-ngl"])
            .arg(ngl.to_string())
            .args(["-o", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = binary.parent() {
            cmd.current_dir(dir);
        }
        debug!(binary = %binary.display(), ngl, tokens = self.tokens, "Running benchmark");

        let child = cmd.spawn().map_err(|source| BenchmarkError::Spawn {
            binary: binary.clone(),
            source,
        })?;

        // dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(BenchmarkError::Cancelled),
            waited = tokio::time::timeout(self.timeout, child.wait_with_output()) => match waited {
                Err(_) => return Err(BenchmarkError::TimedOut(self.timeout.as_secs())),
                Ok(result) => result.map_err(|source| BenchmarkError::Spawn {
                    binary: binary.clone(),
                    source,
                })?,
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(BenchmarkError::Failed {
                status: output.status.to_string(),
                stderr: tail,
            });
        }

        let tps = parse_bench_output(&String::from_utf8_lossy(&output.stdout))?;
        let outcome = BenchmarkOutcome::from_throughput(tps, &self.selector, request);
        info!(
            candidate = %request.candidate.label,
            tokens_per_second = format!("{:.1}", tps),
            tier = outcome.recommended_tier,
            "Benchmark finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ComputeCandidate, ComputeConfig, ResourceCaps, REFERENCE_MODEL_ID};
    use crate::testing::{FakeModels, FakeRuntimes};

    const SAMPLE: &str = r#"[
  {
    "build_commit": "abc",
    "model_type": "qwen3 0.6B Q4_K - Medium",
    "n_prompt": 0,
    "n_gen": 64,
    "avg_ns": 400000000,
    "stddev_ns": 0,
    "avg_ts": 160.0,
    "stddev_ts": 0.0
  }
]"#;

    #[test]
    fn test_parse_generation_row() {
        assert_eq!(parse_bench_output(SAMPLE).unwrap(), 160.0);
    }

    #[test]
    fn test_parse_skips_prompt_rows_and_log_prefix() {
        let out = format!(
            "load_backend: loaded CPU backend\n[{}, {}]",
            r#"{"n_prompt": 512, "n_gen": 0, "avg_ts": 900.0}"#,
            r#"{"n_prompt": 0, "n_gen": 64, "avg_ts": 55.5}"#
        );
        assert_eq!(parse_bench_output(&out).unwrap(), 55.5);
    }

    #[test]
    fn test_parse_falls_back_to_avg_ns() {
        let out = r#"[{"n_gen": 64, "avg_ns": 2000000000, "avg_ts": 0}]"#;
        assert_eq!(parse_bench_output(out).unwrap(), 32.0);
    }

    #[test]
    fn test_zero_throughput_is_an_error() {
        let out = r#"[{"n_gen": 64, "avg_ns": 0, "avg_ts": 0}]"#;
        assert!(matches!(
            parse_bench_output(out),
            Err(BenchmarkError::ZeroThroughput)
        ));
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(matches!(
            parse_bench_output("segfault"),
            Err(BenchmarkError::Parse(_))
        ));
        assert!(matches!(
            parse_bench_output("[]"),
            Err(BenchmarkError::Parse(_))
        ));
    }

    /// A `llama-bench` that records its pid and never finishes
    #[cfg(target_os = "linux")]
    fn hanging_runner(root: &std::path::Path) -> (LlamaBenchRunner, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let cpu = ComputeConfig::cpu();
        let runtimes = FakeRuntimes::rooted_at(root, &[cpu]);
        let dir = runtimes.dir(&cpu);
        std::fs::create_dir_all(&dir).unwrap();
        let pid_file = root.join("bench.pid");
        let script = dir.join(RuntimeTool::Bench.binary_name());
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = LlamaBenchRunner::new(
            Arc::new(runtimes),
            Arc::new(FakeModels::with_installed(&[REFERENCE_MODEL_ID])),
            TierSelector::default(),
            32,
        );
        (runner, pid_file)
    }

    #[cfg(target_os = "linux")]
    fn request() -> BenchmarkRequest {
        BenchmarkRequest {
            candidate: ComputeCandidate::new("CPU", ComputeConfig::cpu()),
            reference_model_id: REFERENCE_MODEL_ID.to_string(),
            gpu_layers: 0,
            caps: ResourceCaps::unlimited(),
        }
    }

    /// Alive means present and not a zombie
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(false, |rest| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn read_pid(pid_file: &std::path::Path) -> u32 {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(text) = std::fs::read_to_string(pid_file) {
                    if let Ok(pid) = text.trim().parse() {
                        return pid;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("benchmark never started")
    }

    #[cfg(target_os = "linux")]
    async fn assert_exits(pid: u32) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while process_alive(pid) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("benchmark process left running");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_benchmark_process() {
        let root = tempfile::TempDir::new().unwrap();
        let (runner, pid_file) = hanging_runner(root.path());
        let runner = Arc::new(runner);
        let cancel = CancellationToken::new();

        let running = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run_benchmark(&request(), &cancel).await })
        };
        let pid = read_pid(&pid_file).await;
        assert!(process_alive(pid));

        cancel.cancel();
        let result = running.await.unwrap();
        assert!(matches!(result, Err(BenchmarkError::Cancelled)));
        assert_exits(pid).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_benchmark_process() {
        let root = tempfile::TempDir::new().unwrap();
        let (runner, pid_file) = hanging_runner(root.path());
        let runner = runner.with_timeout(Duration::from_millis(500));

        let result = runner
            .run_benchmark(&request(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BenchmarkError::TimedOut(_))));
        let pid = read_pid(&pid_file).await;
        assert_exits(pid).await;
    }
}
