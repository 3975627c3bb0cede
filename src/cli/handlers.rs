//! Command handlers: each builds what it needs from [`CliContext`], runs, and
//! returns a process exit code.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::commands::{
    BenchmarkArgs, CandidatesArgs, ComputeArgs, FormatArgs, ModelsCommand, RecommendArgs,
    RuntimeCommand, ServeArgs, SetupArgs,
};
use super::output::{OutputFormatter, StatusReport};
use crate::bench::{BenchmarkOutcome, BenchmarkRequest, BenchmarkRunner, LlamaBenchRunner};
use crate::config::EngineConfig;
use crate::engine::{
    catalog, BenchmarkEntry, CandidateEnumerator, ComputeConfig, ComputeMode, CudaVersion,
    GpuBackend, LaunchConfig, ResourceCaps, TierRecommendation, TierSelector,
};
use crate::hardware::{HardwareProbe, SystemProbe};
use crate::progress::{DownloadProgress, LoggingHandler, ProgressSlot};
use crate::provision::{
    Downloader, LocalModelStore, LocalRuntimeStore, ModelProvisioner, RuntimeProvisioner,
};
use crate::service::{LlamaServerLauncher, ServiceController};
use crate::settings::{JsonSettingsStore, SettingsStore};
use crate::setup::{SetupComponents, SetupError, SetupOrchestrator, SetupPhase, SkippedCandidate};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

/// Shared wiring for CLI commands
struct CliContext {
    config: EngineConfig,
    progress: Arc<ProgressSlot>,
    runtimes: Arc<LocalRuntimeStore>,
    models: Arc<LocalModelStore>,
    service: Arc<ServiceController>,
    settings: Arc<JsonSettingsStore>,
}

impl CliContext {
    fn new() -> Result<Self> {
        let config = EngineConfig::default();
        config.validate().context("Invalid configuration")?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: EngineConfig) -> Self {
        let progress = Arc::new(ProgressSlot::new());
        let downloader = Arc::new(Downloader::new(
            progress.clone(),
            config.mirror_probe_timeout(),
        ));
        let runtimes = Arc::new(LocalRuntimeStore::new(
            config.runtime_root(),
            config.resource_dir.clone(),
            downloader.clone(),
            config.allow_download,
        ));
        let models = Arc::new(LocalModelStore::new(
            config.models_dir.clone(),
            config.resource_dir.clone(),
            downloader,
            config.allow_download,
        ));
        let service = Arc::new(ServiceController::new(
            runtimes.clone(),
            models.clone(),
            Arc::new(LlamaServerLauncher::new(config.start_timeout())),
            config.ctx_size,
        ));
        let settings = Arc::new(JsonSettingsStore::new(config.settings_path()));

        Self {
            config,
            progress,
            runtimes,
            models,
            service,
            settings,
        }
    }

    fn bench_runner(&self) -> LlamaBenchRunner {
        LlamaBenchRunner::new(
            self.runtimes.clone(),
            self.models.clone(),
            TierSelector::default(),
            self.config.bench_tokens,
        )
    }

    fn orchestrator(&self) -> SetupOrchestrator {
        let components = SetupComponents {
            probe: Arc::new(SystemProbe),
            runtimes: self.runtimes.clone(),
            models: self.models.clone(),
            bench: Arc::new(self.bench_runner()),
            service: self.service.clone(),
            settings: self.settings.clone(),
        };
        SetupOrchestrator::new(
            components,
            self.config.candidate_policy(),
            self.config.gpu_layers,
        )
        .with_handler(Arc::new(LoggingHandler))
        .with_progress(self.progress.clone())
    }

    fn compute_config(&self, args: &ComputeArgs) -> ComputeConfig {
        compute_config(
            args.mode,
            args.backend,
            args.cuda_version.unwrap_or(self.config.cuda_version),
        )
    }
}

fn compute_config(
    mode: ComputeMode,
    backend: Option<GpuBackend>,
    cuda: CudaVersion,
) -> ComputeConfig {
    let backend = backend.unwrap_or_else(GpuBackend::platform_default);
    let config = match mode {
        ComputeMode::Cpu => ComputeConfig::cpu(),
        ComputeMode::Gpu => ComputeConfig::gpu(backend),
        ComputeMode::Hybrid => ComputeConfig::hybrid(backend),
    };
    config.with_cuda_version(cuda).normalized()
}

fn exit_code(result: Result<()>) -> i32 {
    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            if let Some(SetupError::Cancelled) = e.downcast_ref::<SetupError>() {
                eprintln!("Cancelled");
                return EXIT_INTERRUPTED;
            }
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        }
    }
}

/// Renders the shared download slot as a terminal progress bar until aborted
fn spawn_progress_bar(slot: &ProgressSlot) -> Option<JoinHandle<()>> {
    let rx = slot.subscribe()?;
    Some(tokio::spawn(drive_progress_bar(rx)))
}

async fn drive_progress_bar(mut rx: watch::Receiver<Option<DownloadProgress>>) {
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
    let mut bar: Option<(String, ProgressBar)> = None;

    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().clone();
        match current {
            Some(progress) => {
                let stale = bar
                    .as_ref()
                    .map_or(true, |(label, _)| *label != progress.label);
                if stale {
                    if let Some((_, old)) = bar.take() {
                        old.finish_and_clear();
                    }
                    let pb = ProgressBar::new(progress.total_bytes.unwrap_or(0));
                    pb.set_style(style.clone());
                    pb.enable_steady_tick(Duration::from_millis(120));
                    bar = Some((progress.label.clone(), pb));
                }
                if let Some((_, pb)) = &bar {
                    if let Some(total) = progress.total_bytes {
                        pb.set_length(total);
                    }
                    pb.set_position(progress.written_bytes);
                    pb.set_message(match progress.speed_bytes_per_sec {
                        Some(speed) => format!(
                            "{} ({:.1} MB/s)",
                            progress.label,
                            speed / (1024.0 * 1024.0)
                        ),
                        None => progress.label.clone(),
                    });
                }
            }
            None => {
                if let Some((_, pb)) = bar.take() {
                    pb.finish_and_clear();
                }
            }
        }
    }
}

fn stop_progress_bar(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

/// Cancels `token` on Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted");
            token.cancel();
        }
    })
}

pub async fn handle_probe(args: &FormatArgs) -> i32 {
    exit_code(probe(args).await)
}

async fn probe(args: &FormatArgs) -> Result<()> {
    let profile = SystemProbe.probe().await;
    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_profile(&profile)?);
    Ok(())
}

pub async fn handle_candidates(args: &CandidatesArgs) -> i32 {
    exit_code(candidates(args).await)
}

async fn candidates(args: &CandidatesArgs) -> Result<()> {
    let config = EngineConfig::default();
    let mut policy = config.candidate_policy();
    if args.prefer.is_some() {
        policy.preferred = args.prefer;
    }
    policy.skip_weak_gpus |= args.skip_weak_gpus;

    let profile = SystemProbe.probe().await;
    let candidates = CandidateEnumerator::new(policy).enumerate(&profile);
    let formatter = OutputFormatter::new(args.output.format.into());
    println!("{}", formatter.format_candidates(&candidates)?);
    Ok(())
}

pub async fn handle_recommend(args: &RecommendArgs) -> i32 {
    exit_code(recommend(args).await)
}

async fn recommend(args: &RecommendArgs) -> Result<()> {
    if let Some(tps) = args.tokens_per_second {
        if !tps.is_finite() || tps < 0.0 {
            bail!("Throughput must be a non-negative number, got {}", tps);
        }
    }

    let selector = TierSelector::default();
    let profile = SystemProbe.probe().await;
    let caps = ResourceCaps::from_profile(&profile);

    let recommendation = match args.tokens_per_second {
        Some(tps) => selector.recommend_capped(tps, &caps, args.mode),
        None => {
            let tier = caps.estimate_tier(args.mode);
            debug!(tier, mode = %args.mode, "No throughput given, using static estimate");
            TierRecommendation {
                tier,
                model_id: catalog::for_tier(tier).id.to_string(),
            }
        }
    };

    let formatter = OutputFormatter::new(args.output.format.into());
    println!(
        "{}",
        formatter.format_recommendation(&recommendation, &selector.tier_table())?
    );
    Ok(())
}

pub async fn handle_benchmark(args: &BenchmarkArgs) -> i32 {
    exit_code(benchmark(args).await)
}

async fn benchmark(args: &BenchmarkArgs) -> Result<()> {
    let ctx = CliContext::new()?;
    let profile = SystemProbe.probe().await;
    let mut candidates = CandidateEnumerator::new(ctx.config.candidate_policy()).enumerate(&profile);
    if let Some(wanted) = &args.candidate {
        candidates.retain(|c| c.label.eq_ignore_ascii_case(wanted));
        if candidates.is_empty() {
            bail!("No compute candidate labelled '{}' on this machine", wanted);
        }
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_interrupt(cancel.clone());
    let bar = spawn_progress_bar(&ctx.progress);

    let result = run_benchmarks(&ctx, &profile, candidates, args.install, &cancel).await;

    stop_progress_bar(bar);
    interrupt.abort();
    let (entries, skipped) = result?;

    let formatter = OutputFormatter::new(args.output.format.into());
    println!("{}", formatter.format_benchmarks(&entries, &skipped)?);
    if entries.is_empty() {
        bail!("No candidate produced a benchmark result");
    }
    Ok(())
}

async fn run_benchmarks(
    ctx: &CliContext,
    profile: &crate::hardware::HardwareProfile,
    candidates: Vec<crate::engine::ComputeCandidate>,
    install: bool,
    cancel: &CancellationToken,
) -> Result<(Vec<BenchmarkEntry>, Vec<SkippedCandidate>)> {
    let runner = ctx.bench_runner();
    let caps = ResourceCaps::from_profile(profile);

    if install {
        ctx.models
            .install_model(catalog::REFERENCE_MODEL_ID, None, cancel)
            .await
            .map_err(SetupError::from)
            .context("Failed to install the reference model")?;
    }

    let mut entries = Vec::new();
    let mut skipped = Vec::new();
    for candidate in candidates {
        if cancel.is_cancelled() {
            return Err(SetupError::Cancelled.into());
        }
        if install {
            if let Err(e) = ctx
                .runtimes
                .install_runtime(&candidate.config, None, cancel)
                .await
            {
                if e.is_cancelled() {
                    return Err(SetupError::Cancelled.into());
                }
                warn!(candidate = %candidate.label, error = %e, "Runtime install failed");
                skipped.push(SkippedCandidate {
                    candidate,
                    phase: SetupPhase::Provisioning,
                    reason: e.to_string(),
                });
                continue;
            }
        }

        let request = BenchmarkRequest {
            candidate: candidate.clone(),
            reference_model_id: catalog::REFERENCE_MODEL_ID.to_string(),
            gpu_layers: ctx.config.gpu_layers,
            caps,
        };
        info!(candidate = %candidate.label, "Benchmarking");
        match runner.run_benchmark(&request, cancel).await {
            Ok(BenchmarkOutcome {
                tokens_per_second,
                recommended_tier,
                recommended_model_id,
            }) => entries.push(BenchmarkEntry {
                candidate,
                tokens_per_second,
                recommended_tier,
                recommended_model_id,
            }),
            Err(crate::bench::BenchmarkError::Cancelled) => {
                return Err(SetupError::Cancelled.into())
            }
            Err(e) => {
                warn!(candidate = %candidate.label, error = %e, "Benchmark failed");
                skipped.push(SkippedCandidate {
                    candidate,
                    phase: SetupPhase::Benchmarking,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok((entries, skipped))
}

pub async fn handle_setup(args: &SetupArgs) -> i32 {
    exit_code(setup(args).await)
}

async fn setup(args: &SetupArgs) -> Result<()> {
    let ctx = CliContext::new()?;
    let orchestrator = Arc::new(ctx.orchestrator());
    let formatter = OutputFormatter::new(args.output.format.into());

    let watcher = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling setup");
                if let Err(e) = orchestrator.cancel().await {
                    debug!(error = %e, "Nothing to cancel");
                }
            }
        })
    };
    let bar = spawn_progress_bar(&ctx.progress);

    let result = run_setup(&orchestrator, args, &formatter).await;

    stop_progress_bar(bar);
    watcher.abort();
    result?;

    if args.serve {
        let state = orchestrator.status().await?;
        println!(
            "Serving {} at {} (Ctrl-C to stop)",
            state.running_model_id.as_deref().unwrap_or("model"),
            state.base_url.as_deref().unwrap_or("unknown address")
        );
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    } else {
        println!("Setup saved. Run `reader-llm serve` to start the server again.");
    }
    orchestrator.service().stop().await;
    Ok(())
}

async fn run_setup(
    orchestrator: &SetupOrchestrator,
    args: &SetupArgs,
    formatter: &OutputFormatter,
) -> Result<()> {
    let session = orchestrator.start_setup().await?;

    if args.select_only {
        println!(
            "{}",
            formatter.format_session(&session, &orchestrator.tier_table())?
        );
        orchestrator.cancel().await?;
        return Ok(());
    }

    if let Some(tier) = args.tier {
        let model_id = orchestrator.select_tier(tier)?;
        info!(tier, model = %model_id, "Tier selected");
    }

    let session = orchestrator
        .confirm_selection(args.model.as_deref())
        .await?;
    println!(
        "{}",
        formatter.format_session(&session, &orchestrator.tier_table())?
    );
    Ok(())
}

pub async fn handle_status(args: &FormatArgs) -> i32 {
    exit_code(status(args).await)
}

async fn status(args: &FormatArgs) -> Result<()> {
    let ctx = CliContext::new()?;
    let desired = ctx.settings.load()?;
    let (model_installed, runtime_installed) = match &desired {
        Some(d) => (
            ctx.models.model_path(&d.model_id).is_some(),
            ctx.runtimes.runtime_status(&d.compute).installed,
        ),
        None => (false, false),
    };
    let report = StatusReport {
        desired,
        model_installed,
        runtime_installed,
    };
    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_status(&report)?);
    Ok(())
}

pub async fn handle_serve(args: &ServeArgs) -> i32 {
    exit_code(serve(args).await)
}

async fn serve(args: &ServeArgs) -> Result<()> {
    let ctx = CliContext::new()?;
    let saved = ctx.settings.load()?;

    let model_id = args
        .model
        .clone()
        .or_else(|| saved.as_ref().map(|d| d.model_id.clone()))
        .ok_or_else(|| anyhow!(SetupError::NotConfigured))
        .context("Pass --model or run `reader-llm setup` first")?;

    let compute = match (args.mode, &saved) {
        (Some(mode), _) => compute_config(mode, args.backend, ctx.config.cuda_version),
        (None, Some(d)) => d.compute,
        (None, None) => ComputeConfig::cpu(),
    };
    let gpu_layers = args
        .gpu_layers
        .or_else(|| saved.as_ref().map(|d| d.gpu_layers))
        .unwrap_or(ctx.config.gpu_layers);

    let launch = LaunchConfig::new(model_id, compute, gpu_layers);
    ctx.service.start(launch.clone()).await?;
    let state = ctx.service.status(Some(&launch)).await;
    println!(
        "Serving {} at {} (Ctrl-C to stop)",
        launch.model_id,
        state.base_url.as_deref().unwrap_or("unknown address")
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    ctx.service.stop().await;
    Ok(())
}

pub async fn handle_config(args: &FormatArgs) -> i32 {
    exit_code(show_config(args))
}

fn show_config(args: &FormatArgs) -> Result<()> {
    let config = EngineConfig::default();
    let formatter = OutputFormatter::new(args.format.into());
    println!("{}", formatter.format_config(&config)?);
    if let Err(e) = config.validate() {
        warn!(error = %e, "Configuration is invalid");
    }
    Ok(())
}

pub async fn handle_models(command: &ModelsCommand) -> i32 {
    exit_code(models(command).await)
}

async fn models(command: &ModelsCommand) -> Result<()> {
    let ctx = CliContext::new()?;
    match command {
        ModelsCommand::List(args) => {
            let installed = ctx.models.list_installed_models()?;
            let formatter = OutputFormatter::new(args.format.into());
            println!("{}", formatter.format_models(&installed)?);
        }
        ModelsCommand::Install { model_id, source } => {
            let cancel = CancellationToken::new();
            let interrupt = cancel_on_interrupt(cancel.clone());
            let bar = spawn_progress_bar(&ctx.progress);
            let result = ctx
                .models
                .install_model(model_id, source.as_deref(), &cancel)
                .await;
            stop_progress_bar(bar);
            interrupt.abort();
            let path = result.map_err(SetupError::from)?;
            println!("Installed {} at {}", model_id, path.display());
        }
        ModelsCommand::Delete { model_id } => {
            ctx.service.delete_model(model_id).await?;
            println!("Deleted {}", model_id);
        }
        ModelsCommand::Import { path } => {
            let model_id = ctx.models.import_model(path).await?;
            println!("Imported {} as {}", path.display(), model_id);
        }
    }
    Ok(())
}

pub async fn handle_runtime(command: &RuntimeCommand) -> i32 {
    exit_code(runtime(command).await)
}

async fn runtime(command: &RuntimeCommand) -> Result<()> {
    let ctx = CliContext::new()?;
    match command {
        RuntimeCommand::Install { compute, source } => {
            let config = ctx.compute_config(compute);
            let cancel = CancellationToken::new();
            let interrupt = cancel_on_interrupt(cancel.clone());
            let bar = spawn_progress_bar(&ctx.progress);
            let result = ctx
                .runtimes
                .install_runtime(&config, source.as_deref(), &cancel)
                .await;
            stop_progress_bar(bar);
            interrupt.abort();
            let record = result.map_err(SetupError::from)?;
            println!(
                "Installed {} runtime at {}",
                config.runtime_variant(),
                record.dir.display()
            );
        }
        RuntimeCommand::Status { compute, output } => {
            let record = ctx.runtimes.runtime_status(&ctx.compute_config(compute));
            let formatter = OutputFormatter::new(output.format.into());
            println!("{}", formatter.format_runtime(&record)?);
        }
        RuntimeCommand::Delete { compute } => {
            let config = ctx.compute_config(compute);
            ctx.service.delete_runtime(&config).await?;
            println!("Deleted {} runtime", config.runtime_variant());
        }
        RuntimeCommand::Import { path, compute } => {
            let config = ctx.compute_config(compute);
            let record = ctx.runtimes.import_runtime(&config, path).await?;
            println!(
                "Imported {} runtime into {}",
                config.runtime_variant(),
                record.dir.display()
            );
        }
    }
    Ok(())
}
