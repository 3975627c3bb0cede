use super::error::SetupError;
use super::session::{select_best, SessionFailure, SetupPhase, SetupSession, SkippedCandidate};
use crate::bench::{BenchmarkError, BenchmarkRequest, BenchmarkRunner};
use crate::engine::catalog::{self, MAX_TIER};
use crate::engine::tier::clamp_gpu_layers;
use crate::engine::{
    BenchmarkEntry, CandidateEnumerator, CandidatePolicy, ComputeCandidate, LaunchConfig,
    ResourceCaps, TierRow, TierSelector, REFERENCE_MODEL_ID,
};
use crate::hardware::HardwareProbe;
use crate::progress::{ProgressEvent, ProgressHandler, ProgressSlot};
use crate::provision::{ModelProvisioner, RuntimeProvisioner};
use crate::service::{ServiceController, ServiceError, ServiceState};
use crate::settings::{DesiredConfig, SettingsStore};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The collaborators a setup run drives
pub struct SetupComponents {
    pub probe: Arc<dyn HardwareProbe>,
    pub runtimes: Arc<dyn RuntimeProvisioner>,
    pub models: Arc<dyn ModelProvisioner>,
    pub bench: Arc<dyn BenchmarkRunner>,
    pub service: Arc<ServiceController>,
    pub settings: Arc<dyn SettingsStore>,
}

struct ActiveSession {
    session: SetupSession,
    cancel: CancellationToken,
    phase_started: Instant,
    started_at: Instant,
}

enum RetryPlan {
    Detect,
    Sweep,
    Final,
}

/// Runs hardware detection, the benchmark sweep, model selection and
/// service start as one cancellable session.
///
/// One session at a time. Long operations run without holding the state
/// lock; every phase change re-checks the session's own cancellation token
/// so a cancelled run can never touch a newer session. At most one flow
/// (sweep, final step or retry) runs at once, and a new session is refused
/// until a cancelled flow has fully unwound.
pub struct SetupOrchestrator {
    probe: Arc<dyn HardwareProbe>,
    enumerator: CandidateEnumerator,
    runtimes: Arc<dyn RuntimeProvisioner>,
    models: Arc<dyn ModelProvisioner>,
    bench: Arc<dyn BenchmarkRunner>,
    service: Arc<ServiceController>,
    settings: Arc<dyn SettingsStore>,
    selector: TierSelector,
    progress: Arc<ProgressSlot>,
    handler: Option<Arc<dyn ProgressHandler>>,
    gpu_layers: u32,
    state: Mutex<Option<ActiveSession>>,
    /// True while a flow is running; only written under the state lock
    busy: watch::Sender<bool>,
}

/// Releases the flow claim when the flow returns or is dropped
struct FlowClaim<'a> {
    orchestrator: &'a SetupOrchestrator,
}

impl Drop for FlowClaim<'_> {
    fn drop(&mut self) {
        let _state = self.orchestrator.state();
        self.orchestrator.busy.send_replace(false);
    }
}

impl SetupOrchestrator {
    pub fn new(components: SetupComponents, policy: CandidatePolicy, gpu_layers: u32) -> Self {
        Self {
            probe: components.probe,
            enumerator: CandidateEnumerator::new(policy),
            runtimes: components.runtimes,
            models: components.models,
            bench: components.bench,
            service: components.service,
            settings: components.settings,
            selector: TierSelector::default(),
            progress: Arc::new(ProgressSlot::new()),
            handler: None,
            gpu_layers,
            state: Mutex::new(None),
            busy: watch::channel(false).0,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ProgressHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Shares the slot the provisioners publish download progress into
    pub fn with_progress(mut self, progress: Arc<ProgressSlot>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_selector(mut self, selector: TierSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn progress(&self) -> &Arc<ProgressSlot> {
        &self.progress
    }

    pub fn service(&self) -> &Arc<ServiceController> {
        &self.service
    }

    /// Copy of the current session, if any
    pub fn snapshot(&self) -> Option<SetupSession> {
        self.state().as_ref().map(|active| active.session.clone())
    }

    pub fn phase(&self) -> SetupPhase {
        self.state()
            .as_ref()
            .map(|active| active.session.phase)
            .unwrap_or(SetupPhase::Idle)
    }

    pub fn tier_table(&self) -> Vec<TierRow> {
        self.selector.tier_table()
    }

    /// Detects hardware and benchmarks every candidate, stopping at
    /// [`SetupPhase::Selecting`] for the caller to confirm a model.
    pub async fn start_setup(&self) -> Result<SetupSession, SetupError> {
        let (session_id, cancel) = {
            let mut state = self.state();
            if self.flow_running() {
                return Err(SetupError::SessionActive);
            }
            if let Some(active) = state.as_ref() {
                if active.session.phase.is_active() {
                    return Err(SetupError::SessionActive);
                }
            }
            let session_id = Uuid::new_v4().to_string();
            let cancel = CancellationToken::new();
            *state = Some(ActiveSession {
                session: SetupSession::new(session_id.clone()),
                cancel: cancel.clone(),
                phase_started: Instant::now(),
                started_at: Instant::now(),
            });
            self.busy.send_replace(true);
            (session_id, cancel)
        };
        let _claim = FlowClaim { orchestrator: self };

        info!("Starting setup session {}", session_id);
        self.emit(ProgressEvent::Started { session_id });

        let result = self.detect_and_sweep(&cancel).await;
        self.settle(&cancel, result)
    }

    /// Picks the model for a tier while the session is selecting
    pub fn select_tier(&self, tier: u8) -> Result<String, SetupError> {
        if tier > MAX_TIER {
            return Err(SetupError::InvalidTier(tier));
        }
        let model_id = catalog::for_tier(tier).id.to_string();
        let mut state = self.state();
        if self.flow_running() {
            return Err(SetupError::SessionActive);
        }
        let active = selecting(&mut state, "select a tier")?;
        active.session.selected_model_id = Some(model_id.clone());
        debug!("Selected tier {} ({})", tier, model_id);
        Ok(model_id)
    }

    /// Accepts the recommendation, or `model_id` instead, then installs the
    /// model and starts the service.
    pub async fn confirm_selection(
        &self,
        model_id: Option<&str>,
    ) -> Result<SetupSession, SetupError> {
        if let Some(id) = model_id {
            if catalog::find(id).is_none() && self.models.model_path(id).is_none() {
                return Err(SetupError::UnknownModel(id.to_string()));
            }
        }
        let cancel = {
            let mut state = self.state();
            if self.flow_running() {
                return Err(SetupError::SessionActive);
            }
            let active = selecting(&mut state, "confirm a selection")?;
            if let Some(id) = model_id {
                active.session.selected_model_id = Some(id.to_string());
            }
            let cancel = active.cancel.clone();
            self.busy.send_replace(true);
            cancel
        };
        let _claim = FlowClaim { orchestrator: self };

        let result = self.finish(&cancel).await;
        self.settle(&cancel, result)
    }

    /// Resumes a failed session.
    ///
    /// Sweep phases continue at the candidate that failed and keep the
    /// measurements already taken; a sweep that ran out of candidates starts
    /// over. `InstallingFinal` and `Starting` rerun only the final step with
    /// the engine already chosen.
    pub async fn retry_from_phase(&self, phase: SetupPhase) -> Result<SetupSession, SetupError> {
        let (cancel, plan) = {
            let mut state = self.state();
            if self.flow_running() {
                return Err(SetupError::SessionActive);
            }
            let Some(active) = state.as_mut() else {
                return Err(SetupError::InvalidTransition {
                    action: "retry",
                    phase: SetupPhase::Idle,
                });
            };
            if active.session.phase != SetupPhase::Error {
                return Err(SetupError::InvalidTransition {
                    action: "retry",
                    phase: active.session.phase,
                });
            }

            let session = &mut active.session;
            let plan = match phase {
                SetupPhase::Detecting => RetryPlan::Detect,
                SetupPhase::Provisioning | SetupPhase::Benchmarking
                    if session.candidates.is_empty() =>
                {
                    RetryPlan::Detect
                }
                SetupPhase::Provisioning | SetupPhase::Benchmarking => {
                    if session.candidate_index >= session.candidates.len() {
                        session.reset_sweep();
                    }
                    RetryPlan::Sweep
                }
                SetupPhase::InstallingFinal | SetupPhase::Starting
                    if session.chosen_engine.is_some() =>
                {
                    RetryPlan::Final
                }
                other => {
                    return Err(SetupError::InvalidTransition {
                        action: "retry from",
                        phase: other,
                    })
                }
            };

            session.failure = None;
            session.cancelled = false;
            active.cancel = CancellationToken::new();
            self.busy.send_replace(true);
            (active.cancel.clone(), plan)
        };
        let _claim = FlowClaim { orchestrator: self };

        info!("Retrying setup from {}", phase);
        let result = match plan {
            RetryPlan::Detect => self.detect_and_sweep(&cancel).await,
            RetryPlan::Sweep => self.sweep(&cancel).await,
            RetryPlan::Final => self.finish(&cancel).await,
        };
        self.settle(&cancel, result)
    }

    /// Aborts the running session and returns it to idle.
    ///
    /// Stops any download, benchmark or service start in flight and any
    /// service this session started, and returns once the interrupted flow
    /// has unwound. The persisted configuration is left alone.
    pub async fn cancel(&self) -> Result<(), SetupError> {
        let stop_service = {
            let mut state = self.state();
            let Some(active) = state.as_mut() else {
                return Ok(());
            };
            match active.session.phase {
                SetupPhase::Idle => return Ok(()),
                phase @ (SetupPhase::Done | SetupPhase::Error) => {
                    return Err(SetupError::InvalidTransition {
                        action: "cancel",
                        phase,
                    })
                }
                _ => {}
            }
            active.cancel.cancel();
            active.session.cancelled = true;
            active.session.phase = SetupPhase::Idle;
            std::mem::take(&mut active.session.service_started)
        };

        self.runtimes.cancel_active_download();
        self.models.cancel_active_download();
        self.drained().await;
        if stop_service {
            self.service.stop().await;
        }
        self.progress.clear();

        info!("Setup cancelled");
        self.emit(ProgressEvent::Cancelled);
        Ok(())
    }

    /// Service state compared against the persisted configuration, read fresh
    pub async fn status(&self) -> Result<ServiceState, SetupError> {
        let desired = self.settings.load()?.map(|d| d.launch_config());
        Ok(self.service.status(desired.as_ref()).await)
    }

    /// Restarts the service with the persisted configuration
    pub async fn apply_and_restart(&self) -> Result<ServiceState, SetupError> {
        let desired = self
            .settings
            .load()?
            .ok_or(SetupError::NotConfigured)?
            .launch_config();
        self.service.apply_and_restart(desired.clone()).await?;
        Ok(self.service.status(Some(&desired)).await)
    }

    /// Starts the persisted configuration if it is marked for auto-start
    pub async fn serve_if_stopped(&self) -> Result<bool, SetupError> {
        match self.settings.load()? {
            Some(desired) => Ok(self.service.serve_if_stopped(&desired).await?),
            None => Ok(false),
        }
    }

    async fn detect_and_sweep(&self, cancel: &CancellationToken) -> Result<(), SetupError> {
        self.enter(cancel, SetupPhase::Detecting)?;
        let profile = self.probe.probe().await;
        let candidates = self.enumerator.enumerate(&profile);
        let gpu_layers = clamp_gpu_layers(self.gpu_layers, profile.vram_bytes);
        info!(
            "Detected {} cores, GPU {:?}; {} candidate(s)",
            profile.cpu_cores,
            profile.gpu_name,
            candidates.len()
        );
        self.emit(ProgressEvent::HardwareDetected {
            cpu_cores: profile.cpu_cores,
            gpu_name: profile.gpu_name.clone(),
            candidates: candidates.len(),
        });

        self.update(cancel, |session| {
            session.reset_sweep();
            session.profile = Some(profile);
            session.candidates = candidates;
            session.gpu_layers = gpu_layers;
        })?;
        self.sweep(cancel).await
    }

    /// Provisions and benchmarks candidates one at a time from the current
    /// index. Per-candidate failures are skipped.
    async fn sweep(&self, cancel: &CancellationToken) -> Result<(), SetupError> {
        let (candidates, start, gpu_layers, caps) = self.update(cancel, |session| {
            (
                session.candidates.clone(),
                session.candidate_index,
                session.gpu_layers,
                session
                    .profile
                    .as_ref()
                    .map(ResourceCaps::from_profile)
                    .unwrap_or_else(ResourceCaps::unlimited),
            )
        })?;
        let total = candidates.len();

        for (index, candidate) in candidates.iter().enumerate().skip(start) {
            self.enter(cancel, SetupPhase::Provisioning)?;
            self.update(cancel, |session| session.candidate_index = index)?;
            self.emit(ProgressEvent::CandidateStarted {
                label: candidate.label.clone(),
                index,
                total,
            });

            self.ensure_reference_model(cancel).await?;

            if let Err(e) = self
                .runtimes
                .install_runtime(&candidate.config, None, cancel)
                .await
            {
                if cancel.is_cancelled() || e.is_cancelled() {
                    return Err(SetupError::Cancelled);
                }
                self.skip(cancel, candidate, SetupPhase::Provisioning, e.into())?;
                continue;
            }

            self.enter(cancel, SetupPhase::Benchmarking)?;
            let request = BenchmarkRequest {
                candidate: candidate.clone(),
                reference_model_id: REFERENCE_MODEL_ID.to_string(),
                gpu_layers,
                caps,
            };
            match self.bench.run_benchmark(&request, cancel).await {
                Ok(outcome) => {
                    let entry = BenchmarkEntry {
                        candidate: candidate.clone(),
                        tokens_per_second: outcome.tokens_per_second,
                        recommended_tier: outcome.recommended_tier,
                        recommended_model_id: outcome.recommended_model_id,
                    };
                    info!(
                        "{}: {:.1} tok/s, tier {}",
                        candidate.label, entry.tokens_per_second, entry.recommended_tier
                    );
                    self.emit(ProgressEvent::BenchmarkRecorded {
                        label: candidate.label.clone(),
                        tokens_per_second: entry.tokens_per_second,
                        tier: entry.recommended_tier,
                    });
                    self.update(cancel, |session| session.entries.push(entry))?;
                }
                Err(BenchmarkError::Cancelled) => return Err(SetupError::Cancelled),
                Err(_) if cancel.is_cancelled() => return Err(SetupError::Cancelled),
                Err(source) => {
                    let error = SetupError::Benchmark {
                        label: candidate.label.clone(),
                        source,
                    };
                    self.skip(cancel, candidate, SetupPhase::Benchmarking, error)?;
                }
            }
        }

        self.update(cancel, |session| session.candidate_index = total)?;
        self.choose_engine(cancel)
    }

    async fn ensure_reference_model(&self, cancel: &CancellationToken) -> Result<(), SetupError> {
        if self.update(cancel, |session| session.reference_ready)? {
            return Ok(());
        }
        debug!("Provisioning reference model {}", REFERENCE_MODEL_ID);
        self.models
            .install_model(REFERENCE_MODEL_ID, None, cancel)
            .await
            .map_err(|e| {
                if cancel.is_cancelled() {
                    SetupError::Cancelled
                } else {
                    e.into()
                }
            })?;
        self.update(cancel, |session| session.reference_ready = true)
    }

    fn skip(
        &self,
        cancel: &CancellationToken,
        candidate: &ComputeCandidate,
        phase: SetupPhase,
        error: SetupError,
    ) -> Result<(), SetupError> {
        let reason = error.to_string();
        warn!("Skipping {} during {}: {}", candidate.label, phase, reason);
        self.emit(ProgressEvent::CandidateSkipped {
            label: candidate.label.clone(),
            reason: reason.clone(),
        });
        self.update(cancel, |session| {
            session.skipped.push(SkippedCandidate {
                candidate: candidate.clone(),
                phase,
                reason,
            })
        })
    }

    fn choose_engine(&self, cancel: &CancellationToken) -> Result<(), SetupError> {
        let chosen = self.update(cancel, |session| select_best(&session.entries).cloned())?;
        let Some(chosen) = chosen else {
            let (attempted, failures) = self.update(cancel, |session| {
                let failures = session
                    .skipped
                    .iter()
                    .map(|s| format!("{}: {}", s.candidate.label, s.reason))
                    .collect();
                (session.candidates.len(), failures)
            })?;
            return Err(SetupError::AggregateBenchmarkFailure {
                attempted,
                failures,
            });
        };

        self.enter(cancel, SetupPhase::Selecting)?;
        info!(
            "Chose {} ({:.1} tok/s), recommending {}",
            chosen.candidate.label, chosen.tokens_per_second, chosen.recommended_model_id
        );
        self.emit(ProgressEvent::EngineChosen {
            label: chosen.candidate.label.clone(),
            model_id: chosen.recommended_model_id.clone(),
        });
        self.update(cancel, |session| {
            session.recommended_model_id = Some(chosen.recommended_model_id.clone());
            session.selected_model_id = Some(chosen.recommended_model_id.clone());
            session.chosen_engine = Some(chosen);
        })
    }

    /// Installs the selected model, starts the service and persists the
    /// configuration.
    async fn finish(&self, cancel: &CancellationToken) -> Result<(), SetupError> {
        let launch = self
            .update(cancel, |session| session.chosen_launch())?
            .ok_or(SetupError::InvalidTransition {
                action: "install a model",
                phase: SetupPhase::Idle,
            })?;

        self.enter(cancel, SetupPhase::InstallingFinal)?;
        self.models
            .install_model(&launch.model_id, None, cancel)
            .await
            .map_err(|e| {
                if cancel.is_cancelled() {
                    SetupError::Cancelled
                } else {
                    e.into()
                }
            })?;

        self.enter(cancel, SetupPhase::Starting)?;
        self.service
            .start_cancellable(launch.clone(), cancel)
            .await
            .map_err(|e| match e {
                ServiceError::Cancelled => SetupError::Cancelled,
                e if cancel.is_cancelled() => {
                    debug!("Service start failed after cancel: {}", e);
                    SetupError::Cancelled
                }
                e => e.into(),
            })?;
        if self
            .update(cancel, |session| session.service_started = true)
            .is_err()
        {
            self.service.stop().await;
            return Err(SetupError::Cancelled);
        }

        if let Err(e) = self.commit(cancel, &launch) {
            if !matches!(e, SetupError::Cancelled) {
                self.service.stop().await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Persists the configuration and moves to `Done` in one step, so a
    /// cancel can never leave a half-committed result.
    fn commit(&self, cancel: &CancellationToken, launch: &LaunchConfig) -> Result<(), SetupError> {
        let (previous, elapsed, total) = {
            let mut state = self.state();
            let active = live(&mut state, cancel)?;
            self.settings.save(&DesiredConfig::new(launch, true))?;
            let previous = active.session.phase;
            let elapsed = active.phase_started.elapsed();
            active.session.phase = SetupPhase::Done;
            active.phase_started = Instant::now();
            (previous, elapsed, active.started_at.elapsed())
        };
        self.progress.clear();
        self.emit(ProgressEvent::PhaseComplete {
            phase: previous.to_string(),
            duration: elapsed,
        });
        info!(
            "Setup complete: {} on {} in {:.1}s",
            launch.model_id,
            launch.compute,
            total.as_secs_f64()
        );
        self.emit(ProgressEvent::Completed {
            model_id: launch.model_id.clone(),
            total_time: total,
        });
        Ok(())
    }

    /// Records a failure against the phase it happened in
    fn settle(
        &self,
        cancel: &CancellationToken,
        result: Result<(), SetupError>,
    ) -> Result<SetupSession, SetupError> {
        let error = match result {
            Ok(()) => {
                return self
                    .state()
                    .as_ref()
                    .filter(|_| !cancel.is_cancelled())
                    .map(|active| active.session.clone())
                    .ok_or(SetupError::Cancelled)
            }
            Err(SetupError::Cancelled) => return Err(SetupError::Cancelled),
            Err(e) => e,
        };

        let phase = {
            let mut state = self.state();
            match live(&mut state, cancel) {
                Ok(active) => {
                    let phase = active.session.phase;
                    active.session.failure = Some(SessionFailure {
                        phase,
                        message: error.to_string(),
                    });
                    active.session.phase = SetupPhase::Error;
                    phase
                }
                Err(_) => return Err(SetupError::Cancelled),
            }
        };

        self.progress.clear();
        error!("Setup failed during {}: {}", phase, error);
        self.emit(ProgressEvent::Failed {
            phase: phase.to_string(),
            error: error.to_string(),
        });
        Err(error)
    }

    /// Moves the session to `phase` and clears stale download progress
    fn enter(&self, cancel: &CancellationToken, phase: SetupPhase) -> Result<(), SetupError> {
        let completed = {
            let mut state = self.state();
            let active = live(&mut state, cancel)?;
            let previous = active.session.phase;
            if previous == phase {
                None
            } else {
                let elapsed = active.phase_started.elapsed();
                active.session.phase = phase;
                active.phase_started = Instant::now();
                Some((previous, elapsed))
            }
        };
        self.progress.clear();

        if let Some((previous, duration)) = completed {
            if !matches!(previous, SetupPhase::Idle | SetupPhase::Error) {
                self.emit(ProgressEvent::PhaseComplete {
                    phase: previous.to_string(),
                    duration,
                });
            }
            debug!("Setup phase: {}", phase);
            self.emit(ProgressEvent::PhaseStarted {
                phase: phase.to_string(),
            });
        }
        Ok(())
    }

    fn update<R>(
        &self,
        cancel: &CancellationToken,
        f: impl FnOnce(&mut SetupSession) -> R,
    ) -> Result<R, SetupError> {
        let mut state = self.state();
        let active = live(&mut state, cancel)?;
        Ok(f(&mut active.session))
    }

    fn flow_running(&self) -> bool {
        *self.busy.borrow()
    }

    /// Waits until no flow is running
    async fn drained(&self) {
        let mut busy = self.busy.subscribe();
        let closed = busy.wait_for(|running| !*running).await.is_err();
        if closed {
            warn!("Flow state channel closed");
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(handler) = &self.handler {
            handler.on_progress(&event);
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The session owned by `cancel`, unless it was cancelled or replaced
fn live<'a>(
    state: &'a mut Option<ActiveSession>,
    cancel: &CancellationToken,
) -> Result<&'a mut ActiveSession, SetupError> {
    match state.as_mut() {
        Some(active) if !cancel.is_cancelled() && !active.session.cancelled => Ok(active),
        _ => Err(SetupError::Cancelled),
    }
}

fn selecting<'a>(
    state: &'a mut Option<ActiveSession>,
    action: &'static str,
) -> Result<&'a mut ActiveSession, SetupError> {
    match state.as_mut() {
        Some(active) if active.session.phase == SetupPhase::Selecting => Ok(active),
        Some(active) => Err(SetupError::InvalidTransition {
            action,
            phase: active.session.phase,
        }),
        None => Err(SetupError::InvalidTransition {
            action,
            phase: SetupPhase::Idle,
        }),
    }
}
