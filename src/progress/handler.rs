//! Progress handler trait and events

use std::time::Duration;

/// Events emitted while a setup session runs
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Setup session started
    Started { session_id: String },

    /// Hardware probe finished
    HardwareDetected {
        cpu_cores: usize,
        gpu_name: Option<String>,
        candidates: usize,
    },

    /// Session entered a new phase
    PhaseStarted { phase: String },

    /// Session left a phase
    PhaseComplete { phase: String, duration: Duration },

    /// Provisioning or benchmarking of one candidate started
    CandidateStarted {
        label: String,
        index: usize,
        total: usize,
    },

    /// A candidate was dropped from the sweep
    CandidateSkipped { label: String, reason: String },

    /// A benchmark succeeded
    BenchmarkRecorded {
        label: String,
        tokens_per_second: f64,
        tier: u8,
    },

    /// The sweep picked an engine
    EngineChosen { label: String, model_id: String },

    /// Setup finished and the service is running
    Completed { model_id: String, total_time: Duration },

    /// Setup was cancelled by the user
    Cancelled,

    /// Setup failed
    Failed { phase: String, error: String },
}

/// Trait for handling progress events during setup
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {}
}
