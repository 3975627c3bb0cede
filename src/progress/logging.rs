//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use tracing::{debug, info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { session_id } => {
                info!(session = %session_id, "Starting engine setup");
            }
            ProgressEvent::HardwareDetected {
                cpu_cores,
                gpu_name,
                candidates,
            } => {
                info!(
                    cpu_cores,
                    gpu = gpu_name.as_deref().unwrap_or("none"),
                    candidates,
                    "Hardware detected"
                );
            }
            ProgressEvent::PhaseStarted { phase } => {
                debug!(phase = %phase, "Entering phase");
            }
            ProgressEvent::PhaseComplete { phase, duration } => {
                debug!(
                    phase = %phase,
                    duration_ms = duration.as_millis(),
                    "Phase complete"
                );
            }
            ProgressEvent::CandidateStarted {
                label,
                index,
                total,
            } => {
                info!(
                    candidate = %label,
                    progress = format!("{}/{}", index + 1, total),
                    "Trying compute candidate"
                );
            }
            ProgressEvent::CandidateSkipped { label, reason } => {
                warn!(candidate = %label, reason = %reason, "Skipping compute candidate");
            }
            ProgressEvent::BenchmarkRecorded {
                label,
                tokens_per_second,
                tier,
            } => {
                info!(
                    candidate = %label,
                    tokens_per_second = format!("{:.1}", tokens_per_second),
                    tier,
                    "Benchmark recorded"
                );
            }
            ProgressEvent::EngineChosen { label, model_id } => {
                info!(engine = %label, model = %model_id, "Engine chosen");
            }
            ProgressEvent::Completed {
                model_id,
                total_time,
            } => {
                info!(
                    model = %model_id,
                    total_time_ms = total_time.as_millis(),
                    "Setup complete"
                );
            }
            ProgressEvent::Cancelled => {
                info!("Setup cancelled");
            }
            ProgressEvent::Failed { phase, error } => {
                warn!(phase = %phase, error = %error, "Setup failed");
            }
        }
    }
}
