use crate::engine::{BenchmarkEntry, ComputeCandidate, LaunchConfig};
use crate::hardware::HardwareProfile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SetupPhase {
    Idle,
    Detecting,
    Provisioning,
    Benchmarking,
    Selecting,
    InstallingFinal,
    Starting,
    Done,
    Error,
}

impl SetupPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SetupPhase::Idle => "idle",
            SetupPhase::Detecting => "detecting",
            SetupPhase::Provisioning => "provisioning",
            SetupPhase::Benchmarking => "benchmarking",
            SetupPhase::Selecting => "selecting",
            SetupPhase::InstallingFinal => "installingFinal",
            SetupPhase::Starting => "starting",
            SetupPhase::Done => "done",
            SetupPhase::Error => "error",
        }
    }

    /// A session in this phase blocks a new one from starting
    pub fn is_active(self) -> bool {
        !matches!(self, SetupPhase::Idle | SetupPhase::Done | SetupPhase::Error)
    }
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SetupPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let phase = match s.trim().to_lowercase().replace(['-', '_'], "").as_str() {
            "idle" => SetupPhase::Idle,
            "detecting" => SetupPhase::Detecting,
            "provisioning" => SetupPhase::Provisioning,
            "benchmarking" => SetupPhase::Benchmarking,
            "selecting" => SetupPhase::Selecting,
            "installingfinal" => SetupPhase::InstallingFinal,
            "starting" => SetupPhase::Starting,
            "done" => SetupPhase::Done,
            "error" => SetupPhase::Error,
            other => return Err(format!("Unknown setup phase: {}", other)),
        };
        Ok(phase)
    }
}

/// A candidate dropped from the sweep and why
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedCandidate {
    pub candidate: ComputeCandidate,
    pub phase: SetupPhase,
    pub reason: String,
}

/// The error that moved a session into [`SetupPhase::Error`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFailure {
    pub phase: SetupPhase,
    pub message: String,
}

/// State of one setup invocation. Lives in memory only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupSession {
    pub id: String,
    pub phase: SetupPhase,
    pub cancelled: bool,
    pub profile: Option<HardwareProfile>,
    pub candidates: Vec<ComputeCandidate>,
    pub candidate_index: usize,
    /// Successful measurements in the order they were taken
    pub entries: Vec<BenchmarkEntry>,
    pub skipped: Vec<SkippedCandidate>,
    pub gpu_layers: u32,
    pub chosen_engine: Option<BenchmarkEntry>,
    pub recommended_model_id: Option<String>,
    pub selected_model_id: Option<String>,
    pub failure: Option<SessionFailure>,
    #[serde(skip)]
    pub(crate) reference_ready: bool,
    #[serde(skip)]
    pub(crate) service_started: bool,
}

impl SetupSession {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            phase: SetupPhase::Idle,
            cancelled: false,
            profile: None,
            candidates: Vec::new(),
            candidate_index: 0,
            entries: Vec::new(),
            skipped: Vec::new(),
            gpu_layers: 0,
            chosen_engine: None,
            recommended_model_id: None,
            selected_model_id: None,
            failure: None,
            reference_ready: false,
            service_started: false,
        }
    }

    /// What the service would be launched with if the selection were confirmed
    pub fn chosen_launch(&self) -> Option<LaunchConfig> {
        let engine = self.chosen_engine.as_ref()?;
        let model_id = self.selected_model_id.as_ref()?;
        Some(LaunchConfig::new(
            model_id.clone(),
            engine.candidate.config,
            self.gpu_layers,
        ))
    }

    pub(crate) fn reset_sweep(&mut self) {
        self.candidate_index = 0;
        self.entries.clear();
        self.skipped.clear();
        self.chosen_engine = None;
        self.recommended_model_id = None;
        self.selected_model_id = None;
    }
}

/// Highest tier wins, then higher throughput. On a full tie the candidate
/// measured first is kept.
pub fn select_best(entries: &[BenchmarkEntry]) -> Option<&BenchmarkEntry> {
    entries.iter().fold(None, |best: Option<&BenchmarkEntry>, entry| match best {
        Some(current)
            if (entry.recommended_tier, entry.tokens_per_second)
                <= (current.recommended_tier, current.tokens_per_second) =>
        {
            Some(current)
        }
        _ => Some(entry),
    })
}
