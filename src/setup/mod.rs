//! Setup state machine: detect, benchmark, select, install, start

mod error;
mod orchestrator;
mod session;

pub use error::SetupError;
pub use orchestrator::{SetupComponents, SetupOrchestrator};
pub use session::{select_best, SessionFailure, SetupPhase, SetupSession, SkippedCandidate};
