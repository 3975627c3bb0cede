//! Hardware capability detection

mod probe;
mod profile;

pub use probe::{HardwareProbe, SystemProbe};
pub use profile::HardwareProfile;
