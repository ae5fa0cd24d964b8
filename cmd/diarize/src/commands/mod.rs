//! CLI commands module.

mod ahc;
mod batch;
mod coupled;
mod score;
mod spectral;
mod util;
mod vbx;

pub use ahc::AhcCommand;
pub use batch::BatchCommand;
pub use coupled::CoupledCommand;
pub use score::ScoreCommand;
pub use spectral::SpectralCommand;
pub use vbx::VbxCommand;

// Re-export utils for use in commands
pub(crate) use util::*;
