//! Frame-level DER of hypothesis turns against a reference.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use giztoy_diarize::pipeline::read_rttm_file;
use giztoy_diarize::score_rttm;

use super::output_result;
use crate::Cli;

#[derive(Args)]
pub struct ScoreCommand {
    /// Reference RTTM
    #[arg(long)]
    reference: String,

    /// Hypothesis RTTM
    #[arg(long)]
    hypothesis: String,

    /// Frame step in seconds
    #[arg(long, default_value_t = 0.01)]
    step: f64,
}

impl ScoreCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let reference =
            read_rttm_file(Path::new(&self.reference)).with_context(|| format!("read {}", self.reference))?;
        let hypothesis =
            read_rttm_file(Path::new(&self.hypothesis)).with_context(|| format!("read {}", self.hypothesis))?;
        let report = score_rttm(reference, hypothesis, self.step)?;
        output_result(&report, cli.output.as_deref(), cli.json)?;
        Ok(ExitCode::SUCCESS)
    }
}
