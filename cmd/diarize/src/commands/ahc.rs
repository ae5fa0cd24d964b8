//! Calibrated AHC without refinement.

use std::process::ExitCode;

use clap::Args;
use giztoy_diarize::InitMode;

use super::{build_diarizer, load_config, load_recordings, output_result, report_failures, write_rttms, InputArgs};
use crate::Cli;

#[derive(Args)]
pub struct AhcCommand {
    #[command(flatten)]
    inputs: InputArgs,

    /// Bias added to the calibrated threshold; lower merges more
    #[arg(long, allow_hyphen_values = true)]
    threshold: Option<f64>,

    /// Also write a per-recording summary (YAML, or JSON with --json)
    #[arg(long)]
    summary: Option<String>,
}

impl AhcCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let mut config = load_config(cli)?;
        config.init = InitMode::Ahc;
        if let Some(v) = self.threshold {
            config.ahc.threshold = v;
        }
        let diarizer = build_diarizer(config, &self.inputs.models)?;

        let archive = load_recordings(&self.inputs)?;
        let (results, failed) = diarizer.diarize_all(&archive.recordings, false);
        let failed: Vec<_> = archive.failed.into_iter().chain(failed).collect();
        write_rttms(&results, cli.output.as_deref())?;

        if let Some(path) = &self.summary {
            let summaries: Vec<_> = results.iter().map(|d| d.summary()).collect();
            output_result(&summaries, Some(path), cli.json)?;
        }
        Ok(report_failures(&failed, results.len()))
    }
}
