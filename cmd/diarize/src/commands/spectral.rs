//! NME spectral clustering without refinement.

use std::process::ExitCode;

use clap::Args;
use giztoy_diarize::InitMode;

use super::{
    build_diarizer, load_config, load_recordings, output_result, report_failures, write_rttms, InputArgs, SpectralArgs,
};
use crate::Cli;

#[derive(Args)]
pub struct SpectralCommand {
    #[command(flatten)]
    inputs: InputArgs,

    #[command(flatten)]
    spectral: SpectralArgs,

    /// Also write a per-recording summary (YAML, or JSON with --json)
    #[arg(long)]
    summary: Option<String>,
}

impl SpectralCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let mut config = load_config(cli)?;
        config.init = InitMode::Spectral;
        self.spectral.apply(&mut config);
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
