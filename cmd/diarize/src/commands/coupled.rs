//! Coupled two-stream VB-HMM over separated channels.

use std::process::ExitCode;

use clap::Args;

use super::{
    build_diarizer, load_config, load_recordings, output_result, report_failures, with_refinement, write_rttms,
    InputArgs, SpectralArgs, VbArgs,
};
use crate::Cli;

#[derive(Args)]
pub struct CoupledCommand {
    #[command(flatten)]
    inputs: InputArgs,

    #[command(flatten)]
    spectral: SpectralArgs,

    #[command(flatten)]
    vb: VbArgs,

    /// Self-loop probability of same-speaker joint states
    #[arg(long)]
    loop_same: Option<f64>,

    /// Self-loop probability of mixed-speaker joint states
    #[arg(long)]
    loop_diff: Option<f64>,

    /// Also write a per-recording summary (YAML, or JSON with --json)
    #[arg(long)]
    summary: Option<String>,
}

impl CoupledCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let mut config = load_config(cli)?;
        config.init = with_refinement(config.init);
        self.spectral.apply(&mut config);
        self.vb.apply_coupled(&mut config);
        if let Some(v) = self.loop_same {
            config.coupled.options.loop_same = v;
        }
        if let Some(v) = self.loop_diff {
            config.coupled.options.loop_diff = v;
        }
        let diarizer = build_diarizer(config, &self.inputs.models)?;

        let archive = load_recordings(&self.inputs)?;
        let (results, failed) = diarizer.diarize_all(&archive.recordings, true);
        let failed: Vec<_> = archive.failed.into_iter().chain(failed).collect();
        write_rttms(&results, cli.output.as_deref())?;

        if let Some(path) = &self.summary {
            let summaries: Vec<_> = results.iter().map(|d| d.summary()).collect();
            output_result(&summaries, Some(path), cli.json)?;
        }
        Ok(report_failures(&failed, results.len()))
    }
}
