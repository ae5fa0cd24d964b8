//! Single-stream VB-HMM refinement.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use giztoy_diarize::InitMode;
use serde::Serialize;

use super::{
    attach_reference, build_diarizer, load_config, load_recordings, output_result, report_failures,
    with_refinement, write_rttms, InputArgs, SpectralArgs, VbArgs,
};
use crate::Cli;

#[derive(Args)]
pub struct VbxCommand {
    #[command(flatten)]
    inputs: InputArgs,

    #[command(flatten)]
    spectral: SpectralArgs,

    #[command(flatten)]
    vb: VbArgs,

    /// Probability of staying with the current speaker
    #[arg(long)]
    loop_prob: Option<f64>,

    /// Minimum speaker duration in frames
    #[arg(long)]
    min_dur: Option<usize>,

    /// Reference RTTM; traces DER and cross-entropy per VB iteration
    #[arg(long)]
    reference: Option<String>,

    /// Write the per-iteration VB trace of every recording here (JSON)
    #[arg(long)]
    trace: Option<String>,

    /// Also write a per-recording summary (YAML, or JSON with --json)
    #[arg(long)]
    summary: Option<String>,
}

#[derive(Serialize)]
struct TraceEntry<'a> {
    recording: &'a str,
    trace: &'a giztoy_diarize::VbTrace,
}

impl VbxCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let mut config = load_config(cli)?;
        config.init = with_refinement(config.init);
        self.spectral.apply(&mut config);
        self.vb.apply_single(&mut config);
        if let Some(v) = self.loop_prob {
            config.vbx.options.loop_prob = v;
        }
        if let Some(v) = self.min_dur {
            config.vbx.options.min_dur = v;
        }
        if matches!(config.init, InitMode::Spectral | InitMode::Ahc) {
            anyhow::bail!("vbx needs --init spectral+vb, ahc+vb or random_N");
        }
        let diarizer = build_diarizer(config, &self.inputs.models)?;

        let archive = load_recordings(&self.inputs)?;
        let recs = attach_reference(archive.recordings, self.reference.as_deref())?;
        let (results, failed) = diarizer.diarize_all(&recs, false);
        let failed: Vec<_> = archive.failed.into_iter().chain(failed).collect();
        write_rttms(&results, cli.output.as_deref())?;

        if let Some(path) = &self.trace {
            let entries: Vec<TraceEntry> = results
                .iter()
                .filter_map(|d| {
                    d.trace.as_ref().map(|trace| TraceEntry {
                        recording: &d.recording,
                        trace,
                    })
                })
                .collect();
            let json = serde_json::to_string_pretty(&entries)?;
            std::fs::write(Path::new(path), json + "\n").with_context(|| format!("write {path}"))?;
        }
        if let Some(path) = &self.summary {
            let summaries: Vec<_> = results.iter().map(|d| d.summary()).collect();
            output_result(&summaries, Some(path), cli.json)?;
        }
        Ok(report_failures(&failed, results.len()))
    }
}
