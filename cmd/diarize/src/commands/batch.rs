//! Diarization of a list of recordings.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use giztoy_diarize::read_job_list;

use super::{build_diarizer, load_config, output_result, print_error, print_success, ModelArgs, SpectralArgs, VbArgs};
use crate::Cli;

#[derive(Args)]
pub struct BatchCommand {
    /// File with one recording id per line
    #[arg(long)]
    list: String,

    /// Directory holding <id>.ark, <id>.seg and optionally <id>.rttm (overlap)
    #[arg(long)]
    dir: String,

    /// Directory receiving <id>.rttm
    #[arg(long)]
    out_dir: String,

    /// Use the coupled two-stream model
    #[arg(long)]
    coupled: bool,

    #[command(flatten)]
    models: ModelArgs,

    #[command(flatten)]
    spectral: SpectralArgs,

    #[command(flatten)]
    vb: VbArgs,
}

impl BatchCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<ExitCode> {
        let mut config = load_config(cli)?;
        self.spectral.apply(&mut config);
        if self.coupled {
            self.vb.apply_coupled(&mut config);
        } else {
            self.vb.apply_single(&mut config);
        }
        let diarizer = build_diarizer(config, &self.models)?;

        let jobs = read_job_list(Path::new(&self.list), Path::new(&self.dir))
            .with_context(|| format!("read list {}", self.list))?;
        std::fs::create_dir_all(&self.out_dir).with_context(|| format!("create {}", self.out_dir))?;
        let summary = diarizer.run_batch(&jobs, self.coupled, Path::new(&self.out_dir));
        output_result(&summary, cli.output.as_deref(), cli.json)?;

        if summary.all_succeeded() {
            print_success(&format!("{} recordings diarized", summary.succeeded.len()));
            Ok(ExitCode::SUCCESS)
        } else {
            print_error(&format!(
                "{} of {} recordings failed",
                summary.failed.len(),
                jobs.len()
            ));
            Ok(ExitCode::FAILURE)
        }
    }
}
