//! Shared arguments and helpers for CLI commands.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use giztoy_diarize::pipeline::{read_rttm_file, records_by_recording};
use giztoy_diarize::{
    DiarizeConfig, Diarization, Diarizer, InitMode, LoadedArchive, Plda, Recording, RecordingFailure, SimilarityKind,
    XvecTransform,
};

use crate::Cli;

/// Embedding, timing and model inputs.
#[derive(Args, Debug)]
pub struct InputArgs {
    /// Embedding archive (Kaldi .ark, binary or text)
    #[arg(long)]
    pub ark: String,

    /// Kaldi segments file with the window timing
    #[arg(long)]
    pub segments: String,

    #[command(flatten)]
    pub models: ModelArgs,

    /// Overlapped-speech RTTM; flagged windows get a second speaker
    #[arg(long)]
    pub overlap: Option<String>,
}

/// Model bundles.
#[derive(Args, Debug)]
pub struct ModelArgs {
    /// x-vector transform bundle (.npz with mean1, mean2, lda)
    #[arg(long)]
    pub transform: Option<String>,

    /// PLDA bundle (.npz with mu, tr, psi)
    #[arg(long)]
    pub plda: Option<String>,
}

/// Spectral clustering overrides.
#[derive(Args, Debug, Default)]
pub struct SpectralArgs {
    /// Affinity: cosine or plda
    #[arg(long)]
    pub similarity: Option<SimilarityKind>,

    /// Smallest neighbour count tried
    #[arg(long)]
    pub pmin: Option<usize>,

    /// Largest neighbour count tried
    #[arg(long)]
    pub pmax: Option<usize>,

    /// Upper bound of the eigengap speaker estimate
    #[arg(long)]
    pub max_speakers: Option<usize>,

    /// Fixed speaker count, skipping the estimate
    #[arg(long)]
    pub num_speakers: Option<usize>,
}

impl SpectralArgs {
    pub fn apply(&self, cfg: &mut DiarizeConfig) {
        if let Some(s) = self.similarity {
            cfg.similarity = s;
        }
        if let Some(v) = self.pmin {
            cfg.spectral.pmin = v;
        }
        if let Some(v) = self.pmax {
            cfg.spectral.pmax = v;
        }
        if let Some(v) = self.max_speakers {
            cfg.spectral.max_speakers = v;
        }
        if self.num_speakers.is_some() {
            cfg.spectral.num_speakers = self.num_speakers;
        }
    }
}

/// VB-HMM overrides shared by the single-stream and coupled commands.
#[derive(Args, Debug, Default)]
pub struct VbArgs {
    /// Initialisation: spectral+vb, ahc+vb or random_N
    #[arg(long)]
    pub init: Option<InitMode>,

    /// Bias added to the calibrated AHC threshold (ahc+vb)
    #[arg(long, allow_hyphen_values = true)]
    pub ahc_threshold: Option<f64>,

    /// PLDA dimensions used as VB features
    #[arg(long)]
    pub lda_dim: Option<usize>,

    /// Acoustic scaling factor
    #[arg(long)]
    pub fa: Option<f64>,

    /// Speaker regularisation factor
    #[arg(long)]
    pub fb: Option<f64>,

    /// Maximum VB iterations
    #[arg(long)]
    pub max_iters: Option<usize>,

    /// Sharpness of the initial soft labels
    #[arg(long)]
    pub init_smoothing: Option<f64>,

    /// Speaker slots of each random start
    #[arg(long)]
    pub max_random_speakers: Option<usize>,
}

impl VbArgs {
    /// Applies the overrides to the single-stream VB section.
    pub fn apply_single(&self, cfg: &mut DiarizeConfig) {
        self.apply_common(cfg);
        let vbx = &mut cfg.vbx;
        if let Some(v) = self.fa {
            vbx.options.fa = v;
        }
        if let Some(v) = self.fb {
            vbx.options.fb = v;
        }
        if let Some(v) = self.max_iters {
            vbx.options.max_iters = v;
        }
        if let Some(v) = self.init_smoothing {
            vbx.init_smoothing = v;
        }
    }

    /// Applies the overrides to the coupled VB section.
    pub fn apply_coupled(&self, cfg: &mut DiarizeConfig) {
        self.apply_common(cfg);
        let coupled = &mut cfg.coupled;
        if let Some(v) = self.fa {
            coupled.options.fa = v;
        }
        if let Some(v) = self.fb {
            coupled.options.fb = v;
        }
        if let Some(v) = self.max_iters {
            coupled.options.max_iters = v;
        }
        if let Some(v) = self.init_smoothing {
            coupled.init_smoothing = v;
        }
    }

    fn apply_common(&self, cfg: &mut DiarizeConfig) {
        if let Some(mode) = self.init {
            cfg.init = mode;
        }
        if let Some(v) = self.ahc_threshold {
            cfg.ahc.threshold = v;
        }
        if let Some(v) = self.lda_dim {
            cfg.vbx.lda_dim = v;
        }
        if let Some(v) = self.max_random_speakers {
            cfg.vbx.max_random_speakers = v;
        }
    }
}

/// The VB-refined counterpart of a clustering-only init mode.
pub fn with_refinement(mode: InitMode) -> InitMode {
    match mode {
        InitMode::Spectral => InitMode::SpectralVb,
        InitMode::Ahc => InitMode::AhcVb,
        other => other,
    }
}

/// Reads the config file (or defaults) and applies the global flags.
pub fn load_config(cli: &Cli) -> anyhow::Result<DiarizeConfig> {
    let cfg = match &cli.config {
        Some(path) => DiarizeConfig::load(Path::new(path)).with_context(|| format!("load config {path}"))?,
        None => DiarizeConfig::default(),
    };
    Ok(match cli.seed {
        Some(seed) => cfg.with_seed(seed),
        None => cfg,
    })
}

/// Loads the model bundles and validates them against `config`.
pub fn build_diarizer(config: DiarizeConfig, models: &ModelArgs) -> anyhow::Result<Diarizer> {
    let transform = match &models.transform {
        Some(path) => Some(XvecTransform::load(Path::new(path)).with_context(|| format!("load transform {path}"))?),
        None => None,
    };
    let plda = match &models.plda {
        Some(path) => Some(Plda::load(Path::new(path)).with_context(|| format!("load PLDA {path}"))?),
        None => None,
    };
    Ok(Diarizer::new(config, transform, plda)?)
}

/// Loads every recording of the input archive. Recordings that do not
/// match their timing come back in `failed`.
pub fn load_recordings(inputs: &InputArgs) -> anyhow::Result<LoadedArchive> {
    let archive = Recording::load(
        Path::new(&inputs.ark),
        Path::new(&inputs.segments),
        inputs.overlap.as_deref().map(Path::new),
    )
    .with_context(|| format!("load {} with {}", inputs.ark, inputs.segments))?;
    tracing::debug!(
        recordings = archive.recordings.len(),
        failed = archive.failed.len(),
        source = %inputs.ark,
        "loaded recordings"
    );
    Ok(archive)
}

/// Prints every failed recording. Any failure turns the exit code into a
/// failure, even though the other recordings were written.
pub fn report_failures(failed: &[RecordingFailure], done: usize) -> ExitCode {
    if failed.is_empty() {
        return ExitCode::SUCCESS;
    }
    for f in failed {
        print_error(&format!("{}: {}", f.id, f.error));
    }
    print_error(&format!("{} of {} recordings failed", failed.len(), failed.len() + done));
    ExitCode::FAILURE
}

/// Attaches reference labels from an RTTM to every recording it covers.
pub fn attach_reference(recs: Vec<Recording>, reference: Option<&str>) -> anyhow::Result<Vec<Recording>> {
    let Some(path) = reference else {
        return Ok(recs);
    };
    let by_rec = records_by_recording(read_rttm_file(Path::new(path)).with_context(|| format!("read {path}"))?);
    Ok(recs
        .into_iter()
        .map(|rec| match by_rec.get(&rec.id) {
            Some(records) => rec.with_reference(records),
            None => rec,
        })
        .collect())
}

/// Writes every diarization as RTTM to `output`, or stdout.
pub fn write_rttms(results: &[Diarization], output: Option<&str>) -> anyhow::Result<()> {
    let mut w: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| format!("create {path}"))?)),
        None => Box::new(std::io::stdout().lock()),
    };
    for d in results {
        d.write_rttm(&mut w)?;
    }
    w.flush()?;
    Ok(())
}

/// Outputs result as JSON or YAML.
pub fn output_result<T: serde::Serialize>(result: &T, output_path: Option<&str>, as_json: bool) -> anyhow::Result<()> {
    let output = if as_json {
        serde_json::to_string_pretty(result)? + "\n"
    } else {
        serde_yaml::to_string(result)?
    };

    match output_path {
        Some(path) => std::fs::write(path, output)?,
        None => print!("{}", output),
    }

    Ok(())
}

/// Prints success message.
pub fn print_success(msg: &str) {
    eprintln!("\x1b[32m✓\x1b[0m {}", msg);
}

/// Prints error message.
pub fn print_error(msg: &str) {
    eprintln!("\x1b[31m✗\x1b[0m {}", msg);
}
