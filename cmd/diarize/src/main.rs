//! Diarize CLI - speaker diarization over Kaldi x-vector archives.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;

use commands::{AhcCommand, BatchCommand, CoupledCommand, ScoreCommand, SpectralCommand, VbxCommand};

/// Diarize CLI - cluster speaker embeddings into RTTM turns.
///
/// Every subcommand reads a config file (YAML or JSON, see --config) and
/// applies its own flags on top.
#[derive(Parser)]
#[command(name = "diarize")]
#[command(about = "Speaker diarization: NME spectral clustering or AHC, VB-HMM refinement, RTTM output")]
#[command(version)]
pub struct Cli {
    /// Config file (YAML or JSON)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Output file or, for batch, directory (default: stdout)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<String>,

    /// Print summaries as JSON instead of YAML
    #[arg(long, global = true)]
    pub json: bool,

    /// Seed for every random component
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// NME spectral clustering only
    Spectral(SpectralCommand),
    /// Average-linkage AHC with a calibrated threshold only
    Ahc(AhcCommand),
    /// Single-stream VB-HMM refinement
    Vbx(VbxCommand),
    /// Coupled two-stream VB-HMM over separated channels
    Coupled(CoupledCommand),
    /// Diarize every recording of a list, one RTTM each
    Batch(BatchCommand),
    /// Frame-level DER of a hypothesis RTTM
    Score(ScoreCommand),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match &cli.command {
        Commands::Spectral(cmd) => cmd.run(&cli),
        Commands::Ahc(cmd) => cmd.run(&cli),
        Commands::Vbx(cmd) => cmd.run(&cli),
        Commands::Coupled(cmd) => cmd.run(&cli),
        Commands::Batch(cmd) => cmd.run(&cli),
        Commands::Score(cmd) => cmd.run(&cli),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            commands::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
