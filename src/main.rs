mod cli;
mod output;

use std::path::PathBuf;

use chrono::Local;
use clap::{Parser, Subcommand};
use genopack::binary::{DEFAULT_READ_SCRATCH, Orientation};
use genopack::error::{CustomError, Result};
use miette::IntoDiagnostic;

/// Inspect, convert and summarize packed genotype matrices.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Log codec activity to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header and dimensions of a matrix or triple file.
    Info {
        #[arg(value_hint = clap::ValueHint::FilePath)]
        file: PathBuf,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Rewrite a matrix, optionally transposing it.
    Convert {
        #[arg(value_hint = clap::ValueHint::FilePath)]
        input: PathBuf,

        #[arg(value_hint = clap::ValueHint::FilePath)]
        output: PathBuf,

        /// Layout of the output: "ldat" (one row per locus) or "sdat" (one row per sample).
        #[arg(long)]
        orientation: Option<Orientation>,

        /// Store blocks uncompressed.
        #[arg(long)]
        no_compress: bool,

        /// Bytes of packed genotypes decoded per transposition window.
        #[arg(long, default_value_t = DEFAULT_READ_SCRATCH)]
        scratch: usize,
    },

    /// Write per-locus missingness and minor allele frequencies.
    Stats {
        #[arg(value_hint = clap::ValueHint::FilePath)]
        input: PathBuf,

        /// Output directory.
        #[arg(
            short,
            long,
            value_hint = clap::ValueHint::DirPath,
            default_value_t = format!("genopack_output_{}", Local::now().format("%Y%m%d_%H%M%S"))
        )]
        output_directory: String,
    },
}

fn init_tracing() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(LevelFilter::DEBUG)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(false)
                .with_timer(fmt::time::uptime()),
        )
        .init();
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    if args.verbose {
        init_tracing();
    }

    match args.command {
        Command::Info { file, json } => cli::run_info(&file, json),
        Command::Convert {
            input,
            output,
            orientation,
            no_compress,
            scratch,
        } => cli::run_convert(&input, &output, orientation, !no_compress, scratch),
        Command::Stats {
            input,
            output_directory,
        } => {
            std::fs::create_dir_all(&output_directory)
                .map_err(|e| CustomError::OutputDir { source: e })?;
            cli::run_stats(&input, output_directory.as_ref())
        }
    }
}

fn main() -> miette::Result<()> {
    try_main().into_diagnostic()
}
