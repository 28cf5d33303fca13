//! tepipe
#![deny(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use te_lib::subset::{subset_bam, Routes};
use te_wrap::driver::{build_experiment, run_experiment};
use te_wrap::job_args::JobArgs;
use te_wrap::run_config::RunConfig;
use te_wrap::utils::{print_error_chain, CliPath};

const CMD: &str = "tepipe";

/// Count transposable element and gene expression per group of single-cell samples
#[derive(Parser, Debug)]
#[clap(name = CMD, version)]
struct TePipe {
    #[clap(subcommand)]
    subcmd: SubCommand,

    /// Logging level: off, error, warn, info, debug or trace. Overrides RUST_LOG.
    #[clap(long, value_name = "LEVEL", global = true)]
    log_level: Option<LevelFilter>,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// Run one region from a TOML run file: register, quantify, merge and
    /// count per group.
    #[clap(name = "run")]
    Run(Run),

    /// Split a BAM file into per-group BAM files by cell barcode.
    #[clap(name = "subset-bam", hide = true)]
    SubsetBam(SubsetBam),
}

#[derive(Parser, Debug, Clone)]
struct Run {
    /// The run file.
    #[clap(long, value_name = "TOML")]
    config: CliPath,

    #[clap(flatten)]
    job_args: JobArgs,
}

impl Run {
    fn execute(self) -> Result<ExitCode> {
        let config = RunConfig::load(&self.config)?;
        let worker_exe: PathBuf =
            std::env::current_exe().context("Unable to locate the running executable")?;
        let mut exp = build_experiment(&config, &self.job_args)?.with_worker_exe(worker_exe);
        let report = run_experiment(&config, &self.job_args, &mut exp)?;
        report.print();
        Ok(if report.has_failures() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        })
    }
}

#[derive(Parser, Debug, Clone)]
struct SubsetBam {
    /// Input BAM with CB tags.
    #[clap(long, value_name = "BAM")]
    bam: CliPath,

    /// `barcode<TAB>output_bam` lines.
    #[clap(long, value_name = "TSV")]
    routes: CliPath,

    /// Drop multi-mapped and secondary alignments.
    #[clap(long)]
    unique: bool,
}

impl SubsetBam {
    fn execute(self) -> Result<ExitCode> {
        let routes = Routes::read(&self.routes)?;
        subset_bam(&self.bam, &routes, self.unique)?;
        Ok(ExitCode::SUCCESS)
    }
}

fn init_logging(level: Option<LevelFilter>) {
    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_default_env();
    if let Some(level) = level {
        builder.filter(None, level);
    }
    builder.init();
}

fn inner_main() -> Result<ExitCode> {
    let args = TePipe::parse();
    init_logging(args.log_level);
    match args.subcmd {
        SubCommand::Run(run) => run.execute(),
        SubCommand::SubsetBam(cmd) => cmd.execute(),
    }
}

fn main() -> ExitCode {
    match inner_main() {
        Ok(exit_code) => exit_code,
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}
