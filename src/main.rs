#![forbid(unsafe_code)]

//! `peer-harness` binary.
//!
//! `run` discovers test files and executes them through the bounded pool;
//! `probe` drives one JSON-RPC peer through its opening handshake.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use peer_harness::config::GlobalConfig;
use peer_harness::pool::discover::{discover, units_for_files};
use peer_harness::pool::{self, ProcessExecutor};
use peer_harness::probe::{run_probe, ProbeRequest, DEFAULT_LANGUAGE_ID};
use peer_harness::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "peer-harness", about = "JSON-RPC peer harness and parallel test runner", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover test files and run them in parallel.
    Run {
        /// Files or directories to search; defaults to the current directory.
        paths: Vec<PathBuf>,

        /// Maximum concurrent units.
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Only run files whose path contains this text.
        #[arg(short, long)]
        filter: Option<String>,

        /// Program each unit runs; overrides `pool.command`.
        #[arg(long)]
        command: Option<String>,
    },
    /// Start the configured peer, initialize it, and optionally open a file.
    Probe {
        /// File to open and wait on for diagnostics.
        #[arg(long)]
        open: Option<PathBuf>,

        /// Language id sent with the opened file.
        #[arg(long, default_value = DEFAULT_LANGUAGE_ID)]
        language_id: String,
    },
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(dispatch(args))
}

async fn dispatch(args: Cli) -> Result<ExitCode> {
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    info!(config = ?args.config, "configuration loaded");

    match args.command {
        Command::Run {
            paths,
            jobs,
            filter,
            command,
        } => run_units(&config, paths, jobs, filter.as_deref(), command).await,
        Command::Probe { open, language_id } => {
            let report = run_probe(&config, &ProbeRequest { open, language_id }).await?;
            println!("{report}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_units(
    config: &GlobalConfig,
    paths: Vec<PathBuf>,
    jobs: Option<usize>,
    filter: Option<&str>,
    command: Option<String>,
) -> Result<ExitCode> {
    let program = command
        .or_else(|| config.pool.command.clone())
        .ok_or_else(|| {
            AppError::Config("no unit command: pass --command or set pool.command".into())
        })?;

    let roots = if paths.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        paths
    };
    let files = discover(&roots, &config.pool.suffixes, filter);
    if files.is_empty() {
        eprintln!("No test files found.");
        return Ok(ExitCode::FAILURE);
    }

    let mut options = config.pool.pool_options();
    if let Some(jobs) = jobs {
        options.jobs = jobs;
    }
    println!("Running {} test files with {} workers", files.len(), options.jobs.max(1));

    let units = units_for_files(&files, &program, &config.pool.args);
    let report = pool::run(units, options, Arc::new(ProcessExecutor)).await;

    for failure in report.failures() {
        println!("\n{} {} ({})", failure.status.tag(), failure.key, failure.exit);
        let output = failure.output();
        if !output.trim().is_empty() {
            println!("{}", output.trim_end());
        }
    }

    let tally = report.tally();
    println!(
        "\nResults: {} passed, {} failed, {} crashed",
        tally.passed, tally.failed, tally.crashed
    );
    println!("Elapsed: {:.2}s", report.elapsed.as_secs_f64());

    Ok(if report.exit_code() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so stdout stays the report.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
