use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, error, trace};
use tracing_subscriber::EnvFilter;

use splitflow::error::{describe_error_code, ErrorCode};
use splitflow::{BackendKind, EngineConfig, SplitflowError, Submitter, Task, TaskOutput};

/// Split, dispatch and cache command-line tasks
#[derive(Parser)]
#[command(name = "splitflow")]
#[command(about = "Run split command-line tasks on local, batch or cluster backends", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a task file and print its output as JSON
    Run {
        /// Path to the task file
        task: PathBuf,

        /// Path to an engine configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Backend to use (local-pool, batch-scheduler, distributed-cluster)
        #[arg(short = 'b', long)]
        backend: Option<String>,
    },
    /// Print the checksum of every instance of a task
    Checksum {
        /// Path to the task file
        task: PathBuf,

        /// Path to an engine configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
    /// Print a task's cached output without running anything
    Result {
        /// Path to the task file
        task: PathBuf,

        /// Path to an engine configuration file
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("splitflow started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Commands::Run {
            task,
            config,
            backend,
        } => run_task(task, config, backend).await,
        Commands::Checksum { task, config } => print_checksums(task, config),
        Commands::Result { task, config } => print_cached(task, config),
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        let code = match e.downcast_ref::<SplitflowError>() {
            Some(err) => {
                debug!("E{:04}: {}", err.code(), describe_error_code(err.code()));
                err.exit_code()
            }
            None => 1,
        };
        std::process::exit(code);
    }
}

async fn run_task(
    task_path: PathBuf,
    config_path: Option<PathBuf>,
    backend: Option<String>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(backend) = backend {
        config.backend = backend.parse::<BackendKind>()?;
    }

    let task = Task::load(&task_path)?;
    let output = Submitter::scope(config, |submitter| async move { submitter.run(&task).await })
        .await?;

    print_output(&output)?;

    let errored = output.values().iter().filter(|r| r.errored).count();
    if errored > 0 {
        return Err(SplitflowError::execution_with_code(
            ErrorCode::EXEC_SUBPROCESS_FAILED,
            format!("{} of {} instance(s) errored", errored, output.len()),
            None,
        )
        .into());
    }
    Ok(())
}

fn load_config(config_path: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    Ok(match config_path {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::from_env()?,
    })
}

fn print_checksums(task_path: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let task = Task::load(&task_path)?;
    for (position, checksum) in task.checksums_under(&config)?.iter().enumerate() {
        println!("{}\t{}", position, checksum);
    }
    Ok(())
}

fn print_cached(task_path: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let task = Task::load(&task_path)?;
    let output = task
        .result_under(&config)?
        .with_context(|| format!("{} has no complete cached run", task.name))?;
    print_output(&output)
}

fn print_output(output: &TaskOutput) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(output)?);
    Ok(())
}
