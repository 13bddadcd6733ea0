mod blocks;
mod context;
mod engine;
mod errors;
mod loader;
mod registry;
mod resolver;
mod shell;
mod types;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use engine::progress::{generate_run_id, ConsoleTracker, JsonlTracker, MultiTracker};
use engine::{ExecutionEngine, RunConfig, SubprocessIsolation};
use errors::ResolutionError;
use registry::{Registered, TaskRegistry};
use resolver::PipelineResolver;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "ritmo",
    version,
    about = "Sequential task runner with retriable, rescuable pipeline blocks"
)]
struct Cli {
    /// Path to the declarations file
    #[arg(
        short = 'f',
        long = "file",
        global = true,
        default_value = "ritmo.yaml"
    )]
    file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute tasks, pipelines and blocks given as trailing tokens
    Run {
        /// Continue with later independent tasks after an unrecovered failure
        #[arg(long)]
        keep_going: bool,

        /// Append progress events to this JSONL file
        #[arg(long)]
        log_events: Option<PathBuf>,

        /// Task tokens, e.g. `:build --release {@retry 2}:deploy{/@}`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
    },

    /// Parse and resolve the given tokens without executing anything
    Validate {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
    },

    /// List declared tasks and pipelines
    List,

    /// Worker half of subprocess isolation (reads a transfer file)
    #[command(hide = true)]
    InternalExec {
        #[arg(long)]
        transfer: PathBuf,
    },
}

/// Exit code when a task or pipeline name cannot be resolved.
const EXIT_NOT_FOUND: i32 = 127;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".bright_red().bold(), e);
            match e.downcast_ref::<ResolutionError>() {
                Some(ResolutionError::TaskNotFound(_)) => EXIT_NOT_FOUND,
                _ => 1,
            }
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            keep_going,
            log_events,
            tokens,
        } => cmd_run(&cli.file, keep_going, log_events, &tokens).await,
        Command::Validate { tokens } => cmd_validate(&cli.file, &tokens),
        Command::List => cmd_list(&cli.file),
        Command::InternalExec { transfer } => cmd_internal_exec(&cli.file, &transfer).await,
    }
}

async fn cmd_run(
    file: &PathBuf,
    keep_going: bool,
    log_events: Option<PathBuf>,
    tokens: &[String],
) -> Result<i32> {
    let declarations = loader::load_declarations_file(file)?;
    let registry = loader::build_registry(&declarations)?;

    let mut arena = blocks::BlockArena::new();
    let block_ids = blocks::group_tokens(tokens, &mut arena)?;
    let mut resolver = PipelineResolver::new(&registry);
    let resolution = resolver.resolve(&block_ids, &mut arena)?;

    let mut tracker = MultiTracker::new();
    tracker.push(Box::new(ConsoleTracker));
    if let Some(path) = log_events {
        tracker.push(Box::new(JsonlTracker::new(path, generate_run_id())));
    }

    // The worker re-reads the same declarations file, so the transferred
    // task id resolves to the same shell command in the subprocess.
    let isolation = SubprocessIsolation::with_worker(vec![
        std::env::current_exe()?.to_string_lossy().into_owned(),
        "internal-exec".into(),
        "--file".into(),
        file.to_string_lossy().into_owned(),
    ]);

    let mut engine = ExecutionEngine::new(
        &mut arena,
        Box::new(isolation),
        Box::new(tracker),
        RunConfig { keep_going },
    );
    let summary = engine.execute(&resolution).await;
    Ok(if summary.is_failed() { 1 } else { 0 })
}

fn cmd_validate(file: &PathBuf, tokens: &[String]) -> Result<i32> {
    let declarations = loader::load_declarations_file(file)?;
    let registry = loader::build_registry(&declarations)?;

    let mut arena = blocks::BlockArena::new();
    let block_ids = blocks::group_tokens(tokens, &mut arena)?;
    let mut resolver = PipelineResolver::new(&registry);
    let resolution = resolver.resolve(&block_ids, &mut arena)?;

    println!(
        "{} {} task(s) scheduled across {} block(s)",
        "OK:".bright_green().bold(),
        resolution.bag.len(),
        block_ids.len()
    );
    Ok(0)
}

fn cmd_list(file: &PathBuf) -> Result<i32> {
    let declarations = loader::load_declarations_file(file)?;
    let registry = loader::build_registry(&declarations)?;

    println!("{}", "Tasks".bold());
    for name in registry.names() {
        match registry.lookup(&name)? {
            Some(Registered::Declarations(decls)) => {
                for declaration in decls {
                    println!("  {}  {}", name.bright_cyan(), declaration.description.dimmed());
                }
            }
            _ => continue,
        }
    }

    println!();
    println!("{}", "Pipelines".bold());
    for name in registry.names() {
        if let Some(Registered::Pipeline(pipeline)) = registry.lookup(&name)? {
            println!(
                "  {}  {}",
                name.bright_magenta(),
                pipeline.description.dimmed()
            );
        }
    }
    Ok(0)
}

async fn cmd_internal_exec(file: &PathBuf, transfer: &PathBuf) -> Result<i32> {
    let declarations = loader::load_declarations_file(file)?;
    let registry = loader::build_registry(&declarations)?;
    let outcome = engine::isolation::run_transfer(transfer, &registry).await;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(0)
}
