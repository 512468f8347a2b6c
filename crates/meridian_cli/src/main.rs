//! MERIDIAN CLI
//!
//! Plans, applies and tears down declared stacks against the simulated
//! control plane, keeping the last result of every stack in a redb file.
//!
//! Exit codes: 0 on success, 1 when an apply or teardown fails or is
//! cancelled, 2 when the stack does not compile.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod render;
mod settings;
mod world;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use meridian_core::StackId;
use meridian_plan::StackDocument;
use meridian_runtime::{CancellationToken, ExecutionResult};
use meridian_sim::{HarnessConfig, HarnessError, SimHarness};
use meridian_storage::{RedbStateStore, StateStore};
use settings::Overrides;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use world::SavedWorld;

const EXIT_COMPILE_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "meridian")]
#[command(about = "MERIDIAN - dependency-ordered stack provisioning", long_about = None)]
struct Cli {
    /// State database
    #[arg(long, global = true, default_value = ".meridian/state.redb")]
    state: PathBuf,
    /// Settings file (JSON)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `meridian_discovery=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a stack and print its stages
    Plan {
        /// Stack document
        file: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Create or update every resource of a stack
    Apply {
        /// Stack document
        file: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Delete every resource of a stack
    Teardown {
        /// Stack document
        file: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the stored result of a stack
    Status {
        /// Stack id
        stack: String,
    },
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meridian=info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let code = run(cli).await?;
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Plan { ref file, ref overrides } => plan(&cli, file, overrides),
        Commands::Apply { ref file, ref overrides } => execute(&cli, file, overrides, Action::Apply).await,
        Commands::Teardown { ref file, ref overrides } => {
            execute(&cli, file, overrides, Action::Teardown).await
        }
        Commands::Status { ref stack } => status(&cli, &StackId::new(stack.as_str())),
    }
}

#[derive(Clone, Copy)]
enum Action {
    Apply,
    Teardown,
}

fn config(cli: &Cli, overrides: &Overrides) -> Result<HarnessConfig> {
    Ok(overrides.apply(settings::load(cli.settings.as_deref())?))
}

fn harness(cli: &Cli, overrides: &Overrides) -> Result<SimHarness> {
    let config = config(cli, overrides)?;
    let store = Arc::new(RedbStateStore::open(&cli.state)?);
    let saved = SavedWorld::load(&world::path_for(&cli.state))?;
    Ok(SimHarness::resume(config, saved.world, saved.dns, store))
}

fn load_document(path: &Path) -> Result<Option<StackDocument>> {
    match StackDocument::from_path(path) {
        Ok(document) => Ok(Some(document)),
        Err(err) => {
            eprintln!("{} {}", console::style("error:").red().bold(), err);
            Ok(None)
        }
    }
}

fn plan(cli: &Cli, file: &Path, overrides: &Overrides) -> Result<i32> {
    let Some(document) = load_document(file)? else {
        return Ok(EXIT_COMPILE_ERROR);
    };
    let harness = SimHarness::new(config(cli, overrides)?);
    let (graph, plan) = match harness.plan(&document) {
        Ok(compiled) => compiled,
        Err(err) => return compile_failure(err),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&render::plan_json(&document.stack, &plan))?);
    } else {
        print!("{}", render::plan_text(&document.stack, &graph, &plan));
    }
    Ok(0)
}

async fn execute(cli: &Cli, file: &Path, overrides: &Overrides, action: Action) -> Result<i32> {
    let Some(document) = load_document(file)? else {
        return Ok(EXIT_COMPILE_ERROR);
    };
    let harness = harness(cli, overrides)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing the current stage");
            on_interrupt.cancel();
        }
    });

    let outcome = match action {
        Action::Apply => harness.apply(&document, &cancel).await,
        Action::Teardown => harness.teardown(&document, &cancel).await,
    };
    harness.shutdown().await;
    SavedWorld::capture(&harness).save(&world::path_for(&cli.state))?;

    let result = match outcome {
        Ok(result) => result,
        Err(err) => return compile_failure(err),
    };
    print_result(cli, &result)?;
    Ok(result.exit_code())
}

fn status(cli: &Cli, stack: &StackId) -> Result<i32> {
    let store = RedbStateStore::open(&cli.state)?;
    let stored = store.load(stack)?;
    match stored {
        Some(result) => print_result(cli, &result)?,
        None if cli.json => println!("null"),
        None => println!("no stored result for {}", stack),
    }
    Ok(0)
}

fn print_result(cli: &Cli, result: &ExecutionResult) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", render::result_text(result));
    }
    Ok(())
}

fn compile_failure(err: HarnessError) -> Result<i32> {
    if !err.is_compile_error() {
        return Err(err.into());
    }
    eprintln!("{} {}", console::style("error:").red().bold(), err);
    Ok(EXIT_COMPILE_ERROR)
}
