//! fastflow CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # List declared tasks
//! fastflow list pipeline.yaml
//!
//! # Print the expanded dependency graph (or Graphviz DOT)
//! fastflow graph pipeline.yaml --dot
//!
//! # Run everything that is out of date
//! fastflow run pipeline.yaml --parallel 8
//!
//! # Preview what would run
//! fastflow run pipeline.yaml --dry-run
//!
//! # Bring one task up to date, rerunning it regardless of timestamps
//! fastflow run pipeline.yaml --target align --force-task align
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use log::{error, info, warn};

use fastflow::execution::{
    ForceMode, LocalBackend, NodeState, RunOptions, RunReport, Scheduler, WorkUnitRunner,
};
use fastflow::pipeline::{LoadedPipeline, PipelineConfig, TaskGraph, TaskGraphBuilder};
use fastflow::{ConfigError, APP_NAME, VERSION};

#[derive(Debug, Parser)]
#[command(name = "fastflow", version, about = "File-pattern driven pipeline runner")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List declared tasks.
    List(PipelineArgs),

    /// Print the expanded dependency graph.
    Graph {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Emit Graphviz DOT instead of a text listing.
        #[arg(long)]
        dot: bool,
    },

    /// Run every out-of-date node.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct PipelineArgs {
    /// Pipeline YAML file.
    config: PathBuf,

    /// Input file, replacing the file list from the config (repeatable).
    #[arg(long = "file", value_name = "PATH")]
    files: Vec<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Only bring these tasks (and what they need) up to date.
    #[arg(long = "target", value_name = "TASK")]
    targets: Vec<String>,

    /// Rerun every selected node regardless of timestamps.
    #[arg(long, conflicts_with = "force_tasks")]
    force: bool,

    /// Rerun the nodes of these tasks regardless of timestamps.
    #[arg(long = "force-task", value_name = "TASK")]
    force_tasks: Vec<String>,

    /// Maximum parallel nodes (default: number of CPUs).
    #[arg(long, value_name = "N")]
    parallel: Option<usize>,

    /// Cancel the run after this many failures.
    #[arg(long, value_name = "N")]
    fail_fast: Option<usize>,

    /// Show what would run without executing anything.
    #[arg(long)]
    dry_run: bool,

    /// Write a JSON run report.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Poll interval for queued jobs, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 500)]
    poll_ms: u64,

    /// Directory relative paths and commands are resolved in.
    #[arg(long, value_name = "DIR")]
    working_dir: Option<PathBuf>,

    /// Shell used for local commands (default: sh).
    #[arg(long, value_name = "PATH")]
    shell: Option<String>,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!();
}

fn load(args: &PipelineArgs) -> Result<LoadedPipeline, Box<dyn std::error::Error>> {
    let mut config = PipelineConfig::load(&args.config)?;
    if !args.files.is_empty() {
        info!("Using {} input files from the command line", args.files.len());
        config.files = args.files.clone();
    }
    Ok(config.build(Some(args.config.as_path()))?)
}

fn build_graph(loaded: &LoadedPipeline) -> Result<TaskGraph, Box<dyn std::error::Error>> {
    Ok(TaskGraphBuilder::new(&loaded.def, &loaded.context)
        .with_registry(&loaded.registry)
        .build()?)
}

fn list(args: &PipelineArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let loaded = load(args)?;
    let graph = build_graph(&loaded)?;

    println!("Pipeline '{}':", loaded.def.name);
    for spec in loaded.def.tasks() {
        let nodes = graph.nodes_of(&spec.name).map_or(0, <[_]>::len);
        let upstream = spec.upstream.as_deref().unwrap_or("-");
        let consumers: Vec<&str> = loaded
            .def
            .consumers_of(&spec.name)
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        println!(
            "  {} {:10} from {:20} {:3} nodes{}",
            format!("{:20}", spec.name).bold(),
            spec.kind.to_string(),
            upstream,
            nodes,
            if consumers.is_empty() {
                String::new()
            } else {
                format!(" -> {}", consumers.join(", "))
            }
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn graph(args: &PipelineArgs, dot: bool) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let loaded = load(args)?;
    let graph = build_graph(&loaded)?;
    if dot {
        print!("{}", graph.to_dot());
    } else {
        print!("{}", graph.render_text());
    }
    Ok(ExitCode::SUCCESS)
}

fn check_working_dir(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }
    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }
    Ok(())
}

fn status_tag(state: NodeState) -> colored::ColoredString {
    match state {
        NodeState::Succeeded => "[  OK  ]".green(),
        NodeState::Skipped => "[ SKIP ]".dimmed(),
        NodeState::Failed => "[ FAIL ]".red().bold(),
        NodeState::Cancelled => "[CANCEL]".yellow(),
        _ => "[ ???? ]".normal(),
    }
}

fn print_report(report: &RunReport) {
    println!();
    for record in &report.records {
        let detail = match record.state {
            NodeState::Failed => {
                let mut detail = record.message.clone().unwrap_or_default();
                if let Some((_, err_log)) = &record.logs {
                    detail.push_str(&format!(" (see {})", err_log));
                }
                detail
            }
            NodeState::Cancelled => record.message.clone().unwrap_or_default(),
            _ => record.reason.clone().unwrap_or_default(),
        };
        let elapsed = record
            .duration_ms()
            .map(|ms| format!(" [{:.1}s]", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!(
            "{} {}{} {}",
            status_tag(record.state),
            record.label,
            elapsed,
            detail.dimmed()
        );
    }

    if report.records.iter().any(|r| r.started.is_some()) {
        print!("{}", report.timeline_chart());
    }

    println!();
    if report.succeeded() {
        println!("{}", report.summary_line().green().bold());
    } else {
        println!("{}", report.summary_line().red().bold());
    }
}

fn dry_run(scheduler: &Scheduler) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let plan = scheduler.plan()?;
    let graph = scheduler.graph();

    for node in graph.nodes() {
        let Some(freshness) = plan.get(node.id) else {
            continue;
        };
        if !freshness.is_stale() {
            println!("{} {} ({})", "[ SKIP ]".dimmed(), node.label(), freshness);
            continue;
        }
        println!();
        println!("[DRY RUN] {} ({})", node.label().bold(), freshness);
        println!("  Command: {}", scheduler.runner().describe(node));
        println!("  Input: {:?}", node.inputs);
        if !node.companions.is_empty() {
            println!("  Companions: {:?}", node.companions);
        }
        println!("  Output: {}", node.output);
    }

    println!();
    println!(
        "{} nodes would run, {} are up to date",
        plan.stale_count(),
        plan.up_to_date_count()
    );
    Ok(ExitCode::SUCCESS)
}

async fn run(args: &RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let loaded = load(&args.pipeline)?;
    let graph = build_graph(&loaded)?;

    let mut runner = WorkUnitRunner::new(Arc::new(loaded.context), loaded.registry)
        .with_poll_interval(Duration::from_millis(args.poll_ms.max(1)));
    match &args.working_dir {
        Some(dir) => {
            check_working_dir(dir)?;
            info!("Working directory: {}", dir.display());
            runner = runner.with_working_dir(dir);
        }
        None => info!("Working directory: {}", env::current_dir()?.display()),
    }
    if let Some(shell) = &args.shell {
        runner = runner.with_local_backend(Arc::new(LocalBackend::with_shell(shell.as_str())));
    }

    let force = if args.force {
        ForceMode::All
    } else if !args.force_tasks.is_empty() {
        ForceMode::Tasks(args.force_tasks.clone())
    } else {
        ForceMode::None
    };
    for task in args.force_tasks.iter().chain(&args.targets) {
        if graph.nodes_of(task).is_none() {
            return Err(ConfigError::UnknownTask(task.clone()).into());
        }
    }

    let mut options = RunOptions {
        force,
        targets: args.targets.clone(),
        fail_fast: args.fail_fast,
        ..RunOptions::default()
    };
    if let Some(parallel) = args.parallel {
        options.max_parallel = parallel;
    }

    let scheduler = Scheduler::new(graph, runner).with_options(options);

    if args.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        return dry_run(&scheduler);
    }

    let cancel = scheduler.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running nodes");
            cancel.cancel();
        }
    });

    let report = scheduler.run().await?;
    print_report(&report);

    if let Some(path) = &args.report {
        report.save_json(path)?;
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    print_banner();

    let result = match &cli.command {
        Command::List(args) => list(args),
        Command::Graph { pipeline, dot } => graph(pipeline, *dot),
        Command::Run(args) => run(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "fastflow",
            "run",
            "pipeline.yaml",
            "--target",
            "align",
            "--force-task",
            "validate",
            "--parallel",
            "2",
            "--file",
            "a_R1.fastq.gz",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.targets, vec!["align"]);
        assert_eq!(args.force_tasks, vec!["validate"]);
        assert_eq!(args.parallel, Some(2));
        assert_eq!(args.pipeline.files, vec!["a_R1.fastq.gz"]);
        assert_eq!(args.poll_ms, 500);
    }

    #[test]
    fn test_force_conflicts_with_force_task() {
        let result = Cli::try_parse_from([
            "fastflow",
            "run",
            "p.yaml",
            "--force",
            "--force-task",
            "align",
        ]);
        assert!(result.is_err());
    }
}
