// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delve main entry point - CLI and commands.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use delve::config::{self, CliOptions, EngineConfig};
use delve::explore::{
    CleanupReport, ExecutionMode, Exploration, ExplorationStatus, Explorer, SafetyReport,
    WorktreeStatus,
};
use delve::telemetry::{init_telemetry, TelemetryConfig};

/// Delve version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Delve - run coding agents side by side in isolated worktrees.
#[derive(Parser)]
#[command(name = "delve")]
#[command(author, version, about = "Parallel exploration engine", long_about = None)]
struct Cli {
    /// Repository root (defaults to the enclosing git repository)
    #[arg(long, global = true, env = "DELVE_REPO")]
    repo: Option<PathBuf>,

    /// Container engine binary (docker, podman)
    #[arg(long, global = true, env = "DELVE_ENGINE")]
    engine: Option<String>,

    /// Output format
    #[arg(short = 'f', long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output and a command metrics report
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Execution mode as a CLI value.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Parallel,
    Sequential,
}

impl From<Mode> for ExecutionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Parallel => ExecutionMode::Parallel,
            Mode::Sequential => ExecutionMode::Sequential,
        }
    }
}

/// Subcommands for delve.
#[derive(Subcommand)]
enum Commands {
    /// Run the pre-flight safety checks
    Validate {
        /// Number of worktrees to plan for
        #[arg(short, long)]
        branches: Option<u32>,
    },

    /// Start a new exploration
    Start {
        /// Task description handed to every worktree
        task: String,

        /// Number of parallel worktrees
        #[arg(short, long)]
        branches: Option<u32>,

        /// How worktree containers are started
        #[arg(long, value_enum)]
        mode: Option<Mode>,

        /// Sandbox image
        #[arg(long)]
        image: Option<String>,

        /// CPU limit per sandbox (e.g. 2, 0.5)
        #[arg(long)]
        cpu: Option<String>,

        /// Memory limit per sandbox (e.g. 4g, 512m)
        #[arg(long)]
        memory: Option<String>,

        /// Timeout in minutes exported to each sandbox
        #[arg(long)]
        timeout: Option<u32>,

        /// Strategy label per worktree, in order (repeatable)
        #[arg(short, long = "strategy")]
        strategies: Vec<String>,

        /// Keep worktrees and containers after finishing
        #[arg(long)]
        no_cleanup: bool,
    },

    /// List explorations, newest first
    #[command(alias = "ls")]
    List,

    /// Show one exploration
    Show {
        id: String,
    },

    /// Stop a running exploration's containers
    Stop {
        id: String,
    },

    /// Finish an exploration and collect its results
    Finish {
        id: String,

        /// Record the exploration as failed
        #[arg(long)]
        failed: bool,
    },

    /// Remove containers, worktrees and branches of an exploration
    Cleanup {
        id: String,
    },

    /// Clean up and delete an exploration's records
    #[command(alias = "rm")]
    Delete {
        id: String,
    },

    /// Show insights and decisions shared by an exploration's agents
    Insights {
        id: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig::from_flags(cli.verbose, cli.debug))
        .context("failed to initialize logging")?;

    if let Commands::Version = cli.command {
        println!("delve {}", VERSION);
        return Ok(());
    }

    let repo_root = resolve_repo_root(cli.repo.as_deref())?;
    let cli_options = cli_options(&cli);
    let config = config::load_config(&repo_root, cli_options)?;
    let explorer = Explorer::new(config.clone());

    let debug = cli.debug;
    let result = handle_command(&explorer, &config, cli.command, cli.format).await;
    if debug {
        eprint!("{}", explorer.metrics().snapshot().format_report().dimmed());
    }
    result
}

fn resolve_repo_root(repo: Option<&Path>) -> anyhow::Result<PathBuf> {
    let start = match repo {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir()?,
    };
    let root = config::find_repo_root(&start)
        .with_context(|| format!("{} is not inside a git repository", start.display()))?;
    root.canonicalize()
        .with_context(|| format!("cannot resolve {}", root.display()))
}

fn cli_options(cli: &Cli) -> CliOptions {
    let mut options = CliOptions {
        container_engine: cli.engine.clone(),
        ..Default::default()
    };

    if let Commands::Start {
        branches,
        mode,
        image,
        cpu,
        memory,
        timeout,
        strategies,
        no_cleanup,
        ..
    } = &cli.command
    {
        options.branches = *branches;
        options.mode = mode.map(ExecutionMode::from);
        options.docker_image = image.clone();
        options.cpu_limit = cpu.clone();
        options.memory_limit = memory.clone();
        options.timeout_minutes = *timeout;
        if !strategies.is_empty() {
            options.strategies = Some(strategies.clone());
        }
        if *no_cleanup {
            options.no_cleanup = Some(true);
        }
    }

    options
}

async fn handle_command(
    explorer: &Explorer,
    config: &EngineConfig,
    command: Commands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match command {
        Commands::Validate { branches } => {
            let planned = branches.unwrap_or(config.exploration.branches);
            let report = explorer.validate(planned).await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => print_safety_report(&report, planned),
            }
            if !report.passed {
                anyhow::bail!("safety checks failed");
            }
        }
        Commands::Start { task, .. } => {
            if format == OutputFormat::Text {
                println!(
                    "{} Starting {} worktree(s) for: {}",
                    "→".cyan(),
                    config.exploration.branches,
                    task.bright_white()
                );
            }
            let exploration = explorer.start(&task, config.exploration.clone()).await?;
            print_exploration(&exploration, format)?;
        }
        Commands::List => {
            let explorations = explorer.list().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&explorations)?),
                OutputFormat::Text => {
                    if explorations.is_empty() {
                        println!("{}", "No explorations found".dimmed());
                    }
                    for summary in explorations {
                        println!(
                            "{}  {:<10} {}/{} worktrees  {}  {}",
                            summary.id.bright_white(),
                            paint_status(summary.status),
                            summary.worktree_count,
                            summary.branches,
                            summary.created_at.format("%Y-%m-%d %H:%M"),
                            summary.task
                        );
                    }
                }
            }
        }
        Commands::Show { id } => {
            let exploration = explorer.load(&id).await?;
            print_exploration(&exploration, format)?;
        }
        Commands::Stop { id } => {
            let exploration = explorer.stop(&id).await?;
            print_exploration(&exploration, format)?;
        }
        Commands::Finish { id, failed } => {
            let exploration = explorer.finish(&id, !failed).await?;
            print_exploration(&exploration, format)?;
        }
        Commands::Cleanup { id } => {
            let report = explorer.cleanup(&id).await?;
            print_cleanup_report(&id, &report, format)?;
        }
        Commands::Delete { id } => {
            let report = explorer.delete(&id).await?;
            print_cleanup_report(&id, &report, format)?;
            if format == OutputFormat::Text {
                println!("{} Deleted {}", "✓".green(), id);
            }
        }
        Commands::Insights { id } => {
            let insights = explorer.insights(&id).await?;
            let decisions = explorer.decisions(&id).await?;
            match format {
                OutputFormat::Json => {
                    let body = serde_json::json!({
                        "explorationId": id,
                        "insights": insights,
                        "decisions": decisions,
                    });
                    println!("{}", serde_json::to_string_pretty(&body)?);
                }
                OutputFormat::Text => {
                    println!("{}", format!("Insights ({})", insights.len()).bright_blue().bold());
                    for insight in &insights {
                        let tags = if insight.tags.is_empty() {
                            String::new()
                        } else {
                            format!(" [{}]", insight.tags.join(", "))
                        };
                        println!(
                            "  wt-{} {}{}",
                            insight.worktree_index,
                            insight.content,
                            tags.dimmed()
                        );
                    }
                    println!("\n{}", format!("Decisions ({})", decisions.len()).bright_blue().bold());
                    for decision in &decisions {
                        println!("  wt-{} {}", decision.worktree_index, decision.title.bright_white());
                        if let Some(choice) = &decision.chosen_option {
                            println!("       chose: {}", choice);
                        }
                        if !decision.rationale.is_empty() {
                            println!("       {}", decision.rationale.dimmed());
                        }
                    }
                }
            }
        }
        Commands::Version => println!("delve {}", VERSION),
    }
    Ok(())
}

fn paint_status(status: ExplorationStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        ExplorationStatus::Pending => label.yellow(),
        ExplorationStatus::Running => label.cyan(),
        ExplorationStatus::Completed => label.green(),
        ExplorationStatus::Failed => label.red(),
        ExplorationStatus::Stopped => label.dimmed(),
    }
}

fn print_exploration(exploration: &Exploration, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(exploration)?);
        return Ok(());
    }

    println!("{} {}", "Exploration".bright_blue().bold(), exploration.id.bright_white());
    println!("Task:    {}", exploration.task);
    println!("Status:  {}", paint_status(exploration.status));
    println!("Mode:    {}", exploration.config.mode);
    println!("Image:   {}", exploration.config.docker_image);

    for worktree in &exploration.worktrees {
        let status = match worktree.status {
            WorktreeStatus::Failed => worktree.status.to_string().red(),
            WorktreeStatus::Completed => worktree.status.to_string().green(),
            _ => worktree.status.to_string().normal(),
        };
        let port = worktree
            .port
            .map(|p| format!(" :{}", p))
            .unwrap_or_default();
        let strategy = worktree
            .strategy
            .as_deref()
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        println!(
            "  [{}] {} {}{}{}",
            worktree.index,
            worktree.branch.bright_white(),
            status,
            port.cyan(),
            strategy.dimmed()
        );
        if let Some(error) = &worktree.error {
            println!("      {}", error.red());
        }
    }

    if let Some(results) = &exploration.results {
        println!(
            "Results: {} succeeded, {} failed, {} insight(s), {} decision(s)",
            results.successful_worktrees.to_string().green(),
            results.failed_worktrees.to_string().red(),
            results.insights_collected,
            results.decisions_collected
        );
        if let Some(summary) = &results.summary {
            println!("Summary: {}", summary);
        }
    }
    if let Some(error) = &exploration.error {
        println!("Error:   {}", error.red());
    }
    Ok(())
}

fn print_safety_report(report: &SafetyReport, planned: u32) {
    let verdict = if report.passed {
        "passed".green().bold()
    } else {
        "failed".red().bold()
    };
    println!("{} for {} worktree(s): {}", "Safety checks".bright_blue().bold(), planned, verdict);
    let changes = match report.git_state.uncommitted_changes {
        Some(count) => format!("{count} uncommitted change(s)"),
        None => "status unknown".to_string(),
    };
    println!(
        "Git:     branch {}, {}",
        report.git_state.current_branch.as_deref().unwrap_or("(detached)"),
        changes
    );
    println!(
        "Host:    {} MiB free, {} core(s), engine {}",
        report.resources.available_memory / (1024 * 1024),
        report.resources.cpu_cores,
        report.resources.engine_version.as_deref().unwrap_or("unavailable")
    );
    for warning in &report.warnings {
        println!("{} {}", "!".yellow(), warning);
    }
    for error in &report.errors {
        println!("{} {}", "✗".red(), error);
    }
}

fn print_cleanup_report(id: &str, report: &CleanupReport, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        let body = serde_json::json!({
            "explorationId": id,
            "containersRemoved": report.containers_removed,
            "worktreesRemoved": report.worktrees_removed,
            "branchesDeleted": report.branches_deleted,
            "releasedPorts": report.released_ports,
            "errors": report.errors,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!(
        "{} Cleaned {}: {} container(s), {} worktree(s), {} branch(es)",
        if report.is_clean() { "✓".green() } else { "!".yellow() },
        id,
        report.containers_removed,
        report.worktrees_removed,
        report.branches_deleted
    );
    for error in &report.errors {
        println!("  {}", error.yellow());
    }
    Ok(())
}
