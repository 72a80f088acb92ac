use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sx_agents::{BranchPolicy, Mode};

mod chat;
mod commands;
mod config;
mod report;
mod setup;

use commands::RunArgs;
use config::{expand_path, Config};

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: request bodies and every git invocation
    Trace,
    /// Verbose: prompt sizes, apply attempts, completion usage
    Debug,
    /// Standard: iteration starts, apply/test/commit results
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "swarmx")]
#[command(author, version, about = "swarmx: goal-driven patch loop over a git repository", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/swarmx/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn", global = true)]
    pub log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Write logs to file (JSON-lines format)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shallow-clone a repository and prepare its workspace
    Repo {
        url: String,
        /// Destination (default: <projects_dir>/<repo name>)
        #[arg(long)]
        project: Option<String>,
        /// Branch to check out
        #[arg(long)]
        branch: Option<String>,
    },
    /// Refresh the workspace file index
    Index {
        #[arg(long, default_value = ".")]
        project: String,
    },
    /// Interactive chat with @file references
    Chat {
        #[arg(long, default_value = ".")]
        project: String,
        #[arg(long, default_value = "ask")]
        mode: Mode,
        /// Model to use (overrides config)
        #[arg(long)]
        model: Option<String>,
    },
    /// Run a goal; changes stay uncommitted unless --commit is given
    Task {
        goal: String,
        #[arg(long, default_value = ".")]
        project: String,
        #[arg(long, default_value = "code")]
        mode: Mode,
        /// Commit each passing iteration
        #[arg(long)]
        commit: bool,
        /// Push after committing
        #[arg(long)]
        push: bool,
        /// Work on this branch (created if missing)
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        max_iters: Option<usize>,
        /// Model to use (overrides config)
        #[arg(long)]
        model: Option<String>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Plan a goal into milestones, then run and commit each one
    Run {
        #[arg(long)]
        goal: String,
        /// Treat the goal as a single milestone
        #[arg(long)]
        skip_plan: bool,
        #[arg(long, default_value = ".")]
        project: String,
        /// Check that the first patch applies, change nothing
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value = "code")]
        mode: Mode,
        #[arg(long)]
        max_iters: Option<usize>,
        #[arg(long)]
        no_commit: bool,
        #[arg(long)]
        push: bool,
        /// Work on a branch; without a name one is derived from the goal
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        branch: Option<String>,
        /// Model to use (overrides config)
        #[arg(long)]
        model: Option<String>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Break a goal into milestones and write the plan file
    Plan {
        goal: String,
        #[arg(long, default_value = ".")]
        project: String,
        /// Model to use (overrides config)
        #[arg(long)]
        model: Option<String>,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the tests; if they fail, ask for one debug patch
    DebugOnce {
        #[arg(long, default_value = ".")]
        project: String,
        /// Commit the fix if the tests pass afterwards
        #[arg(long)]
        commit: bool,
        /// Model to use (overrides config)
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Stage everything and commit
    Commit {
        #[arg(long, default_value = ".")]
        project: String,
        #[arg(short, long)]
        message: String,
    },
    /// Push the current (or given) branch
    Push {
        #[arg(long, default_value = ".")]
        project: String,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Show current configuration
    Config,
    /// Write a configuration template to ~/.config/swarmx
    Setup,
}

fn init_logging(cli: &Cli) -> Result<()> {
    // Resolve log level: --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };
    let filter = EnvFilter::new(log_level.as_filter());

    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::sync::Mutex::new(file))
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    // Handle setup before config is required
    if matches!(&cli.command, Commands::Setup) {
        setup::run(cli.config.as_deref())?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Repo { url, project, branch } => {
            commands::repo(&config, &url, project.as_deref().map(expand_path), branch.as_deref())?;
        }
        Commands::Index { project } => {
            commands::index(&config, &expand_path(&project))?;
        }
        Commands::Chat { project, mode, model } => {
            if let Some(model) = model {
                config.provider.model = Some(model);
            }
            chat::run_chat(&config, &expand_path(&project), mode)?;
        }
        Commands::Task {
            goal,
            project,
            mode,
            commit,
            push,
            branch,
            max_iters,
            model,
            json,
        } => {
            apply_overrides(&mut config, max_iters, model)?;
            let args = RunArgs {
                goal,
                project: expand_path(&project),
                mode,
                commit: commit || push,
                push,
                branch: branch
                    .map(BranchPolicy::Named)
                    .unwrap_or(BranchPolicy::Current),
                dry_run: false,
            };
            return run_goal(&config, &args, json);
        }
        Commands::Run {
            goal,
            skip_plan,
            project,
            dry_run,
            mode,
            max_iters,
            no_commit,
            push,
            branch,
            model,
            json,
        } => {
            apply_overrides(&mut config, max_iters, model)?;
            let args = RunArgs {
                goal,
                project: expand_path(&project),
                mode,
                commit: !no_commit,
                push,
                branch: commands::branch_policy(branch.as_deref()),
                dry_run,
            };
            if skip_plan || mode.allows_prose() {
                return run_goal(&config, &args, json);
            }
            return run_pipeline(&config, &args, json);
        }
        Commands::Plan { goal, project, model, json } => {
            apply_overrides(&mut config, None, model)?;
            let (plan, path) = commands::plan(&config, &expand_path(&project), &goal)?;
            if json {
                report::print_json(&plan)?;
            } else {
                report::print_plan(&plan, &path);
            }
        }
        Commands::DebugOnce { project, commit, model, json } => {
            apply_overrides(&mut config, None, model)?;
            let outcome = commands::debug_once(&config, &expand_path(&project), commit)?;
            if json {
                report::print_json(&outcome)?;
            } else {
                report::print_debug_once(&outcome)?;
            }
            if let sx_agents::DebugOnce::Attempted { report, .. } = &outcome {
                return Ok(ExitCode::from(report.exit_code() as u8));
            }
        }
        Commands::Commit { project, message } => {
            commands::commit(&config, &expand_path(&project), &message)?;
        }
        Commands::Push { project, remote, branch } => {
            commands::push(&config, &expand_path(&project), remote.as_deref(), branch.as_deref())?;
        }
        Commands::Config => commands::show_config(&config)?,
        Commands::Setup => unreachable!(),
    }

    Ok(ExitCode::SUCCESS)
}

/// CLI flags are the last configuration layer.
fn apply_overrides(config: &mut Config, max_iters: Option<usize>, model: Option<String>) -> Result<()> {
    if let Some(n) = max_iters {
        config.orchestrator.max_iters = n;
    }
    if let Some(model) = model {
        config.provider.model = Some(model);
    }
    config.validate()
}

fn run_goal(config: &Config, args: &RunArgs, json: bool) -> Result<ExitCode> {
    let report = commands::task(config, args)?;
    if json {
        report::print_json(&report)?;
    } else {
        report::print_report(&report)?;
    }
    Ok(ExitCode::from(report.exit_code() as u8))
}

fn run_pipeline(config: &Config, args: &RunArgs, json: bool) -> Result<ExitCode> {
    let report = commands::run(config, args)?;
    if json {
        report::print_json(&report)?;
    } else {
        report::print_pipeline(&report)?;
    }
    Ok(ExitCode::from(report.exit_code() as u8))
}
