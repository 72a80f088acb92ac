//! Wiring from parsed arguments to the library crates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use sx_agents::{
    write_plan, BranchPolicy, Controller, ControllerConfig, DebugOnce, Mode, Pipeline,
    PipelineConfig, PipelineReport, Plan, Planner, RunReport,
};
use sx_core::ChatClient;
use sx_providers::OpenAIProvider;
use sx_tools::{CommandTestRunner, CommitOutcome, GitCli, Vcs, Workspace};

use crate::config::Config;

const FALLBACK_REFERER: &str = "https://github.com/andrew/swarmx";
const FALLBACK_TITLE: &str = "swarmx";

/// Primary provider plus the optional fallback hop.
pub fn build_client(config: &Config) -> ChatClient {
    let settings = &config.provider;
    let mut primary = OpenAIProvider::new(settings.api_key.clone())
        .with_name("primary")
        .with_base_url(&settings.base_url)
        .with_timeout(settings.timeout_secs);
    if let Some(model) = &settings.model {
        primary = primary.with_default_model(model);
    }

    let mut client = ChatClient::new(Box::new(primary))
        .with_temperature(config.orchestrator.temperature)
        .with_max_tokens(config.orchestrator.max_tokens);

    if config.fallback.enabled() {
        let mut fallback = OpenAIProvider::new(config.fallback.api_key.clone())
            .with_name("fallback")
            .with_base_url(&config.fallback.base_url)
            .with_timeout(settings.timeout_secs)
            .with_header("HTTP-Referer", FALLBACK_REFERER)
            .with_header("X-Title", FALLBACK_TITLE);
        if let Some(model) = &config.fallback.model {
            fallback = fallback.with_default_model(model);
        }
        client = client.with_fallback(Box::new(fallback));
    }
    client
}

pub fn open_workspace(config: &Config, project: &Path) -> Result<Workspace> {
    Workspace::open(project, &config.orchestrator.meta_dir)
        .with_context(|| format!("Failed to open workspace at {}", project.display()))
}

/// Like [`open_workspace`] but refuses directories that are not already repositories.
fn open_repository(config: &Config, project: &Path) -> Result<(Workspace, GitCli)> {
    if !project.join(".git").exists() {
        bail!("{} is not a git repository", project.display());
    }
    let workspace = open_workspace(config, project)?;
    let git = workspace.git();
    git.exclude(workspace.meta_name())?;
    Ok((workspace, git))
}

/// Last path segment of a clone URL, without `.git`.
pub fn repo_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "project".to_string()
    } else {
        name.to_string()
    }
}

pub fn repo(config: &Config, url: &str, project: Option<PathBuf>, branch: Option<&str>) -> Result<PathBuf> {
    let dest = project.unwrap_or_else(|| config.projects_dir().join(repo_name(url)));
    let cloned = if dest.exists() {
        warn!(dest = %dest.display(), "Destination exists, skipping clone");
        println!("{} already exists, not cloning", dest.display());
        false
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        GitCli::clone_repo(url, &dest, branch)?;
        true
    };

    let workspace = open_workspace(config, &dest)?;
    let git = workspace.git();
    git.ensure_git()?;
    git.exclude(workspace.meta_name())?;
    let listing = workspace.refresh_index(config.prompt.max_tree_entries)?;
    let body = if cloned {
        format!("Cloned {} (branch: {})", url, branch.unwrap_or("default"))
    } else {
        format!("Opened existing checkout for {}", url)
    };
    workspace.append_journal("repository", &body)?;

    println!(
        "Workspace ready at {} ({} files indexed)",
        workspace.root().display(),
        listing.total
    );
    Ok(workspace.root().to_path_buf())
}

pub fn index(config: &Config, project: &Path) -> Result<()> {
    let workspace = open_workspace(config, project)?;
    let listing = workspace.refresh_index(config.prompt.max_tree_entries)?;
    if listing.truncated() {
        println!(
            "Indexed {} of {} files into {}",
            listing.files.len(),
            listing.total,
            workspace.meta().index.display()
        );
    } else {
        println!("Indexed {} files into {}", listing.total, workspace.meta().index.display());
    }
    Ok(())
}

pub fn commit(config: &Config, project: &Path, message: &str) -> Result<()> {
    let message = message.trim();
    if message.is_empty() {
        bail!("Commit message must not be empty");
    }
    let (workspace, git) = open_repository(config, project)?;
    git.stage_all()?;
    match git.commit(message)? {
        CommitOutcome::Committed { sha } => {
            workspace.append_journal("commit", &format!("{} {}", sha, message))?;
            println!("Committed {}", sha);
        }
        CommitOutcome::NothingToCommit => println!("Nothing to commit"),
    }
    Ok(())
}

pub fn push(config: &Config, project: &Path, remote: Option<&str>, branch: Option<&str>) -> Result<()> {
    let (workspace, git) = open_repository(config, project)?;
    let remote = remote.unwrap_or(&config.orchestrator.remote);
    let branch = match branch {
        Some(b) => b.to_string(),
        None => git
            .current_branch()?
            .context("HEAD is detached; pass --branch")?,
    };
    let result = git.push(remote, &branch);
    let line = match &result {
        Ok(()) => format!("Pushed {} to {}", branch, remote),
        Err(e) => format!("Push of {} to {} failed: {}", branch, remote, e),
    };
    workspace.append_journal("push", &line)?;
    result.with_context(|| format!("Failed to push {} to {}", branch, remote))?;
    println!("{}", line);
    Ok(())
}

pub fn show_config(config: &Config) -> Result<()> {
    let path = Config::config_path()?;
    println!("# Config file: {}", path.display());
    if !path.exists() {
        println!("# (not present, showing defaults and environment)");
    }
    let rendered = toml::to_string_pretty(&config.masked()).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}

/// Everything `task` and `run` need beyond the loaded config.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub goal: String,
    pub project: PathBuf,
    pub mode: Mode,
    pub commit: bool,
    pub push: bool,
    pub branch: BranchPolicy,
    pub dry_run: bool,
}

/// `--branch` given without a value means "derive from the goal".
pub fn branch_policy(flag: Option<&str>) -> BranchPolicy {
    match flag.map(str::trim) {
        None => BranchPolicy::Current,
        Some("") => BranchPolicy::FromGoal,
        Some(name) => BranchPolicy::Named(name.to_string()),
    }
}

pub fn controller_config(config: &Config, args: &RunArgs) -> ControllerConfig {
    let settings = &config.orchestrator;
    ControllerConfig {
        mode: args.mode,
        max_iters: settings.max_iters,
        stagnation_limit: settings.stagnation_limit,
        commit: args.commit,
        push: args.push,
        remote: settings.remote.clone(),
        branch: args.branch.clone(),
        branch_prefix: settings.branch_prefix.clone(),
        commit_prefix: settings.commit_prefix.clone(),
        dry_run: args.dry_run,
        limits: config.prompt.limits(),
        ..ControllerConfig::default()
    }
}

pub fn pipeline_config(config: &Config, args: &RunArgs) -> PipelineConfig {
    let settings = &config.orchestrator;
    PipelineConfig {
        controller: controller_config(config, args),
        debug_attempts: settings.debug_attempts,
        max_milestones: settings.max_milestones,
        plan_path: PathBuf::from(&settings.plan_path),
    }
}

fn test_runner(config: &Config) -> CommandTestRunner {
    CommandTestRunner::new()
        .with_command(config.orchestrator.test_command.as_deref())
        .with_timeout(Duration::from_secs(config.orchestrator.test_timeout_secs))
}

/// One goal through the iteration loop.
pub fn task(config: &Config, args: &RunArgs) -> Result<RunReport> {
    let workspace = open_workspace(config, &args.project)?;
    let git = workspace.git();
    let tests = test_runner(config);
    let client = build_client(config);
    let controller = Controller::new(&client, &workspace, &git, &tests, controller_config(config, args));

    info!(project = %workspace.root().display(), mode = %args.mode, "Running goal");
    let report = controller
        .run(&args.goal)
        .with_context(|| format!("Run aborted in {}", workspace.root().display()))?;
    Ok(report)
}

/// Plan the goal, then run each milestone.
pub fn run(config: &Config, args: &RunArgs) -> Result<PipelineReport> {
    let workspace = open_workspace(config, &args.project)?;
    let git = workspace.git();
    let tests = test_runner(config);
    let client = build_client(config);
    let pipeline = Pipeline::new(&client, &workspace, &git, &tests, pipeline_config(config, args));

    info!(project = %workspace.root().display(), "Planning goal");
    let report = pipeline
        .run(&args.goal)
        .with_context(|| format!("Run aborted in {}", workspace.root().display()))?;
    Ok(report)
}

/// Architect the goal and write the plan file. Nothing else changes.
pub fn plan(config: &Config, project: &Path, goal: &str) -> Result<(Plan, PathBuf)> {
    let workspace = open_workspace(config, project)?;
    let git = workspace.git();
    git.ensure_git()?;
    git.exclude(workspace.meta_name())?;
    let client = build_client(config);

    let plan = Planner::new(&client, &workspace, &git)
        .with_limits(config.prompt.limits())
        .with_max_milestones(config.orchestrator.max_milestones)
        .plan(goal)
        .context("Planning failed")?;
    let path = write_plan(&workspace, &plan, Path::new(&config.orchestrator.plan_path))?;
    Ok((plan, path))
}

/// Run the tests and, when they fail, one debug iteration. Without `commit`
/// the fix stays staged.
pub fn debug_once(config: &Config, project: &Path, commit: bool) -> Result<DebugOnce> {
    let workspace = open_workspace(config, project)?;
    let git = workspace.git();
    let tests = test_runner(config);
    let client = build_client(config);
    let args = RunArgs {
        goal: String::new(),
        project: project.to_path_buf(),
        mode: Mode::Debug,
        commit,
        push: false,
        branch: BranchPolicy::Current,
        dry_run: false,
    };
    let pipeline = Pipeline::new(&client, &workspace, &git, &tests, pipeline_config(config, &args));
    pipeline
        .debug_once()
        .with_context(|| format!("Debug run aborted in {}", workspace.root().display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name("https://github.com/acme/shop.git"), "shop");
        assert_eq!(repo_name("git@github.com:acme/shop.git"), "shop");
        assert_eq!(repo_name("https://example.com/acme/tool/"), "tool");
        assert_eq!(repo_name("file:///tmp/src"), "src");
    }

    #[test]
    fn test_branch_policy() {
        assert_eq!(branch_policy(None), BranchPolicy::Current);
        assert_eq!(branch_policy(Some("")), BranchPolicy::FromGoal);
        assert_eq!(
            branch_policy(Some("feature/x")),
            BranchPolicy::Named("feature/x".to_string())
        );
    }

    #[test]
    fn test_controller_config_follows_settings() {
        let mut config = Config::default();
        config.orchestrator.max_iters = 5;
        config.orchestrator.stagnation_limit = 0;
        config.prompt.feedback_chars = 10;
        let args = RunArgs {
            goal: "g".into(),
            project: PathBuf::from("."),
            mode: Mode::Debug,
            commit: false,
            push: true,
            branch: BranchPolicy::FromGoal,
            dry_run: true,
        };
        let cc = controller_config(&config, &args);
        assert_eq!(cc.max_iters, 5);
        assert_eq!(cc.stagnation_limit, 0);
        assert_eq!(cc.mode, Mode::Debug);
        assert!(!cc.commit);
        assert!(cc.push);
        assert!(cc.dry_run);
        assert_eq!(cc.limits.feedback_chars, 10);
        assert_eq!(cc.remote, "origin");

        config.orchestrator.debug_attempts = 0;
        config.orchestrator.plan_path = "PLAN.md".into();
        let pc = pipeline_config(&config, &args);
        assert_eq!(pc.debug_attempts, 0);
        assert_eq!(pc.plan_path, PathBuf::from("PLAN.md"));
        assert_eq!(pc.controller.max_iters, 5);
    }

    #[test]
    fn test_commit_refuses_non_repository() {
        let dir = tempfile::tempdir().unwrap();
        let err = commit(&Config::default(), dir.path(), "msg").unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
    }

    #[test]
    fn test_commit_command_commits_changes() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new(dir.path());
        git.ensure_git().unwrap();
        std::fs::write(dir.path().join("README.md"), "hi\n").unwrap();

        commit(&Config::default(), dir.path(), "add readme").unwrap();
        assert_eq!(git.commit_count().unwrap(), 1);
        assert!(git.status().unwrap().is_empty());

        // Second call has nothing to do.
        commit(&Config::default(), dir.path(), "again").unwrap();
        assert_eq!(git.commit_count().unwrap(), 1);
    }

    #[test]
    fn test_run_dry_run_leaves_tree_untouched() {
        use sx_core::testing::MockProvider;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "print(\"old\")\n").unwrap();
        let config = Config::default();
        let workspace = open_workspace(&config, dir.path()).unwrap();
        let git = workspace.git();
        git.ensure_git().unwrap();
        git.exclude(workspace.meta_name()).unwrap();
        git.stage_all().unwrap();
        git.commit("initial").unwrap();

        let reply = "```diff\ndiff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-print(\"old\")\n+print(\"new\")\n```";
        let client = ChatClient::new(Box::new(MockProvider::always(reply)));
        let tests = CommandTestRunner::new();
        let args = RunArgs {
            goal: "change output".into(),
            project: dir.path().to_path_buf(),
            mode: Mode::Code,
            commit: true,
            push: false,
            branch: BranchPolicy::FromGoal,
            dry_run: true,
        };
        let controller = Controller::new(&client, &workspace, &git, &tests, controller_config(&config, &args));
        let report = controller.run(&args.goal).unwrap();

        assert_eq!(report.termination, sx_agents::Termination::DryRun);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print(\"old\")\n"
        );
        assert_eq!(git.commit_count().unwrap(), 1);
        assert_ne!(git.current_branch().unwrap().as_deref(), Some("swarm/change-output"));
    }
}
