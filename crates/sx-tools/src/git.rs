//! Git operations for the workspace.
//!
//! Everything goes through the `git` executable so that behavior matches what
//! the user sees on the command line. Prompts are disabled so a push against a
//! remote that wants credentials fails instead of blocking.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use sx_core::{Error, PushFailureKind};

use crate::process::{self, ProcessOutput};

/// Identity used for commits when the repository has none configured.
pub const FALLBACK_USER_NAME: &str = "swarmx";
pub const FALLBACK_USER_EMAIL: &str = "swarmx@localhost";

/// One line of `git status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Two-character XY status code, e.g. `" M"`, `"A "`, `"??"`.
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { sha: String },
    NothingToCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchSwitch {
    Unchanged,
    Switched,
    Created,
}

/// Arguments for a single `git apply` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GitApply {
    pub strip: u8,
    pub three_way: bool,
    pub check_only: bool,
}

pub trait Vcs: Send + Sync {
    fn root(&self) -> &Path;

    /// Initialize a repository if none exists. Returns true when one was created.
    fn ensure_git(&self) -> Result<bool, Error>;

    /// Add a pattern to `.git/info/exclude` if not already present.
    fn exclude(&self, pattern: &str) -> Result<(), Error>;

    /// `None` on a detached HEAD.
    fn current_branch(&self) -> Result<Option<String>, Error>;

    fn create_or_switch_branch(&self, name: &str) -> Result<BranchSwitch, Error>;

    /// Porcelain status, sorted by path.
    fn status(&self) -> Result<Vec<StatusEntry>, Error>;

    /// Stage the given paths, including deletions.
    fn stage(&self, paths: &[String]) -> Result<(), Error>;

    fn stage_all(&self) -> Result<(), Error>;

    /// Commit whatever is staged. Nothing staged is not an error.
    fn commit(&self, message: &str) -> Result<CommitOutcome, Error>;

    fn commit_count(&self) -> Result<usize, Error>;

    /// Push `branch` to `remote` and set upstream.
    fn push(&self, remote: &str, branch: &str) -> Result<(), Error>;

    fn apply(&self, patch_file: &Path, args: GitApply) -> Result<ProcessOutput, Error>;
}

/// `Vcs` backed by the git command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Shallow-clone `url` into `dest`, optionally checking out `branch`.
    pub fn clone_repo(url: &str, dest: &Path, branch: Option<&str>) -> Result<Self, Error> {
        info!(url = %url, dest = %dest.display(), branch = ?branch, "Cloning repository");
        let mut cmd = base_command();
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(branch) = branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.arg(url).arg(dest);
        let output = process::run(&mut cmd).map_err(git_missing)?;
        if !output.success() {
            return Err(Error::git(format!("git clone failed: {}", output.combined())));
        }
        Ok(Self::new(dest))
    }

    fn command(&self) -> Command {
        let mut cmd = base_command();
        cmd.arg("-C").arg(&self.root);
        cmd
    }

    fn git(&self, args: &[&str]) -> Result<ProcessOutput, Error> {
        debug!(args = ?args, "git");
        process::run(self.command().args(args)).map_err(git_missing)
    }

    /// Run and require success.
    fn git_ok(&self, args: &[&str]) -> Result<ProcessOutput, Error> {
        let output = self.git(args)?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::git(format!(
                "git {} failed: {}",
                args.join(" "),
                output.combined()
            )))
        }
    }

    fn is_repo(&self) -> bool {
        self.git(&["rev-parse", "--git-dir"])
            .map(|o| o.success())
            .unwrap_or(false)
    }

    fn has_identity(&self) -> bool {
        self.git(&["config", "user.email"])
            .map(|o| o.success() && !o.stdout.trim().is_empty())
            .unwrap_or(false)
    }

    fn branch_exists(&self, name: &str) -> bool {
        let reference = format!("refs/heads/{}", name);
        self.git(&["show-ref", "--verify", "--quiet", &reference])
            .map(|o| o.success())
            .unwrap_or(false)
    }

    fn git_dir(&self) -> Result<PathBuf, Error> {
        let output = self.git_ok(&["rev-parse", "--git-dir"])?;
        let dir = PathBuf::from(output.stdout.trim());
        Ok(if dir.is_absolute() { dir } else { self.root.join(dir) })
    }
}

fn base_command() -> Command {
    let mut cmd = Command::new("git");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    if std::env::var_os("GIT_SSH_COMMAND").is_none() {
        cmd.env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes");
    }
    cmd
}

fn git_missing(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::git("git executable not found on PATH")
    } else {
        Error::Io(e)
    }
}

impl Vcs for GitCli {
    fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_git(&self) -> Result<bool, Error> {
        if self.is_repo() {
            return Ok(false);
        }
        info!(root = %self.root.display(), "Initializing git repository");
        self.git_ok(&["init"])?;
        Ok(true)
    }

    fn exclude(&self, pattern: &str) -> Result<(), Error> {
        let info_dir = self.git_dir()?.join("info");
        std::fs::create_dir_all(&info_dir)?;
        let exclude = info_dir.join("exclude");
        let existing = std::fs::read_to_string(&exclude).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == pattern) {
            return Ok(());
        }
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(pattern);
        content.push('\n');
        std::fs::write(&exclude, content)?;
        Ok(())
    }

    fn current_branch(&self) -> Result<Option<String>, Error> {
        // symbolic-ref works on an unborn branch where rev-parse does not.
        let output = self.git(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if output.success() {
            let name = output.stdout.trim();
            Ok((!name.is_empty()).then(|| name.to_string()))
        } else {
            Ok(None)
        }
    }

    fn create_or_switch_branch(&self, name: &str) -> Result<BranchSwitch, Error> {
        if self.current_branch()?.as_deref() == Some(name) {
            return Ok(BranchSwitch::Unchanged);
        }
        if self.branch_exists(name) {
            self.git_ok(&["checkout", name])?;
            info!(branch = %name, "Switched branch");
            Ok(BranchSwitch::Switched)
        } else {
            self.git_ok(&["checkout", "-b", name])?;
            info!(branch = %name, "Created branch");
            Ok(BranchSwitch::Created)
        }
    }

    fn status(&self) -> Result<Vec<StatusEntry>, Error> {
        let output = self.git_ok(&["status", "--porcelain", "--untracked-files=all"])?;
        let mut entries: Vec<StatusEntry> = output
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| StatusEntry {
                code: l[..2].to_string(),
                path: l[3..].trim_matches('"').to_string(),
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn stage(&self, paths: &[String]) -> Result<(), Error> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.git_ok(&args)?;
        Ok(())
    }

    fn stage_all(&self) -> Result<(), Error> {
        self.git_ok(&["add", "-A"])?;
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<CommitOutcome, Error> {
        let staged = self.git(&["diff", "--cached", "--quiet"])?;
        // Exit 0 means no staged changes. An unborn HEAD reports changes as 1.
        if staged.exit_code == Some(0) {
            debug!("Nothing staged to commit");
            return Ok(CommitOutcome::NothingToCommit);
        }

        let mut args: Vec<String> = Vec::new();
        if !self.has_identity() {
            args.push("-c".into());
            args.push(format!("user.name={}", FALLBACK_USER_NAME));
            args.push("-c".into());
            args.push(format!("user.email={}", FALLBACK_USER_EMAIL));
        }
        args.extend(["commit".into(), "-m".into(), message.to_string()]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.git(&args)?;
        if !output.success() {
            let text = output.combined();
            if text.contains("nothing to commit") {
                return Ok(CommitOutcome::NothingToCommit);
            }
            return Err(Error::git(format!("git commit failed: {}", text)));
        }

        let sha = self.git_ok(&["rev-parse", "HEAD"])?.stdout.trim().to_string();
        info!(sha = %sha, "Committed");
        Ok(CommitOutcome::Committed { sha })
    }

    fn commit_count(&self) -> Result<usize, Error> {
        let output = self.git(&["rev-list", "--count", "HEAD"])?;
        if !output.success() {
            // Unborn branch.
            return Ok(0);
        }
        output
            .stdout
            .trim()
            .parse()
            .map_err(|e| Error::git(format!("unexpected rev-list output: {}", e)))
    }

    fn push(&self, remote: &str, branch: &str) -> Result<(), Error> {
        let remotes = self.git_ok(&["remote"])?;
        if !remotes.stdout.lines().any(|r| r.trim() == remote) {
            return Err(Error::push_failed(
                PushFailureKind::NoRemote,
                format!("no remote named '{}' is configured", remote),
            ));
        }

        info!(remote = %remote, branch = %branch, "Pushing");
        let output = self.git(&["push", "-u", remote, branch])?;
        if output.success() {
            return Ok(());
        }
        let text = output.combined();
        Err(Error::push_failed(classify_push_failure(&text), text))
    }

    fn apply(&self, patch_file: &Path, args: GitApply) -> Result<ProcessOutput, Error> {
        let mut cmd = self.command();
        cmd.arg("apply").arg("--index");
        if args.three_way {
            cmd.arg("--3way");
        }
        if args.check_only {
            cmd.arg("--check");
        }
        cmd.arg(format!("-p{}", args.strip))
            .arg("--whitespace=nowarn")
            .arg(patch_file);
        debug!(strip = args.strip, three_way = args.three_way, check = args.check_only, "git apply");
        process::run(&mut cmd).map_err(git_missing)
    }
}

/// Map git push output to a failure kind.
pub fn classify_push_failure(output: &str) -> PushFailureKind {
    let text = output.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if any(&[
        "does not appear to be a git repository",
        "no configured push destination",
        "no such remote",
    ]) {
        PushFailureKind::NoRemote
    } else if any(&[
        "authentication failed",
        "permission denied",
        "could not read username",
        "terminal prompts disabled",
        "403",
        "invalid username or password",
    ]) {
        PushFailureKind::Auth
    } else if any(&["[rejected]", "non-fast-forward", "fetch first", "protected branch"]) {
        PushFailureKind::Rejected
    } else if any(&[
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "network is unreachable",
        "unable to access",
    ]) {
        PushFailureKind::Network
    } else {
        PushFailureKind::Other
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fresh repository with a committed `app.py`.
    pub fn repo_with_app() -> (tempfile::TempDir, GitCli) {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new(dir.path());
        git.ensure_git().unwrap();
        std::fs::write(dir.path().join("app.py"), "print(\"old\")\n").unwrap();
        git.stage_all().unwrap();
        assert!(matches!(
            git.commit("initial").unwrap(),
            CommitOutcome::Committed { .. }
        ));
        (dir, git)
    }
}
