//! Extracting unified diffs from model replies and applying them.
//!
//! Application tries a fixed ladder of strategies and stops at the first one
//! that succeeds:
//!
//! 1. `git apply --index -p0` (skipped when every header carries `a/`/`b/` prefixes)
//! 2. `git apply --index -p1`
//! 3. `git apply --index --3way -p1`
//! 4. `patch -p1 --forward`, dry-run first, then staged with `git add`

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use sx_core::Error;

use crate::git::{GitApply, Vcs};
use crate::process;
use crate::workspace::{is_contained, Workspace};

/// Reply content meaning "no change is needed".
pub const NOOP_SENTINEL: &str = "NOOP";

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?ms)^```[ \t]*([A-Za-z0-9_+\-]*)[^\n]*\n(.*?)^```[ \t]*$")
            .expect("fence regex is valid")
    })
}

/// A unified diff in git format, newline-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    text: String,
}

impl Patch {
    pub fn new(text: &str) -> Self {
        let body = text.trim_start_matches(['\n', '\r']).trim_end_matches(['\n', '\r']);
        Self {
            text: format!("{}\n", body),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Every path named by a header line, as written.
    pub fn header_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for line in self.text.lines() {
            if let Some(rest) = line.strip_prefix("diff --git ") {
                paths.extend(split_git_header(rest));
            } else if let Some(rest) = line
                .strip_prefix("--- ")
                .or_else(|| line.strip_prefix("+++ "))
            {
                let path = rest.split('\t').next().unwrap_or("").trim();
                paths.push(unquote(path));
            } else if let Some(rest) = ["rename from ", "rename to ", "copy from ", "copy to "]
                .iter()
                .find_map(|p| line.strip_prefix(p))
            {
                // These are written without a/ b/ prefixes.
                paths.push(unquote(rest.trim()));
            }
        }
        paths.retain(|p| !p.is_empty() && p != "/dev/null");
        paths
    }

    /// True when every `diff --git` header uses `a/` and `b/` prefixes.
    pub fn is_prefixed(&self) -> bool {
        let mut headers = self
            .text
            .lines()
            .filter_map(|l| l.strip_prefix("diff --git "))
            .peekable();
        if headers.peek().is_none() {
            return false;
        }
        headers.all(|rest| {
            let parts = split_git_header(rest);
            parts.len() == 2 && parts[0].starts_with("a/") && parts[1].starts_with("b/")
        })
    }

    /// Repository-relative files the patch touches. The `a/` `b/` component
    /// is dropped only when every header carries it.
    pub fn touched_files(&self) -> Vec<String> {
        self.stripped_paths(usize::from(self.is_prefixed()))
    }

    /// Header paths with `strip` leading components removed, as `patch -pN` sees them.
    fn stripped_paths(&self, strip: usize) -> Vec<String> {
        let mut files: Vec<String> = self
            .text
            .lines()
            .filter_map(|l| l.strip_prefix("+++ ").or_else(|| l.strip_prefix("--- ")))
            .map(|rest| unquote(rest.split('\t').next().unwrap_or("").trim()))
            .filter(|p| p != "/dev/null" && !p.is_empty())
            .map(|p| strip_components(&p, strip))
            .filter(|p| !p.is_empty())
            .collect();
        files.sort();
        files.dedup();
        files
    }

    /// Refuse header paths that would land outside the repository under
    /// either `-p0` or `-p1`.
    pub fn validate_paths(&self) -> Result<(), Error> {
        for path in self.header_paths() {
            if !is_contained(&path) || !is_contained(&strip_components(&path, 1)) {
                return Err(Error::path_escape(path));
            }
        }
        Ok(())
    }
}

fn split_git_header(rest: &str) -> Vec<String> {
    let rest = rest.trim();
    if rest.starts_with('"') {
        return rest
            .split('"')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    // "a/x b/x": split where the second prefix begins when present.
    if let Some(idx) = rest.find(" b/") {
        return vec![rest[..idx].to_string(), rest[idx + 1..].to_string()];
    }
    rest.split_whitespace().map(str::to_string).collect()
}

fn unquote(path: &str) -> String {
    path.trim_matches('"').to_string()
}

fn strip_components(path: &str, n: usize) -> String {
    path.splitn(n + 1, '/').nth(n).unwrap_or("").to_string()
}

fn is_noop(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(NOOP_SENTINEL)
}

/// What a reply contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Patch(Patch),
    NoOp,
    Unparseable(String),
}

/// Find the patch in a model reply.
///
/// Fenced blocks labeled `diff` or `patch` are preferred, then unlabeled
/// fences that start with a `diff --git` header, then a bare diff.
pub fn extract(reply: &str) -> Extraction {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Extraction::Unparseable("empty reply".into());
    }
    if is_noop(trimmed) {
        return Extraction::NoOp;
    }

    let mut reason = None;
    let mut unlabeled: Option<&str> = None;
    for caps in fence_regex().captures_iter(reply) {
        let label = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        if is_noop(body) {
            return Extraction::NoOp;
        }
        let has_header = body.lines().any(|l| l.starts_with("diff --git "));
        match label.as_str() {
            "diff" | "patch" if has_header => return Extraction::Patch(Patch::new(body)),
            "diff" | "patch" => {
                reason.get_or_insert("diff block has no 'diff --git' header");
            }
            "" if has_header && body.trim_start().starts_with("diff --git ") => {
                unlabeled.get_or_insert(body);
            }
            _ => {}
        }
    }
    if let Some(body) = unlabeled {
        return Extraction::Patch(Patch::new(body));
    }

    if trimmed.starts_with("diff --git ") {
        return Extraction::Patch(Patch::new(trimmed));
    }
    if let Some(first) = trimmed.lines().next() {
        if is_noop(first) {
            return Extraction::NoOp;
        }
    }

    Extraction::Unparseable(
        reason
            .unwrap_or("no fenced diff block and no NOOP")
            .to_string(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    GitApplyP0,
    GitApplyP1,
    GitApplyThreeWay,
    PatchCommand,
}

impl Strategy {
    pub const LADDER: [Strategy; 4] = [
        Strategy::GitApplyP0,
        Strategy::GitApplyP1,
        Strategy::GitApplyThreeWay,
        Strategy::PatchCommand,
    ];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::GitApplyP0 => "git apply -p0",
            Strategy::GitApplyP1 => "git apply -p1",
            Strategy::GitApplyThreeWay => "git apply --3way",
            Strategy::PatchCommand => "patch -p1",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub strategy: Strategy,
    pub succeeded: bool,
    pub skipped: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        strategy: Strategy,
        attempts: Vec<Attempt>,
    },
    Rejected {
        reason: String,
        attempts: Vec<Attempt>,
    },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }

    pub fn attempts(&self) -> &[Attempt] {
        match self {
            ApplyOutcome::Applied { attempts, .. } | ApplyOutcome::Rejected { attempts, .. } => {
                attempts
            }
        }
    }
}

/// Try each strategy in turn. `check_only` verifies applicability without
/// touching the tree or index.
///
/// The only errors are a path escape and failure to run git at all; a patch
/// that does not apply is `Ok(Rejected)`.
pub fn apply(
    vcs: &dyn Vcs,
    patch: &Patch,
    patch_file: &Path,
    check_only: bool,
) -> Result<ApplyOutcome, Error> {
    patch.validate_paths()?;

    let prefixed = patch.is_prefixed();
    let mut attempts = Vec::new();
    for strategy in Strategy::LADDER {
        if strategy == Strategy::GitApplyP0 && prefixed {
            attempts.push(Attempt {
                strategy,
                succeeded: false,
                skipped: true,
                detail: "headers use a/ b/ prefixes".into(),
            });
            continue;
        }

        let (succeeded, detail) = match strategy {
            Strategy::GitApplyP0 | Strategy::GitApplyP1 | Strategy::GitApplyThreeWay => {
                let args = GitApply {
                    strip: if strategy == Strategy::GitApplyP0 { 0 } else { 1 },
                    three_way: strategy == Strategy::GitApplyThreeWay,
                    check_only,
                };
                let output = vcs.apply(patch_file, args)?;
                (output.success(), output.combined())
            }
            Strategy::PatchCommand => run_patch_command(vcs, patch, patch_file, check_only)?,
        };
        debug!(strategy = %strategy, succeeded, "Apply attempt");
        attempts.push(Attempt {
            strategy,
            succeeded,
            skipped: false,
            detail,
        });

        if succeeded {
            info!(strategy = %strategy, check_only, "Patch applied");
            return Ok(ApplyOutcome::Applied { strategy, attempts });
        }
    }

    let reason = attempts
        .iter()
        .rev()
        .find(|a| !a.skipped && !a.detail.is_empty())
        .map(|a| format!("{}: {}", a.strategy, a.detail))
        .unwrap_or_else(|| "no strategy applied the patch".to_string());
    warn!(reason = %reason, "Patch rejected");
    Ok(ApplyOutcome::Rejected { reason, attempts })
}

/// Validate, archive under `label`, then apply.
pub fn apply_in_workspace(
    workspace: &Workspace,
    vcs: &dyn Vcs,
    patch: &Patch,
    label: &str,
    check_only: bool,
) -> Result<ApplyOutcome, Error> {
    patch.validate_paths()?;
    let patch_file = workspace.write_patch(label, patch.text())?;
    apply(vcs, patch, &patch_file, check_only)
}

fn patch_command(root: &Path, patch_file: &Path, dry_run: bool) -> Command {
    let mut cmd = Command::new("patch");
    cmd.arg("-p1")
        .arg("--forward")
        .arg("--batch")
        .arg("--no-backup-if-mismatch")
        .arg("--reject-file=-")
        .arg("-d")
        .arg(root)
        .arg("-i")
        .arg(patch_file);
    if dry_run {
        cmd.arg("--dry-run");
    }
    cmd
}

fn run_patch_command(
    vcs: &dyn Vcs,
    patch: &Patch,
    patch_file: &Path,
    check_only: bool,
) -> Result<(bool, String), Error> {
    let dry = match process::run(&mut patch_command(vcs.root(), patch_file, true)) {
        Ok(o) => o,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((false, "patch executable not found".to_string()));
        }
        Err(e) => return Err(Error::Io(e)),
    };
    if !dry.success() || check_only {
        return Ok((dry.success(), dry.combined()));
    }

    let real = process::run(&mut patch_command(vcs.root(), patch_file, false))?;
    if !real.success() {
        return Ok((false, real.combined()));
    }
    vcs.stage(&patch.stripped_paths(1))?;
    Ok((true, real.combined()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::repo_with_app;
    use crate::git::CommitOutcome;

    const APP_PATCH: &str = "diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-print(\"old\")\n+print(\"new\")\n";

    fn write(dir: &Path, patch: &Patch) -> std::path::PathBuf {
        let file = dir.join("candidate.diff");
        std::fs::write(&file, patch.text()).unwrap();
        file
    }

    #[test]
    fn test_extract_fenced_diff() {
        let reply = format!("Here you go:\n\n```diff\n{}```\n\nDone.", APP_PATCH);
        match extract(&reply) {
            Extraction::Patch(p) => assert_eq!(p.text(), APP_PATCH),
            other => panic!("expected patch, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_noop_variants() {
        assert_eq!(extract("NOOP"), Extraction::NoOp);
        assert_eq!(extract("  NOOP\n"), Extraction::NoOp);
        assert_eq!(extract("```\nNOOP\n```"), Extraction::NoOp);
        assert_eq!(extract("NOOP\nNothing to change here."), Extraction::NoOp);
        assert_eq!(extract("noop"), Extraction::NoOp);
        assert_eq!(extract("```diff\nNoOp\n```"), Extraction::NoOp);
    }

    #[test]
    fn test_extract_unparseable() {
        assert!(matches!(extract(""), Extraction::Unparseable(_)));
        assert!(matches!(extract("I think you should edit app.py"), Extraction::Unparseable(_)));
        assert!(matches!(
            extract("```diff\n--- a/x\n+++ b/x\n```"),
            Extraction::Unparseable(r) if r.contains("diff --git")
        ));
        assert!(matches!(
            extract("```python\nprint('hi')\n```"),
            Extraction::Unparseable(_)
        ));
    }

    #[test]
    fn test_extract_unlabeled_and_bare() {
        let unlabeled = format!("```\n{}```", APP_PATCH);
        assert!(matches!(extract(&unlabeled), Extraction::Patch(_)));
        assert!(matches!(extract(APP_PATCH), Extraction::Patch(_)));
    }

    #[test]
    fn test_patch_preserves_trailing_context_line() {
        let text = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n-x\n+y\n \n";
        assert_eq!(Patch::new(text).text(), text);
    }

    #[test]
    fn test_header_paths_and_prefixes() {
        let patch = Patch::new(APP_PATCH);
        assert!(patch.is_prefixed());
        assert_eq!(patch.touched_files(), vec!["app.py"]);

        let unprefixed = Patch::new("diff --git src/app.py src/app.py\n--- src/app.py\n+++ src/app.py\n@@ -1 +1 @@\n-a\n+b\n");
        assert!(!unprefixed.is_prefixed());
        assert_eq!(unprefixed.touched_files(), vec!["src/app.py"]);
    }

    #[test]
    fn test_validate_paths_rejects_escape() {
        let evil = Patch::new(
            "diff --git a/../../etc/passwd b/../../etc/passwd\n--- a/../../etc/passwd\n+++ b/../../etc/passwd\n@@ -1 +1 @@\n-x\n+y\n",
        );
        assert!(matches!(evil.validate_paths(), Err(Error::PathEscape(_))));

        let absolute = Patch::new("diff --git /etc/hosts /etc/hosts\n--- /etc/hosts\n+++ /etc/hosts\n");
        assert!(absolute.validate_paths().is_err());

        let created = Patch::new("diff --git a/new.txt b/new.txt\nnew file mode 100644\n--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1 @@\n+hi\n");
        assert!(created.validate_paths().is_ok());
    }

    #[test]
    fn test_apply_then_reapply_is_rejected() {
        let (dir, git) = repo_with_app();
        let patch = Patch::new(APP_PATCH);
        let file = write(&dir.path().join(".git"), &patch);

        let first = apply(&git, &patch, &file, false).unwrap();
        assert!(matches!(
            &first,
            ApplyOutcome::Applied { strategy: Strategy::GitApplyP1, attempts } if attempts[0].skipped
        ));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print(\"new\")\n"
        );
        assert!(matches!(git.commit("apply").unwrap(), CommitOutcome::Committed { .. }));

        let second = apply(&git, &patch, &file, false).unwrap();
        assert!(!second.is_applied());
        assert_eq!(second.attempts().len(), 4);
    }

    #[test]
    fn test_bare_path_patch_applies_with_p0() {
        let (dir, git) = repo_with_app();
        let patch = Patch::new(
            "diff --git app.py app.py\n--- app.py\n+++ app.py\n@@ -1 +1 @@\n-print(\"old\")\n+print(\"new\")\n",
        );
        assert_eq!(patch.touched_files(), vec!["app.py"]);
        let file = write(&dir.path().join(".git"), &patch);

        let outcome = apply(&git, &patch, &file, false).unwrap();
        match &outcome {
            ApplyOutcome::Applied { strategy, attempts } => {
                assert_eq!(*strategy, Strategy::GitApplyP0);
                assert_eq!(attempts.len(), 1);
                assert!(!attempts[0].skipped);
            }
            other => panic!("expected -p0 to apply, got {:?}", other),
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print(\"new\")\n"
        );
        assert!(git.status().unwrap().iter().any(|e| e.path == "app.py"));
    }

    #[test]
    fn test_check_only_leaves_tree_untouched() {
        let (dir, git) = repo_with_app();
        let patch = Patch::new(APP_PATCH);
        let file = write(&dir.path().join(".git"), &patch);

        let outcome = apply(&git, &patch, &file, true).unwrap();
        assert!(outcome.is_applied());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print(\"old\")\n"
        );
        assert!(git.status().unwrap().is_empty());
    }

    #[test]
    fn test_apply_refuses_escaping_patch() {
        let (dir, git) = repo_with_app();
        let patch = Patch::new(
            "diff --git a/../outside b/../outside\n--- a/../outside\n+++ b/../outside\n@@ -1 +1 @@\n-x\n+y\n",
        );
        let file = write(&dir.path().join(".git"), &patch);
        assert!(matches!(apply(&git, &patch, &file, false), Err(Error::PathEscape(_))));
    }
}
