//! The plan, patch, test, commit loop for one goal.
//!
//! Each iteration asks the model for a patch, applies it, runs the tests and
//! commits on success. Rejections and test failures become feedback for the
//! next iteration. Only a failed model call or a patch that reaches outside
//! the repository ends a run with an error.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use sx_core::{ChatClient, ChatOptions, Error, PushFailureKind};
use sx_tools::{
    apply_in_workspace, extract, ApplyOutcome, Attempt, CommitOutcome, Extraction, Strategy,
    TestOutcome, TestRunner, Vcs, Workspace,
};

use crate::prompt::{PromptBuilder, PromptLimits};
use crate::Mode;

pub const DEFAULT_MAX_ITERS: usize = 3;
pub const DEFAULT_STAGNATION_LIMIT: usize = 2;
pub const DEFAULT_COMMIT_PREFIX: &str = "swarmx";
pub const DEFAULT_BRANCH_PREFIX: &str = "swarm/";
pub const DEFAULT_REMOTE: &str = "origin";

const MAX_SLUG_LEN: usize = 48;
/// Characters of the raw reply kept in the journal.
const JOURNAL_REPLY_CHARS: usize = 1500;

/// Which branch the run works on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BranchPolicy {
    /// Stay on whatever is checked out.
    #[default]
    Current,
    Named(String),
    /// Derive a branch name from the goal.
    FromGoal,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub mode: Mode,
    pub max_iters: usize,
    /// Consecutive replies without a patch that end the run; 0 disables.
    pub stagnation_limit: usize,
    pub commit: bool,
    pub push: bool,
    pub remote: String,
    pub branch: BranchPolicy,
    pub branch_prefix: String,
    pub commit_prefix: String,
    /// Check that the first patch applies, then stop without touching anything.
    pub dry_run: bool,
    pub limits: PromptLimits,
    pub chat: ChatOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Code,
            max_iters: DEFAULT_MAX_ITERS,
            stagnation_limit: DEFAULT_STAGNATION_LIMIT,
            commit: true,
            push: false,
            remote: DEFAULT_REMOTE.to_string(),
            branch: BranchPolicy::Current,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            commit_prefix: DEFAULT_COMMIT_PREFIX.to_string(),
            dry_run: false,
            limits: PromptLimits::default(),
            chat: ChatOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Planning,
    Patching,
    Testing,
    Committing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// An applied patch passed the tests, or there were none to run.
    Converged,
    /// A prose reply in a mode that allows one.
    Answered,
    /// Too many consecutive replies without a patch.
    Stagnated,
    /// Ran out of iterations.
    Exhausted,
    /// The first applicable patch was checked and nothing was changed.
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyKind {
    Patch,
    NoOp,
    Prose,
    Unparseable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyRecord {
    pub applied: bool,
    pub check_only: bool,
    pub strategy: Option<Strategy>,
    pub reason: Option<String>,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitRecord {
    Committed { sha: String, message: String },
    NothingToCommit,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushRecord {
    pub remote: String,
    pub branch: Option<String>,
    pub ok: bool,
    pub failure: Option<PushFailureKind>,
    pub message: Option<String>,
}

/// Everything that happened in one iteration; one line of `history.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub mode: Mode,
    pub goal: String,
    pub phase: Phase,
    pub system_prompt: String,
    pub user_prompt: String,
    pub response: String,
    pub reply: ReplyKind,
    pub patch: Option<String>,
    pub apply: Option<ApplyRecord>,
    pub test: Option<TestOutcome>,
    pub commit: Option<CommitRecord>,
    pub push: Option<PushRecord>,
    pub timestamp: String,
}

impl IterationRecord {
    fn new(iteration: usize, mode: Mode, goal: &str) -> Self {
        Self {
            iteration,
            mode,
            goal: goal.to_string(),
            phase: Phase::Init,
            system_prompt: String::new(),
            user_prompt: String::new(),
            response: String::new(),
            reply: ReplyKind::NoOp,
            patch: None,
            apply: None,
            test: None,
            commit: None,
            push: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn rejected(&self) -> bool {
        self.apply.as_ref().is_some_and(|a| !a.applied)
    }

    /// What went wrong in this iteration, if anything did.
    pub fn failure(&self) -> Option<Error> {
        if let ReplyKind::Unparseable { reason } = &self.reply {
            return Some(Error::unparseable(reason.as_str()));
        }
        if let Some(apply) = self.apply.as_ref().filter(|a| !a.applied) {
            return Some(Error::patch_rejected(
                apply.reason.as_deref().unwrap_or("no strategy applied the patch"),
            ));
        }
        match &self.test {
            Some(TestOutcome::Failed { command, exit_code: Some(code), .. }) => {
                Some(Error::test_failed(format!("{} exited with {}", command, code)))
            }
            Some(TestOutcome::Failed { command, .. }) => {
                Some(Error::test_failed(format!("{} was killed", command)))
            }
            Some(TestOutcome::TimedOut { command, .. }) => {
                Some(Error::test_failed(format!("{} timed out", command)))
            }
            _ => None,
        }
    }

    fn summary(&self) -> String {
        let mut lines = vec![format!("Phase reached: {:?}", self.phase)];
        match &self.reply {
            ReplyKind::NoOp => lines.push("Reply: NOOP".into()),
            ReplyKind::Prose => lines.push("Reply: prose answer".into()),
            ReplyKind::Patch | ReplyKind::Unparseable { .. } => {}
        }
        if let Some(strategy) = self.apply.as_ref().and_then(|a| a.strategy) {
            lines.push(format!("Applied with {}", strategy));
        }
        if let Some(test) = &self.test {
            lines.push(format!("Tests: {}", test));
        }
        if let Some(failure) = self.failure() {
            lines.push(failure.to_string());
        }
        match &self.commit {
            Some(CommitRecord::Committed { sha, .. }) => lines.push(format!("Committed {}", sha)),
            Some(CommitRecord::NothingToCommit) => lines.push("Nothing to commit".into()),
            Some(CommitRecord::Failed { error }) => lines.push(format!("Commit failed: {}", error)),
            None => {}
        }
        if let Some(push) = &self.push {
            match (&push.failure, &push.message) {
                (None, _) => lines.push(format!("Pushed to {}", push.remote)),
                (Some(kind), message) => lines.push(format!(
                    "Push failed ({}): {}",
                    kind,
                    message.as_deref().unwrap_or("")
                )),
            }
        }
        lines.push(String::new());
        lines.push("```".into());
        lines.push(truncate(&self.response, JOURNAL_REPLY_CHARS));
        lines.push("```".into());
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub goal: String,
    pub mode: Mode,
    pub branch: Option<String>,
    pub termination: Termination,
    pub iterations: Vec<IterationRecord>,
}

impl RunReport {
    pub fn commits(&self) -> Vec<&str> {
        self.iterations
            .iter()
            .filter_map(|r| match &r.commit {
                Some(CommitRecord::Committed { sha, .. }) => Some(sha.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.iterations.last()
    }

    /// Reply text of the final iteration, for prose answers.
    pub fn answer(&self) -> Option<&str> {
        self.last().map(|r| r.response.as_str())
    }

    /// The last iteration's failure when the run did not succeed.
    pub fn failure(&self) -> Option<Error> {
        match self.termination {
            Termination::Converged | Termination::Answered | Termination::DryRun => None,
            Termination::Stagnated | Termination::Exhausted => {
                self.iterations.iter().rev().find_map(IterationRecord::failure)
            }
        }
    }

    /// The most recent failing test run, if any iteration had one.
    pub fn last_failed_test(&self) -> Option<&TestOutcome> {
        self.iterations
            .iter()
            .rev()
            .filter_map(|r| r.test.as_ref())
            .find(|t| t.is_failure())
    }

    pub fn succeeded(&self) -> bool {
        matches!(
            self.termination,
            Termination::Converged | Termination::Answered | Termination::DryRun
        )
    }

    pub fn push_failed(&self) -> bool {
        self.iterations
            .iter()
            .any(|r| r.push.as_ref().is_some_and(|p| !p.ok))
    }

    /// 1 when the budget ran out with a rejected patch in the last iteration.
    pub fn exit_code(&self) -> i32 {
        let rejected_last = self.last().is_some_and(IterationRecord::rejected);
        if self.termination == Termination::Exhausted && rejected_last {
            1
        } else {
            0
        }
    }
}

/// Branch name derived from a goal: lowercase, runs of other characters
/// collapsed to one hyphen, capped, prefixed.
pub fn slugify_branch(prefix: &str, goal: &str) -> String {
    let mut slug = String::new();
    for c in goal.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("task");
    }
    format!("{}{}", prefix, slug)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_chars).collect();
        format!("{}\n[... truncated]", kept)
    }
}

fn rejection_feedback(reason: &str, attempts: &[Attempt]) -> String {
    let mut out = String::from("The previous patch did not apply. Diagnostics per strategy:\n");
    for attempt in attempts.iter().filter(|a| !a.skipped) {
        out.push_str(&format!("--- {} ---\n{}\n", attempt.strategy, attempt.detail.trim()));
    }
    out.push_str(&format!(
        "Summary: {}\nRegenerate the diff against the current file contents.",
        reason
    ));
    out
}

pub struct Controller<'a> {
    client: &'a ChatClient,
    workspace: &'a Workspace,
    vcs: &'a dyn Vcs,
    tests: &'a dyn TestRunner,
    config: ControllerConfig,
}

impl<'a> Controller<'a> {
    pub fn new(
        client: &'a ChatClient,
        workspace: &'a Workspace,
        vcs: &'a dyn Vcs,
        tests: &'a dyn TestRunner,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            workspace,
            vcs,
            tests,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn run(&self, goal: &str) -> Result<RunReport, Error> {
        self.run_with_feedback(goal, None)
    }

    /// Like [`Controller::run`], with `feedback` already in the first prompt.
    /// Used to hand a failing test log straight to a debug run.
    pub fn run_with_feedback(
        &self,
        goal: &str,
        feedback: Option<String>,
    ) -> Result<RunReport, Error> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(Error::invalid_request("goal must not be empty"));
        }
        let mode = self.config.mode;
        info!(mode = %mode, max_iters = self.config.max_iters, dry_run = self.config.dry_run, "Starting run");

        let branch = self.init(goal)?;
        self.workspace.append_journal(
            &format!("run ({}): {}", mode, goal),
            &format!(
                "Branch: {}\nMax iterations: {}\nCommit: {}\nPush: {}\nDry run: {}",
                branch.as_deref().unwrap_or("(detached)"),
                self.config.max_iters,
                self.config.commit,
                self.config.push,
                self.config.dry_run
            ),
        )?;
        self.workspace.append_history(
            "run_started",
            serde_json::json!({ "goal": goal, "mode": mode, "branch": branch }),
        );

        let builder = PromptBuilder::new(self.workspace, self.vcs).with_limits(self.config.limits);
        let mut iterations: Vec<IterationRecord> = Vec::new();
        let mut feedback = feedback.filter(|f| !f.trim().is_empty());
        let mut idle = 0usize;
        let mut termination = Termination::Exhausted;

        for iteration in 1..=self.config.max_iters {
            let mut record = IterationRecord::new(iteration, mode, goal);
            let step = self.iterate(&builder, &mut record, feedback.as_deref());
            self.log_iteration(&record);

            let step = match step {
                Ok(step) => step,
                Err(e) => {
                    error!(iteration, error = %e, "Run aborted");
                    self.workspace.append_history(
                        "run_aborted",
                        serde_json::json!({ "iteration": iteration, "error": e.to_string() }),
                    );
                    let _ = self
                        .workspace
                        .append_journal(&format!("aborted at iteration {}", iteration), &e.to_string());
                    return Err(e);
                }
            };
            iterations.push(record);

            match step {
                Step::Done(t) => {
                    termination = t;
                    break;
                }
                Step::Idle(next) => {
                    idle += 1;
                    // A bare NOOP keeps the last test or apply output in the prompt.
                    if let Some(next) = next {
                        feedback = Some(next);
                    }
                    if self.config.stagnation_limit > 0 && idle >= self.config.stagnation_limit {
                        info!(iteration, idle, "No patch in consecutive replies, stopping");
                        termination = Termination::Stagnated;
                        break;
                    }
                }
                Step::Retry(next) => {
                    idle = 0;
                    feedback = Some(next);
                }
            }
        }

        let report = RunReport {
            goal: goal.to_string(),
            mode,
            branch,
            termination,
            iterations,
        };
        info!(termination = ?report.termination, iterations = report.iterations.len(), commits = report.commits().len(), "Run finished");
        self.workspace.append_history(
            "run_finished",
            serde_json::json!({
                "termination": report.termination,
                "iterations": report.iterations.len(),
                "commits": report.commits(),
            }),
        );
        self.workspace.append_journal(
            "run finished",
            &format!(
                "Termination: {:?}\nIterations: {}\nCommits: {}",
                report.termination,
                report.iterations.len(),
                report.commits().len()
            ),
        )?;
        Ok(report)
    }

    /// Ensure a repository and the requested branch. Returns the branch in use.
    fn init(&self, goal: &str) -> Result<Option<String>, Error> {
        if self.vcs.ensure_git()? {
            info!(root = %self.workspace.root().display(), "Initialized new repository");
        }
        self.vcs.exclude(self.workspace.meta_name())?;

        let wanted = match &self.config.branch {
            BranchPolicy::Current => None,
            BranchPolicy::Named(name) => Some(name.clone()),
            BranchPolicy::FromGoal => Some(slugify_branch(&self.config.branch_prefix, goal)),
        };
        if let Some(name) = wanted {
            if self.config.dry_run {
                info!(branch = %name, "Dry run, not switching branch");
            } else {
                let switch = self.vcs.create_or_switch_branch(&name)?;
                debug!(branch = %name, switch = ?switch, "Branch ready");
            }
        }
        self.vcs.current_branch()
    }

    fn iterate(
        &self,
        builder: &PromptBuilder<'_>,
        record: &mut IterationRecord,
        feedback: Option<&str>,
    ) -> Result<Step, Error> {
        let mode = self.config.mode;
        let iteration = record.iteration;

        record.phase = Phase::Planning;
        let prompt = builder.build(mode, &record.goal, None, feedback)?;
        record.system_prompt = prompt.system;
        record.user_prompt = prompt.user;

        info!(iteration, mode = %mode, "Requesting patch");
        let response =
            self.client
                .complete_with(&record.system_prompt, &record.user_prompt, &self.config.chat)?;
        record.response = response;
        match self.workspace.remember(&record.response) {
            Ok(n) if n > 0 => debug!(notes = n, "Stored memory notes"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to store memory notes"),
        }

        record.phase = Phase::Patching;
        let patch = match extract(&record.response) {
            Extraction::Patch(patch) => patch,
            Extraction::NoOp => {
                info!(iteration, "Model reported no change needed");
                record.reply = ReplyKind::NoOp;
                return Ok(Step::Idle(None));
            }
            Extraction::Unparseable(_) if mode.allows_prose() => {
                record.reply = ReplyKind::Prose;
                return Ok(Step::Done(Termination::Answered));
            }
            Extraction::Unparseable(reason) => {
                warn!(iteration, reason = %reason, "Reply had no usable patch");
                let next = format!(
                    "Your previous reply could not be used ({}). Reply with a single ```diff block or exactly NOOP.",
                    reason
                );
                record.reply = ReplyKind::Unparseable { reason };
                return Ok(Step::Idle(Some(next)));
            }
        };
        record.reply = ReplyKind::Patch;
        record.patch = Some(patch.text().to_string());

        let label = format!("iter-{}", iteration);
        let check_only = self.config.dry_run;
        let outcome = apply_in_workspace(self.workspace, self.vcs, &patch, &label, check_only)?;
        match outcome {
            ApplyOutcome::Rejected { reason, attempts } => {
                record.phase = Phase::Failed;
                let next = rejection_feedback(&reason, &attempts);
                record.apply = Some(ApplyRecord {
                    applied: false,
                    check_only,
                    strategy: None,
                    reason: Some(reason),
                    attempts,
                });
                return Ok(Step::Retry(next));
            }
            ApplyOutcome::Applied { strategy, attempts } => {
                record.apply = Some(ApplyRecord {
                    applied: true,
                    check_only,
                    strategy: Some(strategy),
                    reason: None,
                    attempts,
                });
            }
        }
        if check_only {
            info!(iteration, "Dry run: patch applies cleanly, stopping");
            return Ok(Step::Done(Termination::DryRun));
        }

        record.phase = Phase::Testing;
        let test = self.tests.run(self.workspace.root());
        let failed = test.is_failure();
        let test_output = test.output().to_string();
        record.test = Some(test);
        if failed {
            record.phase = Phase::Failed;
            return Ok(Step::Retry(format!(
                "The patch applied but the tests failed. Test output:\n{}",
                test_output
            )));
        }

        if self.config.commit {
            record.phase = Phase::Committing;
            self.commit_and_push(record);
        }
        Ok(Step::Done(Termination::Converged))
    }

    /// Commit and push failures are recorded, never raised.
    fn commit_and_push(&self, record: &mut IterationRecord) {
        let first_line = record.goal.lines().next().unwrap_or("").trim();
        let message = format!(
            "{}: {} (iter {})",
            self.config.commit_prefix, first_line, record.iteration
        );
        let committed = match self.vcs.commit(&message) {
            Ok(CommitOutcome::Committed { sha }) => {
                record.commit = Some(CommitRecord::Committed { sha, message });
                true
            }
            Ok(CommitOutcome::NothingToCommit) => {
                record.commit = Some(CommitRecord::NothingToCommit);
                false
            }
            Err(e) => {
                warn!(error = %e, "Commit failed");
                record.commit = Some(CommitRecord::Failed { error: e.to_string() });
                false
            }
        };

        if !(committed && self.config.push) {
            return;
        }
        let remote = self.config.remote.clone();
        let branch = self.vcs.current_branch().ok().flatten();
        let result = match &branch {
            Some(b) => self.vcs.push(&remote, b),
            None => Err(Error::push_failed(
                PushFailureKind::Other,
                "HEAD is detached; nothing to push",
            )),
        };
        record.push = Some(match result {
            Ok(()) => PushRecord {
                remote,
                branch,
                ok: true,
                failure: None,
                message: None,
            },
            Err(e) => {
                warn!(error = %e, "Push failed; commit kept");
                let failure = match &e {
                    Error::PushFailed { kind, .. } => *kind,
                    _ => PushFailureKind::Other,
                };
                PushRecord {
                    remote,
                    branch,
                    ok: false,
                    failure: Some(failure),
                    message: Some(e.to_string()),
                }
            }
        });
    }

    fn log_iteration(&self, record: &IterationRecord) {
        self.workspace.append_history("iteration", record);
        if let Err(e) = self.workspace.append_journal(
            &format!("iteration {} ({})", record.iteration, record.mode),
            &record.summary(),
        ) {
            warn!(error = %e, "Failed to write journal");
        }
    }
}

enum Step {
    Done(Termination),
    /// No patch in the reply.
    Idle(Option<String>),
    /// Patch rejected or tests failed; feed this back.
    Retry(String),
}
