//! Goal-level runs built from the controller: plan into milestones, run each
//! one, and hand failing tests to a bounded debug run.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use sx_core::{ChatClient, Error};
use sx_tools::{TestOutcome, TestRunner, Vcs, Workspace};

use crate::controller::{slugify_branch, BranchPolicy, Controller, ControllerConfig, RunReport};
use crate::plan::{write_plan, Plan, Planner, DEFAULT_MAX_MILESTONES, DEFAULT_PLAN_PATH};
use crate::Mode;

pub const DEFAULT_DEBUG_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Settings for each milestone run. The mode is used for implementation.
    pub controller: ControllerConfig,
    /// Iterations of the debug run after a milestone's tests fail; 0 disables.
    pub debug_attempts: usize,
    pub max_milestones: usize,
    /// Relative to the workspace root.
    pub plan_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            debug_attempts: DEFAULT_DEBUG_ATTEMPTS,
            max_milestones: DEFAULT_MAX_MILESTONES,
            plan_path: PathBuf::from(DEFAULT_PLAN_PATH),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MilestoneReport {
    pub index: usize,
    pub milestone: String,
    pub implement: RunReport,
    pub debug: Option<RunReport>,
}

impl MilestoneReport {
    /// The run that decided the milestone: the debug run when there was one.
    pub fn outcome(&self) -> &RunReport {
        self.debug.as_ref().unwrap_or(&self.implement)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome().succeeded()
    }

    pub fn failure(&self) -> Option<Error> {
        self.outcome().failure()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub goal: String,
    pub plan: Plan,
    pub plan_path: Option<PathBuf>,
    pub milestones: Vec<MilestoneReport>,
}

impl PipelineReport {
    pub fn failed(&self) -> Vec<&MilestoneReport> {
        self.milestones.iter().filter(|m| !m.succeeded()).collect()
    }

    pub fn commits(&self) -> Vec<&str> {
        self.milestones
            .iter()
            .flat_map(|m| {
                let mut commits = m.implement.commits();
                if let Some(debug) = &m.debug {
                    commits.extend(debug.commits());
                }
                commits
            })
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        self.milestones
            .iter()
            .map(|m| m.outcome().exit_code())
            .max()
            .unwrap_or(0)
    }
}

/// What `debug_once` found and did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DebugOnce {
    /// Tests pass already, or there is nothing to run.
    NothingToFix { tests: TestOutcome },
    Attempted { tests: TestOutcome, report: RunReport },
}

fn failing_tests_feedback(test: &TestOutcome) -> String {
    format!("The tests fail: {}. Test output:\n{}", test, test.output())
}

/// The goal text for one milestone. The milestone comes first so it names
/// the commit.
fn milestone_goal(goal: &str, milestone: &str, index: usize, total: usize) -> String {
    format!(
        "{}\n\nMilestone {} of {} towards: {}",
        milestone.trim(),
        index,
        total,
        goal.trim()
    )
}

pub struct Pipeline<'a> {
    client: &'a ChatClient,
    workspace: &'a Workspace,
    vcs: &'a dyn Vcs,
    tests: &'a dyn TestRunner,
    config: PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        client: &'a ChatClient,
        workspace: &'a Workspace,
        vcs: &'a dyn Vcs,
        tests: &'a dyn TestRunner,
        config: PipelineConfig,
    ) -> Self {
        Self {
            client,
            workspace,
            vcs,
            tests,
            config,
        }
    }

    pub fn planner(&self) -> Planner<'a> {
        Planner::new(self.client, self.workspace, self.vcs)
            .with_limits(self.config.controller.limits)
            .with_chat(self.config.controller.chat.clone())
            .with_max_milestones(self.config.max_milestones)
    }

    /// Plan, write the plan file, then run each milestone in turn. A milestone
    /// that does not converge is logged and the next one still runs; a dry run
    /// stops after the first milestone and writes nothing.
    pub fn run(&self, goal: &str) -> Result<PipelineReport, Error> {
        let goal = goal.trim();
        let plan = self.planner().plan(goal)?;
        let dry_run = self.config.controller.dry_run;
        let plan_path = if dry_run {
            None
        } else {
            Some(write_plan(self.workspace, &plan, &self.config.plan_path)?)
        };
        info!(title = %plan.title, milestones = plan.milestones.len(), "Plan ready");

        // One branch for the whole goal, not one per milestone.
        let mut base = self.config.controller.clone();
        if base.branch == BranchPolicy::FromGoal {
            base.branch = BranchPolicy::Named(slugify_branch(&base.branch_prefix, goal));
        }

        let total = plan.milestones.len();
        let mut milestones = Vec::with_capacity(total);
        for (i, milestone) in plan.milestones.iter().enumerate() {
            let index = i + 1;
            let task = milestone_goal(goal, milestone, index, total);
            info!(index, total, milestone = %milestone, "Starting milestone");

            let implement = Controller::new(self.client, self.workspace, self.vcs, self.tests, base.clone())
                .run(&task)?;
            let debug = match implement.last_failed_test() {
                Some(test)
                    if !implement.succeeded() && !dry_run && self.config.debug_attempts > 0 =>
                {
                    warn!(index, "Tests failing, starting debug run");
                    let config = ControllerConfig {
                        mode: Mode::Debug,
                        max_iters: self.config.debug_attempts,
                        branch: BranchPolicy::Current,
                        ..base.clone()
                    };
                    let feedback = failing_tests_feedback(test);
                    Some(
                        Controller::new(self.client, self.workspace, self.vcs, self.tests, config)
                            .run_with_feedback(&task, Some(feedback))?,
                    )
                }
                _ => None,
            };

            let report = MilestoneReport {
                index,
                milestone: milestone.clone(),
                implement,
                debug,
            };
            if let Some(failure) = report.failure() {
                warn!(index, milestone = %milestone, error = %failure, "Milestone did not converge");
                self.workspace.append_history(
                    "milestone_failed",
                    serde_json::json!({ "index": index, "milestone": milestone, "error": failure.to_string() }),
                );
                self.workspace.append_journal(
                    &format!("milestone {} of {} failed", index, total),
                    &format!("{}\n\n{}", milestone, failure),
                )?;
            }
            milestones.push(report);
            if dry_run {
                break;
            }
        }

        Ok(PipelineReport {
            goal: goal.to_string(),
            plan,
            plan_path,
            milestones,
        })
    }

    /// Run the tests once; if they fail, give the output to a single
    /// debug-mode iteration.
    pub fn debug_once(&self) -> Result<DebugOnce, Error> {
        let tests = self.tests.run(self.workspace.root());
        if !tests.is_failure() {
            info!(result = %tests, "Nothing to debug");
            return Ok(DebugOnce::NothingToFix { tests });
        }
        let goal = match &tests {
            TestOutcome::Failed { command, .. } | TestOutcome::TimedOut { command, .. } => {
                format!("Make `{}` pass", command)
            }
            _ => "Make the tests pass".to_string(),
        };
        let config = ControllerConfig {
            mode: Mode::Debug,
            max_iters: 1,
            ..self.config.controller.clone()
        };
        let report = Controller::new(self.client, self.workspace, self.vcs, self.tests, config)
            .run_with_feedback(&goal, Some(failing_tests_feedback(&tests)))?;
        Ok(DebugOnce::Attempted { tests, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use sx_core::testing::MockProvider;
    use sx_tools::{GitCli, DEFAULT_META_DIR};

    use crate::controller::Termination;

    /// Replays outcomes in order, then reports no signal.
    struct ScriptedTests(Mutex<Vec<TestOutcome>>);

    impl ScriptedTests {
        fn new(outcomes: Vec<TestOutcome>) -> Self {
            Self(Mutex::new(outcomes))
        }
    }

    impl TestRunner for ScriptedTests {
        fn run(&self, _root: &std::path::Path) -> TestOutcome {
            let mut outcomes = self.0.lock().unwrap();
            if outcomes.is_empty() {
                TestOutcome::NoSignal {
                    reason: "none".into(),
                }
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn failed(output: &str) -> TestOutcome {
        TestOutcome::Failed {
            command: "pytest".into(),
            exit_code: Some(1),
            output: output.into(),
        }
    }

    const PLAN_REPLY: &str = "# Greeting\n\nTwo small steps.\n\n## Milestones\n- Change the greeting\n- Add a farewell\n";

    fn patch(from: &str, to: &str) -> String {
        format!(
            "```diff\ndiff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-print(\"{}\")\n+print(\"{}\")\n```",
            from, to
        )
    }

    fn repo() -> (tempfile::TempDir, Workspace, GitCli) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), DEFAULT_META_DIR).unwrap();
        let git = ws.git();
        git.ensure_git().unwrap();
        git.exclude(DEFAULT_META_DIR).unwrap();
        std::fs::write(dir.path().join("app.py"), "print(\"old\")\n").unwrap();
        git.stage_all().unwrap();
        git.commit("initial").unwrap();
        (dir, ws, git)
    }

    #[test]
    fn test_milestone_goal_leads_with_milestone() {
        let goal = milestone_goal("ship login", " Add model ", 1, 3);
        assert!(goal.starts_with("Add model\n"));
        assert!(goal.ends_with("Milestone 1 of 3 towards: ship login"));
    }

    #[test]
    fn test_plan_then_one_run_per_milestone() {
        let (dir, ws, git) = repo();
        let provider = MockProvider::new();
        provider.queue_response(PLAN_REPLY);
        provider.queue_response(&patch("old", "hello"));
        provider.queue_response(&patch("hello", "bye"));
        let client = ChatClient::new(Box::new(provider));
        let tests = ScriptedTests::new(vec![]);
        let config = PipelineConfig {
            controller: ControllerConfig {
                branch: BranchPolicy::FromGoal,
                ..ControllerConfig::default()
            },
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(&client, &ws, &git, &tests, config);

        let report = pipeline.run("greet then part").unwrap();
        assert_eq!(report.plan.milestones.len(), 2);
        assert_eq!(report.milestones.len(), 2);
        assert!(report.failed().is_empty());
        assert_eq!(report.commits().len(), 2);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print(\"bye\")\n"
        );
        let plan_file = std::fs::read_to_string(dir.path().join(DEFAULT_PLAN_PATH)).unwrap();
        assert!(plan_file.contains("- Add a farewell"));
        assert_eq!(git.current_branch().unwrap().as_deref(), Some("swarm/greet-then-part"));
        // Milestone commits are named after the milestone.
        assert!(report.milestones[0].implement.iterations[0]
            .commit
            .as_ref()
            .is_some_and(|c| matches!(c, crate::CommitRecord::Committed { message, .. } if message.contains("Change the greeting"))));
    }

    #[test]
    fn test_failing_milestone_gets_debug_run_with_test_output() {
        let (_dir, ws, git) = repo();
        let provider = MockProvider::new();
        provider.queue_response("# One step\n\n## Milestones\n- Change the greeting\n");
        provider.queue_response(&patch("old", "hello"));
        provider.queue_response(&patch("hello", "fixed"));
        let captured = provider.captured();
        let client = ChatClient::new(Box::new(provider));
        let tests = ScriptedTests::new(vec![failed("NameError: greet")]);
        let config = PipelineConfig {
            controller: ControllerConfig {
                max_iters: 1,
                ..ControllerConfig::default()
            },
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(&client, &ws, &git, &tests, config);

        let report = pipeline.run("greet").unwrap();
        let milestone = &report.milestones[0];
        assert_eq!(milestone.implement.termination, Termination::Exhausted);
        let debug = milestone.debug.as_ref().unwrap();
        assert_eq!(debug.mode, Mode::Debug);
        assert_eq!(debug.termination, Termination::Converged);
        assert!(milestone.succeeded());

        let requests = captured.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].messages[0]
            .content
            .starts_with(Mode::Debug.persona().system_prompt()));
        assert!(requests[2].messages[1].content.contains("NameError: greet"));
    }

    #[test]
    fn test_unconverged_milestone_is_logged_and_next_runs() {
        let (_dir, ws, git) = repo();
        let provider = MockProvider::new();
        provider.queue_response(PLAN_REPLY);
        provider.queue_response("I am not sure what to change.");
        provider.queue_response("Still unsure.");
        provider.queue_response(&patch("old", "bye"));
        let client = ChatClient::new(Box::new(provider));
        let tests = ScriptedTests::new(vec![]);
        let pipeline = Pipeline::new(&client, &ws, &git, &tests, PipelineConfig::default());

        let report = pipeline.run("greet then part").unwrap();
        assert_eq!(report.milestones.len(), 2);
        assert!(report.milestones[0].debug.is_none());
        assert!(matches!(report.milestones[0].failure(), Some(Error::Unparseable(_))));
        assert!(report.milestones[1].succeeded());
        assert_eq!(report.failed().len(), 1);

        let journal = std::fs::read_to_string(&ws.meta().journal).unwrap();
        assert!(journal.contains("milestone 1 of 2 failed"));
        let history = std::fs::read_to_string(&ws.meta().history).unwrap();
        assert!(history.contains("milestone_failed"));
    }

    #[test]
    fn test_dry_run_plans_without_writing() {
        let (dir, ws, git) = repo();
        let provider = MockProvider::new();
        provider.queue_response(PLAN_REPLY);
        provider.queue_response(&patch("old", "hello"));
        let client = ChatClient::new(Box::new(provider));
        let tests = ScriptedTests::new(vec![]);
        let config = PipelineConfig {
            controller: ControllerConfig {
                dry_run: true,
                ..ControllerConfig::default()
            },
            ..PipelineConfig::default()
        };
        let report = Pipeline::new(&client, &ws, &git, &tests, config)
            .run("greet then part")
            .unwrap();

        assert!(report.plan_path.is_none());
        assert_eq!(report.milestones.len(), 1);
        assert_eq!(report.milestones[0].implement.termination, Termination::DryRun);
        assert!(!dir.path().join(DEFAULT_PLAN_PATH).exists());
        assert_eq!(git.commit_count().unwrap(), 1);
    }

    #[test]
    fn test_debug_once_skips_passing_tests() {
        let (_dir, ws, git) = repo();
        let provider = MockProvider::new();
        let captured = provider.captured();
        let client = ChatClient::new(Box::new(provider));
        let tests = ScriptedTests::new(vec![TestOutcome::Passed {
            command: "pytest".into(),
            output: "1 passed".into(),
        }]);
        let outcome = Pipeline::new(&client, &ws, &git, &tests, PipelineConfig::default())
            .debug_once()
            .unwrap();
        assert!(matches!(outcome, DebugOnce::NothingToFix { .. }));
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn test_debug_once_feeds_failure_to_one_iteration() {
        let (dir, ws, git) = repo();
        let provider = MockProvider::always(&patch("old", "new"));
        let captured = provider.captured();
        let client = ChatClient::new(Box::new(provider));
        let tests = ScriptedTests::new(vec![failed("AssertionError: expected new")]);
        let outcome = Pipeline::new(&client, &ws, &git, &tests, PipelineConfig::default())
            .debug_once()
            .unwrap();

        let DebugOnce::Attempted { report, .. } = outcome else {
            panic!("expected a debug attempt");
        };
        assert_eq!(report.iterations.len(), 1);
        assert_eq!(report.mode, Mode::Debug);
        assert_eq!(report.goal, "Make `pytest` pass");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print(\"new\")\n"
        );
        let requests = captured.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].messages[1]
            .content
            .contains("AssertionError: expected new"));
    }
}
