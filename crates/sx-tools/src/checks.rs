//! Running the target project's tests after a patch lands.

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::process::{self, tail};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Output kept from a test run.
const OUTPUT_TAIL_CHARS: usize = 4000;

/// `sh` exit status for a command it could not find.
const COMMAND_NOT_FOUND: i32 = 127;

/// npm's placeholder test script, which always fails.
const NPM_PLACEHOLDER: &str = "no test specified";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed { command: String, output: String },
    Failed {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },
    TimedOut { command: String, output: String },
    /// No runnable test command; not treated as failure.
    NoSignal { reason: String },
}

impl TestOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TestOutcome::Failed { .. } | TestOutcome::TimedOut { .. })
    }

    pub fn output(&self) -> &str {
        match self {
            TestOutcome::Passed { output, .. }
            | TestOutcome::Failed { output, .. }
            | TestOutcome::TimedOut { output, .. } => output,
            TestOutcome::NoSignal { reason } => reason,
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Passed { command, .. } => write!(f, "passed ({})", command),
            TestOutcome::Failed { command, exit_code, .. } => match exit_code {
                Some(code) => write!(f, "failed with exit {} ({})", code, command),
                None => write!(f, "failed ({})", command),
            },
            TestOutcome::TimedOut { command, .. } => write!(f, "timed out ({})", command),
            TestOutcome::NoSignal { reason } => write!(f, "no signal: {}", reason),
        }
    }
}

pub trait TestRunner: Send + Sync {
    fn run(&self, root: &Path) -> TestOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TestCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// A user-supplied command line, run through `sh -c`.
    pub fn shell(line: &str) -> Self {
        Self::new("sh", &["-c", line])
    }

    fn to_command(&self, root: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(root);
        cmd
    }
}

impl fmt::Display for TestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.program == "sh" && self.args.len() == 2 && self.args[0] == "-c" {
            return f.write_str(&self.args[1]);
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Pick a test command from the files present at `root`.
pub fn detect_test_command(root: &Path) -> Option<TestCommand> {
    let has = |name: &str| root.join(name).exists();

    if has("artisan") {
        return Some(TestCommand::new("php", &["artisan", "test", "--no-interaction"]));
    }
    if has("composer.json") && has("vendor/bin/phpunit") {
        return Some(TestCommand::new("vendor/bin/phpunit", &[]));
    }
    if has("package.json") && npm_has_test_script(&root.join("package.json")) {
        return Some(TestCommand::new("npm", &["test", "--silent"]));
    }
    if has("pubspec.yaml") {
        return Some(TestCommand::new("flutter", &["test"]));
    }
    if has("Cargo.toml") {
        return Some(TestCommand::new("cargo", &["test", "--quiet"]));
    }
    if has("pytest.ini") || has("conftest.py") || pyproject_mentions_pytest(root) {
        return Some(TestCommand::new("python3", &["-m", "pytest", "-q"]));
    }
    None
}

fn npm_has_test_script(package_json: &Path) -> bool {
    std::fs::read_to_string(package_json)
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| v["scripts"]["test"].as_str().map(str::to_string))
        .map(|script| !script.contains(NPM_PLACEHOLDER))
        .unwrap_or(false)
}

fn pyproject_mentions_pytest(root: &Path) -> bool {
    std::fs::read_to_string(root.join("pyproject.toml"))
        .map(|s| s.contains("pytest"))
        .unwrap_or(false)
}

/// Runs a configured or detected command with a deadline.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: Option<TestCommand>,
    timeout: Duration,
}

impl Default for CommandTestRunner {
    fn default() -> Self {
        Self {
            command: None,
            timeout: DEFAULT_TEST_TIMEOUT,
        }
    }
}

impl CommandTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this command line instead of detecting one.
    pub fn with_command(mut self, line: Option<&str>) -> Self {
        self.command = line
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(TestCommand::shell);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl TestRunner for CommandTestRunner {
    fn run(&self, root: &Path) -> TestOutcome {
        let Some(command) = self.command.clone().or_else(|| detect_test_command(root)) else {
            return TestOutcome::NoSignal {
                reason: "no test command configured or detected".into(),
            };
        };
        let shown = command.to_string();
        info!(command = %shown, "Running tests");

        let output = match process::run_with_timeout(&mut command.to_command(root), self.timeout) {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return TestOutcome::NoSignal {
                    reason: format!("'{}' is not installed", command.program),
                };
            }
            Err(e) => {
                return TestOutcome::NoSignal {
                    reason: format!("could not start '{}': {}", shown, e),
                };
            }
        };
        let text = tail(&output.combined(), OUTPUT_TAIL_CHARS);
        debug!(exit_code = ?output.exit_code, timed_out = output.timed_out, "Tests finished");

        if output.timed_out {
            TestOutcome::TimedOut {
                command: shown,
                output: text,
            }
        } else if output.success() {
            TestOutcome::Passed {
                command: shown,
                output: text,
            }
        } else if output.exit_code == Some(COMMAND_NOT_FOUND) {
            TestOutcome::NoSignal {
                reason: format!("'{}' not found: {}", shown, text),
            }
        } else {
            TestOutcome::Failed {
                command: shown,
                exit_code: output.exit_code,
                output: text,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_test_command(dir.path()), None);
        let outcome = CommandTestRunner::new().run(dir.path());
        assert!(matches!(outcome, TestOutcome::NoSignal { .. }));
        assert!(!outcome.is_failure());
    }

    #[test]
    fn test_detect_by_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        assert_eq!(detect_test_command(dir.path()).unwrap().to_string(), "cargo test --quiet");

        std::fs::write(dir.path().join("artisan"), "").unwrap();
        assert_eq!(
            detect_test_command(dir.path()).unwrap().to_string(),
            "php artisan test --no-interaction"
        );
    }

    #[test]
    fn test_npm_placeholder_script_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"test":"echo \"Error: no test specified\" && exit 1"}}"#,
        )
        .unwrap();
        assert_eq!(detect_test_command(dir.path()), None);

        std::fs::write(dir.path().join("package.json"), r#"{"scripts":{"test":"jest"}}"#).unwrap();
        assert_eq!(detect_test_command(dir.path()).unwrap().to_string(), "npm test --silent");
    }

    #[test]
    fn test_configured_command_pass_and_fail() {
        let dir = tempfile::tempdir().unwrap();
        let pass = CommandTestRunner::new().with_command(Some("echo ok")).run(dir.path());
        assert!(matches!(&pass, TestOutcome::Passed { output, .. } if output == "ok"));
        assert!(matches!(&pass, TestOutcome::Passed { command, .. } if command == "echo ok"));
        assert_eq!(pass.to_string(), "passed (echo ok)");

        let fail = CommandTestRunner::new()
            .with_command(Some("echo broken >&2; exit 2"))
            .run(dir.path());
        assert!(fail.is_failure());
        assert!(matches!(&fail, TestOutcome::Failed { exit_code: Some(2), output, .. } if output.contains("broken")));
    }

    #[test]
    fn test_missing_program_is_no_signal() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = CommandTestRunner::new()
            .with_command(Some("definitely-not-a-real-test-binary-xyz"))
            .run(dir.path());
        assert!(matches!(outcome, TestOutcome::NoSignal { .. }));
    }

    #[test]
    fn test_timeout_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = CommandTestRunner::new()
            .with_command(Some("sleep 30"))
            .with_timeout(Duration::from_secs(1))
            .run(dir.path());
        assert!(matches!(outcome, TestOutcome::TimedOut { .. }));
        assert!(outcome.is_failure());
    }
}
