//! sx-tools: repository-side tooling for swarmx
//!
//! - Workspace: file listing, journal, history, patch archive, memory
//! - Git: branch, status, stage, commit, push, apply
//! - Patch: extract diffs from replies and apply them with fallbacks
//! - Checks: detect and run the project's tests
//! - Mentions: inline `@path` references

pub mod checks;
pub mod git;
pub mod mentions;
pub mod patch;
pub mod process;
pub mod workspace;

pub use checks::{detect_test_command, CommandTestRunner, TestCommand, TestOutcome, TestRunner};
pub use git::{BranchSwitch, CommitOutcome, GitApply, GitCli, StatusEntry, Vcs};
pub use mentions::{expand_mentions, parse_mentions, Mention, MentionContent, DEFAULT_MAX_FILE_BYTES};
pub use patch::{apply, apply_in_workspace, extract, ApplyOutcome, Attempt, Extraction, Patch, Strategy, NOOP_SENTINEL};
pub use process::ProcessOutput;
pub use workspace::{memory_notes, FileListing, MetaPaths, Workspace, DEFAULT_META_DIR};
