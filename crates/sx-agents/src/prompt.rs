//! Builds the system and user messages for one exchange.
//!
//! The user message is a plain-text bundle of delimited sections so the model
//! sees the goal, the repository shape and any feedback in a stable order.

use std::fmt::Write;

use tracing::debug;

use sx_core::Error;
use sx_tools::mentions::expand_mentions;
use sx_tools::process::tail;
use sx_tools::{Vcs, Workspace, DEFAULT_MAX_FILE_BYTES};

use crate::Mode;

pub const DEFAULT_MAX_TREE_ENTRIES: usize = 500;
pub const DEFAULT_FEEDBACK_CHARS: usize = 3000;
pub const DEFAULT_MEMORY_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub max_tree_entries: usize,
    pub feedback_chars: usize,
    pub memory_chars: usize,
    pub max_file_bytes: u64,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            max_tree_entries: DEFAULT_MAX_TREE_ENTRIES,
            feedback_chars: DEFAULT_FEEDBACK_CHARS,
            memory_chars: DEFAULT_MEMORY_CHARS,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPrompt {
    pub system: String,
    pub user: String,
}

pub struct PromptBuilder<'a> {
    workspace: &'a Workspace,
    vcs: &'a dyn Vcs,
    limits: PromptLimits,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(workspace: &'a Workspace, vcs: &'a dyn Vcs) -> Self {
        Self {
            workspace,
            vcs,
            limits: PromptLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: PromptLimits) -> Self {
        self.limits = limits;
        self
    }

    /// `request` is the chat turn (or other extra context); `feedback` is the
    /// previous iteration's apply diagnostics or test output.
    pub fn build(
        &self,
        mode: Mode,
        goal: &str,
        request: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<BuiltPrompt, Error> {
        let system = mode.persona().full_system_prompt();

        let mut user = String::new();
        section(&mut user, "GOAL", goal.trim());
        section(&mut user, "MODE", mode.name());
        section(&mut user, "FILE TREE", &self.tree());
        section(&mut user, "GIT STATUS", &self.status());

        let memory = self.workspace.memory();
        if !memory.trim().is_empty() {
            section(&mut user, "MEMORY", tail(memory.trim(), self.limits.memory_chars).as_str());
        }

        let mut mention_text = goal.to_string();
        if let Some(request) = request {
            mention_text.push('\n');
            mention_text.push_str(request);
        }
        let files: Vec<String> =
            expand_mentions(self.workspace.root(), &mention_text, self.limits.max_file_bytes)
                .iter()
                .map(|m| m.to_string())
                .collect();
        if !files.is_empty() {
            section(&mut user, "REFERENCED FILES", &files.join("\n\n"));
        }

        if let Some(request) = request.map(str::trim).filter(|r| !r.is_empty()) {
            section(&mut user, "REQUEST", request);
        }

        if let Some(feedback) = feedback.map(str::trim).filter(|f| !f.is_empty()) {
            section(
                &mut user,
                "FEEDBACK FROM PREVIOUS ITERATION",
                &tail(feedback, self.limits.feedback_chars),
            );
        }

        debug!(mode = %mode, system_len = system.len(), user_len = user.len(), "Built prompt");
        Ok(BuiltPrompt { system, user })
    }

    fn tree(&self) -> String {
        let listing = self.workspace.file_listing(self.limits.max_tree_entries);
        if listing.files.is_empty() {
            return "(empty)".to_string();
        }
        let mut out = listing.files.join("\n");
        if listing.truncated() {
            let _ = write!(out, "\n... {} more not shown", listing.total - listing.files.len());
        }
        out
    }

    fn status(&self) -> String {
        match self.vcs.status() {
            Ok(entries) if entries.is_empty() => "(clean)".to_string(),
            Ok(entries) => entries
                .iter()
                .map(|e| format!("{} {}", e.code, e.path))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("(unavailable: {})", e),
        }
    }
}

fn section(out: &mut String, title: &str, body: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    let _ = writeln!(out, "=== {} ===", title);
    out.push_str(body);
    out.push('\n');
}
