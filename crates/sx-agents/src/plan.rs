//! Architect-mode planning: one exchange that breaks a goal into milestones.
//!
//! The reply is read as loose markdown. Headings mentioning milestones or
//! acceptance criteria collect the list items under them; when the model
//! ignores the requested shape, the first list in the reply is used, and
//! failing that the goal itself becomes the only milestone.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use sx_core::{ChatClient, ChatOptions, Error};
use sx_tools::{Vcs, Workspace};

use crate::prompt::{PromptBuilder, PromptLimits};
use crate::Mode;

pub const DEFAULT_MAX_MILESTONES: usize = 8;
pub const DEFAULT_PLAN_PATH: &str = "docs/architecture.md";

const PLAN_REQUEST: &str = "Reply with a plan in markdown and no diff:\n\
- a `# ` title line\n\
- one short paragraph summarising the approach\n\
- a `## Milestones` section: at most 8 `- ` items, in order, each small enough for a single patch\n\
- an `## Acceptance Criteria` section: measurable `- ` items";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub title: String,
    pub summary: String,
    pub milestones: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

impl Plan {
    /// The plan when the model produced nothing usable.
    pub fn single(goal: &str) -> Self {
        let goal = goal.trim();
        Self {
            title: first_line(goal).to_string(),
            summary: goal.to_string(),
            milestones: vec![goal.to_string()],
            acceptance_criteria: Vec::new(),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!("# {}\n\n", self.title);
        if !self.summary.is_empty() {
            out.push_str(&self.summary);
            out.push_str("\n\n");
        }
        out.push_str("## Milestones\n");
        for milestone in &self.milestones {
            out.push_str(&format!("- {}\n", milestone));
        }
        if !self.acceptance_criteria.is_empty() {
            out.push_str("\n## Acceptance Criteria\n");
            for item in &self.acceptance_criteria {
                out.push_str(&format!("- {}\n", item));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Milestones,
    Acceptance,
    Other,
}

/// Parse an architect reply into a plan with at most `max_milestones` steps.
pub fn parse_plan(goal: &str, reply: &str, max_milestones: usize) -> Plan {
    let fallback = Plan::single(goal);
    let mut title = None;
    let mut summary: Vec<&str> = Vec::new();
    let mut summary_done = false;
    let mut milestones = Vec::new();
    let mut acceptance = Vec::new();
    let mut loose = Vec::new();
    let mut section = Section::Preamble;
    let mut in_fence = false;

    for raw in reply.lines() {
        let line = raw.trim();
        if line.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        if let Some(heading) = heading_text(line) {
            if title.is_none() && line.starts_with("# ") {
                title = Some(heading.to_string());
                continue;
            }
            let lower = heading.to_lowercase();
            section = if lower.contains("milestone") {
                Section::Milestones
            } else if lower.contains("acceptance") {
                Section::Acceptance
            } else {
                Section::Other
            };
            summary_done |= !summary.is_empty();
            continue;
        }

        if let Some(item) = list_item(line) {
            summary_done |= !summary.is_empty();
            match section {
                Section::Milestones => milestones.push(item),
                Section::Acceptance => acceptance.push(item),
                Section::Preamble | Section::Other => loose.push(item),
            }
            continue;
        }

        if line.is_empty() {
            summary_done |= !summary.is_empty();
        } else if section == Section::Preamble && !summary_done {
            summary.push(line);
        }
    }

    if milestones.is_empty() {
        milestones = loose;
    }
    if milestones.is_empty() {
        debug!("No milestones in plan reply, using the goal");
        milestones = fallback.milestones.clone();
    }
    milestones.truncate(max_milestones.max(1));

    Plan {
        title: title.unwrap_or(fallback.title),
        summary: if summary.is_empty() {
            fallback.summary
        } else {
            summary.join(" ")
        },
        milestones,
        acceptance_criteria: acceptance,
    }
}

/// `# Title`, `**Title**` or `**Title:**`, `Title:` alone on a line.
fn heading_text(line: &str) -> Option<&str> {
    if line.starts_with('#') {
        let text = line.trim_start_matches('#').trim();
        return (!text.is_empty()).then_some(text);
    }
    if line.len() > 4 && line.starts_with("**") && line.ends_with("**") {
        return Some(line.trim_matches('*').trim_end_matches(':').trim());
    }
    if line.ends_with(':') && line.len() <= 40 && list_item(line).is_none() {
        return Some(line.trim_end_matches(':').trim());
    }
    None
}

/// Text of a `-`, `*`, `+` or `1.` / `1)` list item, without bold markers.
fn list_item(line: &str) -> Option<String> {
    let rest = ["- ", "* ", "+ "]
        .iter()
        .find_map(|marker| line.strip_prefix(marker))
        .or_else(|| {
            let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                return None;
            }
            line[digits..]
                .strip_prefix(". ")
                .or_else(|| line[digits..].strip_prefix(") "))
        })?;
    let text = rest.trim().replace("**", "");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

/// Write `plan` under the workspace root. `relative` must stay inside it.
pub fn write_plan(workspace: &Workspace, plan: &Plan, relative: &Path) -> Result<PathBuf, Error> {
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        return Err(Error::path_escape(relative));
    }
    let path = workspace.root().join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, plan.to_markdown())?;
    info!(path = %path.display(), milestones = plan.milestones.len(), "Wrote plan");
    Ok(path)
}

pub struct Planner<'a> {
    client: &'a ChatClient,
    workspace: &'a Workspace,
    vcs: &'a dyn Vcs,
    limits: PromptLimits,
    chat: ChatOptions,
    max_milestones: usize,
}

impl<'a> Planner<'a> {
    pub fn new(client: &'a ChatClient, workspace: &'a Workspace, vcs: &'a dyn Vcs) -> Self {
        Self {
            client,
            workspace,
            vcs,
            limits: PromptLimits::default(),
            chat: ChatOptions::default(),
            max_milestones: DEFAULT_MAX_MILESTONES,
        }
    }

    pub fn with_limits(mut self, limits: PromptLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_chat(mut self, chat: ChatOptions) -> Self {
        self.chat = chat;
        self
    }

    pub fn with_max_milestones(mut self, max_milestones: usize) -> Self {
        self.max_milestones = max_milestones;
        self
    }

    pub fn plan(&self, goal: &str) -> Result<Plan, Error> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(Error::invalid_request("goal must not be empty"));
        }
        let prompt = PromptBuilder::new(self.workspace, self.vcs)
            .with_limits(self.limits)
            .build(Mode::Architect, goal, Some(PLAN_REQUEST), None)?;

        info!(goal = %first_line(goal), "Requesting plan");
        let reply = self
            .client
            .complete_with(&prompt.system, &prompt.user, &self.chat)?;
        if let Err(e) = self.workspace.remember(&reply) {
            warn!(error = %e, "Failed to store memory notes");
        }

        let plan = parse_plan(goal, &reply, self.max_milestones);
        self.workspace.append_history(
            "plan",
            serde_json::json!({ "goal": goal, "plan": &plan, "reply": &reply }),
        );
        self.workspace
            .append_journal(&format!("plan: {}", first_line(goal)), &plan.to_markdown())?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sx_core::testing::MockProvider;
    use sx_tools::DEFAULT_META_DIR;

    const REPLY: &str = "# Login form\n\nAdd a session-backed login page.\nKeeps the existing router.\n\n## Milestones\n1. Add the `User` model\n2. **Login** route and template\n- Tests for bad passwords\n\n## Risks\n- Session fixation\n\n## Acceptance Criteria\n- `pytest` passes\n- Wrong password shows an error\n\nDecision: use server-side sessions\nSummary: login planned in three steps";

    #[test]
    fn test_parse_structured_reply() {
        let plan = parse_plan("add login", REPLY, DEFAULT_MAX_MILESTONES);
        assert_eq!(plan.title, "Login form");
        assert_eq!(plan.summary, "Add a session-backed login page. Keeps the existing router.");
        assert_eq!(
            plan.milestones,
            vec!["Add the `User` model", "Login route and template", "Tests for bad passwords"]
        );
        assert_eq!(plan.acceptance_criteria.len(), 2);
        assert!(!plan.milestones.iter().any(|m| m.contains("fixation")));
    }

    #[test]
    fn test_loose_list_and_bold_headings() {
        let reply = "**Plan:**\n1. Parse the config\n2. Validate ports\n\n**Risks**\n- none";
        let plan = parse_plan("harden config", reply, DEFAULT_MAX_MILESTONES);
        assert_eq!(plan.title, "harden config");
        assert_eq!(plan.milestones, vec!["Parse the config", "Validate ports", "none"]);

        let reply = "Milestones:\n- one\n- two\n```diff\n- not an item\n```";
        let plan = parse_plan("g", reply, DEFAULT_MAX_MILESTONES);
        assert_eq!(plan.milestones, vec!["one", "two"]);
    }

    #[test]
    fn test_unstructured_reply_falls_back_to_goal() {
        let plan = parse_plan("fix the build\nit fails on CI", "Sure, I can help.", 8);
        assert_eq!(plan.title, "fix the build");
        assert_eq!(plan.milestones, vec!["fix the build\nit fails on CI"]);
    }

    #[test]
    fn test_milestones_are_capped() {
        let reply: String = (1..=12).map(|i| format!("- step {}\n", i)).collect();
        assert_eq!(parse_plan("g", &reply, 8).milestones.len(), 8);
        assert_eq!(parse_plan("g", &reply, 0).milestones.len(), 1);
    }

    #[test]
    fn test_markdown_lists_milestones_and_criteria() {
        let plan = parse_plan("add login", REPLY, DEFAULT_MAX_MILESTONES);
        let md = plan.to_markdown();
        assert!(md.starts_with("# Login form\n\n"));
        assert!(md.contains("## Milestones\n- Add the `User` model\n"));
        assert!(md.contains("## Acceptance Criteria\n- `pytest` passes\n"));
        assert!(!Plan::single("g").to_markdown().contains("Acceptance"));
    }

    #[test]
    fn test_planner_asks_architect_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), DEFAULT_META_DIR).unwrap();
        let git = ws.git();
        git.ensure_git().unwrap();
        let provider = MockProvider::always(REPLY);
        let captured = provider.captured();
        let client = ChatClient::new(Box::new(provider));

        let plan = Planner::new(&client, &ws, &git).plan("add login").unwrap();
        assert_eq!(plan.milestones.len(), 3);
        {
            let requests = captured.lock().unwrap();
            assert!(requests[0].messages[0]
                .content
                .starts_with(Mode::Architect.persona().system_prompt()));
            assert!(requests[0].messages[1].content.contains("## Milestones"));
        }
        assert!(ws.memory().contains("Decision: use server-side sessions"));

        let path = write_plan(&ws, &plan, Path::new(DEFAULT_PLAN_PATH)).unwrap();
        assert_eq!(path, dir.path().join("docs/architecture.md"));
        assert!(std::fs::read_to_string(path).unwrap().contains("- Tests for bad passwords"));
        assert!(matches!(
            write_plan(&ws, &plan, Path::new("../outside.md")),
            Err(Error::PathEscape(_))
        ));
    }
}
