//! Modes, prompt building and the iteration loop for swarmx.
//!
//! This crate provides:
//! - `Persona` trait and the fixed set of built-in modes
//! - `PromptBuilder` for assembling the two-message exchange from repository state
//! - `Controller` for the plan, patch, test, commit loop
//! - `Planner` and `Pipeline` for milestone runs and one-shot debugging

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use sx_core::Error;

mod architect;
mod ask;
mod code;
pub mod controller;
mod debug;
mod guard;
mod orchestrate;
pub mod pipeline;
pub mod plan;
pub mod prompt;

pub use architect::ArchitectPersona;
pub use ask::AskPersona;
pub use code::CodePersona;
pub use controller::{
    slugify_branch, BranchPolicy, CommitRecord, Controller, ControllerConfig, IterationRecord,
    Phase, PushRecord, RunReport, Termination,
};
pub use debug::DebugPersona;
pub use guard::{generate_guard, GuardContext};
pub use orchestrate::OrchestratePersona;
pub use pipeline::{DebugOnce, MilestoneReport, Pipeline, PipelineConfig, PipelineReport};
pub use plan::{parse_plan, write_plan, Plan, Planner};
pub use prompt::{BuiltPrompt, PromptBuilder, PromptLimits};

/// A named ruleset for talking to the model.
pub trait Persona: Send + Sync {
    fn mode(&self) -> Mode;

    /// One-line description for help output.
    fn description(&self) -> &str;

    /// Persona text, without the output contract.
    fn system_prompt(&self) -> &str;

    /// Whether a reply without a patch is a normal answer rather than a failed attempt.
    fn allows_prose(&self) -> bool {
        false
    }

    /// Persona text followed by the output contract.
    fn full_system_prompt(&self) -> String {
        format!(
            "{}\n\n{}",
            self.system_prompt(),
            generate_guard(&GuardContext {
                allows_prose: self.allows_prose(),
            })
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Ask,
    Architect,
    #[default]
    Code,
    Debug,
    Orchestrate,
}

impl Mode {
    pub fn all() -> [Mode; 5] {
        [
            Mode::Ask,
            Mode::Architect,
            Mode::Code,
            Mode::Debug,
            Mode::Orchestrate,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Ask => "ask",
            Mode::Architect => "architect",
            Mode::Code => "code",
            Mode::Debug => "debug",
            Mode::Orchestrate => "orchestrate",
        }
    }

    pub fn persona(&self) -> Box<dyn Persona> {
        match self {
            Mode::Ask => Box::new(AskPersona::new()),
            Mode::Architect => Box::new(ArchitectPersona::new()),
            Mode::Code => Box::new(CodePersona::new()),
            Mode::Debug => Box::new(DebugPersona::new()),
            Mode::Orchestrate => Box::new(OrchestratePersona::new()),
        }
    }

    /// Ask and architect replies may be prose; every other mode must patch.
    pub fn allows_prose(&self) -> bool {
        matches!(self, Mode::Ask | Mode::Architect)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Mode::all()
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| {
                Error::config(format!(
                    "unknown mode '{}' (expected one of: ask, architect, code, debug, orchestrate)",
                    s
                ))
            })
    }
}
