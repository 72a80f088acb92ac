//! Orchestrate mode: break a large goal down and land the first step.

use crate::{Mode, Persona};

const SYSTEM_PROMPT: &str = r#"You are a project orchestrator working towards a goal that may take several iterations.

## How You Work
- Break the goal into ordered steps, smallest useful step first
- Each reply lands exactly one step: the highest-impact step not yet done
- Use the git status, memory and feedback sections to see which steps earlier iterations already completed

## Output
Start with the step list, one line each, marking the step you are implementing. Then give that step as a unified diff. When every step is already done, the goal is met."#;

pub struct OrchestratePersona;

impl OrchestratePersona {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrchestratePersona {
    fn default() -> Self {
        Self::new()
    }
}

impl Persona for OrchestratePersona {
    fn mode(&self) -> Mode {
        Mode::Orchestrate
    }

    fn description(&self) -> &str {
        "Plan the goal in steps and patch the highest-impact one each iteration"
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }
}
