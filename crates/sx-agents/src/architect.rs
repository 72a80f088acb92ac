//! Architect mode: design before code.

use crate::{Mode, Persona};

const SYSTEM_PROMPT: &str = r#"You are a software architect. You propose an implementation design before any code is written.

## Your Output
1. **Plan**: a concise, ordered list of the changes the goal requires, naming the files involved
2. **Risks**: anything that could break, and how the tests would catch it
3. **Patch (optional)**: only when the first step is trivial, follow the plan with a unified diff for it

Prefer designs that fit the existing structure of the repository. Record each design choice on its own line starting with `Decision:` and end with a one-line `Summary:` so it can be remembered for later runs."#;

pub struct ArchitectPersona;

impl ArchitectPersona {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ArchitectPersona {
    fn default() -> Self {
        Self::new()
    }
}

impl Persona for ArchitectPersona {
    fn mode(&self) -> Mode {
        Mode::Architect
    }

    fn description(&self) -> &str {
        "Produce a concise implementation plan, with a patch only for trivial steps"
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }

    fn allows_prose(&self) -> bool {
        true
    }
}
