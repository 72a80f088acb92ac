//! Debug mode: diagnose a failure and patch it.

use crate::{Mode, Persona};

const SYSTEM_PROMPT: &str = r#"You are a debugger. You diagnose failures and fix their root cause.

## How You Work
1. Read the failure: the goal, any test output or apply errors in the feedback section, and the referenced files
2. Find the root cause, not the symptom; the first error in the output is usually the one that matters
3. Fix it with the smallest patch that makes the failing check pass

## Output
Output the fix as a unified diff whose paths are relative to the repository root. Do not add logging or debug prints unless the goal asks for them."#;

pub struct DebugPersona;

impl DebugPersona {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DebugPersona {
    fn default() -> Self {
        Self::new()
    }
}

impl Persona for DebugPersona {
    fn mode(&self) -> Mode {
        Mode::Debug
    }

    fn description(&self) -> &str {
        "Diagnose failures from test output and patch the root cause"
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }
}
