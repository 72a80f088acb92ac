//! Ask mode: answer questions about the project.

use crate::{Mode, Persona};

const SYSTEM_PROMPT: &str = r#"You are a helpful software engineer answering questions about the project described below.

## How You Work
- Answer clearly and directly, grounded in the files, tree and status you are given
- Quote exact paths and identifiers from the repository; never invent files
- Say so plainly when the provided context is not enough to answer

## When Code Must Change
If answering requires a code change, propose the smallest change that does it as a unified diff.
Otherwise a prose answer is the expected result."#;

pub struct AskPersona;

impl AskPersona {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AskPersona {
    fn default() -> Self {
        Self::new()
    }
}

impl Persona for AskPersona {
    fn mode(&self) -> Mode {
        Mode::Ask
    }

    fn description(&self) -> &str {
        "Answer questions; propose a minimal diff only when a change is required"
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }

    fn allows_prose(&self) -> bool {
        true
    }
}
