//! Output contract appended to every persona's system prompt.
//!
//! The contract is what the patch extractor relies on, so every mode gets it;
//! sections vary with what the mode is allowed to return.

use sx_tools::NOOP_SENTINEL;

/// Context for generating the guard clause.
pub struct GuardContext {
    /// Whether a prose-only reply is an acceptable answer.
    pub allows_prose: bool,
}

pub fn generate_guard(ctx: &GuardContext) -> String {
    let mut sections = Vec::new();

    sections.push(
        "## Output Contract\n\
         You operate on a git repository. Your reply is parsed by a program, not read by a person first.\n\
         - Only edit files that exist under the project root, unless the goal asks for a new file\n\
         - Never reference paths outside the project root or absolute paths\n\
         - Put all changes in a single fenced ```diff block containing a unified diff in `git diff` format\n\
         - Each file section must start with a `diff --git a/<path> b/<path>` header"
            .to_string(),
    );

    sections.push(format!(
        "### No Change Needed\n\
         If the goal is already met and no change is needed, reply with exactly `{}` and nothing else.",
        NOOP_SENTINEL
    ));

    if ctx.allows_prose {
        sections.push(
            "### Answers Without Changes\n\
             A plain prose answer is acceptable when the request is a question or a plan. \
             Include a ```diff block only when you are proposing a concrete change."
                .to_string(),
        );
    } else {
        sections.push(
            "### Changes Are Expected\n\
             A reply with neither a ```diff block nor the no-change marker is treated as a failed attempt."
                .to_string(),
        );
    }

    sections.join("\n\n")
}
