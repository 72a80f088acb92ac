use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;

const CONFIG_TEMPLATE: &str = r#"# swarmx configuration
#
# Every key can also be set from the environment:
#   SWARMX_ORCHESTRATOR__MAX_ITERS=5, SWARMX_PROVIDER__BASE_URL=...
# and the usual OPENAI_BASE_URL / OPENAI_API_KEY / OPENAI_MODEL and
# OPENROUTER_BASE / OPENROUTER_API_KEY variables are honoured.

# ── Primary model endpoint ───────────────────────────────────────
# Any OpenAI-compatible server (llama.cpp, vLLM, LiteLLM, ...).

[provider]
base_url = "http://127.0.0.1:8080/v1"
model = "qwen2.5-coder-7b-instruct-q4_k_m"
# api_key = "sk-..."              # or set OPENAI_API_KEY
timeout_secs = 120

# ── Fallback ─────────────────────────────────────────────────────
# Tried once when the primary fails. Disabled until an API key is set.

[fallback]
base_url = "https://openrouter.ai/api/v1"
# api_key = "sk-or-..."           # or set OPENROUTER_API_KEY
# model = "qwen/qwen-2.5-coder-32b-instruct"

# ── Iteration loop ───────────────────────────────────────────────

[orchestrator]
max_iters = 3
stagnation_limit = 2              # replies without a patch before stopping, 0 = never
temperature = 0.2
max_tokens = 2048
commit_prefix = "swarmx"
branch_prefix = "swarm/"
remote = "origin"
# test_command = "make test"      # default: detected from project files
test_timeout_secs = 600
meta_dir = ".sanaa"
# projects_dir = "~/projects"     # where `swarmx repo` clones to
plan_path = "docs/architecture.md" # written by `swarmx plan` and `swarmx run`
max_milestones = 8
debug_attempts = 3                # debug iterations after a milestone's tests fail, 0 = none

# ── Prompt sizes ─────────────────────────────────────────────────

[prompt]
max_tree_entries = 500
feedback_chars = 3000
memory_chars = 2000
max_file_bytes = 400000
"#;

pub fn run(target: Option<&Path>) -> Result<()> {
    let config_path = match target {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    install(&config_path, confirm_overwrite)?;
    Ok(())
}

fn confirm_overwrite(path: &Path) -> Result<bool> {
    println!("Existing config file found:");
    println!("  {}", path.display());
    print!("\nOverwrite? (Existing file will be backed up) [y/N] ");

    // Flush stdout so the prompt appears before reading
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Write the template to `config_path`. Returns false when the user declined.
fn install(config_path: &Path, confirm: impl FnOnce(&Path) -> Result<bool>) -> Result<bool> {
    if let Some(config_dir) = config_path.parent() {
        std::fs::create_dir_all(config_dir).with_context(|| {
            format!("Failed to create config directory: {}", config_dir.display())
        })?;
    }

    if config_path.exists() {
        if !confirm(config_path)? {
            println!("Setup cancelled.");
            return Ok(false);
        }
        backup_file(config_path)?;
    }

    std::fs::write(config_path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created {}", config_path.display());

    println!("\nNext steps:");
    println!("  1. Point provider.base_url at your model server");
    println!("  2. Clone a project:   swarmx repo https://github.com/you/app.git");
    println!("  3. Run a goal:        swarmx run --goal \"fix the failing test\" --project ~/projects/app");

    Ok(true)
}

/// Back up a file to <name>.bak, appending a timestamp if .bak already exists.
fn backup_file(path: &Path) -> Result<PathBuf> {
    let mut backup = path.with_extension("toml.bak");

    if backup.exists() {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let name = format!("toml.bak.{}", timestamp);
        backup = path.with_extension(name);
    }

    std::fs::rename(path, &backup)
        .with_context(|| format!("Failed to back up {} to {}", path.display(), backup.display()))?;
    println!("  Backed up to {}", backup.display());

    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_loads_as_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarmx").join("config.toml");
        assert!(install(&path, |_| Ok(true)).unwrap());

        let config = Config::load(Some(&path)).unwrap();
        let defaults = Config::default();
        assert_eq!(config.provider.base_url, defaults.provider.base_url);
        assert_eq!(config.provider.model, defaults.provider.model);
        assert_eq!(config.orchestrator.max_iters, defaults.orchestrator.max_iters);
        assert_eq!(config.orchestrator.meta_dir, defaults.orchestrator.meta_dir);
        assert_eq!(config.prompt.max_file_bytes, defaults.prompt.max_file_bytes);
        assert_eq!(config.orchestrator.plan_path, defaults.orchestrator.plan_path);
        assert_eq!(config.orchestrator.debug_attempts, defaults.orchestrator.debug_attempts);
    }

    #[test]
    fn test_existing_file_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[provider]\nmodel = \"mine\"\n").unwrap();

        assert!(install(&path, |_| Ok(true)).unwrap());
        let backup = dir.path().join("config.toml.bak");
        assert!(std::fs::read_to_string(backup).unwrap().contains("mine"));
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("# swarmx configuration"));
    }

    #[test]
    fn test_declined_overwrite_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "keep").unwrap();

        assert!(!install(&path, |_| Ok(false)).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep");
    }
}
