use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sx_agents::controller::{
    DEFAULT_BRANCH_PREFIX, DEFAULT_COMMIT_PREFIX, DEFAULT_MAX_ITERS, DEFAULT_REMOTE,
    DEFAULT_STAGNATION_LIMIT,
};
use sx_agents::pipeline::DEFAULT_DEBUG_ATTEMPTS;
use sx_agents::plan::{DEFAULT_MAX_MILESTONES, DEFAULT_PLAN_PATH};
use sx_agents::prompt::{DEFAULT_FEEDBACK_CHARS, DEFAULT_MAX_TREE_ENTRIES, DEFAULT_MEMORY_CHARS};
use sx_agents::PromptLimits;
use sx_core::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use sx_tools::{DEFAULT_MAX_FILE_BYTES, DEFAULT_META_DIR};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/v1";
const DEFAULT_MODEL: &str = "qwen2.5-coder-7b-instruct-q4_k_m";
const DEFAULT_FALLBACK_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TEST_TIMEOUT_SECS: u64 = 600;

/// Prefix for environment overrides, e.g. `SWARMX_ORCHESTRATOR__MAX_ITERS=5`.
pub const ENV_PREFIX: &str = "SWARMX_";

/// Conventional variables mapped onto config keys.
const WELL_KNOWN_ENV: &[(&str, &str)] = &[
    ("OPENAI_BASE_URL", "provider.base_url"),
    ("OPENAI_API_KEY", "provider.api_key"),
    ("OPENAI_MODEL", "provider.model"),
    ("OPENROUTER_BASE", "fallback.base_url"),
    ("OPENROUTER_API_KEY", "fallback.api_key"),
    ("OPENROUTER_MODEL", "fallback.model"),
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub fallback: FallbackConfig,
    pub orchestrator: OrchestratorConfig,
    pub prompt: PromptConfig,
}

/// The primary OpenAI-compatible endpoint (llama.cpp, LiteLLM, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: Some(DEFAULT_MODEL.to_string()),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Tried once when the primary fails. Only used when an API key is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FALLBACK_URL.to_string(),
            api_key: None,
            model: None,
        }
    }
}

impl FallbackConfig {
    pub fn enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_iters: usize,
    /// Consecutive replies without a patch before giving up; 0 disables.
    pub stagnation_limit: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub commit_prefix: String,
    pub branch_prefix: String,
    pub remote: String,
    /// Overrides test command detection (run through `sh -c`).
    pub test_command: Option<String>,
    pub test_timeout_secs: u64,
    pub meta_dir: String,
    /// Where `repo` clones to when no project path is given (supports ~ and $VAR).
    pub projects_dir: Option<String>,
    /// Debug iterations after a milestone's tests fail; 0 disables.
    pub debug_attempts: usize,
    pub max_milestones: usize,
    /// Where `plan` and `run` write the plan, relative to the project.
    pub plan_path: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iters: DEFAULT_MAX_ITERS,
            stagnation_limit: DEFAULT_STAGNATION_LIMIT,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            commit_prefix: DEFAULT_COMMIT_PREFIX.to_string(),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            remote: DEFAULT_REMOTE.to_string(),
            test_command: None,
            test_timeout_secs: DEFAULT_TEST_TIMEOUT_SECS,
            meta_dir: DEFAULT_META_DIR.to_string(),
            projects_dir: None,
            debug_attempts: DEFAULT_DEBUG_ATTEMPTS,
            max_milestones: DEFAULT_MAX_MILESTONES,
            plan_path: DEFAULT_PLAN_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub max_tree_entries: usize,
    pub feedback_chars: usize,
    pub memory_chars: usize,
    pub max_file_bytes: u64,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_tree_entries: DEFAULT_MAX_TREE_ENTRIES,
            feedback_chars: DEFAULT_FEEDBACK_CHARS,
            memory_chars: DEFAULT_MEMORY_CHARS,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl PromptConfig {
    pub fn limits(&self) -> PromptLimits {
        PromptLimits {
            max_tree_entries: self.max_tree_entries,
            feedback_chars: self.feedback_chars,
            memory_chars: self.memory_chars,
            max_file_bytes: self.max_file_bytes,
        }
    }
}

/// Expand environment variables in a path string
/// Supports: $VAR, ${VAR}, ~
pub fn expand_path(path: &str) -> PathBuf {
    let mut result = path.to_string();

    // Expand ~ at the start
    if result.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            result = format!("{}{}", home.display(), &result[1..]);
        }
    } else if result == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    // Expand $VAR and ${VAR}
    let re = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("env var pattern is valid");
    let expanded = re.replace_all(&result, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    });

    PathBuf::from(expanded.to_string())
}

impl Config {
    /// Defaults, then the TOML file, then `SWARMX_*`, then the well-known variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path {
            Some(path) => figment = figment.merge(Toml::file(path)),
            None => {
                if let Ok(default_path) = Self::config_path() {
                    figment = figment.merge(Toml::file(default_path));
                }
            }
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Env::raw().filter_map(|key| {
                WELL_KNOWN_ENV
                    .iter()
                    .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                    .map(|(_, target)| (*target).into())
            }))
    }

    /// Load configuration. A missing file is fine; an explicitly named one must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            anyhow::ensure!(path.is_file(), "Config file not found: {}", path.display());
        }
        let config: Config = Self::figment(path)
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.orchestrator.max_iters > 0,
            "orchestrator.max_iters must be at least 1"
        );
        let meta = Path::new(&self.orchestrator.meta_dir);
        anyhow::ensure!(
            meta.components().count() == 1
                && matches!(meta.components().next(), Some(std::path::Component::Normal(_))),
            "orchestrator.meta_dir must be a single directory name, got '{}'",
            self.orchestrator.meta_dir
        );
        let plan = Path::new(&self.orchestrator.plan_path);
        anyhow::ensure!(
            plan.components().count() > 0
                && plan
                    .components()
                    .all(|c| matches!(c, std::path::Component::Normal(_))),
            "orchestrator.plan_path must be a relative path inside the project, got '{}'",
            self.orchestrator.plan_path
        );
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("swarmx"))
    }

    /// Directory `repo` clones into by default.
    pub fn projects_dir(&self) -> PathBuf {
        self.orchestrator
            .projects_dir
            .as_deref()
            .map(expand_path)
            .or_else(|| dirs::home_dir().map(|h| h.join("projects")))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Copy with API keys replaced, for display.
    pub fn masked(&self) -> Config {
        let mut copy = self.clone();
        copy.provider.api_key = copy.provider.api_key.as_deref().map(mask_secret);
        copy.fallback.api_key = copy.fallback.api_key.as_deref().map(mask_secret);
        copy
    }
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        "****".to_string()
    } else {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{}", tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.provider.base_url, "http://127.0.0.1:8080/v1");
        assert_eq!(config.provider.model.as_deref(), Some(DEFAULT_MODEL));
        assert_eq!(config.orchestrator.max_iters, 3);
        assert_eq!(config.orchestrator.stagnation_limit, 2);
        assert_eq!(config.orchestrator.meta_dir, ".sanaa");
        assert_eq!(config.prompt.max_tree_entries, 500);
        assert_eq!(config.prompt.feedback_chars, 3000);
        assert_eq!(config.orchestrator.debug_attempts, 3);
        assert_eq!(config.orchestrator.max_milestones, 8);
        assert_eq!(config.orchestrator.plan_path, "docs/architecture.md");
        assert!(!config.fallback.enabled());
        config.validate().unwrap();
    }

    #[test]
    fn test_file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                    [provider]
                    base_url = "http://gpu-box:8000/v1"
                    model = "from-file"

                    [orchestrator]
                    max_iters = 7
                    test_command = "make check"
                "#,
            )?;
            jail.set_env("SWARMX_ORCHESTRATOR__MAX_ITERS", "9");
            jail.set_env("OPENAI_MODEL", "from-env");
            jail.set_env("OPENROUTER_API_KEY", "sk-or-123456789");

            let config: Config = Config::figment(Some(Path::new("config.toml"))).extract()?;
            assert_eq!(config.provider.base_url, "http://gpu-box:8000/v1");
            assert_eq!(config.provider.model.as_deref(), Some("from-env"));
            assert_eq!(config.orchestrator.max_iters, 9);
            assert_eq!(config.orchestrator.test_command.as_deref(), Some("make check"));
            assert!(config.fallback.enabled());
            assert_eq!(config.fallback.base_url, DEFAULT_FALLBACK_URL);
            // Untouched sections keep their defaults.
            assert_eq!(config.prompt.max_tree_entries, 500);
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(Config::load(Some(Path::new("/definitely/not/here.toml"))).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.orchestrator.meta_dir = "../outside".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.orchestrator.max_iters = 0;
        assert!(config.validate().is_err());

        for bad in ["/etc/plan.md", "../plan.md", "docs/../../plan.md", ""] {
            let mut config = Config::default();
            config.orchestrator.plan_path = bad.to_string();
            assert!(config.validate().is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_masked_hides_keys() {
        let mut config = Config::default();
        config.provider.api_key = Some("sk-abcdefghijklmnop".to_string());
        config.fallback.api_key = Some("short".to_string());
        let masked = config.masked();
        assert_eq!(masked.provider.api_key.as_deref(), Some("****mnop"));
        assert_eq!(masked.fallback.api_key.as_deref(), Some("****"));
    }

    #[test]
    fn test_expand_path() {
        Jail::expect_with(|jail| {
            jail.set_env("SWARMX_TEST_DIR", "/srv/projects");
            assert_eq!(expand_path("$SWARMX_TEST_DIR/app"), PathBuf::from("/srv/projects/app"));
            assert_eq!(expand_path("${SWARMX_TEST_DIR}/x"), PathBuf::from("/srv/projects/x"));
            assert_eq!(expand_path("$NOT_SET_ANYWHERE_XYZ/y"), PathBuf::from("$NOT_SET_ANYWHERE_XYZ/y"));
            Ok(())
        });
    }
}
