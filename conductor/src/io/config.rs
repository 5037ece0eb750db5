//! Project configuration stored under `.conductor/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;
use crate::core::branch_name::DEFAULT_BRANCH_TEMPLATE;

/// Conductor configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that
/// work for a fresh repository with a `main` branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Branch task work is ultimately merged into.
    pub main_branch: String,

    /// Integration branch for finished tasks. Empty disables the review flow.
    pub review_branch: String,

    /// minijinja template for task branch names (`id`, `slug`, `title`).
    pub branch_template: String,

    /// Model round-trips per task before the loop stops.
    pub max_iterations: u32,

    /// Wall-clock limit for one `run_command` tool call.
    pub command_timeout_secs: u64,

    /// Truncate tool command stdout/stderr beyond this many bytes.
    pub command_output_limit_bytes: usize,

    pub provider: ProviderConfig,
}

/// Which execution provider backs the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Local CLI: request JSON on stdin, streamed reply on stdout.
    Command {
        command: Vec<String>,
        #[serde(default = "default_provider_timeout")]
        timeout_secs: u64,
    },
    /// OpenAI-compatible chat-completions endpoint.
    Http {
        base_url: String,
        model: String,
        /// Environment variable holding the bearer token.
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
        #[serde(default = "default_provider_timeout")]
        timeout_secs: u64,
    },
}

fn default_provider_timeout() -> u64 {
    10 * 60
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Command {
            command: vec!["conductor-agent".to_string()],
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            main_branch: "main".to_string(),
            review_branch: "review".to_string(),
            branch_template: DEFAULT_BRANCH_TEMPLATE.to_string(),
            max_iterations: 5,
            command_timeout_secs: 5 * 60,
            command_output_limit_bytes: 100_000,
            provider: ProviderConfig::default(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.main_branch.trim().is_empty() {
            return Err(anyhow!("main_branch must not be empty"));
        }
        if self.review_branch.trim() == self.main_branch.trim() {
            return Err(anyhow!("review_branch must differ from main_branch"));
        }
        if self.branch_template.trim().is_empty() {
            return Err(anyhow!("branch_template must not be empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.command_output_limit_bytes == 0 {
            return Err(anyhow!("command_output_limit_bytes must be > 0"));
        }
        match &self.provider {
            ProviderConfig::Command {
                command,
                timeout_secs,
            } => {
                if command.is_empty() || command[0].trim().is_empty() {
                    return Err(anyhow!("provider.command must be a non-empty array"));
                }
                if *timeout_secs == 0 {
                    return Err(anyhow!("provider.timeout_secs must be > 0"));
                }
            }
            ProviderConfig::Http {
                base_url,
                model,
                timeout_secs,
                ..
            } => {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    return Err(anyhow!("provider.base_url must be an http(s) URL"));
                }
                if model.trim().is_empty() {
                    return Err(anyhow!("provider.model must not be empty"));
                }
                if *timeout_secs == 0 {
                    return Err(anyhow!("provider.timeout_secs must be > 0"));
                }
            }
        }
        Ok(())
    }

    /// The review branch, if the review flow is enabled.
    pub fn review_branch(&self) -> Option<&str> {
        let name = self.review_branch.trim();
        (!name.is_empty()).then_some(name)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConductorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ConductorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = ConductorConfig {
            provider: ProviderConfig::Http {
                base_url: "https://api.example.test/v1".to_string(),
                model: "m".to_string(),
                api_key_env: "KEY".to_string(),
                timeout_secs: 30,
            },
            ..ConductorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "main_branch = \"trunk\"\n[provider]\nkind = \"command\"\ncommand = [\"agent\", \"--json\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.main_branch, "trunk");
        assert_eq!(cfg.max_iterations, 5);
        assert_eq!(
            cfg.provider,
            ProviderConfig::Command {
                command: vec!["agent".to_string(), "--json".to_string()],
                timeout_secs: 600,
            }
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let cfg = ConductorConfig {
            max_iterations: 0,
            ..ConductorConfig::default()
        };
        assert!(cfg.validate().is_err());

        let same = ConductorConfig {
            review_branch: "main".to_string(),
            ..ConductorConfig::default()
        };
        assert!(same.validate().is_err());

        let no_review = ConductorConfig {
            review_branch: String::new(),
            ..ConductorConfig::default()
        };
        no_review.validate().expect("review flow is optional");
        assert_eq!(no_review.review_branch(), None);
    }
}
