//! Orchestrator configuration (TOML).
//!
//! The file is intended to be edited by humans and must remain stable and
//! automatable. Missing fields default to sensible values; a missing file
//! yields the full default configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Backend flavor for a model endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    /// Hosted OpenAI API; requires a real credential.
    OpenAi,
    /// Any OpenAI-compatible server (e.g. a local inference daemon);
    /// requires an endpoint, tolerates a dummy credential.
    OpenAiCompatible,
}

/// Per-role model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Endpoint override; falls back to the global `api_base`.
    pub api_base: Option<String>,
    /// Credential env var override; falls back to the global `api_key_env`.
    pub api_key_env: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::OpenAiCompatible,
            model: "qwen3:32b".to_string(),
            temperature: 0.3,
            max_output_tokens: 2048,
            api_base: None,
            api_key_env: None,
        }
    }
}

/// A stage role that may carry its own model override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Chat,
    Planner,
    Coder,
    Research,
    Critic,
}

/// Verification settings for the contract checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Command proving the patched tree still builds, run inside the
    /// disposable worktree (e.g. `["python3", "-m", "compileall", "-q", "."]`).
    pub build_command: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            build_command: vec![
                "python3".to_string(),
                "-m".to_string(),
                "compileall".to_string(),
                "-q".to_string(),
                ".".to_string(),
            ],
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverseerConfig {
    /// Fallback model for any role without an override.
    pub chat_model: ModelConfig,
    pub planner_model: Option<ModelConfig>,
    pub coder_model: Option<ModelConfig>,
    pub research_model: Option<ModelConfig>,
    pub critic_model: Option<ModelConfig>,

    /// Hard stop for the critic's execution-repair loop.
    pub max_loops: u32,
    /// Web searches allowed per task.
    pub max_web_searches: u32,
    /// Hard stop for the outer contract-repair loop.
    pub max_contract_retries: u32,
    /// Safety cap on stage transitions within one turn attempt.
    pub max_stage_steps: u32,

    /// Wall-clock budget for a whole turn, in seconds.
    pub turn_timeout_secs: u64,
    /// Per-command budget in the sandbox, in seconds.
    pub command_timeout_secs: u64,
    /// Truncate captured subprocess output beyond this many bytes.
    pub exec_output_limit_bytes: usize,
    /// Tail of stderr quoted back to the coder in fix instructions.
    pub stderr_tail_bytes: usize,
    /// Upper bound on files listed in the repo snapshot grounding message.
    pub repo_snapshot_max_files: usize,

    /// Whether the web-search provider is wired up at all.
    pub web_search_enabled: bool,
    /// Results requested per research query.
    pub research_top_k: usize,

    /// Default endpoint for OpenAI-compatible backends.
    pub api_base: Option<String>,
    /// Env var holding the API credential.
    pub api_key_env: String,

    pub verify: VerifyConfig,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            chat_model: ModelConfig::default(),
            planner_model: None,
            coder_model: None,
            research_model: None,
            critic_model: None,
            max_loops: 3,
            max_web_searches: 1,
            max_contract_retries: 2,
            max_stage_steps: 24,
            turn_timeout_secs: 600,
            command_timeout_secs: 120,
            exec_output_limit_bytes: 100_000,
            stderr_tail_bytes: 2000,
            repo_snapshot_max_files: 200,
            web_search_enabled: false,
            research_top_k: 5,
            api_base: Some("http://127.0.0.1:11434/v1".to_string()),
            api_key_env: "OPENAI_API_KEY".to_string(),
            verify: VerifyConfig::default(),
        }
    }
}

impl OverseerConfig {
    /// Model for a role, falling back to the chat model.
    pub fn model_for(&self, role: ModelRole) -> &ModelConfig {
        let override_cfg = match role {
            ModelRole::Chat => None,
            ModelRole::Planner => self.planner_model.as_ref(),
            ModelRole::Coder => self.coder_model.as_ref(),
            ModelRole::Research => self.research_model.as_ref(),
            ModelRole::Critic => self.critic_model.as_ref(),
        };
        override_cfg.unwrap_or(&self.chat_model)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_loops == 0 {
            return Err(anyhow!("max_loops must be > 0"));
        }
        if self.max_contract_retries == 0 {
            return Err(anyhow!("max_contract_retries must be > 0"));
        }
        if self.max_stage_steps == 0 {
            return Err(anyhow!("max_stage_steps must be > 0"));
        }
        if self.turn_timeout_secs == 0 {
            return Err(anyhow!("turn_timeout_secs must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.exec_output_limit_bytes == 0 {
            return Err(anyhow!("exec_output_limit_bytes must be > 0"));
        }
        if self.verify.build_command.is_empty()
            || self.verify.build_command[0].trim().is_empty()
        {
            return Err(anyhow!("verify.build_command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OverseerConfig::default()`.
pub fn load_config(path: &Path) -> Result<OverseerConfig> {
    if !path.exists() {
        let cfg = OverseerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OverseerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OverseerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OverseerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = OverseerConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn model_for_falls_back_to_chat() {
        let mut cfg = OverseerConfig::default();
        assert_eq!(cfg.model_for(ModelRole::Coder), &cfg.chat_model.clone());

        cfg.coder_model = Some(ModelConfig {
            model: "coder-model".to_string(),
            ..ModelConfig::default()
        });
        assert_eq!(cfg.model_for(ModelRole::Coder).model, "coder-model");
        assert_eq!(cfg.model_for(ModelRole::Critic).model, cfg.chat_model.model);
    }

    #[test]
    fn validate_rejects_zero_budgets() {
        let cfg = OverseerConfig {
            max_loops: 0,
            ..OverseerConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = OverseerConfig {
            verify: VerifyConfig {
                build_command: Vec::new(),
            },
            ..OverseerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
