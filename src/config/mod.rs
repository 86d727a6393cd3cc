//! Validated configuration snapshot consumed by the executor.
//!
//! Loaded once at startup from a JSON file, validated, then treated as
//! immutable for the life of the session. The snapshot is embedded in the
//! durable session state so a resumed session reports the options it was
//! started with.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

// ── Errors ──────────────────────────────────────────────────────────────────

/// Validation and load failures. All are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("project.repo must be \"owner/name\", got {0:?}")]
    InvalidRepo(String),
    #[error("project.path must be an absolute path, got {}", .0.display())]
    RelativeProjectPath(PathBuf),
    #[error("executor.maxParallel must be within [1, 10], got {0}")]
    MaxParallelOutOfRange(usize),
    #[error("executor.timeoutMinutes must be within [5, 120], got {0}")]
    TimeoutOutOfRange(u64),
    #[error("agent.maxBudgetUsd must be at least 0.01, got {0}")]
    AgentBudgetTooSmall(f64),
    #[error("maxTotalBudgetUsd must be positive, got {0}")]
    TotalBudgetNotPositive(f64),
}

// ── Model ───────────────────────────────────────────────────────────────────

/// Agent model tier. Drives the `--model` flag and the default turn cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentModel {
    Opus,
    #[default]
    Sonnet,
    Haiku,
}

impl AgentModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Sonnet => "sonnet",
            Self::Haiku => "haiku",
        }
    }

    /// Default turn cap per model: larger models get fewer, longer turns.
    pub fn default_max_turns(&self) -> u32 {
        match self {
            Self::Opus => 5,
            Self::Sonnet => 8,
            Self::Haiku => 12,
        }
    }
}

impl fmt::Display for AgentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "opus" => Ok(Self::Opus),
            "sonnet" => Ok(Self::Sonnet),
            "haiku" => Ok(Self::Haiku),
            other => Err(format!("unknown model {other:?} (expected opus, sonnet, or haiku)")),
        }
    }
}

// ── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    /// Source-control host repository as `owner/name`.
    pub repo: String,
    /// Absolute path to the local checkout worktrees are forked from.
    pub path: PathBuf,
    pub base_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    pub max_parallel: usize,
    pub timeout_minutes: u64,
    pub create_pr: bool,
    pub pr_draft: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            timeout_minutes: 30,
            create_pr: true,
            pr_draft: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub model: AgentModel,
    pub max_budget_usd: f64,
    /// Turn cap; `None` falls back to the model default.
    pub max_turns: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: AgentModel::Sonnet,
            max_budget_usd: 5.0,
            max_turns: None,
        }
    }
}

impl AgentConfig {
    pub fn effective_max_turns(&self) -> u32 {
        self.max_turns.unwrap_or_else(|| self.model.default_max_turns())
    }
}

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub project: ProjectConfig,
    pub executor: ExecutorConfig,
    pub agent: AgentConfig,
    /// Session-wide cost ceiling across all tasks.
    pub max_total_budget_usd: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectConfig {
                repo: String::new(),
                path: PathBuf::new(),
                base_branch: "main".to_string(),
            },
            executor: ExecutorConfig::default(),
            agent: AgentConfig::default(),
            max_total_budget_usd: 50.0,
        }
    }
}

fn repo_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[^/]+/[^/]+$").expect("repo regex"))
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every recognized option against its documented range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !repo_regex().is_match(&self.project.repo) {
            return Err(ConfigError::InvalidRepo(self.project.repo.clone()));
        }
        if !self.project.path.is_absolute() {
            return Err(ConfigError::RelativeProjectPath(self.project.path.clone()));
        }
        if !(1..=10).contains(&self.executor.max_parallel) {
            return Err(ConfigError::MaxParallelOutOfRange(self.executor.max_parallel));
        }
        if !(5..=120).contains(&self.executor.timeout_minutes) {
            return Err(ConfigError::TimeoutOutOfRange(self.executor.timeout_minutes));
        }
        if self.agent.max_budget_usd < 0.01 {
            return Err(ConfigError::AgentBudgetTooSmall(self.agent.max_budget_usd));
        }
        if self.max_total_budget_usd <= 0.0 {
            return Err(ConfigError::TotalBudgetNotPositive(self.max_total_budget_usd));
        }
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.executor.timeout_minutes * 60)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            project: ProjectConfig {
                repo: "acme/widgets".to_string(),
                path: PathBuf::from("/tmp/widgets"),
                base_branch: "main".to_string(),
            },
            ..Config::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.project.base_branch, "main");
        assert_eq!(c.executor.max_parallel, 3);
        assert_eq!(c.executor.timeout_minutes, 30);
        assert!(c.executor.create_pr);
        assert!(!c.executor.pr_draft);
        assert_eq!(c.agent.model, AgentModel::Sonnet);
        assert_eq!(c.agent.max_budget_usd, 5.0);
        assert_eq!(c.max_total_budget_usd, 50.0);
    }

    #[test]
    fn repo_must_have_exactly_one_slash() {
        for bad in ["acme", "acme/widgets/extra", "/widgets", "acme/", ""] {
            let mut c = valid();
            c.project.repo = bad.to_string();
            assert!(
                matches!(c.validate(), Err(ConfigError::InvalidRepo(_))),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn project_path_must_be_absolute() {
        let mut c = valid();
        c.project.path = PathBuf::from("relative/checkout");
        assert!(matches!(c.validate(), Err(ConfigError::RelativeProjectPath(_))));
    }

    #[test]
    fn max_parallel_range_enforced() {
        for bad in [0usize, 11] {
            let mut c = valid();
            c.executor.max_parallel = bad;
            assert!(matches!(c.validate(), Err(ConfigError::MaxParallelOutOfRange(_))));
        }
    }

    #[test]
    fn timeout_range_enforced() {
        for bad in [4u64, 121] {
            let mut c = valid();
            c.executor.timeout_minutes = bad;
            assert!(matches!(c.validate(), Err(ConfigError::TimeoutOutOfRange(_))));
        }
    }

    #[test]
    fn agent_budget_floor_enforced() {
        let mut c = valid();
        c.agent.max_budget_usd = 0.005;
        assert!(matches!(c.validate(), Err(ConfigError::AgentBudgetTooSmall(_))));
    }

    #[test]
    fn default_max_turns_by_model() {
        assert_eq!(AgentModel::Opus.default_max_turns(), 5);
        assert_eq!(AgentModel::Sonnet.default_max_turns(), 8);
        assert_eq!(AgentModel::Haiku.default_max_turns(), 12);

        let mut agent = AgentConfig::default();
        assert_eq!(agent.effective_max_turns(), 8);
        agent.max_turns = Some(3);
        assert_eq!(agent.effective_max_turns(), 3);
    }

    #[test]
    fn config_round_trips_through_json() {
        let c = valid();
        let json = serde_json::to_string(&c).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project.repo, c.project.repo);
        assert_eq!(back.executor.max_parallel, c.executor.max_parallel);
    }

    #[test]
    fn unknown_model_string_is_rejected() {
        assert!("gpt-5".parse::<AgentModel>().is_err());
        assert_eq!("OPUS".parse::<AgentModel>().unwrap(), AgentModel::Opus);
    }
}
