//! The external code-generation agent seam.
//!
//! The executor talks to agents only through [`AgentRunner`]; failures are
//! always expressed in the returned [`AgentOutcome`] so a worker never has
//! to translate a mid-run error into scheduler state itself.

pub mod claude;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::AgentModel;

pub use claude::ClaudeCodeRunner;

// ── Invocation / outcome ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// Working directory — the task's worktree checkout.
    pub cwd: PathBuf,
    pub model: AgentModel,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_budget_usd: f64,
    pub max_turns: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// The run exceeded its deadline and was force-terminated.
    Timeout,
    /// The agent process could not be started.
    Spawn,
    /// The process exited without a usable terminal result.
    Crashed,
    /// The run finished but reported more cost than its per-task budget.
    BudgetExceeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome {
    pub success: bool,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// The agent's own session identifier, when it reported one.
    pub agent_session_id: Option<String>,
    pub error_kind: Option<AgentErrorKind>,
}

impl AgentOutcome {
    pub fn failure(kind: AgentErrorKind, elapsed: Duration) -> Self {
        Self {
            success: false,
            cost_usd: 0.0,
            duration_ms: elapsed.as_millis() as u64,
            agent_session_id: None,
            error_kind: Some(kind),
        }
    }
}

// ── Seam ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one agent to completion. Never returns an error: every failure
    /// mode is encoded in the outcome.
    async fn run(&self, invocation: AgentInvocation) -> AgentOutcome;
}

// ── Dry-run stub ────────────────────────────────────────────────────────────

/// Deterministic stand-in used by `--dry-run` and tests: immediate success,
/// zero cost, zero duration.
#[derive(Debug, Default)]
pub struct StubAgentRunner;

#[async_trait]
impl AgentRunner for StubAgentRunner {
    async fn run(&self, _invocation: AgentInvocation) -> AgentOutcome {
        AgentOutcome {
            success: true,
            cost_usd: 0.0,
            duration_ms: 0,
            agent_session_id: Some("dry-run".to_string()),
            error_kind: None,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
