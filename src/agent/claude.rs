//! `claude` CLI agent runner.
//!
//! Spawns one non-interactive `claude -p` process per task inside the
//! task's worktree and parses the stream-json event feed. Only the startup
//! `system` event (for the agent's session id) and the terminal `result`
//! event (cost, duration, error flag) matter here; everything else is
//! passed over with `#[serde(other)]`.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AgentErrorKind, AgentInvocation, AgentOutcome, AgentRunner};

// ── Stream-json event types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeEvent {
    /// Startup event — carries claude's own session_id.
    System { session_id: Option<String> },
    /// Terminal event for the run.
    Result {
        is_error: Option<bool>,
        total_cost_usd: Option<f64>,
        duration_ms: Option<u64>,
        session_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default)]
struct ParsedRun {
    session_id: Option<String>,
    cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    is_error: bool,
    saw_result: bool,
}

// ── Runner ──────────────────────────────────────────────────────────────────

pub struct ClaudeCodeRunner;

#[async_trait]
impl AgentRunner for ClaudeCodeRunner {
    async fn run(&self, invocation: AgentInvocation) -> AgentOutcome {
        let started = Instant::now();

        let mut cmd = Command::new("claude");
        cmd.args([
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
            "--model",
            invocation.model.as_str(),
            "--max-turns",
            &invocation.max_turns.to_string(),
            "--append-system-prompt",
            &invocation.system_prompt,
            "-p",
            &invocation.user_prompt,
        ]);
        cmd.current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A cancelled worker drops the child; make sure it dies with us.
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(err = %e, "failed to spawn `claude` — is it installed and on PATH?");
                return AgentOutcome::failure(AgentErrorKind::Spawn, started.elapsed());
            }
        };

        let Some(stdout) = child.stdout.take() else {
            warn!("claude child has no stdout pipe");
            return AgentOutcome::failure(AgentErrorKind::Spawn, started.elapsed());
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "claude_stderr", "{line}");
                }
            });
        }

        let parsed = match tokio::time::timeout(invocation.timeout, read_events(stdout)).await {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    timeout_secs = invocation.timeout.as_secs(),
                    "agent run timed out — terminating"
                );
                let _ = child.kill().await;
                let _ = child.wait().await;
                return AgentOutcome::failure(AgentErrorKind::Timeout, started.elapsed());
            }
        };

        let status = child.wait().await;
        let exited_cleanly = status.map(|s| s.success()).unwrap_or(false);

        if !parsed.saw_result || !exited_cleanly {
            warn!(
                saw_result = parsed.saw_result,
                exited_cleanly, "agent run ended without a usable result"
            );
            return AgentOutcome {
                success: false,
                cost_usd: parsed.cost_usd.unwrap_or(0.0),
                duration_ms: started.elapsed().as_millis() as u64,
                agent_session_id: parsed.session_id,
                error_kind: Some(AgentErrorKind::Crashed),
            };
        }

        let cost_usd = parsed.cost_usd.unwrap_or(0.0);
        let duration_ms = parsed
            .duration_ms
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);

        // The CLI has no budget flag; enforce the per-task ceiling after the
        // fact and report overruns as failures.
        if cost_usd > invocation.max_budget_usd {
            warn!(
                cost_usd,
                max_budget_usd = invocation.max_budget_usd,
                "agent exceeded its per-task budget"
            );
            return AgentOutcome {
                success: false,
                cost_usd,
                duration_ms,
                agent_session_id: parsed.session_id,
                error_kind: Some(AgentErrorKind::BudgetExceeded),
            };
        }

        AgentOutcome {
            success: !parsed.is_error,
            cost_usd,
            duration_ms,
            agent_session_id: parsed.session_id,
            error_kind: None,
        }
    }
}

async fn read_events(stdout: tokio::process::ChildStdout) -> ParsedRun {
    let mut parsed = ParsedRun::default();
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event: ClaudeEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(_) => {
                debug!(line = %line, "unparseable claude event");
                continue;
            }
        };
        match event {
            ClaudeEvent::System { session_id } => {
                if let Some(sid) = session_id {
                    parsed.session_id = Some(sid);
                }
            }
            ClaudeEvent::Result {
                is_error,
                total_cost_usd,
                duration_ms,
                session_id,
            } => {
                parsed.saw_result = true;
                parsed.is_error = is_error.unwrap_or(false);
                parsed.cost_usd = total_cost_usd;
                parsed.duration_ms = duration_ms;
                if let Some(sid) = session_id {
                    parsed.session_id = Some(sid);
                }
            }
            ClaudeEvent::Unknown => {}
        }
    }
    parsed
}

// ── Tests ───────────────────────────────────────────────────────────────────
