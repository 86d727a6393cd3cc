//! The outer execution loop.
//!
//! One coordinator fills scheduler slots, spawns a worker per admitted task,
//! and is the sole consumer of the completion channel — and therefore the
//! sole mutator of scheduler state, cumulative cost, and session state.
//! Workers acquire a worktree, drive the agent, publish a pull request, and
//! report a single completion message; their errors never escape as
//! unhandled failures.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentInvocation, AgentRunner};
use crate::classifier::classify;
use crate::config::Config;
use crate::host::{PullRequestSpec, SourceControlHost};
use crate::issue::{IssueFilter, IssueSource, IssueState};
use crate::scheduler::{Scheduler, SchedulerSummary, Task};
use crate::session::{SessionState, SessionStore};
use crate::worktree::{WorktreeHandle, WorktreeManager};

// ── Run status ──────────────────────────────────────────────────────────────

/// Exit code for configuration and startup failures, mapped in `main`.
pub const EXIT_STARTUP_ERROR: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every task completed.
    AllCompleted,
    /// At least one task failed.
    SomeFailed,
    /// The session budget ran out with work still pending.
    BudgetExhausted,
    /// The run was interrupted by a signal.
    Interrupted,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AllCompleted => 0,
            Self::SomeFailed => 1,
            Self::BudgetExhausted => 2,
            Self::Interrupted => 3,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub session_id: String,
    pub summary: SchedulerSummary,
    pub total_cost_usd: f64,
}

/// One worker's result, delivered over the completion channel.
#[derive(Debug)]
struct TaskCompletion {
    issue_number: u64,
    success: bool,
    cost_usd: f64,
}

// ── Executor ────────────────────────────────────────────────────────────────

pub struct Executor {
    config: Arc<Config>,
    issues: Arc<dyn IssueSource>,
    agent: Arc<dyn AgentRunner>,
    host: Arc<dyn SourceControlHost>,
    worktrees: Arc<WorktreeManager>,
    store: SessionStore,
    dry_run: bool,
}

impl Executor {
    pub fn new(
        config: Config,
        issues: Arc<dyn IssueSource>,
        agent: Arc<dyn AgentRunner>,
        host: Arc<dyn SourceControlHost>,
        state_root: &Path,
        dry_run: bool,
    ) -> Self {
        let worktrees = Arc::new(WorktreeManager::new(
            &config.project.path,
            &config.project.base_branch,
        ));
        Self {
            config: Arc::new(config),
            issues,
            agent,
            host,
            worktrees,
            store: SessionStore::new(state_root),
            dry_run,
        }
    }

    /// Execute the batch selected by `filter`, optionally resuming a prior
    /// session. Startup failures return `Err`; everything after startup is
    /// reported through the `RunReport` status.
    pub async fn run(&self, filter: IssueFilter, resume: Option<String>) -> Result<RunReport> {
        let mut state = match &resume {
            Some(session_id) => self
                .store
                .load(session_id)
                .await
                .context("failed to load session state for resume")?,
            None => SessionState::new(&self.config),
        };
        let _lock = self.store.acquire_lock(&state.session_id).await?;
        info!(
            session = %state.session_id,
            resumed = resume.is_some(),
            dry_run = self.dry_run,
            "session started"
        );

        let issues = self
            .issues
            .fetch(&filter)
            .await
            .context("failed to fetch issues")?;
        info!(count = issues.len(), "issues fetched");

        let mut scheduler = Scheduler::new(self.config.executor.max_parallel);
        for issue in &issues {
            if issue.state == IssueState::Closed {
                debug!(issue = issue.number, "skipping closed issue");
                continue;
            }
            if state.is_finished(issue.number) {
                debug!(issue = issue.number, "already finished in a previous run");
                continue;
            }
            let classification = classify(issue);
            info!(
                issue = issue.number,
                domain = %classification.domain,
                confidence = classification.confidence,
                reasons = ?classification.reasons,
                "issue classified"
            );
            scheduler.enqueue(Task::from_issue(issue, &classification));
        }

        let mut total_cost = state.total_cost_usd;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<TaskCompletion>(16);
        let mut in_flight = 0usize;
        let mut budget_exhausted = false;
        let mut interrupted = false;

        let signal_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received — cancelling in-flight tasks");
                    cancel.cancel();
                }
            })
        };

        while scheduler.has_work() {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            if total_cost >= self.config.max_total_budget_usd {
                warn!(
                    total_cost_usd = total_cost,
                    limit = self.config.max_total_budget_usd,
                    "session budget exhausted — aborting remaining queue"
                );
                budget_exhausted = true;
                break;
            }

            for task in scheduler.fill_slots() {
                info!(issue = task.issue_number, domain = %task.domain, "task admitted");
                in_flight += 1;
                let worker = TaskWorker {
                    config: self.config.clone(),
                    worktrees: self.worktrees.clone(),
                    agent: self.agent.clone(),
                    host: self.host.clone(),
                    dry_run: self.dry_run,
                };
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let completion = worker.run_task(task, cancel).await;
                    let _ = tx.send(completion).await;
                });
            }

            if in_flight == 0 {
                // Queue non-empty, nothing running, nothing admitted: the
                // admission rule can never make progress again.
                for blocked in scheduler.block_reasons() {
                    error!(issue = blocked.issue_number, reason = %blocked.reason, "unschedulable task");
                }
                self.store.save(&state).await.ok();
                signal_task.abort();
                bail!("scheduler made no progress: tasks queued but nothing running or admitted");
            }

            for blocked in scheduler.block_reasons() {
                debug!(issue = blocked.issue_number, reason = %blocked.reason, "task waiting");
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                received = rx.recv() => {
                    let Some(completion) = received else { break };
                    in_flight -= 1;
                    self.record_completion(&mut scheduler, &mut state, &mut total_cost, completion)
                        .await?;
                }
            }
        }

        // Let in-flight workers finish (cancelled workers exit quickly),
        // bounded by the per-task timeout plus cleanup slack.
        let drain_deadline = self.config.timeout() + Duration::from_secs(60);
        while in_flight > 0 {
            match tokio::time::timeout(drain_deadline, rx.recv()).await {
                Ok(Some(completion)) => {
                    in_flight -= 1;
                    self.record_completion(&mut scheduler, &mut state, &mut total_cost, completion)
                        .await?;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(in_flight, "gave up waiting for in-flight tasks");
                    break;
                }
            }
        }
        signal_task.abort();

        // Anything still occupying a slot never reported back: record it as
        // failed rather than losing it.
        let abandoned: Vec<u64> = scheduler
            .running_tasks()
            .iter()
            .map(|t| t.issue_number)
            .collect();
        for issue_number in abandoned {
            warn!(issue = issue_number, "task did not report back — marking failed");
            scheduler.complete(issue_number, false);
            state.record(issue_number, false);
        }

        state.total_cost_usd = total_cost;
        state.last_checkpoint_at = Utc::now();
        self.store
            .save(&state)
            .await
            .context("failed to persist final session state")?;

        let summary = scheduler.summary();
        let status = if interrupted {
            RunStatus::Interrupted
        } else if budget_exhausted && scheduler.has_work() {
            RunStatus::BudgetExhausted
        } else if summary.failed > 0 {
            RunStatus::SomeFailed
        } else {
            RunStatus::AllCompleted
        };
        info!(
            session = %state.session_id,
            completed = summary.completed,
            failed = summary.failed,
            success_rate = summary.success_rate,
            total_cost_usd = total_cost,
            status = ?status,
            "session finished"
        );

        Ok(RunReport {
            status,
            session_id: state.session_id.clone(),
            summary,
            total_cost_usd: total_cost,
        })
    }

    async fn record_completion(
        &self,
        scheduler: &mut Scheduler,
        state: &mut SessionState,
        total_cost: &mut f64,
        completion: TaskCompletion,
    ) -> Result<()> {
        if !scheduler.complete(completion.issue_number, completion.success) {
            warn!(
                issue = completion.issue_number,
                "completion reported for a task not in any slot"
            );
        }
        *total_cost += completion.cost_usd;
        state.record(completion.issue_number, completion.success);
        state.total_cost_usd = *total_cost;
        state.last_checkpoint_at = Utc::now();
        self.store
            .save(state)
            .await
            .context("failed to checkpoint session state")?;
        info!(
            issue = completion.issue_number,
            success = completion.success,
            cost_usd = completion.cost_usd,
            total_cost_usd = *total_cost,
            "task finished"
        );
        Ok(())
    }
}

// ── Per-task worker ─────────────────────────────────────────────────────────

const AGENT_SYSTEM_PROMPT: &str = "You are an automated software engineer resolving one tracker \
issue in an isolated git worktree. Modify files directly, keep the change minimal and focused on \
the issue, run the project's tests when available, and commit your work with a descriptive \
message before finishing.";

/// Everything a worker needs, cloned out of the executor so the spawned
/// future is `'static`.
struct TaskWorker {
    config: Arc<Config>,
    worktrees: Arc<WorktreeManager>,
    agent: Arc<dyn AgentRunner>,
    host: Arc<dyn SourceControlHost>,
    dry_run: bool,
}

impl TaskWorker {
    async fn run_task(&self, task: Task, cancel: CancellationToken) -> TaskCompletion {
        let issue = task.issue_number;
        let branch_name = format!("autoissue/issue-{}-{}", issue, slug(&task.title));

        let mut handle = match self.worktrees.create(&branch_name).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(issue, err = %e, "worktree creation failed — task failed");
                return TaskCompletion {
                    issue_number: issue,
                    success: false,
                    cost_usd: 0.0,
                };
            }
        };

        let invocation = AgentInvocation {
            cwd: handle.path.clone(),
            model: self.config.agent.model,
            system_prompt: AGENT_SYSTEM_PROMPT.to_string(),
            user_prompt: compose_prompt(&task, &handle.path),
            max_budget_usd: self.config.agent.max_budget_usd,
            max_turns: self.config.agent.effective_max_turns(),
            timeout: self.config.timeout(),
        };

        let outcome = tokio::select! {
            outcome = self.agent.run(invocation) => outcome,
            _ = cancel.cancelled() => {
                info!(issue, "task cancelled — releasing worktree");
                handle.cleanup().await;
                return TaskCompletion {
                    issue_number: issue,
                    success: false,
                    cost_usd: 0.0,
                };
            }
        };

        let mut success = outcome.success;
        if let Some(kind) = outcome.error_kind {
            warn!(issue, kind = ?kind, cost_usd = outcome.cost_usd, "agent run failed");
        }

        // The dry-run stub never touches files; skip the publish stage.
        if success && !self.dry_run {
            match changes_in_worktree(&handle, &self.config.project.base_branch).await {
                Ok(true) => match self.publish(&handle, &task).await {
                    Ok(Some(url)) => info!(issue, url = %url, "pull request created"),
                    Ok(None) => info!(
                        issue,
                        branch = %handle.branch,
                        "changes pushed; pull request creation disabled by config"
                    ),
                    Err(e) => {
                        // Agent-succeeded / publish-failed: the task still
                        // counts as completed and the branch survives for
                        // manual recovery.
                        warn!(
                            issue,
                            branch = %handle.branch,
                            err = %e,
                            "publishing changes failed — branch kept for manual recovery"
                        );
                        handle.keep_branch();
                    }
                },
                Ok(false) => {
                    warn!(issue, "agent reported success but produced no changes — task failed");
                    success = false;
                }
                Err(e) => {
                    warn!(issue, err = %e, "could not inspect worktree for changes — task failed");
                    success = false;
                }
            }
        }

        handle.cleanup().await;
        TaskCompletion {
            issue_number: issue,
            success,
            cost_usd: outcome.cost_usd,
        }
    }

    /// Commit whatever the agent left uncommitted and push the branch; then
    /// open the pull request unless PR creation is disabled. Returns the PR
    /// URL, or `None` when the config skips PR creation.
    async fn publish(&self, handle: &WorktreeHandle, task: &Task) -> Result<Option<String>> {
        let title = format!("Issue #{}: {}", task.issue_number, task.title);

        let wt_path = handle.path.clone();
        let message = title.clone();
        tokio::task::spawn_blocking(move || commit_all_blocking(&wt_path, &message))
            .await
            .context("commit task panicked")??;

        push_branch(&handle.path, &handle.branch).await?;

        if !self.config.executor.create_pr {
            return Ok(None);
        }

        let pr = self
            .host
            .create_pull_request(&PullRequestSpec {
                base_branch: self.config.project.base_branch.clone(),
                head_branch: handle.branch.clone(),
                title,
                body: format!(
                    "Automated change for issue #{}.\n\n{}",
                    task.issue_number, task.body
                ),
                draft: self.config.executor.pr_draft,
            })
            .await?;
        Ok(Some(pr.url))
    }
}

fn compose_prompt(task: &Task, worktree: &Path) -> String {
    format!(
        "Resolve issue #{number}: {title}\n\n{body}\n\nWork only inside {path}. Apply the \
         changes directly to the files there and commit them when done.",
        number = task.issue_number,
        title = task.title,
        body = task.body,
        path = worktree.display(),
    )
}

/// Short lowercase-and-dashes rendering of an issue title for branch names.
fn slug(title: &str) -> String {
    let mut out = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-')
        .chars()
        .take(40)
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

// ── Git helpers ─────────────────────────────────────────────────────────────

async fn changes_in_worktree(handle: &WorktreeHandle, base_branch: &str) -> Result<bool> {
    let path = handle.path.clone();
    let base = base_branch.to_string();
    tokio::task::spawn_blocking(move || worktree_has_changes_blocking(&path, &base))
        .await
        .context("status task panicked")?
}

/// True when the worktree has commits past the base branch tip or a dirty
/// working tree.
fn worktree_has_changes_blocking(wt_path: &Path, base_branch: &str) -> Result<bool> {
    let repo = git2::Repository::open(wt_path).context("failed to open worktree")?;
    if !repo
        .statuses(None)
        .context("failed to read worktree status")?
        .is_empty()
    {
        return Ok(true);
    }
    let head = repo
        .head()
        .context("worktree has no HEAD")?
        .peel_to_commit()
        .context("HEAD is not a commit")?
        .id();
    let base = repo
        .find_branch(base_branch, git2::BranchType::Local)
        .context("base branch not visible from worktree")?
        .get()
        .peel_to_commit()
        .context("base branch tip is not a commit")?
        .id();
    Ok(head != base)
}

fn commit_all_blocking(wt_path: &Path, message: &str) -> Result<()> {
    let repo = git2::Repository::open(wt_path).context("failed to open worktree")?;
    if repo
        .statuses(None)
        .context("failed to read worktree status")?
        .is_empty()
    {
        // Agent committed everything itself.
        return Ok(());
    }
    let mut index = repo.index().context("failed to open index")?;
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .context("failed to stage changes")?;
    index.write().context("failed to write index")?;
    let tree_id = index.write_tree().context("failed to write tree")?;
    let tree = repo.find_tree(tree_id).context("failed to find tree")?;
    let signature = repo
        .signature()
        .or_else(|_| git2::Signature::now("autoissue", "autoissue@localhost"))
        .context("failed to build commit signature")?;
    let head = repo
        .head()
        .context("worktree has no HEAD")?
        .peel_to_commit()
        .context("HEAD is not a commit")?;
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[&head])
        .context("failed to commit staged changes")?;
    Ok(())
}

async fn push_branch(worktree: &Path, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["push", "--set-upstream", "origin", branch])
        .current_dir(worktree)
        .output()
        .await
        .context("failed to run `git push`")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git push failed for {branch}: {}", stderr.trim());
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
