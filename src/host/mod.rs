//! Source-control host seam — pull-request creation.
//!
//! The shipped host shells out to `gh pr create`, keeping authentication
//! with the host CLI just like the issue source does.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PullRequestSpec {
    pub base_branch: String,
    pub head_branch: String,
    pub title: String,
    pub body: String,
    pub draft: bool,
}

#[derive(Debug, Clone)]
pub struct CreatedPullRequest {
    pub url: String,
}

// ── Seam ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait SourceControlHost: Send + Sync {
    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<CreatedPullRequest>;
}

// ── gh CLI host ─────────────────────────────────────────────────────────────

pub struct GhHost {
    repo: String,
}

impl GhHost {
    pub fn new(repo: impl Into<String>) -> Self {
        Self { repo: repo.into() }
    }
}

#[async_trait]
impl SourceControlHost for GhHost {
    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<CreatedPullRequest> {
        let mut args: Vec<&str> = vec![
            "pr",
            "create",
            "--repo",
            &self.repo,
            "--base",
            &spec.base_branch,
            "--head",
            &spec.head_branch,
            "--title",
            &spec.title,
            "--body",
            &spec.body,
        ];
        if spec.draft {
            args.push("--draft");
        }

        debug!(repo = %self.repo, head = %spec.head_branch, "running gh pr create");
        let output = Command::new("gh")
            .args(&args)
            .output()
            .await
            .context("failed to run `gh` — is it installed and authenticated?")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh pr create failed: {}", stderr.trim());
        }

        // gh prints the PR URL as the last line of stdout.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(CreatedPullRequest { url })
    }
}
