//! Issue records and the issue-source seam.
//!
//! The shipped source shells out to the `gh` CLI and parses its `--json`
//! output, so authentication and pagination stay the host CLI's problem.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

/// One tracker issue, immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRecord {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: IssueState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: String,
}

/// Selects the issues a session operates on.
#[derive(Debug, Clone)]
pub enum IssueFilter {
    /// All open issues carrying this label.
    Label(String),
    /// An explicit list of issue numbers.
    Numbers(Vec<u64>),
}

// ── Seam ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn fetch(&self, filter: &IssueFilter) -> Result<Vec<IssueRecord>>;
}

// ── gh CLI source ───────────────────────────────────────────────────────────

const ISSUE_JSON_FIELDS: &str = "number,title,body,labels,state,createdAt,updatedAt,url";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

impl From<RawIssue> for IssueRecord {
    fn from(raw: RawIssue) -> Self {
        let state = if raw.state.eq_ignore_ascii_case("open") {
            IssueState::Open
        } else {
            IssueState::Closed
        };
        let mut labels: Vec<String> = raw.labels.into_iter().map(|l| l.name).collect();
        labels.sort();
        labels.dedup();
        Self {
            number: raw.number,
            title: raw.title,
            body: raw.body.unwrap_or_default(),
            labels,
            state,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            url: raw.url,
        }
    }
}

/// Issue source backed by the `gh` CLI.
pub struct GhIssueSource {
    repo: String,
}

impl GhIssueSource {
    pub fn new(repo: impl Into<String>) -> Self {
        Self { repo: repo.into() }
    }

    async fn run_gh(&self, args: &[&str]) -> Result<String> {
        debug!(repo = %self.repo, ?args, "running gh");
        let output = Command::new("gh")
            .args(args)
            .output()
            .await
            .context("failed to run `gh` — is it installed and authenticated?")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gh {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl IssueSource for GhIssueSource {
    async fn fetch(&self, filter: &IssueFilter) -> Result<Vec<IssueRecord>> {
        match filter {
            IssueFilter::Label(label) => {
                let stdout = self
                    .run_gh(&[
                        "issue",
                        "list",
                        "--repo",
                        &self.repo,
                        "--state",
                        "open",
                        "--label",
                        label,
                        "--limit",
                        "200",
                        "--json",
                        ISSUE_JSON_FIELDS,
                    ])
                    .await?;
                let raw: Vec<RawIssue> =
                    serde_json::from_str(&stdout).context("unparseable `gh issue list` output")?;
                Ok(raw.into_iter().map(IssueRecord::from).collect())
            }
            IssueFilter::Numbers(numbers) => {
                let mut issues = Vec::with_capacity(numbers.len());
                for number in numbers {
                    let stdout = self
                        .run_gh(&[
                            "issue",
                            "view",
                            &number.to_string(),
                            "--repo",
                            &self.repo,
                            "--json",
                            ISSUE_JSON_FIELDS,
                        ])
                        .await?;
                    let raw: RawIssue = serde_json::from_str(&stdout)
                        .with_context(|| format!("unparseable `gh issue view {number}` output"))?;
                    issues.push(IssueRecord::from(raw));
                }
                Ok(issues)
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
