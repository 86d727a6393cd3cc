use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use autoissue::agent::{AgentRunner, ClaudeCodeRunner, StubAgentRunner};
use autoissue::config::Config;
use autoissue::executor::{Executor, RunReport, EXIT_STARTUP_ERROR};
use autoissue::host::GhHost;
use autoissue::issue::{GhIssueSource, IssueFilter};
use clap::Parser;
use tracing::error;

#[derive(Parser)]
#[command(
    name = "autoissue",
    about = "Batch-execute tracker issues through isolated agent worktrees",
    version
)]
struct Args {
    /// Path to the JSON config file
    #[arg(long, default_value = "autoissue.json", env = "AUTOISSUE_CONFIG")]
    config: PathBuf,

    /// Run all open issues carrying this label
    #[arg(long, conflicts_with = "issues")]
    label: Option<String>,

    /// Run these issue numbers (comma separated)
    #[arg(long, value_delimiter = ',', conflicts_with = "label")]
    issues: Vec<u64>,

    /// Resume a previous session by its ID
    #[arg(long)]
    resume: Option<String>,

    /// Run everything except the agent invocation and PR creation
    #[arg(long)]
    dry_run: bool,

    /// State directory; sessions live under <state-root>/sessions/
    /// (defaults to <project.path>/.autoissue)
    #[arg(long, env = "AUTOISSUE_STATE_DIR")]
    state_root: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "AUTOISSUE_LOG")]
    log: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log)
        .compact()
        .init();

    let code = match run(args).await {
        Ok(report) => report.status.exit_code(),
        Err(e) => {
            error!("{e:#}");
            EXIT_STARTUP_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<RunReport> {
    let config = Config::load(&args.config)?;

    let filter = if !args.issues.is_empty() {
        IssueFilter::Numbers(args.issues.clone())
    } else if let Some(label) = &args.label {
        IssueFilter::Label(label.clone())
    } else {
        bail!("select issues with --label <name> or --issues <n,n,...>");
    };

    let state_root = args
        .state_root
        .clone()
        .unwrap_or_else(|| config.project.path.join(".autoissue"));

    let issues = Arc::new(GhIssueSource::new(config.project.repo.clone()));
    let host = Arc::new(GhHost::new(config.project.repo.clone()));
    let agent: Arc<dyn AgentRunner> = if args.dry_run {
        Arc::new(StubAgentRunner)
    } else {
        Arc::new(ClaudeCodeRunner)
    };

    let executor = Executor::new(config, issues, agent, host, &state_root, args.dry_run);
    executor.run(filter, args.resume).await
}
