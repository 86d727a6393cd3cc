//! Durable session state — checkpointed after every task completion.
//!
//! One session is one invocation of the executor. Its state lives at
//! `<state_root>/sessions/<session_id>.json`, written atomically (temp file
//! then rename) so a crash can never leave a torn checkpoint. The recorded
//! view is superset-monotonic: an issue number present in the file has
//! truly finished; one absent may still be running.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub config_snapshot: Config,
    pub completed_issue_numbers: BTreeSet<u64>,
    pub failed_issue_numbers: BTreeSet<u64>,
    pub total_cost_usd: f64,
    pub last_checkpoint_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(config: &Config) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: now,
            config_snapshot: config.clone(),
            completed_issue_numbers: BTreeSet::new(),
            failed_issue_numbers: BTreeSet::new(),
            total_cost_usd: 0.0,
            last_checkpoint_at: now,
        }
    }

    /// True when this issue finished (either way) in a previous run.
    pub fn is_finished(&self, issue_number: u64) -> bool {
        self.completed_issue_numbers.contains(&issue_number)
            || self.failed_issue_numbers.contains(&issue_number)
    }

    pub fn record(&mut self, issue_number: u64, success: bool) {
        if success {
            self.completed_issue_numbers.insert(issue_number);
        } else {
            self.failed_issue_numbers.insert(issue_number);
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            sessions_dir: state_root.join("sessions"),
        }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    /// Persist a checkpoint atomically: write to a temp file, then rename.
    pub async fn save(&self, state: &SessionState) -> Result<()> {
        tokio::fs::create_dir_all(&self.sessions_dir)
            .await
            .context("failed to create sessions directory")?;

        let path = self.path_for(&state.session_id);
        let tmp = self.sessions_dir.join(format!("{}.json.tmp", state.session_id));
        let json = serde_json::to_string_pretty(state).context("failed to serialize session state")?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move checkpoint into place at {}", path.display()))?;

        debug!(session = %state.session_id, file = %path.display(), "session checkpoint saved");
        Ok(())
    }

    pub async fn load(&self, session_id: &str) -> Result<SessionState> {
        let path = self.path_for(session_id);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("no session state at {}", path.display()))?;
        let state: SessionState = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt session state at {}", path.display()))?;
        Ok(state)
    }

    /// Take the session's PID lock. A second concurrent run against the same
    /// session fails here rather than corrupting the checkpoint file.
    pub async fn acquire_lock(&self, session_id: &str) -> Result<SessionLock> {
        tokio::fs::create_dir_all(&self.sessions_dir)
            .await
            .context("failed to create sessions directory")?;

        let path = self.sessions_dir.join(format!("{session_id}.lock"));
        let lock_path = path.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)?;
            write!(file, "{}", std::process::id())?;
            Ok(())
        })
        .await
        .context("lock task panicked")?;

        match result {
            Ok(()) => Ok(SessionLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!(
                    "session {session_id} appears to be running already (lock file {}); \
                     delete it if the previous run is gone",
                    path.display()
                )
            }
            Err(e) => Err(e).with_context(|| format!("failed to create lock file {}", path.display())),
        }
    }
}

/// Held for the life of a run; releases the lock file on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(file = %self.path.display(), err = %e, "failed to remove session lock");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> Config {
        let mut c = Config::default();
        c.project.repo = "acme/widgets".to_string();
        c.project.path = PathBuf::from("/tmp/widgets");
        c
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());

        let mut state = SessionState::new(&config());
        state.record(7, true);
        state.record(9, false);
        state.total_cost_usd = 3.25;

        store.save(&state).await.unwrap();
        let loaded = store.load(&state.session_id).await.unwrap();
        assert_eq!(loaded.session_id, state.session_id);
        assert!(loaded.completed_issue_numbers.contains(&7));
        assert!(loaded.failed_issue_numbers.contains(&9));
        assert_eq!(loaded.total_cost_usd, 3.25);
        assert!(loaded.is_finished(7));
        assert!(loaded.is_finished(9));
        assert!(!loaded.is_finished(8));
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let state = SessionState::new(&config());
        store.save(&state).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path().join("sessions")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names.len(), 1, "expected only the checkpoint, got {names:?}");
        assert!(names[0].ends_with(".json"));
    }

    #[tokio::test]
    async fn load_missing_session_errors() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load("nope").await.is_err());
    }

    #[tokio::test]
    async fn second_lock_acquisition_fails() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());

        let lock = store.acquire_lock("s1").await.unwrap();
        let err = store.acquire_lock("s1").await.unwrap_err();
        assert!(err.to_string().contains("appears to be running"));

        drop(lock);
        // Lock is released on drop; a new acquisition succeeds.
        let _relock = store.acquire_lock("s1").await.unwrap();
    }

    #[tokio::test]
    async fn checkpoint_schema_uses_camel_case_fields() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let state = SessionState::new(&config());
        store.save(&state).await.unwrap();

        let raw = tokio::fs::read_to_string(store.path_for(&state.session_id))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for field in [
            "sessionId",
            "startedAt",
            "configSnapshot",
            "completedIssueNumbers",
            "failedIssueNumbers",
            "totalCostUsd",
            "lastCheckpointAt",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
    }
}
