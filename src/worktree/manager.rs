//! Worktree lifecycle: create on a fresh branch, release on every exit path.
//!
//! Worktrees live at `<repo_root>/.worktrees/<branch>` and are branched from
//! the configured base branch at creation time. Creation is atomic — partial
//! state is rolled back before the error is reported — and release is an
//! idempotent scoped operation that never masks a prior error.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("branch name {0:?} sanitizes to an empty string")]
    EmptyBranchName(String),
    #[error(
        "worktree path already exists: {} (try `git worktree prune && rm -rf .worktrees/`)",
        path.display()
    )]
    PathExists { path: PathBuf },
    #[error("git operation failed for {}: {source}", path.display())]
    Git {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },
    #[error("filesystem operation failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worktree task panicked")]
    Join(#[from] tokio::task::JoinError),
}

// ── Branch names ────────────────────────────────────────────────────────────

/// Sanitize a proposed branch name: lowercase, keep only alphanumerics and
/// `-`/`_`/`/`, collapse dash runs, strip leading/trailing dashes, cap at
/// 100 characters. Rejects names that sanitize to nothing.
pub fn sanitize_branch_name(raw: &str) -> Result<String, WorktreeError> {
    let mut replaced = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '/' {
            replaced.push(c);
        } else {
            replaced.push('-');
        }
    }

    let mut collapsed = String::with_capacity(replaced.len());
    let mut prev_dash = false;
    for c in replaced.chars() {
        if c == '-' {
            if !prev_dash {
                collapsed.push(c);
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }

    let capped: String = collapsed.trim_matches('-').chars().take(100).collect();
    let name = capped.trim_matches('-').to_string();
    if name.is_empty() {
        return Err(WorktreeError::EmptyBranchName(raw.to_string()));
    }
    Ok(name)
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// Exclusive handle to one worktree. Owned by the task runner that created
/// it; `cleanup` must be called on every exit path and is a no-op after the
/// first call. `Drop` is a last-resort guard for paths that never reach
/// `cleanup` (e.g. a panicking worker).
#[derive(Debug)]
pub struct WorktreeHandle {
    pub branch: String,
    pub path: PathBuf,
    repo_root: PathBuf,
    delete_branch: bool,
    released: bool,
}

impl WorktreeHandle {
    /// Keep the branch alive when the worktree is released. Used when a
    /// pushed branch must survive for manual recovery.
    pub fn keep_branch(&mut self) {
        self.delete_branch = false;
    }

    /// Remove the worktree (and, unless kept, its branch). Idempotent;
    /// failures are logged rather than returned so they cannot mask the
    /// error that ended the caller's scope.
    pub async fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let repo_root = self.repo_root.clone();
        let path = self.path.clone();
        let branch = self.branch.clone();
        let delete_branch = self.delete_branch;

        let result = tokio::task::spawn_blocking(move || {
            remove_worktree_blocking(&repo_root, &path, &branch, delete_branch)
        })
        .await;

        match result {
            Ok(Ok(())) => debug!(branch = %self.branch, "worktree released"),
            Ok(Err(e)) => {
                warn!(branch = %self.branch, err = %e, "worktree cleanup failed")
            }
            Err(e) => warn!(branch = %self.branch, err = %e, "worktree cleanup task panicked"),
        }
    }
}

impl Drop for WorktreeHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!(branch = %self.branch, "worktree handle dropped without cleanup — releasing now");
        if let Err(e) =
            remove_worktree_blocking(&self.repo_root, &self.path, &self.branch, self.delete_branch)
        {
            warn!(branch = %self.branch, err = %e, "worktree cleanup failed in drop");
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

pub struct WorktreeManager {
    repo_root: PathBuf,
    base_branch: String,
    worktree_base: PathBuf,
    /// Positive `exists` results memoized for the life of this manager.
    exists_cache: Mutex<HashSet<PathBuf>>,
}

impl WorktreeManager {
    pub fn new(repo_root: &Path, base_branch: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            base_branch: base_branch.to_string(),
            worktree_base: repo_root.join(".worktrees"),
            exists_cache: Mutex::new(HashSet::new()),
        }
    }

    /// Create a worktree on a new branch forked from the base branch.
    ///
    /// Fails without side effects when the target path already exists; any
    /// partially created state (branch without worktree) is rolled back
    /// before the error is reported.
    pub async fn create(&self, branch_name: &str) -> Result<WorktreeHandle, WorktreeError> {
        let branch = sanitize_branch_name(branch_name)?;
        let path = self.worktree_base.join(&branch);

        if path.exists() {
            return Err(WorktreeError::PathExists { path });
        }
        // Branch names may carry '/', nesting the checkout under the base.
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| WorktreeError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let repo_root = self.repo_root.clone();
        let base_branch = self.base_branch.clone();
        let branch_for_task = branch.clone();
        let path_for_task = path.clone();
        tokio::task::spawn_blocking(move || {
            create_worktree_blocking(&repo_root, &base_branch, &branch_for_task, &path_for_task)
        })
        .await??;

        debug!(branch = %branch, path = %path.display(), "worktree created");
        Ok(WorktreeHandle {
            branch,
            path,
            repo_root: self.repo_root.clone(),
            delete_branch: true,
            released: false,
        })
    }

    /// Plain filesystem existence check.
    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Existence check that memoizes positive results, avoiding repeated
    /// stats for paths already seen during scheduling passes.
    pub async fn exists_cached(&self, path: &Path) -> bool {
        let mut cache = self.exists_cache.lock().await;
        if cache.contains(path) {
            return true;
        }
        if path.exists() {
            cache.insert(path.to_path_buf());
            return true;
        }
        false
    }
}

// ── Blocking git2 helpers ───────────────────────────────────────────────────

fn create_worktree_blocking(
    repo_root: &Path,
    base_branch: &str,
    branch_name: &str,
    wt_path: &Path,
) -> Result<(), WorktreeError> {
    let git_err = |source: git2::Error| WorktreeError::Git {
        path: wt_path.to_path_buf(),
        source,
    };

    let repo = git2::Repository::open(repo_root).map_err(|source| WorktreeError::Git {
        path: repo_root.to_path_buf(),
        source,
    })?;

    let base = repo
        .find_branch(base_branch, git2::BranchType::Local)
        .map_err(git_err)?;
    let base_commit = base.get().peel_to_commit().map_err(git_err)?;

    let mut created_branch = false;
    let branch = match repo.branch(branch_name, &base_commit, false) {
        Ok(b) => {
            created_branch = true;
            b
        }
        Err(e) if e.code() == git2::ErrorCode::Exists => {
            debug!(branch = branch_name, "branch already exists — reusing");
            repo.find_branch(branch_name, git2::BranchType::Local)
                .map_err(git_err)?
        }
        Err(e) => return Err(git_err(e)),
    };

    // git disallows '/' in worktree names even though branch names carry it.
    let wt_name = branch_name.replace('/', "--");
    let branch_ref = branch.get();
    let mut opts = git2::WorktreeAddOptions::new();
    opts.reference(Some(branch_ref));

    if let Err(e) = repo.worktree(&wt_name, wt_path, Some(&opts)) {
        // Roll back partial state before reporting.
        if wt_path.exists() {
            let _ = std::fs::remove_dir_all(wt_path);
        }
        if created_branch {
            if let Ok(mut b) = repo.find_branch(branch_name, git2::BranchType::Local) {
                let _ = b.delete();
            }
        }
        return Err(git_err(e));
    }

    Ok(())
}

fn remove_worktree_blocking(
    repo_root: &Path,
    wt_path: &Path,
    branch_name: &str,
    delete_branch: bool,
) -> Result<(), WorktreeError> {
    let git_err = |source: git2::Error| WorktreeError::Git {
        path: wt_path.to_path_buf(),
        source,
    };

    let repo = git2::Repository::open(repo_root).map_err(|source| WorktreeError::Git {
        path: repo_root.to_path_buf(),
        source,
    })?;

    // Prune the registered worktree whose checkout lives at `wt_path`.
    let names = repo.worktrees().map_err(git_err)?;
    for name in names.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(name) {
            if wt.path() == wt_path {
                let mut opts = git2::WorktreePruneOptions::new();
                opts.valid(true).working_tree(true);
                wt.prune(Some(&mut opts)).map_err(git_err)?;
                break;
            }
        }
    }

    if wt_path.exists() {
        std::fs::remove_dir_all(wt_path).map_err(|source| WorktreeError::Io {
            path: wt_path.to_path_buf(),
            source,
        })?;
    }

    // Drop now-empty intermediate directories left by '/'-nested branches.
    let base = repo_root.join(".worktrees");
    let mut parent = wt_path.parent();
    while let Some(dir) = parent {
        if dir == base || !dir.starts_with(&base) {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        parent = dir.parent();
    }

    if delete_branch {
        if let Ok(mut b) = repo.find_branch(branch_name, git2::BranchType::Local) {
            b.delete().map_err(git_err)?;
        }
    }

    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_replaces() {
        assert_eq!(
            sanitize_branch_name("autoissue/issue-7-Fix Auth!").unwrap(),
            "autoissue/issue-7-fix-auth"
        );
    }

    #[test]
    fn sanitize_collapses_dash_runs() {
        assert_eq!(
            sanitize_branch_name("fix---the   thing").unwrap(),
            "fix-the-thing"
        );
    }

    #[test]
    fn sanitize_strips_edge_dashes() {
        assert_eq!(sanitize_branch_name("!!fix me!!").unwrap(), "fix-me");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(250);
        assert_eq!(sanitize_branch_name(&long).unwrap().len(), 100);
    }

    #[test]
    fn sanitize_rejects_empty_results() {
        for raw in ["", "!!!", "---", "¡¿"] {
            assert!(
                matches!(sanitize_branch_name(raw), Err(WorktreeError::EmptyBranchName(_))),
                "expected {raw:?} to be rejected"
            );
        }
    }

    #[test]
    fn sanitize_keeps_slashes_and_underscores() {
        assert_eq!(
            sanitize_branch_name("autoissue/issue-12-add_index").unwrap(),
            "autoissue/issue-12-add_index"
        );
    }
}
