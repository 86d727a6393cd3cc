//! Isolated git worktrees for concurrently running tasks.
//!
//! Every task runs its agent inside a dedicated worktree branched from the
//! configured base branch, so concurrent agents can never touch each
//! other's in-progress changes.

pub mod manager;

pub use manager::{sanitize_branch_name, WorktreeError, WorktreeHandle, WorktreeManager};
