//! Sliding-window scheduler with domain-conflict admission control.
//!
//! The scheduler owns a FIFO queue of pending tasks and a fixed array of
//! execution slots. An admission pass walks the queue in order and moves a
//! task into a free slot only when its domain is pairwise compatible with
//! every task already running; skipped tasks keep their queue position.
//!
//! Single-owner by design: the executor is the sole mutator and workers
//! report results back over a channel, so no interior locking is needed.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classifier::{are_domains_compatible, Classification, Domain};
use crate::issue::IssueRecord;

// ── Task ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One unit of schedulable work, built from an issue and its classification.
/// Identity is the issue number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub issue_number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub domain: Domain,
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_issue(issue: &IssueRecord, classification: &Classification) -> Self {
        Self {
            issue_number: issue.number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            labels: issue.labels.clone(),
            domain: classification.domain,
            status: TaskStatus::Pending,
            completed_at: None,
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.issue_number == other.issue_number
    }
}

impl Eq for Task {}

// ── Slots ───────────────────────────────────────────────────────────────────

/// One of the N concurrent execution positions. Reused across tasks.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub task: Option<Task>,
    pub started_at: Option<DateTime<Utc>>,
}

// ── Introspection types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    /// Everything ever enqueued this session.
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSummary {
    pub completed: usize,
    pub failed: usize,
    /// Percentage of finished tasks that completed; 0 when nothing finished.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockReason {
    pub issue_number: u64,
    pub reason: String,
}

// ── Scheduler ───────────────────────────────────────────────────────────────

pub struct Scheduler {
    max_slots: usize,
    slots: Vec<Slot>,
    queue: VecDeque<Task>,
    scheduled: HashSet<u64>,
    completed: usize,
    failed: usize,
}

impl Scheduler {
    /// Allocate a scheduler with `max_slots` empty slots, clamped to [1, 10].
    pub fn new(max_slots: usize) -> Self {
        let clamped = max_slots.clamp(1, 10);
        if clamped != max_slots {
            warn!(requested = max_slots, using = clamped, "max_slots out of range");
        }
        Self {
            max_slots: clamped,
            slots: vec![Slot::default(); clamped],
            queue: VecDeque::new(),
            scheduled: HashSet::new(),
            completed: 0,
            failed: 0,
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Append a task to the queue. Idempotent per issue number: a task that
    /// was ever scheduled this session is not accepted again.
    pub fn enqueue(&mut self, task: Task) -> bool {
        if !self.scheduled.insert(task.issue_number) {
            return false;
        }
        self.queue.push_back(task);
        true
    }

    /// The admission pass. Walks the queue in FIFO order and moves each task
    /// whose domain is compatible with every running task into a free slot.
    /// Skipped tasks keep their position; the pass stops early once no free
    /// slot remains. Returns the newly admitted tasks.
    pub fn fill_slots(&mut self) -> Vec<Task> {
        let mut admitted = Vec::new();
        let mut skipped: VecDeque<Task> = VecDeque::new();

        while let Some(mut task) = self.queue.pop_front() {
            let Some(slot_idx) = self.slots.iter().position(|s| s.task.is_none()) else {
                skipped.push_back(task);
                break;
            };
            let compatible = self
                .running_tasks()
                .iter()
                .all(|running| are_domains_compatible(task.domain, running.domain));
            if compatible {
                task.status = TaskStatus::Running;
                admitted.push(task.clone());
                self.slots[slot_idx] = Slot {
                    task: Some(task),
                    started_at: Some(Utc::now()),
                };
            } else {
                skipped.push_back(task);
            }
        }

        // Re-queue the skipped tasks followed by anything never examined,
        // preserving FIFO order.
        while let Some(task) = self.queue.pop_front() {
            skipped.push_back(task);
        }
        self.queue = skipped;

        admitted
    }

    /// Free the slot running `issue_number` and record the outcome.
    /// Returns `false` (and changes nothing) when no slot runs that issue.
    pub fn complete(&mut self, issue_number: u64, success: bool) -> bool {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.task.as_ref().map(|t| t.issue_number) == Some(issue_number))
        else {
            return false;
        };
        let Some(mut task) = slot.task.take() else {
            return false;
        };
        slot.started_at = None;
        if success {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            self.completed += 1;
        } else {
            task.status = TaskStatus::Failed;
            self.failed += 1;
        }
        true
    }

    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || self.slots.iter().any(|s| s.task.is_some())
    }

    pub fn is_complete(&self) -> bool {
        !self.has_work()
    }

    /// Tasks currently occupying slots.
    pub fn running_tasks(&self) -> Vec<&Task> {
        self.slots.iter().filter_map(|s| s.task.as_ref()).collect()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running_tasks().len(),
            queued: self.queue.len(),
            completed: self.completed,
            failed: self.failed,
            total: self.scheduled.len(),
        }
    }

    pub fn summary(&self) -> SchedulerSummary {
        let finished = self.completed + self.failed;
        let success_rate = if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64 * 100.0
        };
        SchedulerSummary {
            completed: self.completed,
            failed: self.failed,
            success_rate,
        }
    }

    /// Why each queued task could not be admitted right now. Meaningful
    /// immediately after an admission pass.
    pub fn block_reasons(&self) -> Vec<BlockReason> {
        let running = self.running_tasks();
        let free_slots = self.slots.iter().filter(|s| s.task.is_none()).count();
        self.queue
            .iter()
            .map(|task| {
                let blockers: Vec<String> = running
                    .iter()
                    .filter(|r| !are_domains_compatible(task.domain, r.domain))
                    .map(|r| {
                        if r.domain == task.domain {
                            format!("Blocked by {} task #{} (same domain)", r.domain, r.issue_number)
                        } else {
                            format!("Blocked by {} task #{}", r.domain, r.issue_number)
                        }
                    })
                    .collect();
                let reason = if !blockers.is_empty() {
                    blockers.join("; ")
                } else if free_slots == 0 {
                    "No free slots".to_string()
                } else {
                    "Admissible on the next pass".to_string()
                };
                BlockReason {
                    issue_number: task.issue_number,
                    reason,
                }
            })
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn task(issue_number: u64, domain: Domain) -> Task {
        Task {
            issue_number,
            title: format!("task {issue_number}"),
            body: String::new(),
            labels: Vec::new(),
            domain,
            status: TaskStatus::Pending,
            completed_at: None,
        }
    }

    fn assert_conservation(s: &Scheduler) {
        let st = s.status();
        assert_eq!(
            st.completed + st.failed + st.running + st.queued,
            st.total,
            "conservation invariant violated: {st:?}"
        );
    }

    #[test]
    fn enqueue_is_idempotent_per_issue() {
        let mut s = Scheduler::new(3);
        assert!(s.enqueue(task(1, Domain::Backend)));
        assert!(!s.enqueue(task(1, Domain::Frontend)));
        assert_eq!(s.status().total, 1);
        assert_conservation(&s);
    }

    #[test]
    fn max_slots_is_clamped() {
        assert_eq!(Scheduler::new(0).max_slots(), 1);
        assert_eq!(Scheduler::new(99).max_slots(), 10);
        assert_eq!(Scheduler::new(4).max_slots(), 4);
    }

    #[test]
    fn same_domain_tasks_serialize() {
        let mut s = Scheduler::new(3);
        s.enqueue(task(1, Domain::Backend));
        s.enqueue(task(2, Domain::Backend));

        let admitted = s.fill_slots();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].issue_number, 1);
        assert_eq!(s.status().running, 1);
        assert_eq!(s.status().queued, 1);
        assert_conservation(&s);

        let reasons = s.block_reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].reason.contains("backend"));
        assert!(reasons[0].reason.contains("#1"));
        assert!(reasons[0].reason.contains("same domain"));

        assert!(s.complete(1, true));
        let admitted = s.fill_slots();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].issue_number, 2);
        assert_conservation(&s);
    }

    #[test]
    fn database_runs_exclusively() {
        let mut s = Scheduler::new(3);
        s.enqueue(task(1, Domain::Database));
        s.enqueue(task(2, Domain::Backend));

        let admitted = s.fill_slots();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].issue_number, 1);
        let reasons = s.block_reasons();
        assert!(reasons[0].reason.contains("database"));
        assert!(reasons[0].reason.contains("#1"));

        assert!(s.complete(1, true));
        assert_eq!(s.fill_slots().len(), 1);
        assert_conservation(&s);
    }

    #[test]
    fn cross_domain_tasks_fill_all_slots() {
        let mut s = Scheduler::new(3);
        s.enqueue(task(1, Domain::Backend));
        s.enqueue(task(2, Domain::Frontend));
        s.enqueue(task(3, Domain::Testing));
        s.enqueue(task(4, Domain::Security));
        s.enqueue(task(5, Domain::Documentation));

        let admitted = s.fill_slots();
        assert_eq!(
            admitted.iter().map(|t| t.issue_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(s.status().queued, 2);
        assert_conservation(&s);

        // No free slot is the block reason, not domain conflict.
        assert!(s
            .block_reasons()
            .iter()
            .all(|r| r.reason == "No free slots"));

        assert!(s.complete(1, true));
        let admitted = s.fill_slots();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].issue_number, 4);
        assert_conservation(&s);
    }

    #[test]
    fn unknown_domain_runs_alone() {
        let mut s = Scheduler::new(3);
        s.enqueue(task(1, Domain::Unknown));
        s.enqueue(task(2, Domain::Backend));

        let admitted = s.fill_slots();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].issue_number, 1);
        assert!(s.block_reasons()[0].reason.contains("unknown"));

        assert!(s.complete(1, true));
        assert_eq!(s.fill_slots().len(), 1);
        assert_conservation(&s);
    }

    #[test]
    fn skipped_tasks_keep_queue_position() {
        let mut s = Scheduler::new(3);
        s.enqueue(task(1, Domain::Backend));
        s.enqueue(task(2, Domain::Backend)); // skipped: same domain as #1
        s.enqueue(task(3, Domain::Frontend)); // admitted past #2

        let admitted = s.fill_slots();
        assert_eq!(
            admitted.iter().map(|t| t.issue_number).collect::<Vec<_>>(),
            vec![1, 3]
        );

        // #2 is still first in line once #1 frees its slot.
        assert!(s.complete(1, true));
        let admitted = s.fill_slots();
        assert_eq!(admitted[0].issue_number, 2);
        assert_conservation(&s);
    }

    #[test]
    fn fifo_within_compatibility() {
        let mut s = Scheduler::new(2);
        s.enqueue(task(1, Domain::Backend));
        s.enqueue(task(2, Domain::Frontend));
        s.enqueue(task(3, Domain::Testing));

        // Both compatible; the earlier-queued task is admitted first and the
        // pass stops when slots run out.
        let admitted = s.fill_slots();
        assert_eq!(
            admitted.iter().map(|t| t.issue_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(s.status().queued, 1);
    }

    #[test]
    fn complete_unknown_issue_is_a_noop() {
        let mut s = Scheduler::new(2);
        s.enqueue(task(1, Domain::Backend));
        s.fill_slots();

        let before = s.status();
        assert!(!s.complete(999, true));
        let after = s.status();
        assert_eq!(before.running, after.running);
        assert_eq!(before.completed, after.completed);
        assert_conservation(&s);
    }

    #[test]
    fn running_set_is_always_pairwise_compatible() {
        let mut s = Scheduler::new(3);
        for (n, d) in [
            (1, Domain::Backend),
            (2, Domain::Backend),
            (3, Domain::Database),
            (4, Domain::Frontend),
            (5, Domain::Unknown),
            (6, Domain::Testing),
        ] {
            s.enqueue(task(n, d));
        }
        loop {
            s.fill_slots();
            let running = s.running_tasks();
            for a in &running {
                for b in &running {
                    if a.issue_number != b.issue_number {
                        assert!(
                            are_domains_compatible(a.domain, b.domain),
                            "#{} ({}) and #{} ({}) running together",
                            a.issue_number,
                            a.domain,
                            b.issue_number,
                            b.domain
                        );
                    }
                }
            }
            assert_conservation(&s);
            let Some(first) = running.first().map(|t| t.issue_number) else {
                break;
            };
            s.complete(first, true);
        }
        assert!(s.is_complete());
        assert_eq!(s.status().completed, 6);
    }

    #[test]
    fn summary_computes_success_rate() {
        let mut s = Scheduler::new(3);
        s.enqueue(task(1, Domain::Backend));
        s.enqueue(task(2, Domain::Frontend));
        s.fill_slots();
        s.complete(1, true);
        s.complete(2, false);

        let summary = s.summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.success_rate, 50.0);
    }

    #[test]
    fn empty_summary_has_zero_rate() {
        let s = Scheduler::new(1);
        assert_eq!(s.summary().success_rate, 0.0);
    }

    #[test]
    fn single_task_lifecycle() {
        let mut s = Scheduler::new(3);
        s.enqueue(task(1, Domain::Backend));
        let admitted = s.fill_slots();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].status, TaskStatus::Running);
        assert!(s.has_work());

        assert!(s.complete(1, true));
        assert!(s.is_complete());
        let summary = s.summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.success_rate, 100.0);
    }
}
