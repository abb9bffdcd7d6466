//! Worker Registry: the in-memory map from QueueGroup to live children (§3,
//! §4.4), plus the sole-reaper primitive built directly on `waitpid(2)`.
//!
//! Grounded on the child-bookkeeping shape of `airssys_rt::supervisor::types`
//! (`ChildHandle`, `ChildId`) but keyed by OS pid rather than a generated
//! UUID, since the spec's uniqueness invariant (§8.1) is specifically
//! "no pid appears in two QueueGroup buckets".

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

// Layer 3: Internal module imports
use crate::queue_group::QueueGroup;

/// Per-live-child metadata (§3).
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub pid: Pid,
    pub queue_group: QueueGroup,
    pub kind: String,
    pub spawned_at: DateTime<Utc>,
}

/// The in-memory mapping `QueueGroup -> { pid -> WorkerRecord }`.
///
/// Insertion order within a QueueGroup's bucket is preserved (a `Vec`, not a
/// `HashMap`), because `reconcile()` quits the oldest-inserted pids first
/// (§4.4) and the scaling-down-via-HUP scenario (§8) asserts on that order.
#[derive(Debug, Default)]
pub struct Registry {
    buckets: HashMap<QueueGroup, Vec<WorkerRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly spawned worker. Panics in debug builds if the pid is
    /// already tracked under some other (or the same) QueueGroup, which would
    /// violate the uniqueness invariant (§8.1) — that would indicate a bug
    /// in the reaper, not a condition callers should route around.
    pub fn insert(&mut self, record: WorkerRecord) {
        debug_assert!(
            self.find_queue_group(record.pid).is_none(),
            "pid {} already tracked in registry",
            record.pid
        );
        self.buckets
            .entry(record.queue_group.clone())
            .or_default()
            .push(record);
    }

    /// Number of live workers currently tracked for `queue_group`.
    pub fn worker_count(&self, queue_group: &QueueGroup) -> usize {
        self.buckets.get(queue_group).map_or(0, Vec::len)
    }

    /// Pids for `queue_group` in insertion order (oldest first).
    pub fn pids(&self, queue_group: &QueueGroup) -> Vec<Pid> {
        self.buckets
            .get(queue_group)
            .map(|records| records.iter().map(|r| r.pid).collect())
            .unwrap_or_default()
    }

    /// Every pid currently tracked, across all queue groups.
    pub fn all_pids(&self) -> Vec<Pid> {
        self.buckets
            .values()
            .flat_map(|records| records.iter().map(|r| r.pid))
            .collect()
    }

    /// Every QueueGroup with at least one live worker.
    pub fn queue_groups(&self) -> impl Iterator<Item = &QueueGroup> {
        self.buckets.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }

    fn find_queue_group(&self, pid: Pid) -> Option<&QueueGroup> {
        self.buckets
            .iter()
            .find(|(_, records)| records.iter().any(|r| r.pid == pid))
            .map(|(qg, _)| qg)
    }

    /// Remove and return the record for `pid`, wherever it lives. Returns
    /// `None` if the pid was never tracked (e.g. already reaped).
    fn remove_by_pid(&mut self, pid: Pid) -> Option<WorkerRecord> {
        for records in self.buckets.values_mut() {
            if let Some(idx) = records.iter().position(|r| r.pid == pid) {
                return Some(records.remove(idx));
            }
        }
        None
    }
}

/// How far a reap pass should go (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapMode {
    /// Reap everything immediately reapable, then return.
    NonBlocking,
    /// Block until the Registry is fully drained, honoring the quit-now
    /// escape (§4.3, §5).
    BlockingUntilEmpty,
}

/// Result of one `reap()` call: which QueueGroups lost workers and when those
/// workers were spawned (fed into the Backoff Governor integration rule,
/// §4.1), plus whether a blocking reap was cut short by quit-now.
#[derive(Debug, Default)]
pub struct ReapOutcome {
    pub reaped: HashMap<QueueGroup, Vec<DateTime<Utc>>>,
    pub aborted: bool,
}

impl Registry {
    /// Reap exited children. In `NonBlocking` mode, returns as soon as no
    /// more children are immediately reapable. In `BlockingUntilEmpty` mode,
    /// blocks until every tracked pid has been reaped, unless `quit_now`
    /// transitions to `true` mid-wait (the fast-path escape from §4.3),
    /// cleared and reported back via `ReapOutcome::aborted`.
    pub fn reap(&mut self, mode: ReapMode, quit_now: &AtomicBool) -> ReapOutcome {
        let mut outcome = ReapOutcome::default();

        loop {
            if mode == ReapMode::BlockingUntilEmpty && self.is_empty() {
                break;
            }

            let flag = match mode {
                ReapMode::NonBlocking => Some(WaitPidFlag::WNOHANG),
                ReapMode::BlockingUntilEmpty => None,
            };

            match waitpid(None, flag) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    if let Some(record) = self.remove_by_pid(pid) {
                        outcome
                            .reaped
                            .entry(record.queue_group.clone())
                            .or_default()
                            .push(record.spawned_at);
                    }
                }
                Ok(WaitStatus::StillAlive) => break,
                Err(Errno::EINTR) => {
                    if mode == ReapMode::BlockingUntilEmpty && quit_now.swap(false, Ordering::SeqCst) {
                        outcome.aborted = true;
                        break;
                    }
                    continue;
                }
                Err(Errno::ECHILD) => break,
                Err(_) => break,
                Ok(_) => continue,
            }
        }

        outcome
    }
}
