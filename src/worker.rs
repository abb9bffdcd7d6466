//! Worker kinds and the Pool that spawns, signals, and reconciles them
//! against configured targets (§4.4).
//!
//! Grounded on the `Child`/`ChildSpec` composition style of
//! `airssys_rt::supervisor::types`, adapted from an async actor-restart model
//! to a synchronous fork-based one: `Pool::spawn` calls `nix::unistd::fork`
//! directly rather than handing a spec to a runtime.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::Utc;
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid};
use tracing::{debug, info, warn};

// Layer 3: Internal module imports
use crate::backoff::BackoffGovernor;
use crate::error::{ForemanError, ForemanResult};
use crate::hooks::HookSet;
use crate::queue_group::QueueGroup;
use crate::registry::{Registry, WorkerRecord};
use crate::signals;

/// A unit of work a forked child runs instead of returning to the master's
/// control loop (§4.4 "Default worker kind" expansion).
///
/// Implementors must treat `work` as the entire lifetime of the child: once
/// it returns, the child process exits. Long-running implementations are
/// expected to loop internally, polling `poll_interval` between units.
pub trait Worker: Send {
    /// Run the worker body. Returns when the worker should exit cleanly.
    fn work(&mut self, poll_interval: Duration) -> ForemanResult<()>;

    /// How long the child should wait between units of work when no work is
    /// immediately available.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// How long `term_child` should wait for a graceful exit before the
    /// worker is escalated to SIGKILL by the caller's shutdown policy
    /// (§6 `RESQUE_TERM_TIMEOUT`, default 4.0 seconds).
    fn term_timeout(&self) -> Duration {
        Duration::from_millis(4_000)
    }
}

/// Case-insensitive truthy-string parse for boolean environment variables
/// that are not simply "set or unset" (§6 `RESQUE_SINGLE_PGRP`).
fn is_truthy_env(var: &str) -> bool {
    const TRUTHY: &[&str] = &["yes", "y", "true", "t", "1", "okay", "sure", "please"];
    std::env::var(var)
        .map(|raw| TRUTHY.contains(&raw.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Read a duration from an environment variable holding a floating-point
/// seconds value (§6 `INTERVAL`, `RESQUE_TERM_TIMEOUT`), falling back to
/// `default_secs` when unset or unparseable.
fn env_duration_secs_f64(var: &str, default_secs: f64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or_else(|| Duration::from_secs_f64(default_secs))
}

/// Opaque unit of work handed to `DefaultWorker`. Defined as a callback
/// rather than a trait object bound to external job-queue semantics, since
/// this crate supervises queue-backed workers without prescribing the queue
/// backend (§4.4 expansion: "opaque `JobExecutor` callback").
pub type JobExecutor = Box<dyn FnMut(&QueueGroup) -> ForemanResult<()> + Send>;

/// The worker kind used when a QueueGroup names no explicit kind prefix
/// (§6). Polls `executor` in a loop, sleeping `poll_interval` between calls
/// when the executor reports no work was available.
pub struct DefaultWorker {
    queue_group: QueueGroup,
    executor: JobExecutor,
    poll_interval: Duration,
    term_timeout: Duration,
}

impl DefaultWorker {
    /// `poll_interval` and `term_timeout` default from `$INTERVAL` and
    /// `$RESQUE_TERM_TIMEOUT` (§6), read once at construction; either can
    /// still be overridden explicitly via the `with_*` builders.
    pub fn new(queue_group: QueueGroup, executor: JobExecutor) -> Self {
        Self {
            queue_group,
            executor,
            poll_interval: env_duration_secs_f64("INTERVAL", 5.0),
            term_timeout: env_duration_secs_f64("RESQUE_TERM_TIMEOUT", 4.0),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_term_timeout(mut self, timeout: Duration) -> Self {
        self.term_timeout = timeout;
        self
    }
}

impl Worker for DefaultWorker {
    fn work(&mut self, poll_interval: Duration) -> ForemanResult<()> {
        loop {
            (self.executor)(&self.queue_group)?;
            std::thread::sleep(poll_interval);
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn term_timeout(&self) -> Duration {
        self.term_timeout
    }
}

/// Constructs a `Worker` for a given QueueGroup and worker-kind name (the
/// part before `:` in the group string, §6). Registered once at startup and
/// frozen before `Master::start` forks its first child.
pub type WorkerFactory = Box<dyn Fn(&QueueGroup) -> ForemanResult<Box<dyn Worker>> + Send + Sync>;

#[derive(Default)]
pub struct WorkerKindRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl WorkerKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `kind`. A QueueGroup with no `kind:` prefix
    /// uses the factory registered under `"default"`.
    pub fn register(&mut self, kind: impl Into<String>, factory: WorkerFactory) {
        self.factories.insert(kind.into(), factory);
    }

    fn build(&self, queue_group: &QueueGroup) -> ForemanResult<Box<dyn Worker>> {
        let kind = queue_group.kind().unwrap_or("default");
        let factory = self.factories.get(kind).ok_or_else(|| {
            ForemanError::unknown_worker_kind(kind, queue_group.as_str())
        })?;
        factory(queue_group)
    }
}

/// Composes the Registry, per-QueueGroup backoff state, and the worker-kind
/// registry into the single collaborator `Master` drives each loop iteration
/// (§4.4).
pub struct Pool {
    registry: Registry,
    backoff: HashMap<QueueGroup, BackoffGovernor>,
    kinds: WorkerKindRegistry,
    delay_step: Duration,
    delay_max: Duration,
    single_process_group: bool,
    run_at_exit_hooks: bool,
}

impl Pool {
    pub fn new(kinds: WorkerKindRegistry, delay_step: Duration, delay_max: Duration) -> Self {
        Self {
            registry: Registry::new(),
            backoff: HashMap::new(),
            kinds,
            delay_step,
            delay_max,
            single_process_group: is_truthy_env("RESQUE_SINGLE_PGRP"),
            run_at_exit_hooks: is_truthy_env("RUN_AT_EXIT_HOOKS"),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    fn governor_mut(&mut self, queue_group: &QueueGroup) -> &mut BackoffGovernor {
        self.backoff
            .entry(queue_group.clone())
            .or_insert_with(|| BackoffGovernor::new(self.delay_step, self.delay_max))
    }

    /// Fork one worker for `queue_group`. The parent records the new pid;
    /// the child runs prefork hooks, restores default signal dispositions,
    /// joins a fresh process group (unless `RESQUE_SINGLE_PGRP` is set), and
    /// then blocks forever inside `Worker::work` — it never returns to this
    /// function on the child side.
    pub fn spawn(&mut self, queue_group: &QueueGroup, hooks: &HookSet) -> ForemanResult<()> {
        let mut worker = self.kinds.build(queue_group)?;

        // SAFETY: the master is single-threaded at the point every `spawn`
        // call happens (only `Master::join`'s control loop calls this); no
        // other thread can observe the fork mid-flight.
        match unsafe { nix::unistd::fork() } {
            Ok(ForkResult::Parent { child }) => {
                self.registry.insert(WorkerRecord {
                    pid: child,
                    queue_group: queue_group.clone(),
                    kind: queue_group.kind().unwrap_or("default").to_string(),
                    spawned_at: Utc::now(),
                });
                info!(pid = child.as_raw(), queue_group = %queue_group, "spawned worker");
                Ok(())
            }
            Ok(ForkResult::Child) => {
                if !self.single_process_group {
                    let _ = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));
                }
                if let Err(e) = signals::restore_defaults() {
                    warn!(error = %e, "failed to restore default signal dispositions in child");
                }
                hooks.run_after_prefork(queue_group);

                let interval = worker.poll_interval();
                if let Err(e) = worker.work(interval) {
                    warn!(queue_group = %queue_group, error = %e, "worker exited with error");
                }
                if self.run_at_exit_hooks {
                    hooks.run_at_exit(queue_group);
                }
                std::process::exit(0);
            }
            Err(errno) => Err(ForemanError::fork_failed(queue_group.as_str(), errno.to_string())),
        }
    }

    /// Signal every tracked worker with `signal`, best-effort (§4.4).
    pub fn signal_all(&self, signal: Signal) {
        for pid in self.registry.all_pids() {
            if let Err(e) = nix::sys::signal::kill(pid, signal) {
                debug!(pid = pid.as_raw(), signal = ?signal, error = %e, "signal delivery failed");
            }
        }
    }

    /// Signal every tracked worker of `queue_group` with `signal`.
    pub fn signal_queue_group(&self, queue_group: &QueueGroup, signal: Signal) {
        for pid in self.registry.pids(queue_group) {
            if let Err(e) = nix::sys::signal::kill(pid, signal) {
                debug!(pid = pid.as_raw(), signal = ?signal, error = %e, "signal delivery failed");
            }
        }
    }

    /// How many workers of `queue_group` to spawn (positive) or quit
    /// (negative) to reach `target`, clamped to zero when the QueueGroup's
    /// backoff governor currently forbids spawning (§4.1, §9 resolved Open
    /// Question: locality is strictly per-QueueGroup — one group's backoff
    /// never throttles another's reconciliation).
    pub fn delta(&mut self, queue_group: &QueueGroup, target: usize) -> isize {
        let current = self.registry.worker_count(queue_group) as isize;
        let mut delta = target as isize - current;

        if delta > 0 {
            let now = Utc::now();
            let permits = self.governor_mut(queue_group).should_spawn(now);
            if !permits {
                delta = 0;
            }
        }

        delta
    }

    /// Apply `delta(queue_group, target)` by spawning or quitting the
    /// difference. Quits always target the oldest-inserted workers first
    /// (§4.4, matching `Registry::pids`'s insertion-ordered view).
    ///
    /// A spawn failure (unknown worker kind, or a transient `fork()` error)
    /// is logged and skipped rather than propagated (§7): one bad
    /// queue-group or one `EAGAIN` must not stop the master from
    /// reconciling the rest of its queue-groups, nor the rest of this one's
    /// shortfall, on the next loop iteration.
    pub fn reconcile(&mut self, queue_group: &QueueGroup, target: usize, hooks: &HookSet) {
        let delta = self.delta(queue_group, target);

        if delta > 0 {
            for _ in 0..delta {
                if let Err(e) = self.spawn(queue_group, hooks) {
                    warn!(queue_group = %queue_group, error = %e, "spawn skipped");
                }
            }
        } else if delta < 0 {
            let pids = self.registry.pids(queue_group);
            for pid in pids.into_iter().take((-delta) as usize) {
                if let Err(e) = nix::sys::signal::kill(pid, Signal::SIGQUIT) {
                    debug!(pid = pid.as_raw(), error = %e, "quit signal delivery failed during scale-down");
                }
            }
        }
    }

    /// Feed a reap outcome into each affected QueueGroup's backoff governor
    /// (§4.1 integration rule): a record that died younger than `delay_step`
    /// counts as a failure; otherwise the governor resets.
    pub fn observe_reaped(&mut self, reaped: &HashMap<QueueGroup, Vec<chrono::DateTime<Utc>>>) {
        let now = Utc::now();
        for (queue_group, spawn_times) in reaped {
            let too_young = spawn_times.iter().any(|spawned_at| {
                let age = now.signed_duration_since(*spawned_at);
                let threshold = self.delay_step.as_secs() as i64;
                age.num_seconds() < threshold
            });

            let governor = self.governor_mut(queue_group);
            if too_young {
                governor.delay_spawns(now);
                warn!(queue_group = %queue_group, failed_count = governor.failed_count(), "backoff engaged: worker died too young");
            } else {
                governor.reset();
            }
        }
    }
}
