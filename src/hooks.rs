//! Ordered hook registration (§4.4, §4.6): `after_prefork` hooks run in a
//! freshly forked child before it starts working; `poll` hooks run on the
//! master once per control-loop iteration, with the master itself as their
//! argument; `at_exit` hooks run in the child after `Worker::work` returns,
//! when `$RUN_AT_EXIT_HOOKS` opts in (§6). All three are frozen once
//! `Master` starts — registering a hook after startup is a programmer
//! error, not a runtime condition to recover from.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use tracing::warn;

// Layer 3: Internal module imports
use crate::error::ForemanResult;
use crate::master::Master;
use crate::queue_group::QueueGroup;

type AfterPreforkHook = Box<dyn Fn(&QueueGroup) + Send + Sync>;
type AtExitHook = Box<dyn Fn(&QueueGroup) + Send + Sync>;
/// A poll hook receives the master itself (§4.5 step 2, §GLOSSARY
/// `poll(master)`): hooks are opaque, and a failing one is reported but
/// non-fatal, never allowed to unwind the control loop.
type PollHook = Box<dyn Fn(&Master) -> ForemanResult<()> + Send + Sync>;

/// The hooks a `Master` runs at fixed points in its lifecycle, in
/// registration order.
#[derive(Default)]
pub struct HookSet {
    after_prefork: Vec<AfterPreforkHook>,
    poll: Vec<PollHook>,
    at_exit: Vec<AtExitHook>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook to run, in the freshly forked child, after signal
    /// dispositions are restored and before `Worker::work` is invoked.
    pub fn on_after_prefork(&mut self, hook: AfterPreforkHook) {
        self.after_prefork.push(hook);
    }

    /// Register a hook to run on the master once per steady-state loop
    /// iteration (§4.5's `poll_hooks` step), regardless of which signal (if
    /// any) woke the loop. A hook that returns `Err` is logged and skipped;
    /// it never aborts the iteration.
    pub fn on_poll(&mut self, hook: PollHook) {
        self.poll.push(hook);
    }

    /// Register a hook to run in the child, after `Worker::work` returns and
    /// before the child calls `exit(0)`. Only invoked when `$RUN_AT_EXIT_HOOKS`
    /// is truthy (§6) — a worker kind "supports" this by registering one.
    pub fn on_at_exit(&mut self, hook: AtExitHook) {
        self.at_exit.push(hook);
    }

    pub(crate) fn run_after_prefork(&self, queue_group: &QueueGroup) {
        for hook in &self.after_prefork {
            hook(queue_group);
        }
    }

    pub(crate) fn run_poll(&self, master: &Master) {
        for hook in &self.poll {
            if let Err(e) = hook(master) {
                warn!(error = %e, "poll hook failed");
            }
        }
    }

    pub(crate) fn run_at_exit(&self, queue_group: &QueueGroup) {
        for hook in &self.at_exit {
            hook(queue_group);
        }
    }
}
