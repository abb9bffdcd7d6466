//! End-to-end scenarios from §8: real `fork()`/`waitpid()` cycles driven
//! through `Pool`/`Registry`, exercising the actual OS primitives rather
//! than mocking them (matching the spec's own scenario descriptions, which
//! are stated in terms of real process lifecycles).

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use foreman::registry::ReapMode;
use foreman::{DefaultWorker, ForemanError, HookSet, Pool, QueueGroup, Worker, WorkerKindRegistry};

/// A worker that blocks until signaled, for scenarios that need to observe
/// live children before they exit.
fn blocking_kinds() -> WorkerKindRegistry {
    let mut kinds = WorkerKindRegistry::new();
    kinds.register(
        "default",
        Box::new(|queue_group| {
            let queue_group = queue_group.clone();
            let worker = DefaultWorker::new(queue_group, Box::new(|_| Ok(())))
                .with_poll_interval(Duration::from_secs(30));
            Ok(Box::new(worker) as Box<dyn Worker>)
        }),
    );
    kinds
}

/// A worker whose executor fails immediately, so the child exits well
/// inside any reasonable `delay_step` window ("too young", §4.1).
fn quick_exit_kinds() -> WorkerKindRegistry {
    let mut kinds = WorkerKindRegistry::new();
    kinds.register(
        "default",
        Box::new(|queue_group| {
            let queue_group = queue_group.clone();
            let worker = DefaultWorker::new(
                queue_group,
                Box::new(|_| Err(ForemanError::process_error("worker", 0, "one-shot exit"))),
            )
            .with_poll_interval(Duration::from_millis(1));
            Ok(Box::new(worker) as Box<dyn Worker>)
        }),
    );
    kinds
}

/// A worker that lives noticeably longer than one `delay_step` before
/// exiting, for the "governor clearance" scenario (§8). Each call to the
/// executor is followed by a `poll_interval` sleep (inside `work`'s loop)
/// unless it errors, so returning `Ok` twice before erroring keeps the
/// child alive for roughly `2 * poll_interval`.
fn long_lived_then_exit_kinds() -> WorkerKindRegistry {
    let mut kinds = WorkerKindRegistry::new();
    kinds.register(
        "default",
        Box::new(|queue_group| {
            let queue_group = queue_group.clone();
            let mut calls = 0u32;
            let worker = DefaultWorker::new(
                queue_group,
                Box::new(move |_| {
                    calls += 1;
                    if calls <= 2 {
                        Ok(())
                    } else {
                        Err(ForemanError::process_error("worker", 0, "exit after living a while"))
                    }
                }),
            )
            .with_poll_interval(Duration::from_millis(700));
            Ok(Box::new(worker) as Box<dyn Worker>)
        }),
    );
    kinds
}

#[test]
fn scaling_up_spawns_exactly_the_configured_count() {
    let mut pool = Pool::new(blocking_kinds(), Duration::from_secs(10), Duration::from_secs(600));
    let hooks = HookSet::new();
    let queue_group = QueueGroup::new("a,b");

    pool.reconcile(&queue_group, 2, &hooks);
    assert_eq!(pool.registry().worker_count(&queue_group), 2);

    for pid in pool.registry().pids(&queue_group) {
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
    }
    let quit_now = AtomicBool::new(false);
    pool.registry_mut().reap(ReapMode::BlockingUntilEmpty, &quit_now);
    assert_eq!(pool.registry().worker_count(&queue_group), 0);
}

#[test]
fn scaling_down_quits_the_oldest_inserted_workers_first() {
    let mut pool = Pool::new(blocking_kinds(), Duration::from_secs(10), Duration::from_secs(600));
    let hooks = HookSet::new();
    let queue_group = QueueGroup::new("q");

    pool.reconcile(&queue_group, 3, &hooks);
    let oldest_two: Vec<_> = pool.registry().pids(&queue_group).into_iter().take(2).collect();

    pool.reconcile(&queue_group, 1, &hooks);

    let quit_now = AtomicBool::new(false);
    let outcome = pool.registry_mut().reap(ReapMode::BlockingUntilEmpty, &quit_now);

    // The 2 oldest pids should have been asked to quit and reaped; the
    // remaining one is still alive, so a full drain requires killing it too.
    let reaped_pids_count: usize = outcome.reaped.values().map(Vec::len).sum();
    assert_eq!(reaped_pids_count, 2);
    assert_eq!(pool.registry().worker_count(&queue_group), 1);

    for pid in pool.registry().pids(&queue_group) {
        assert!(!oldest_two.contains(&pid));
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
    }
    pool.registry_mut().reap(ReapMode::BlockingUntilEmpty, &quit_now);
}

#[test]
fn backoff_engages_after_children_die_too_young() {
    let delay_step = Duration::from_secs(1);
    let mut pool = Pool::new(quick_exit_kinds(), delay_step, Duration::from_secs(10));
    let hooks = HookSet::new();
    let queue_group = QueueGroup::new("x");

    pool.reconcile(&queue_group, 3, &hooks);

    let quit_now = AtomicBool::new(false);
    let outcome = pool.registry_mut().reap(ReapMode::BlockingUntilEmpty, &quit_now);
    assert!(!outcome.reaped.is_empty());

    pool.observe_reaped(&outcome.reaped);

    // All 3 died within well under 1 second; the next reconcile must not
    // spawn replacements immediately.
    assert_eq!(pool.delta(&queue_group, 3), 0);
}

#[test]
fn governor_clears_after_a_healthy_reap() {
    let delay_step = Duration::from_millis(500);
    let mut pool = Pool::new(long_lived_then_exit_kinds(), delay_step, Duration::from_secs(10));
    let hooks = HookSet::new();
    let queue_group = QueueGroup::new("y");

    pool.reconcile(&queue_group, 1, &hooks);

    let quit_now = AtomicBool::new(false);
    let outcome = pool.registry_mut().reap(ReapMode::BlockingUntilEmpty, &quit_now);
    assert!(!outcome.reaped.is_empty());

    pool.observe_reaped(&outcome.reaped);

    // The worker lived well past `delay_step` (1200ms poll tick vs 500ms
    // step), so the governor should have reset and spawning is permitted.
    assert_eq!(pool.delta(&queue_group, 1), 1);
}
