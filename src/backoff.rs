//! Per-queue-group exponential backoff, preventing fork storms.
//!
//! Grounded on the restart-rate-limiting design of
//! `airssys_rt::supervisor::backoff::RestartBackoff`, but reshaped to the
//! exact contract this spec requires: a `{failed_count, delay_until}` pair
//! gated by `should_spawn()`/`delay_spawns()`/`reset()`, with the formula
//! `delay_step.pow(failed_count)` clamped to `delay_max` (§4.1, §9 "Exponential
//! base" — the coarse `10, 100, 1000, …` schedule is intentional and must be
//! preserved exactly, not smoothed into a `2^n` curve).

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};

// Layer 3: Internal module imports
// (none)

/// Default exponential base and "too young to count as progress" threshold,
/// in seconds (`DELAY_SPAWN_LIMIT`, §6).
pub const DEFAULT_DELAY_STEP_SECS: u64 = 10;

/// Default clamp on the computed delay, in seconds (`DELAY_SPAWN_MAX`, §6).
pub const DEFAULT_DELAY_MAX_SECS: u64 = 600;

/// Exponential-backoff gate for a single QueueGroup.
///
/// Created lazily on first reference to a QueueGroup and discarded once a
/// reap confirms the QueueGroup is healthy again (§3, §4.1 integration rule).
#[derive(Debug, Clone)]
pub struct BackoffGovernor {
    delay_step: Duration,
    delay_max: Duration,
    failed_count: u32,
    delay_until: Option<DateTime<Utc>>,
}

impl BackoffGovernor {
    /// Create a governor with the given `delay_step` (exponential base, and
    /// the "too young" threshold used by the reaper's integration rule) and
    /// `delay_max` clamp.
    pub fn new(delay_step: Duration, delay_max: Duration) -> Self {
        Self {
            delay_step,
            delay_max,
            failed_count: 0,
            delay_until: None,
        }
    }

    /// The `delay_step` this governor was configured with. Exposed so the
    /// reaper's integration rule (§4.1) can compare a reaped record's age
    /// against the same threshold used for the exponential base.
    pub fn delay_step(&self) -> Duration {
        self.delay_step
    }

    /// `true` iff no delay is in effect, or the delay has elapsed.
    pub fn should_spawn(&self, now: DateTime<Utc>) -> bool {
        match self.delay_until {
            None => true,
            Some(until) => now >= until,
        }
    }

    /// Record that a batch reap found at least one child of this QueueGroup
    /// that died "too young" (§4.1). Bumps `failed_count` and recomputes
    /// `delay_until = now + min(delay_step ^ failed_count, delay_max)`.
    pub fn delay_spawns(&mut self, now: DateTime<Utc>) {
        self.failed_count += 1;

        let step_secs = self.delay_step.as_secs().max(1);
        let delay_secs = step_secs.saturating_pow(self.failed_count);
        let clamped_secs = delay_secs.min(self.delay_max.as_secs());

        let delay = chrono::Duration::seconds(clamped_secs as i64);
        self.delay_until = Some(now + delay);
    }

    /// Clear failed-count and the active delay. Called when a reap shows the
    /// QueueGroup is healthy (oldest reaped record lived `>= delay_step`).
    pub fn reset(&mut self) {
        self.failed_count = 0;
        self.delay_until = None;
    }

    /// Number of consecutive "too young" reaps recorded so far.
    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    /// The timestamp spawning is gated until, if any.
    pub fn delay_until(&self) -> Option<DateTime<Utc>> {
        self.delay_until
    }
}

impl Default for BackoffGovernor {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_DELAY_STEP_SECS),
            Duration::from_secs(DEFAULT_DELAY_MAX_SECS),
        )
    }
}
