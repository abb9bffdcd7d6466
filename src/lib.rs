//! `foreman` — a worker-pool supervisor for queue-backed background jobs.
//!
//! The master process forks and reaps queue-group-bound worker children,
//! reconfigures on signal, and throttles respawns per queue-group with
//! exponential backoff. See `SPEC_FULL.md` in the repository root for the
//! full component design this crate implements.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod queue_group;
pub mod registry;
pub mod selfpipe;
pub mod signals;
pub mod worker;

pub mod master;

pub use backoff::BackoffGovernor;
pub use config::{Configuration, ConfigLoader, FileConfigLoader};
pub use error::{ForemanError, ForemanResult};
pub use hooks::HookSet;
pub use master::{Master, ShutdownPolicy};
pub use queue_group::QueueGroup;
pub use registry::{Registry, WorkerRecord};
pub use worker::{DefaultWorker, JobExecutor, Pool, Worker, WorkerKindRegistry};
