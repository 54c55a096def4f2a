//! Job model: persisted state, audit trails, progress reporting, and the
//! handler trait that business logic implements.

mod base;
mod events;

pub use base::{make_key, Job, JobData, JobInfo, Progress};
pub use events::{ErrorEntry, Event, WarningEntry};

use async_trait::async_trait;

/// Result code meaning "not finished"; the worker re-enqueues the job.
pub const NO_RESULT: i64 = -1;

/// Result code recorded for unrecoverable failures.
pub const INTERNAL_ERROR: i64 = 500;

/// Result code recorded when an operator kills a running job.
pub const KILLED_BY_USER: i64 = 410;

/// Error retries recorded on a job before it is finished as failed.
pub const MAX_ERRORS: i64 = 3;

/// Storage key namespace, fixed per deployment.
pub const DOCUMENT_TYPE: &str = "zerog_job";

/// Lease duration for enqueued jobs when the caller does not pick one.
/// Thirty days: expiry means something has gone badly wrong.
pub const DEFAULT_TTR: u64 = 3600 * 24 * 30;

/// What a job run reports back to the worker.
///
/// The error/warning variants are flow control, not failures: the audit
/// entry has already been recorded by the [`Job`] helper that produced the
/// variant, and the worker decides between retry and termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal result code, or [`NO_RESULT`] to requeue after the default
    /// delay.
    Done(i64),
    /// Result code plus an explicit requeue delay in seconds.
    DoneAfter(i64, u64),
    /// Error recorded; retry subject to [`Job::continue_running`].
    ErrorContinue,
    /// Error recorded and the job already finished terminally.
    ErrorFinish,
    /// Warning recorded; retry subject to [`Job::continue_running`].
    WarningContinue,
    /// Warning recorded and the job already finished terminally.
    WarningFinish,
}

/// The unit of business logic dispatched by a worker.
///
/// Implementations are registered with a [`crate::JobRegistry`] and
/// rehydrated from the persisted job document; progress and audit entries
/// are recorded through the [`Job`] passed to `run`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job. Runs under an at-least-once contract: a crashed or
    /// timed-out run is leased again by another worker, so side effects
    /// must tolerate re-execution.
    async fn run(&mut self, job: &mut Job) -> anyhow::Result<Outcome>;
}

/// Lease-refresh hook a worker installs on the job it is running.
#[async_trait]
pub trait KeepAlive: Send + Sync {
    async fn ping(&self);
}
