//! Tube-based work queue with lease semantics.
//!
//! A handle is bound to one tube. Reserving gives time-bounded exclusive
//! possession of a body; the holder must `delete`, `release`, `bury`, or
//! `touch` it before the time-to-run expires, after which the broker
//! auto-releases it and counts a timeout against the job.

mod beanstalk;
mod memory;

pub use beanstalk::BeanstalkQueue;
pub use memory::{MemoryBroker, MemoryQueue};

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Failure kinds surfaced by a queue adapter.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connection lost and reconnect attempts exhausted.
    #[error("queue socket error: {0}")]
    Socket(String),

    /// The job id is unknown to the broker (or not held by this client).
    #[error("queue job {0} not found")]
    NotFound(u64),

    /// The broker said something this client does not understand.
    #[error("queue protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A body leased from a tube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    pub id: u64,
    pub body: String,
}

/// Broker-side statistics for one queue job.
///
/// Retry accounting in the worker relies on these counters rather than
/// anything stored on the job record, so that failures occurring before the
/// job record can even be loaded are still bounded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobStats {
    #[serde(default)]
    pub reserves: u64,
    #[serde(default)]
    pub timeouts: u64,
    #[serde(default)]
    pub releases: u64,
    #[serde(default)]
    pub state: String,
}

/// Broker-side statistics for one tube.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TubeStats {
    #[serde(default, rename = "current-watching")]
    pub current_watching: u64,
    #[serde(default, rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    #[serde(default, rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    #[serde(default, rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
}

/// One tube of a lease-based broker.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// The tube this handle produces to and consumes from.
    fn tube(&self) -> &str;

    /// Enqueue a body; visible after `delay` seconds, leased for `ttr`
    /// seconds per reservation. Returns the broker job id.
    async fn put(&self, body: &str, delay: u64, ttr: u64) -> Result<u64, QueueError>;

    /// Lease the next ready body, waiting up to `timeout` (`None` blocks).
    /// `Some(Duration::ZERO)` polls without blocking. Returns `None` when
    /// nothing became ready in time.
    async fn reserve(&self, timeout: Option<Duration>)
        -> Result<Option<ReservedJob>, QueueError>;

    /// Consume a leased body.
    async fn delete(&self, id: u64) -> Result<(), QueueError>;

    /// Return a leased body to the tube after at least `delay` seconds.
    async fn release(&self, id: u64, delay: u64) -> Result<(), QueueError>;

    /// Sideline a leased body for operator inspection.
    async fn bury(&self, id: u64) -> Result<(), QueueError>;

    /// Refresh the lease on a held body.
    async fn touch(&self, id: u64) -> Result<(), QueueError>;

    /// Broker statistics for one job.
    async fn stats_job(&self, id: u64) -> Result<JobStats, QueueError>;

    /// Join the tube's use/watch sets. Handles attach on construction; this
    /// is only needed after a `detach`.
    async fn attach(&self) -> Result<(), QueueError>;

    /// Leave the tube's use/watch sets so the broker can collect the tube.
    async fn detach(&self) -> Result<(), QueueError>;

    /// Every tube known to the broker.
    async fn list_tubes(&self) -> Result<Vec<String>, QueueError>;

    /// Statistics for an arbitrary tube.
    async fn stats_tube(&self, tube: &str) -> Result<TubeStats, QueueError>;
}
