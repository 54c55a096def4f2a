//! Job infrastructure for supervised background execution.
//!
//! This crate provides the core of the zerog job-processing system:
//! - [`Datastore`] - Key/value persistence with compare-and-swap writes
//! - [`WorkQueue`] - Tube-based lease broker (beanstalkd semantics)
//! - [`Job`] - Job model with audit trails and optimistic-concurrency saves
//! - [`JobRegistry`] - Maps job type strings to handler factories
//! - [`Worker`] - Child process that leases jobs and runs them
//! - [`Server`] - Parent process that supervises one worker
//! - [`mgmt`] - Control/updates channels and the fleet-side manager
//!
//! # Architecture
//!
//! ```text
//! Server (parent process)
//!     │
//!     ├─► spawns Worker (child process, piped stdio)
//!     ├─► polls worker frames + per-instance control tube
//!     └─► publishes job/info messages on the shared updates tube
//!
//! Worker
//!     │
//!     ├─► reserve from {service}_jobs tube
//!     ├─► load job via JobRegistry (datastore read + CAS)
//!     ├─► run the job, persisting progress as it goes
//!     └─► delete/re-enqueue the lease, then exit for a fresh respawn
//! ```
//!
//! Business logic lives in [`JobHandler`] implementations registered by the
//! embedding service. This crate only provides the infrastructure.

pub mod config;
pub mod datastore;
pub mod jobs;
pub mod mgmt;
pub mod pipe;
pub mod queue;
pub mod registry;
pub mod server;
pub mod worker;

pub use config::Config;
pub use datastore::{Datastore, DatastoreError, MemoryDatastore, RetryDatastore};
pub use jobs::{
    Job, JobData, JobHandler, Outcome, DEFAULT_TTR, INTERNAL_ERROR, KILLED_BY_USER, MAX_ERRORS,
    NO_RESULT,
};
pub use mgmt::{MgmtChannel, MgmtMsg, WorkerId, WorkerManager, UPDATES_CHANNEL_NAME};
pub use queue::{JobStats, MemoryBroker, QueueError, ReservedJob, WorkQueue};
pub use registry::{JobFactory, JobRegistry, RegistrationError};
pub use server::{Server, ServerState};
pub use worker::Worker;
