//! Management plane: worker identity, control/update messages, the
//! channel codec over broker tubes, and the fleet-side manager.

mod channel;
mod manager;
mod messages;

pub use channel::MgmtChannel;
pub use manager::{JobRun, WorkerManager, WorkerStatus};
pub use messages::{JobAction, MemInfo, MgmtMsg};

use std::fmt;
use std::str::FromStr;

/// Shared tube carrying `job` and `info` messages from every worker.
pub const UPDATES_CHANNEL_NAME: &str = "updates";

/// Worker type tag carried in every worker id.
pub const WORKER_TYPE: &str = "zerog";

/// Delimiter inside a canonical worker id. Deliberately not a character
/// that appears in hostnames, service names, or pids.
const DELIM: &str = "+$";

/// Canonical identity of one server/worker pair across the fleet; also the
/// name of its control tube.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub worker_type: String,
    pub host: String,
    pub service_name: String,
    pub pid: u32,
}

impl WorkerId {
    pub fn new(worker_type: &str, host: &str, service_name: &str, pid: u32) -> Self {
        Self {
            worker_type: worker_type.to_string(),
            host: host.to_string(),
            service_name: service_name.to_string(),
            pid,
        }
    }

    /// Parse a canonical id string; `None` for anything ill-formed.
    pub fn parse(worker_id: &str) -> Option<Self> {
        let parts: Vec<&str> = worker_id.split(DELIM).collect();
        let [worker_type, host, service_name, pid] = parts.as_slice() else {
            return None;
        };
        let pid = pid.parse().ok()?;
        Some(Self::new(worker_type, host, service_name, pid))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{DELIM}{}{DELIM}{}{DELIM}{}",
            self.worker_type, self.host, self.service_name, self.pid
        )
    }
}

impl FromStr for WorkerId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}
