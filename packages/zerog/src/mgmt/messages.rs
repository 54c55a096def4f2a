//! Typed management messages.
//!
//! Wire format is UTF-8 JSON tagged by `msgtype`, field names exactly as
//! they appear here after camel-casing, ISO-8601 UTC timestamps. Updates
//! (`job`, `info`) flow worker to manager; the rest are controls flowing
//! manager to worker. Absent booleans read as false; absent uuid/mem read
//! as empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Memory snapshot carried in `info` replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemInfo {
    /// System-wide available bytes.
    #[serde(default)]
    pub available: u64,
    /// Resident-set bytes of the server plus its children.
    #[serde(default)]
    pub used: u64,
}

/// Job run boundary marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Start,
    End,
}

/// Every message that crosses the management tubes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgtype", rename_all = "camelCase")]
pub enum MgmtMsg {
    /// Live job boundary, worker to updates channel.
    #[serde(rename_all = "camelCase")]
    Job {
        worker_id: String,
        timestamp: DateTime<Utc>,
        uuid: String,
        action: JobAction,
    },

    /// Worker snapshot in reply to `requestInfo`.
    #[serde(rename_all = "camelCase")]
    Info {
        worker_id: String,
        timestamp: DateTime<Utc>,
        state: String,
        #[serde(default)]
        uuid: String,
        #[serde(default)]
        mem: MemInfo,
        #[serde(default)]
        retiring: bool,
    },

    /// Ask a worker for an `info`.
    #[serde(rename_all = "camelCase")]
    RequestInfo { timestamp: DateTime<Utc> },

    /// Kill the job with this uuid, only if it is currently running.
    #[serde(rename_all = "camelCase")]
    KillJob { timestamp: DateTime<Utc>, uuid: String },

    /// Stop accepting new jobs.
    #[serde(rename_all = "camelCase")]
    Drain { timestamp: DateTime<Utc> },

    /// Resume accepting jobs, unless retiring.
    #[serde(rename_all = "camelCase")]
    Undrain { timestamp: DateTime<Utc> },

    /// Drain and set the one-way retiring flag.
    #[serde(rename_all = "camelCase")]
    Retire { timestamp: DateTime<Utc> },
}

impl MgmtMsg {
    pub fn job(worker_id: &str, uuid: &str, action: JobAction) -> Self {
        MgmtMsg::Job {
            worker_id: worker_id.to_string(),
            timestamp: Utc::now(),
            uuid: uuid.to_string(),
            action,
        }
    }

    pub fn info(worker_id: &str, state: &str, uuid: &str, mem: MemInfo, retiring: bool) -> Self {
        MgmtMsg::Info {
            worker_id: worker_id.to_string(),
            timestamp: Utc::now(),
            state: state.to_string(),
            uuid: uuid.to_string(),
            mem,
            retiring,
        }
    }

    pub fn request_info() -> Self {
        MgmtMsg::RequestInfo {
            timestamp: Utc::now(),
        }
    }

    pub fn kill_job(uuid: &str) -> Self {
        MgmtMsg::KillJob {
            timestamp: Utc::now(),
            uuid: uuid.to_string(),
        }
    }

    pub fn drain() -> Self {
        MgmtMsg::Drain {
            timestamp: Utc::now(),
        }
    }

    pub fn undrain() -> Self {
        MgmtMsg::Undrain {
            timestamp: Utc::now(),
        }
    }

    pub fn retire() -> Self {
        MgmtMsg::Retire {
            timestamp: Utc::now(),
        }
    }

    /// The wire tag for this message.
    pub fn msgtype(&self) -> &'static str {
        match self {
            MgmtMsg::Job { .. } => "job",
            MgmtMsg::Info { .. } => "info",
            MgmtMsg::RequestInfo { .. } => "requestInfo",
            MgmtMsg::KillJob { .. } => "killJob",
            MgmtMsg::Drain { .. } => "drain",
            MgmtMsg::Undrain { .. } => "undrain",
            MgmtMsg::Retire { .. } => "retire",
        }
    }
}
