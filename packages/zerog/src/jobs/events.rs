//! Append-only audit entries carried on every job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Something routine that happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub msg: String,
}

impl Event {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            msg: msg.into(),
        }
    }
}

/// A recoverable anomaly worth surfacing to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningEntry {
    pub timestamp: DateTime<Utc>,
    pub msg: String,
}

impl WarningEntry {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            msg: msg.into(),
        }
    }
}

/// A failure recorded against the job, counted toward its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub error_code: i64,
    pub msg: String,
}

impl ErrorEntry {
    pub fn new(error_code: i64, msg: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            error_code,
            msg: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_entry_serializes_with_camel_case_code() {
        let entry = ErrorEntry::new(500, "boom");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["errorCode"], 500);
        assert_eq!(json["msg"], "boom");
    }

    #[test]
    fn event_round_trips() {
        let event = Event::new("started");
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
