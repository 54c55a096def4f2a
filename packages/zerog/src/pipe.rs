//! Parent/worker pipe framing.
//!
//! The worker child talks to its supervising server over its own stdio:
//! newline-delimited JSON frames go up on stdout, bare control lines
//! (`drain`, `undrain`) come down on stdin. Logging in the child goes to
//! stderr so frames stay clean. Framing is explicit: one frame per line,
//! no other blob boundaries are trusted.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};

/// A frame emitted by the worker child on its stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum WorkerFrame {
    /// The child has initialized its own handles and entered its loop.
    Ready(bool),
    /// Start (non-empty uuid) or end (empty) of a job run.
    RunningJobUuid(String),
}

impl WorkerFrame {
    /// Encode as one newline-terminated line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("frames always serialize");
        line.push('\n');
        line
    }

    /// Decode one line (newline already stripped).
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// What the worker saw on its control pipe.
#[derive(Debug, PartialEq, Eq)]
pub enum PipeSignal {
    /// A control line from the parent.
    Msg(String),
    /// Nothing arrived within the wait.
    Timeout,
    /// The parent end is gone.
    Closed,
}

/// The child's end of the parent pipe.
#[async_trait]
pub trait WorkerPipe: Send {
    /// Send a frame upstream.
    async fn send(&mut self, frame: &WorkerFrame) -> Result<()>;

    /// Wait up to `timeout` for a control line.
    async fn recv(&mut self, timeout: Duration) -> PipeSignal;
}

/// Pipe over the child's own stdin/stdout.
pub struct StdioPipe {
    lines: Lines<BufReader<Stdin>>,
    stdout: Stdout,
}

impl StdioPipe {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for StdioPipe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerPipe for StdioPipe {
    async fn send(&mut self, frame: &WorkerFrame) -> Result<()> {
        self.stdout.write_all(frame.to_line().as_bytes()).await?;
        self.stdout.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> PipeSignal {
        match tokio::time::timeout(timeout, self.lines.next_line()).await {
            Err(_) => PipeSignal::Timeout,
            Ok(Ok(Some(line))) => PipeSignal::Msg(line.trim().to_lowercase()),
            Ok(Ok(None)) | Ok(Err(_)) => PipeSignal::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        for frame in [
            WorkerFrame::Ready(true),
            WorkerFrame::RunningJobUuid("u-1".to_string()),
            WorkerFrame::RunningJobUuid(String::new()),
        ] {
            let line = frame.to_line();
            assert!(line.ends_with('\n'));
            let back = WorkerFrame::from_line(line.trim()).unwrap();
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn frame_wire_shape_is_type_value() {
        let line = WorkerFrame::RunningJobUuid("u-1".to_string()).to_line();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "runningJobUuid");
        assert_eq!(value["value"], "u-1");
    }

    #[test]
    fn malformed_frame_is_an_error_not_a_panic() {
        assert!(WorkerFrame::from_line("not json").is_err());
        assert!(WorkerFrame::from_line(r#"{"type":"wat","value":1}"#).is_err());
    }
}
