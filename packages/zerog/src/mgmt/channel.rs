//! Envelope codec over one management tube.
//!
//! Control tubes are named by worker id; the shared updates tube is named
//! by [`super::UPDATES_CHANNEL_NAME`]. Messages are single JSON bodies,
//! one per reservation; decoding failures are logged and dropped so a bad
//! producer can never wedge a consumer.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::MgmtMsg;
use crate::queue::{QueueError, WorkQueue};

/// Messages are transient; anything unconsumed for this long is stale.
const MSG_TTR: u64 = 3600;

/// A management channel over one broker tube.
pub struct MgmtChannel {
    queue: Arc<dyn WorkQueue>,
}

impl MgmtChannel {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self { queue }
    }

    /// The tube this channel produces to and consumes from.
    pub fn tube(&self) -> &str {
        self.queue.tube()
    }

    /// JSON-encode and enqueue a message.
    pub async fn send_msg(&self, msg: &MgmtMsg) -> Result<(), QueueError> {
        let body = serde_json::to_string(msg)
            .map_err(|e| QueueError::Protocol(format!("unencodable message: {e}")))?;
        self.queue.put(&body, 0, MSG_TTR).await?;
        Ok(())
    }

    /// Take the next message, if any.
    ///
    /// The reservation is consumed either way: a message that does not
    /// decode is logged and dropped rather than redelivered forever.
    pub async fn get_msg(&self) -> Result<Option<MgmtMsg>, QueueError> {
        let Some(queue_job) = self.queue.reserve(Some(Duration::ZERO)).await? else {
            return Ok(None);
        };
        self.queue.delete(queue_job.id).await?;

        match serde_json::from_str(&queue_job.body) {
            Ok(msg) => Ok(Some(msg)),
            Err(err) => {
                warn!(
                    tube = %self.tube(),
                    error = %err,
                    body = %queue_job.body,
                    "dropping malformed management message"
                );
                Ok(None)
            }
        }
    }

    /// Rejoin the tube's use/watch sets after a detach.
    pub async fn attach(&self) -> Result<(), QueueError> {
        self.queue.attach().await
    }

    /// Release the tube so the broker can garbage-collect it.
    pub async fn detach(&self) -> Result<(), QueueError> {
        self.queue.detach().await
    }

    /// Every tube known to the broker, not just this channel's.
    pub async fn list_all_queues(&self) -> Result<Vec<String>, QueueError> {
        self.queue.list_tubes().await
    }

    /// Watcher count for a named tube.
    pub async fn get_named_queue_watchers(&self, tube: &str) -> Result<u64, QueueError> {
        Ok(self.queue.stats_tube(tube).await?.current_watching)
    }
}
