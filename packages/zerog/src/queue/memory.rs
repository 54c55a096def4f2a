//! In-process broker with full lease accounting.
//!
//! Backs tests and single-node development. One [`MemoryBroker`] holds any
//! number of tubes; [`MemoryQueue`] handles attach to one tube each, the
//! same shape as the TCP adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{JobStats, QueueError, ReservedJob, TubeStats, WorkQueue};

const RESERVE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct StoredJob {
    id: u64,
    body: String,
    ready_at: Instant,
    ttr: u64,
    deadline: Option<Instant>,
    reserves: u64,
    timeouts: u64,
    releases: u64,
}

#[derive(Default)]
struct Tube {
    ready: Vec<StoredJob>,
    reserved: Vec<StoredJob>,
    buried: Vec<StoredJob>,
    watchers: u64,
}

impl Tube {
    /// Move expired reservations back to ready, counting a timeout.
    fn reap(&mut self, now: Instant) {
        let mut kept = Vec::with_capacity(self.reserved.len());
        for mut job in self.reserved.drain(..) {
            match job.deadline {
                Some(deadline) if deadline <= now => {
                    job.timeouts += 1;
                    job.deadline = None;
                    job.ready_at = now;
                    self.ready.push(job);
                }
                _ => kept.push(job),
            }
        }
        self.reserved = kept;
    }

    fn reserve(&mut self, now: Instant) -> Option<ReservedJob> {
        self.reap(now);
        let pos = self.ready.iter().position(|j| j.ready_at <= now)?;
        let mut job = self.ready.remove(pos);
        job.reserves += 1;
        job.deadline = Some(now + Duration::from_secs(job.ttr));
        let reserved = ReservedJob {
            id: job.id,
            body: job.body.clone(),
        };
        self.reserved.push(job);
        Some(reserved)
    }

    fn take_reserved(&mut self, id: u64) -> Option<StoredJob> {
        let pos = self.reserved.iter().position(|j| j.id == id)?;
        Some(self.reserved.remove(pos))
    }

    fn remove(&mut self, id: u64) -> Option<StoredJob> {
        for list in [&mut self.reserved, &mut self.ready, &mut self.buried] {
            if let Some(pos) = list.iter().position(|j| j.id == id) {
                return Some(list.remove(pos));
            }
        }
        None
    }

    fn find(&self, id: u64) -> Option<&StoredJob> {
        self.reserved
            .iter()
            .chain(self.ready.iter())
            .chain(self.buried.iter())
            .find(|j| j.id == id)
    }
}

#[derive(Default)]
struct BrokerInner {
    tubes: Mutex<HashMap<String, Tube>>,
    next_id: AtomicU64,
}

/// Shared multi-tube broker state; clones are handles on the same broker.
#[derive(Default, Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an attached handle on `tube`.
    pub fn queue(&self, tube: &str) -> MemoryQueue {
        self.with_tube(tube, |tube| tube.watchers += 1);
        MemoryQueue {
            broker: self.clone(),
            tube: tube.to_string(),
        }
    }

    fn with_tube<T>(&self, tube: &str, f: impl FnOnce(&mut Tube) -> T) -> T {
        let mut tubes = self.inner.tubes.lock().unwrap();
        f(tubes.entry(tube.to_string()).or_default())
    }
}

/// Handle on one tube of a [`MemoryBroker`].
pub struct MemoryQueue {
    broker: MemoryBroker,
    tube: String,
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn tube(&self) -> &str {
        &self.tube
    }

    async fn put(&self, body: &str, delay: u64, ttr: u64) -> Result<u64, QueueError> {
        let id = self.broker.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Instant::now();
        self.broker.with_tube(&self.tube, |tube| {
            tube.ready.push(StoredJob {
                id,
                body: body.to_string(),
                ready_at: now + Duration::from_secs(delay),
                ttr,
                deadline: None,
                reserves: 0,
                timeouts: 0,
                releases: 0,
            });
        });
        Ok(id)
    }

    async fn reserve(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<ReservedJob>, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let now = Instant::now();
            let job = self.broker.with_tube(&self.tube, |tube| tube.reserve(now));
            if job.is_some() {
                return Ok(job);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(RESERVE_POLL).await;
        }
    }

    async fn delete(&self, id: u64) -> Result<(), QueueError> {
        self.broker
            .with_tube(&self.tube, |tube| tube.remove(id))
            .map(|_| ())
            .ok_or(QueueError::NotFound(id))
    }

    async fn release(&self, id: u64, delay: u64) -> Result<(), QueueError> {
        let now = Instant::now();
        self.broker.with_tube(&self.tube, |tube| {
            let mut job = tube.take_reserved(id).ok_or(QueueError::NotFound(id))?;
            job.releases += 1;
            job.deadline = None;
            job.ready_at = now + Duration::from_secs(delay);
            tube.ready.push(job);
            Ok(())
        })
    }

    async fn bury(&self, id: u64) -> Result<(), QueueError> {
        self.broker.with_tube(&self.tube, |tube| {
            let mut job = tube.take_reserved(id).ok_or(QueueError::NotFound(id))?;
            job.deadline = None;
            tube.buried.push(job);
            Ok(())
        })
    }

    async fn touch(&self, id: u64) -> Result<(), QueueError> {
        let now = Instant::now();
        self.broker.with_tube(&self.tube, |tube| {
            let job = tube
                .reserved
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or(QueueError::NotFound(id))?;
            job.deadline = Some(now + Duration::from_secs(job.ttr));
            Ok(())
        })
    }

    async fn stats_job(&self, id: u64) -> Result<JobStats, QueueError> {
        self.broker.with_tube(&self.tube, |tube| {
            let job = tube.find(id).ok_or(QueueError::NotFound(id))?;
            let state = if job.deadline.is_some() {
                "reserved"
            } else if tube.buried.iter().any(|j| j.id == id) {
                "buried"
            } else {
                "ready"
            };
            Ok(JobStats {
                reserves: job.reserves,
                timeouts: job.timeouts,
                releases: job.releases,
                state: state.to_string(),
            })
        })
    }

    async fn attach(&self) -> Result<(), QueueError> {
        self.broker.with_tube(&self.tube, |tube| tube.watchers += 1);
        Ok(())
    }

    async fn detach(&self) -> Result<(), QueueError> {
        self.broker.with_tube(&self.tube, |tube| {
            tube.watchers = tube.watchers.saturating_sub(1);
        });
        Ok(())
    }

    async fn list_tubes(&self) -> Result<Vec<String>, QueueError> {
        let tubes = self.broker.inner.tubes.lock().unwrap();
        Ok(tubes.keys().cloned().collect())
    }

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats, QueueError> {
        let tubes = self.broker.inner.tubes.lock().unwrap();
        let tube = tubes
            .get(tube)
            .ok_or_else(|| QueueError::Protocol(format!("no such tube: {tube}")))?;
        Ok(TubeStats {
            current_watching: tube.watchers,
            current_jobs_ready: tube.ready.len() as u64,
            current_jobs_reserved: tube.reserved.len() as u64,
            current_jobs_delayed: tube
                .ready
                .iter()
                .filter(|j| j.ready_at > Instant::now())
                .count() as u64,
        })
    }
}
