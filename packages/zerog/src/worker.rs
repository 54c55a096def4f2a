//! Worker child process: leases jobs from a tube, runs them, and reports
//! progress to the supervising server over the parent pipe.
//!
//! The worker runs in its own OS process so a runaway or OOM-killed job
//! cannot take the server down. It opens its own datastore and queue
//! handles (never inherited), processes at most one job, then exits so the
//! server respawns a fresh process and the memory goes back to the OS.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::datastore::Datastore;
use crate::jobs::{make_key, Job, JobData, JobHandler, KeepAlive, Outcome, INTERNAL_ERROR, NO_RESULT};
use crate::pipe::{PipeSignal, WorkerFrame, WorkerPipe};
use crate::queue::{ReservedJob, WorkQueue};
use crate::registry::JobRegistry;

/// How long each loop lap waits on the parent pipe; this also sets the
/// job-queue polling cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Broker-side reserve count beyond which an unloadable job is dropped.
pub const MAX_RESERVES: u64 = 3;

/// Broker-side timeout count beyond which an unloadable job is dropped.
pub const MAX_TIMEOUTS: u64 = 2;

/// Requeue delay after an interrupted run.
const RETRY_DELAY: u64 = 30;

/// Requeue delay when a job finishes without specifying one.
const DEFAULT_DELAY: u64 = 10;

/// Lease refresh hook: touches the reserved queue job so the broker's ttr
/// clock restarts.
struct TouchKeepAlive {
    queue: Arc<dyn WorkQueue>,
    id: u64,
}

#[async_trait]
impl KeepAlive for TouchKeepAlive {
    async fn ping(&self) {
        if let Err(err) = self.queue.touch(self.id).await {
            warn!(id = self.id, error = %err, "keepalive touch failed");
        }
    }
}

/// Handler stand-in for records whose own handler cannot be built; lets
/// the worker record a terminal error on an otherwise unloadable job.
struct InertHandler;

#[async_trait]
impl JobHandler for InertHandler {
    async fn run(&mut self, _job: &mut Job) -> Result<Outcome> {
        Ok(Outcome::Done(INTERNAL_ERROR))
    }
}

/// Reserves jobs from a queue, instantiates them, and runs them.
///
/// Runs as a child of [`crate::Server`], communicating over stdio frames.
pub struct Worker {
    name: String,
    registry: Arc<JobRegistry>,
    datastore: Arc<dyn Datastore>,
    queue: Arc<dyn WorkQueue>,
    parent_pid: u32,
    draining: bool,
}

impl Worker {
    /// `datastore` and `queue` must be opened inside the worker process,
    /// not inherited from the parent.
    pub fn new(
        name: &str,
        registry: Arc<JobRegistry>,
        datastore: Arc<dyn Datastore>,
        queue: Arc<dyn WorkQueue>,
        parent_pid: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            registry,
            datastore,
            queue,
            parent_pid,
            draining: false,
        }
    }

    async fn get_job(&self, uuid: &str) -> Result<Option<Job>> {
        self.registry
            .get_job(uuid, self.datastore.clone(), self.queue.clone())
            .await
    }

    /// Main loop: poll the parent pipe, poll the job queue, run one job,
    /// exit. Exits when the parent disappears (orphan policy).
    pub async fn run(&mut self, pipe: &mut dyn WorkerPipe) -> Result<()> {
        pipe.send(&WorkerFrame::Ready(true)).await?;
        info!(name = %self.name, pid = std::process::id(), "starting worker process");

        loop {
            match pipe.recv(POLL_INTERVAL).await {
                PipeSignal::Msg(msg) if msg == "drain" => {
                    info!(name = %self.name, "worker draining");
                    self.draining = true;
                }
                PipeSignal::Msg(msg) if msg == "undrain" => {
                    info!(name = %self.name, "worker undraining");
                    self.draining = false;
                }
                PipeSignal::Msg(msg) => {
                    warn!(name = %self.name, msg = %msg, "unrecognized parent message");
                }
                PipeSignal::Closed => {
                    info!(name = %self.name, "parent pipe closed - orphaned");
                    return Ok(());
                }
                PipeSignal::Timeout => {}
            }

            if !self.draining {
                if let Some(queue_job) = self.queue.reserve(Some(Duration::ZERO)).await? {
                    self.process_queue_job(queue_job, pipe).await;
                    // exit after one job so the parent respawns a fresh
                    // process and leaked memory goes back to the OS
                    return Ok(());
                }
            }

            if !self.parent_alive() {
                info!(name = %self.name, "parent process gone - orphaned");
                return Ok(());
            }
        }
    }

    fn parent_alive(&self) -> bool {
        // kill(pid, 0) probes for existence without delivering a signal
        unsafe { libc::kill(self.parent_pid as i32, 0) == 0 }
    }

    /// Handle one reserved queue job: load the persisted job and run it,
    /// absorbing every failure mode so a problematic job cannot crash the
    /// worker.
    pub async fn process_queue_job(&mut self, queue_job: ReservedJob, pipe: &mut dyn WorkerPipe) {
        // the queue body is just a uuid used to retrieve the full job
        let uuid: String = serde_json::from_str(&queue_job.body)
            .unwrap_or_else(|_| queue_job.body.clone());
        info!(name = %self.name, uuid = %uuid, "reserved");

        let job = match self.get_job(&uuid).await {
            Ok(job) => job,
            Err(err) => {
                warn!(uuid = %uuid, error = %err, "job load failed");
                None
            }
        };

        let Some(mut job) = job else {
            self.handle_unloadable(&uuid, &queue_job).await;
            return;
        };

        if job.data.running {
            // the previous run died without clearing the flag - most likely
            // the process was killed mid-lease (memory exhaustion)
            job.record_error(INTERNAL_ERROR, "job was killed - likely out of memory")
                .await;
            let result_code = job.continue_running();
            if result_code == NO_RESULT {
                job.record_event("Killed (memory error?) - Restarting").await;
            } else {
                job.record_event("Killed (memory error?) - Finished").await;
                job.record_result(result_code).await;
                self.delete_queue_job(queue_job.id).await;
                return;
            }
        }

        if let Err(err) = pipe.send(&WorkerFrame::RunningJobUuid(uuid.clone())).await {
            warn!(uuid = %uuid, error = %err, "could not announce job start");
        }
        job.update_attrs(|data| data.running = true).await;
        job.set_keepalive(Some(Arc::new(TouchKeepAlive {
            queue: self.queue.clone(),
            id: queue_job.id,
        })));

        info!(name = %self.name, job_type = %job.job_type(), uuid = %uuid, "running job");
        let verdict = self.run_job(&mut job).await;

        // always emitted, even when the run finished the job itself
        if let Err(err) = pipe.send(&WorkerFrame::RunningJobUuid(String::new())).await {
            warn!(uuid = %uuid, error = %err, "could not announce job end");
        }
        job.set_keepalive(None);
        job.update_attrs(|data| data.running = false).await;

        // the lease is consumed either way
        self.delete_queue_job(queue_job.id).await;

        if let Some((result_code, delay)) = verdict {
            if result_code == NO_RESULT {
                job.enqueue(delay, None).await;
            } else {
                job.record_result(result_code).await;
            }
        }
    }

    /// Run the job's handler and normalize what came back.
    ///
    /// `None` means the run already finished the job terminally and only
    /// the lease remains to clean up; `Some((code, delay))` is the result
    /// to record or, for [`NO_RESULT`], the requeue delay.
    async fn run_job(&self, job: &mut Job) -> Option<(i64, u64)> {
        let Some(mut handler) = job.take_handler() else {
            error!(log_id = %job.log_id(), "job has no handler");
            return Some((INTERNAL_ERROR, DEFAULT_DELAY));
        };
        let run_result = handler.run(job).await;
        job.set_handler(handler);

        match run_result {
            Ok(Outcome::Done(result_code)) => Some((result_code, DEFAULT_DELAY)),
            Ok(Outcome::DoneAfter(result_code, delay)) => Some((result_code, delay)),
            Ok(Outcome::ErrorFinish) | Ok(Outcome::WarningFinish) => {
                // result already recorded by the finish helper
                job.record_event("Error - finished").await;
                None
            }
            Ok(Outcome::ErrorContinue) | Ok(Outcome::WarningContinue) => {
                job.record_event("Error - restarting").await;
                Some((job.continue_running(), RETRY_DELAY))
            }
            Err(err) => {
                let msg = format!("{err:?}");
                job.record_error(INTERNAL_ERROR, &msg).await;
                error!(
                    name = %self.name,
                    job_type = %job.job_type(),
                    uuid = %job.uuid(),
                    mem_available_mib = available_mib(),
                    "job failed with unexpected error: {msg}"
                );

                let result_code = job.continue_running();
                if result_code == NO_RESULT {
                    job.record_event("Error - restarting").await;
                } else {
                    job.record_event("Error - finished").await;
                }
                Some((result_code, RETRY_DELAY))
            }
        }
    }

    /// A reserved body whose job could not be loaded: bounded by broker
    /// stats, not job state, so pre-load failures cannot loop forever.
    async fn handle_unloadable(&self, uuid: &str, queue_job: &ReservedJob) {
        let stats = match self.queue.stats_job(queue_job.id).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(uuid = %uuid, error = %err, "no stats for unloadable job; releasing");
                self.release_queue_job(queue_job.id, RETRY_DELAY).await;
                return;
            }
        };

        let too_many = if stats.reserves > MAX_RESERVES {
            Some(format!("{MAX_RESERVES} reserves"))
        } else if stats.timeouts > MAX_TIMEOUTS {
            Some(format!("{MAX_TIMEOUTS} timeouts"))
        } else {
            None
        };

        match too_many {
            Some(which) => {
                let msg = format!("more than {which}, deleting from queue");
                error!(uuid = %uuid, reserves = stats.reserves, timeouts = stats.timeouts, "{msg}");
                self.delete_queue_job(queue_job.id).await;

                // record a terminal failure if a record exists at all
                if let Ok(Some((doc, cas))) =
                    self.datastore.read_with_cas(&make_key(uuid)).await
                {
                    if let Ok(mut data) = serde_json::from_value::<JobData>(doc) {
                        data.cas = cas;
                        let mut job = Job::new(
                            data,
                            Box::new(InertHandler),
                            self.datastore.clone(),
                            self.queue.clone(),
                        );
                        job.record_error(INTERNAL_ERROR, &msg).await;
                        job.record_result(INTERNAL_ERROR).await;
                    }
                }
            }
            None => {
                warn!(
                    uuid = %uuid,
                    reserves = stats.reserves,
                    timeouts = stats.timeouts,
                    "failed to load job; releasing for retry"
                );
                self.release_queue_job(queue_job.id, RETRY_DELAY).await;
            }
        }
    }

    async fn delete_queue_job(&self, id: u64) {
        if let Err(err) = self.queue.delete(id).await {
            warn!(id, error = %err, "queue delete failed");
        }
    }

    async fn release_queue_job(&self, id: u64, delay: u64) {
        if let Err(err) = self.queue.release(id, delay).await {
            warn!(id, error = %err, "queue release failed");
        }
    }
}

/// System-wide available memory in MiB, logged with unexpected failures to
/// make OOM investigations cheaper.
fn available_mib() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.available_memory() / (1024 * 1024)
}
