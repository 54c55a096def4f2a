//! Supervising parent: owns the registry, spawns and watches one worker
//! child, proxies its liveness and progress, and services the control
//! channel.
//!
//! All state transitions happen inside `do_poll`, driven by one periodic
//! task; there is no concurrent mutator, so the state machine needs no
//! locks.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::datastore::Datastore;
use crate::jobs::KILLED_BY_USER;
use crate::mgmt::{JobAction, MemInfo, MgmtChannel, MgmtMsg, WorkerId};
use crate::pipe::WorkerFrame;
use crate::queue::WorkQueue;
use crate::registry::JobRegistry;

/// Cadence of the supervision poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Supervisor state, reported verbatim in `info` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Child up, no current job.
    ActiveIdle,
    /// Child up, running a job.
    ActiveRunning,
    /// Drain requested; child told to stop leasing.
    DrainingIdle,
    /// Drain requested while a job is still running.
    DrainingRunning,
    /// Child not runnable, drained.
    DrainingDown,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::ActiveIdle => "activeIdle",
            ServerState::ActiveRunning => "activeRunning",
            ServerState::DrainingIdle => "drainingIdle",
            ServerState::DrainingRunning => "drainingRunning",
            ServerState::DrainingDown => "drainingDown",
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, ServerState::ActiveIdle | ServerState::ActiveRunning)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS-level view of the worker child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited,
    Gone,
}

/// Handle on a spawned worker process.
#[async_trait]
pub trait WorkerChild: Send {
    /// Send a control line down the child's stdin.
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Next frame line the child wrote, if any has arrived.
    fn try_recv(&mut self) -> Option<String>;

    /// Current process status.
    async fn status(&mut self) -> ChildStatus;

    /// Kill the process.
    async fn kill(&mut self) -> Result<()>;

    fn pid(&self) -> Option<u32>;
}

/// Spawns worker children; the seam that lets supervision be driven
/// without real processes in tests.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self) -> Result<Box<dyn WorkerChild>>;
}

/// A real worker child: this executable re-run with the `worker`
/// subcommand, stdio piped for frames, stderr inherited for logs.
pub struct ProcessChild {
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
    lines: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl WorkerChild for ProcessChild {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    fn try_recv(&mut self) -> Option<String> {
        self.lines.try_recv().ok()
    }

    async fn status(&mut self) -> ChildStatus {
        match self.child.try_wait() {
            Ok(None) => ChildStatus::Running,
            Ok(Some(_)) => ChildStatus::Exited,
            Err(_) => ChildStatus::Gone,
        }
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawns `current_exe() worker ...` children from the server's config.
pub struct ProcessSpawner {
    config: Config,
}

impl ProcessSpawner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self) -> Result<Box<dyn WorkerChild>> {
        let exe = std::env::current_exe().context("cannot locate own executable")?;
        let mut child = Command::new(exe)
            .arg("worker")
            .arg("--service")
            .arg(&self.config.service_name)
            .arg("--broker-host")
            .arg(&self.config.broker_host)
            .arg("--broker-port")
            .arg(self.config.broker_port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn worker child")?;

        let stdin = child.stdin.take().context("worker child has no stdin")?;
        let stdout = child.stdout.take().context("worker child has no stdout")?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(ProcessChild {
            child,
            stdin,
            lines: rx,
        }))
    }
}

/// The supervising parent process.
pub struct Server {
    worker_id: WorkerId,
    registry: Arc<JobRegistry>,
    datastore: Arc<dyn Datastore>,
    job_queue: Arc<dyn WorkQueue>,
    updates_channel: MgmtChannel,
    ctrl_channel: MgmtChannel,
    spawner: Box<dyn WorkerSpawner>,
    child: Option<Box<dyn WorkerChild>>,
    state: ServerState,
    retiring: bool,
    running_job_uuid: String,
}

impl Server {
    /// The control channel's tube must be named by `worker_id`; the
    /// updates channel is the shared fleet tube.
    pub fn new(
        worker_id: WorkerId,
        registry: Arc<JobRegistry>,
        datastore: Arc<dyn Datastore>,
        job_queue: Arc<dyn WorkQueue>,
        updates_channel: MgmtChannel,
        ctrl_channel: MgmtChannel,
        spawner: Box<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            worker_id,
            registry,
            datastore,
            job_queue,
            updates_channel,
            ctrl_channel,
            spawner,
            child: None,
            state: ServerState::ActiveIdle,
            retiring: false,
            running_job_uuid: String::new(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn retiring(&self) -> bool {
        self.retiring
    }

    pub fn running_job_uuid(&self) -> &str {
        &self.running_job_uuid
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Supervise until cancelled: spawn the worker, then poll on a steady
    /// cadence. On shutdown the worker is killed and any running job gets
    /// a restart event.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.worker_id, "server starting");
        self.start_worker().await?;

        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.do_poll().await,
            }
        }

        info!(worker_id = %self.worker_id, "server exiting");
        self.kill_worker(false).await;
        Ok(())
    }

    /// One supervision lap: worker pipe, worker liveness, control tube.
    pub async fn do_poll(&mut self) {
        self.do_worker_poll().await;
        self.do_control_queue_poll().await;
    }

    pub async fn start_worker(&mut self) -> Result<()> {
        let child = self.spawner.spawn().await?;
        info!(worker_id = %self.worker_id, pid = ?child.pid(), "started worker");
        self.child = Some(child);
        self.state = ServerState::ActiveIdle;
        Ok(())
    }

    /// Kill the worker child. With `kill_job`, the running job is marked
    /// gone (410) and its queue entry consumed; otherwise it gets a
    /// restart event and the next lease continues it.
    pub async fn kill_worker(&mut self, kill_job: bool) {
        // pick up anything the child managed to say first
        self.drain_worker_frames().await;

        info!(
            worker_id = %self.worker_id,
            active_job = %self.running_job_uuid,
            "killing worker"
        );
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "worker kill failed");
            }
        }

        if self.running_job_uuid.is_empty() {
            return;
        }
        let uuid = self.running_job_uuid.clone();
        let job = self
            .registry
            .get_job(&uuid, self.datastore.clone(), self.job_queue.clone())
            .await;
        let Ok(Some(mut job)) = job else {
            warn!(uuid = %uuid, "could not load job for killed worker");
            return;
        };

        if kill_job {
            self.running_job_uuid.clear();
            job.record_error(KILLED_BY_USER, "Killed by user").await;
            job.record_result(KILLED_BY_USER).await;
            if job.data.queue_job_id > 0 {
                if let Err(err) = self.job_queue.delete(job.data.queue_job_id as u64).await {
                    warn!(uuid = %uuid, error = %err, "queue delete for killed job failed");
                }
            }
        } else {
            job.record_event("System restart").await;
        }
    }

    /// Stop leasing new jobs; a running job is left to finish.
    pub async fn drain(&mut self) {
        match self.state {
            ServerState::ActiveIdle => {
                self.state = ServerState::DrainingIdle;
                info!(worker_id = %self.worker_id, "drain - no job");
                self.send_to_child("drain").await;
            }
            ServerState::ActiveRunning => {
                // the child is not told: it exits after the current job
                // and a draining server does not respawn it
                self.state = ServerState::DrainingRunning;
                info!(
                    worker_id = %self.worker_id,
                    job = %self.running_job_uuid,
                    "drain - finish current job"
                );
            }
            state => {
                info!(worker_id = %self.worker_id, %state, "drain - already draining");
            }
        }
    }

    /// Resume leasing, unless the server is retiring.
    pub async fn undrain(&mut self) {
        if self.retiring {
            return;
        }

        self.send_to_child("undrain").await;
        match self.state {
            ServerState::DrainingIdle | ServerState::DrainingDown => {
                self.state = ServerState::ActiveIdle;
            }
            ServerState::DrainingRunning => {
                self.state = ServerState::ActiveRunning;
            }
            _ => {}
        }
    }

    /// Drain and set the one-way retiring flag.
    pub async fn retire(&mut self) {
        self.retiring = true;
        self.drain().await;
    }

    /// Kill the currently running job, but only if `uuid` still matches;
    /// stale kills are silently ignored.
    pub async fn kill_job(&mut self, uuid: &str) {
        if self.running_job_uuid.is_empty() || self.running_job_uuid != uuid {
            return;
        }
        self.kill_worker(true).await;
        if let Err(err) = self.start_worker().await {
            error!(error = %err, "could not respawn worker after kill");
        }
    }

    async fn send_to_child(&mut self, line: &str) {
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.send_line(line).await {
                warn!(error = %err, line = %line, "could not reach worker child");
            }
        }
    }

    async fn do_worker_poll(&mut self) {
        self.drain_worker_frames().await;

        let status = match self.child.as_mut() {
            Some(child) => child.status().await,
            None => ChildStatus::Gone,
        };
        if status == ChildStatus::Running {
            return;
        }

        debug!(worker_id = %self.worker_id, ?status, state = %self.state, "worker down");
        self.running_job_uuid.clear();
        if self.state.is_active() {
            info!(worker_id = %self.worker_id, "restarting worker");
            if let Err(err) = self.start_worker().await {
                error!(error = %err, "could not restart worker");
            }
        } else {
            self.state = ServerState::DrainingDown;
        }
    }

    async fn drain_worker_frames(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };

        let mut frames = Vec::new();
        while let Some(line) = child.try_recv() {
            match WorkerFrame::from_line(line.trim()) {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    error!(worker_id = %self.worker_id, error = %err, line = %line, "can't parse worker message");
                }
            }
        }
        for frame in frames {
            self.process_worker_frame(frame).await;
        }
    }

    async fn process_worker_frame(&mut self, frame: WorkerFrame) {
        match frame {
            WorkerFrame::Ready(_) => {
                debug!(worker_id = %self.worker_id, "worker ready");
            }
            WorkerFrame::RunningJobUuid(value) => {
                let (action, uuid) = if value.is_empty() {
                    if self.state == ServerState::ActiveRunning {
                        self.state = ServerState::ActiveIdle;
                    }
                    (JobAction::End, self.running_job_uuid.clone())
                } else {
                    self.state = if self.state.is_active() {
                        ServerState::ActiveRunning
                    } else {
                        ServerState::DrainingRunning
                    };
                    (JobAction::Start, value.clone())
                };
                self.running_job_uuid = value;

                let msg = MgmtMsg::job(&self.worker_id.to_string(), &uuid, action);
                if let Err(err) = self.updates_channel.send_msg(&msg).await {
                    warn!(error = %err, "could not publish job update");
                }
            }
        }
    }

    async fn do_control_queue_poll(&mut self) {
        loop {
            let msg = match self.ctrl_channel.get_msg().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(err) => {
                    // broker trouble is not fatal; retry next poll
                    warn!(error = %err, "control channel read failed");
                    break;
                }
            };

            match msg {
                MgmtMsg::RequestInfo { .. } => self.send_info().await,
                MgmtMsg::Drain { .. } => self.drain().await,
                MgmtMsg::Undrain { .. } => self.undrain().await,
                MgmtMsg::Retire { .. } => self.retire().await,
                MgmtMsg::KillJob { uuid, .. } => self.kill_job(&uuid).await,
                other => {
                    warn!(msgtype = other.msgtype(), "unexpected message on control channel");
                }
            }
        }
    }

    async fn send_info(&mut self) {
        let msg = MgmtMsg::info(
            &self.worker_id.to_string(),
            self.state.as_str(),
            &self.running_job_uuid,
            self.memory_info(),
            self.retiring,
        );
        if let Err(err) = self.updates_channel.send_msg(&msg).await {
            warn!(error = %err, "could not publish info");
        }
    }

    /// Available system memory plus resident-set usage of this process
    /// and its worker child.
    fn memory_info(&self) -> MemInfo {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        let mut used = 0;
        let mut pids = vec![std::process::id()];
        if let Some(pid) = self.child.as_ref().and_then(|c| c.pid()) {
            pids.push(pid);
        }
        for pid in pids {
            let pid = sysinfo::Pid::from_u32(pid);
            if sys.refresh_process(pid) {
                used += sys.process(pid).map(|p| p.memory()).unwrap_or(0);
            }
        }

        MemInfo {
            available: sys.available_memory(),
            used,
        }
    }
}
