//! Operator-side fleet aggregator.
//!
//! Discovers workers by listing broker tubes (each worker's control tube
//! is named by its worker id), requests snapshots, aggregates the shared
//! updates stream, and issues drain/retire/kill controls.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use tracing::warn;

use super::{JobAction, MemInfo, MgmtChannel, MgmtMsg, WorkerId};

/// Latest known snapshot of one worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub alive: bool,
    pub state: String,
    pub running_job_uuid: String,
    pub mem: MemInfo,
    pub retiring: bool,
}

/// One observed job start/end, keyed under its uuid by timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub worker_id: String,
    pub action: JobAction,
}

type ChannelFactory = Box<dyn Fn(&str) -> MgmtChannel + Send + Sync>;

/// Aggregates a fleet of workers over the management tubes.
pub struct WorkerManager {
    updates_channel: MgmtChannel,
    make_channel: ChannelFactory,
    ctrl_channels: HashMap<String, MgmtChannel>,
    /// Latest snapshot per worker id.
    pub workers: HashMap<String, WorkerStatus>,
    /// Start/end observations per job uuid, ordered by timestamp. Updates
    /// interleave across workers, so aggregation keys on time, never on
    /// receive order.
    pub job_runs: HashMap<String, BTreeMap<chrono::DateTime<chrono::Utc>, JobRun>>,
}

impl WorkerManager {
    /// `make_channel` opens a channel on a named tube; the manager uses it
    /// to lazily create per-worker control channels.
    pub fn new(updates_channel: MgmtChannel, make_channel: ChannelFactory) -> Self {
        Self {
            updates_channel,
            make_channel,
            ctrl_channels: HashMap::new(),
            workers: HashMap::new(),
            job_runs: HashMap::new(),
        }
    }

    fn ctrl_channel(&mut self, worker_id: &str) -> &MgmtChannel {
        self.ctrl_channels
            .entry(worker_id.to_string())
            .or_insert_with(|| (self.make_channel)(worker_id))
    }

    /// Send one control message to one worker.
    pub async fn send_ctrl_msg(&mut self, worker_id: &str, msg: &MgmtMsg) -> Result<()> {
        let channel = self.ctrl_channel(worker_id);
        channel.attach().await?;
        channel.send_msg(msg).await?;
        Ok(())
    }

    /// Workers that are listening on a control tube right now.
    ///
    /// A tube that parses as a worker id but has no watchers belongs to a
    /// dead worker: its backlog is drained and its channel dropped so the
    /// broker can collect the tube.
    pub async fn known_workers(&mut self) -> Result<HashMap<String, WorkerId>> {
        // do not let our own control channels hold tubes open
        for channel in self.ctrl_channels.values() {
            channel.detach().await?;
        }

        let mut known = HashMap::new();
        for tube in self.updates_channel.list_all_queues().await? {
            let Some(parsed) = WorkerId::parse(&tube) else {
                continue;
            };

            let watchers = self.updates_channel.get_named_queue_watchers(&tube).await?;
            if watchers == 0 {
                let channel = self.ctrl_channel(&tube);
                channel.attach().await?;
                while channel.get_msg().await?.is_some() {}
                channel.detach().await?;
                self.ctrl_channels.remove(&tube);
                continue;
            }

            known.insert(tube, parsed);
        }
        Ok(known)
    }

    /// Reconcile the worker table against the live fleet and ask every
    /// survivor for a fresh snapshot.
    pub async fn update_workers(&mut self) -> Result<()> {
        let known = self.known_workers().await?;
        self.workers.retain(|worker_id, _| known.contains_key(worker_id));

        let request = MgmtMsg::request_info();
        for worker_id in known.keys() {
            self.send_ctrl_msg(worker_id, &request).await?;
        }
        Ok(())
    }

    /// Drain the shared updates tube into the local tables.
    pub async fn poll_updates_channel(&mut self) -> Result<()> {
        while let Some(msg) = self.updates_channel.get_msg().await? {
            match msg {
                MgmtMsg::Job {
                    worker_id,
                    timestamp,
                    uuid,
                    action,
                } => {
                    self.job_runs
                        .entry(uuid)
                        .or_default()
                        .insert(timestamp, JobRun { worker_id, action });
                }
                MgmtMsg::Info {
                    worker_id,
                    state,
                    uuid,
                    mem,
                    retiring,
                    ..
                } => {
                    self.workers.insert(
                        worker_id,
                        WorkerStatus {
                            alive: true,
                            state,
                            running_job_uuid: uuid,
                            mem,
                            retiring,
                        },
                    );
                }
                other => {
                    warn!(msgtype = other.msgtype(), "unexpected message on updates");
                }
            }
        }
        Ok(())
    }

    /// Send `drain` to a set of workers.
    pub async fn drain_workers(&mut self, worker_ids: &[String]) -> Result<()> {
        let msg = MgmtMsg::drain();
        for worker_id in worker_ids {
            self.send_ctrl_msg(worker_id, &msg).await?;
        }
        Ok(())
    }

    /// Ask a set of workers for snapshots.
    pub async fn request_worker_statuses(&mut self, worker_ids: &[String]) -> Result<()> {
        let msg = MgmtMsg::request_info();
        for worker_id in worker_ids {
            self.send_ctrl_msg(worker_id, &msg).await?;
        }
        Ok(())
    }

    /// Drain (or retire) every worker on a host.
    pub async fn drain_host(&mut self, host: &str, retire: bool) -> Result<()> {
        let targets: Vec<String> = self
            .workers
            .keys()
            .filter(|id| on_host(id, host))
            .cloned()
            .collect();

        let msg = if retire {
            MgmtMsg::retire()
        } else {
            MgmtMsg::drain()
        };
        for worker_id in targets {
            self.send_ctrl_msg(&worker_id, &msg).await?;
        }
        Ok(())
    }

    /// True when every worker on `host` has stopped leasing and finished
    /// its current job.
    pub fn host_is_drained(&self, host: &str) -> bool {
        self.workers
            .iter()
            .filter(|(id, _)| on_host(id, host))
            .all(|(_, status)| {
                status.state.starts_with("draining") && status.running_job_uuid.is_empty()
            })
    }

    /// Worker ids grouped by host.
    pub fn workers_by_host(&self) -> HashMap<String, Vec<String>> {
        let mut by_host: HashMap<String, Vec<String>> = HashMap::new();
        for worker_id in self.workers.keys() {
            if let Some(parsed) = WorkerId::parse(worker_id) {
                by_host.entry(parsed.host).or_default().push(worker_id.clone());
            }
        }
        by_host
    }

    /// Count of currently running jobs per host.
    pub fn job_count_by_host(&self) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for (worker_id, status) in &self.workers {
            let Some(parsed) = WorkerId::parse(worker_id) else {
                continue;
            };
            let entry = counts.entry(parsed.host).or_default();
            if !status.running_job_uuid.is_empty() {
                *entry += 1;
            }
        }
        counts
    }

    /// Worker states grouped by host.
    pub fn states_by_host(&self) -> HashMap<String, HashMap<String, String>> {
        let mut by_host: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (worker_id, status) in &self.workers {
            if let Some(parsed) = WorkerId::parse(worker_id) {
                by_host
                    .entry(parsed.host)
                    .or_default()
                    .insert(worker_id.clone(), status.state.clone());
            }
        }
        by_host
    }
}

fn on_host(worker_id: &str, host: &str) -> bool {
    WorkerId::parse(worker_id).is_some_and(|parsed| parsed.host == host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mgmt::{UPDATES_CHANNEL_NAME, WORKER_TYPE};
    use crate::queue::MemoryBroker;
    use std::sync::Arc;

    fn manager_on(broker: &MemoryBroker) -> WorkerManager {
        let updates = MgmtChannel::new(Arc::new(broker.queue(UPDATES_CHANNEL_NAME)));
        let factory = {
            let broker = broker.clone();
            Box::new(move |tube: &str| MgmtChannel::new(Arc::new(broker.queue(tube))))
        };
        WorkerManager::new(updates, factory)
    }

    fn worker_id(host: &str, pid: u32) -> String {
        WorkerId::new(WORKER_TYPE, host, "svc", pid).to_string()
    }

    #[tokio::test]
    async fn known_workers_parses_control_tubes() {
        let broker = MemoryBroker::new();
        // live worker holding its control tube open
        let live = worker_id("host-a", 1);
        let _live_handle = broker.queue(&live);
        // non-worker tubes are ignored
        let _jobs = broker.queue("svc_jobs");

        let mut manager = manager_on(&broker);
        let known = manager.known_workers().await.unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[&live].host, "host-a");
    }

    #[tokio::test]
    async fn known_workers_drains_dead_worker_tubes() {
        let broker = MemoryBroker::new();
        let dead = worker_id("host-a", 2);
        // tube exists with a stale message but nobody watching
        {
            let handle = broker.queue(&dead);
            let channel = MgmtChannel::new(Arc::new(handle));
            channel.send_msg(&MgmtMsg::drain()).await.unwrap();
            channel.detach().await.unwrap();
        }

        let mut manager = manager_on(&broker);
        let known = manager.known_workers().await.unwrap();
        assert!(known.is_empty());

        // the backlog was consumed
        use crate::queue::WorkQueue as _;
        let probe = broker.queue(&dead);
        assert!(probe
            .reserve(Some(std::time::Duration::ZERO))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_workers_reconciles_and_requests_info() {
        let broker = MemoryBroker::new();
        let live = worker_id("host-a", 1);
        let gone = worker_id("host-b", 9);
        let _live_handle = broker.queue(&live);

        let mut manager = manager_on(&broker);
        manager.workers.insert(gone.clone(), WorkerStatus::default());
        manager.update_workers().await.unwrap();

        assert!(!manager.workers.contains_key(&gone));

        // the live worker got a requestInfo on its control tube
        let ctrl = MgmtChannel::new(Arc::new(broker.queue(&live)));
        let msg = ctrl.get_msg().await.unwrap().expect("an info request");
        assert_eq!(msg.msgtype(), "requestInfo");
    }

    #[tokio::test]
    async fn poll_updates_aggregates_job_runs_and_worker_info() {
        let broker = MemoryBroker::new();
        let wid = worker_id("host-a", 1);
        let updates = MgmtChannel::new(Arc::new(broker.queue(UPDATES_CHANNEL_NAME)));

        updates
            .send_msg(&MgmtMsg::job(&wid, "u-1", JobAction::Start))
            .await
            .unwrap();
        updates
            .send_msg(&MgmtMsg::job(&wid, "u-1", JobAction::End))
            .await
            .unwrap();
        updates
            .send_msg(&MgmtMsg::info(
                &wid,
                "activeIdle",
                "",
                MemInfo::default(),
                false,
            ))
            .await
            .unwrap();

        let mut manager = manager_on(&broker);
        manager.poll_updates_channel().await.unwrap();

        let runs = &manager.job_runs["u-1"];
        assert_eq!(runs.len(), 2);
        let actions: Vec<JobAction> = runs.values().map(|r| r.action).collect();
        assert_eq!(actions, vec![JobAction::Start, JobAction::End]);

        let status = &manager.workers[&wid];
        assert!(status.alive);
        assert_eq!(status.state, "activeIdle");
        assert_eq!(status.running_job_uuid, "");
    }

    #[tokio::test]
    async fn drain_host_targets_only_that_host() {
        let broker = MemoryBroker::new();
        let on_a = worker_id("host-a", 1);
        let on_b = worker_id("host-b", 2);

        let mut manager = manager_on(&broker);
        manager.workers.insert(on_a.clone(), WorkerStatus::default());
        manager.workers.insert(on_b.clone(), WorkerStatus::default());
        manager.drain_host("host-a", false).await.unwrap();

        let ctrl_a = MgmtChannel::new(Arc::new(broker.queue(&on_a)));
        let msg = ctrl_a.get_msg().await.unwrap().expect("a drain");
        assert_eq!(msg.msgtype(), "drain");

        let ctrl_b = MgmtChannel::new(Arc::new(broker.queue(&on_b)));
        assert_eq!(ctrl_b.get_msg().await.unwrap(), None);
    }

    #[tokio::test]
    async fn retire_flag_sends_retire_instead() {
        let broker = MemoryBroker::new();
        let wid = worker_id("host-a", 1);
        let mut manager = manager_on(&broker);
        manager.workers.insert(wid.clone(), WorkerStatus::default());
        manager.drain_host("host-a", true).await.unwrap();

        let ctrl = MgmtChannel::new(Arc::new(broker.queue(&wid)));
        let msg = ctrl.get_msg().await.unwrap().expect("a retire");
        assert_eq!(msg.msgtype(), "retire");
    }

    #[test]
    fn host_is_drained_requires_draining_state_and_no_job() {
        let broker = MemoryBroker::new();
        let mut manager = manager_on(&broker);

        manager.workers.insert(
            worker_id("host-a", 1),
            WorkerStatus {
                alive: true,
                state: "drainingIdle".to_string(),
                ..Default::default()
            },
        );
        assert!(manager.host_is_drained("host-a"));

        manager.workers.insert(
            worker_id("host-a", 2),
            WorkerStatus {
                alive: true,
                state: "drainingRunning".to_string(),
                running_job_uuid: "u-1".to_string(),
                ..Default::default()
            },
        );
        assert!(!manager.host_is_drained("host-a"));
    }

    #[test]
    fn pivots_group_by_host() {
        let broker = MemoryBroker::new();
        let mut manager = manager_on(&broker);
        manager.workers.insert(
            worker_id("host-a", 1),
            WorkerStatus {
                alive: true,
                state: "activeRunning".to_string(),
                running_job_uuid: "u-1".to_string(),
                ..Default::default()
            },
        );
        manager.workers.insert(
            worker_id("host-a", 2),
            WorkerStatus {
                alive: true,
                state: "activeIdle".to_string(),
                ..Default::default()
            },
        );
        manager.workers.insert(
            worker_id("host-b", 3),
            WorkerStatus {
                alive: true,
                state: "activeIdle".to_string(),
                ..Default::default()
            },
        );

        let by_host = manager.workers_by_host();
        assert_eq!(by_host["host-a"].len(), 2);
        assert_eq!(by_host["host-b"].len(), 1);

        let jobs = manager.job_count_by_host();
        assert_eq!(jobs["host-a"], 1);
        assert_eq!(jobs["host-b"], 0);

        let states = manager.states_by_host();
        assert_eq!(states["host-a"][&worker_id("host-a", 2)], "activeIdle");
    }
}
