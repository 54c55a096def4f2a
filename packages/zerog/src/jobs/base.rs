//! Persisted job state and the optimistic-concurrency save loop.
//!
//! Every mutation goes through [`Job::record_change`]: apply the change
//! in memory, `set_with_cas`, and on collision reload-and-retry. Nothing
//! here takes a distributed lock; contention is resolved by the cas token.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::{
    ErrorEntry, Event, JobHandler, KeepAlive, Outcome, WarningEntry, DEFAULT_TTR, DOCUMENT_TYPE,
    INTERNAL_ERROR, MAX_ERRORS, NO_RESULT,
};
use crate::datastore::{Datastore, DatastoreError};
use crate::queue::WorkQueue;

/// Save attempts before a mutation is reported as lost.
const MAX_RECORD_ATTEMPTS: u32 = 10;

/// Upper bound on the collision backoff jitter, in milliseconds.
const MAX_JITTER_MS: u64 = 100;

/// Datastore key for a job record.
pub fn make_key(uuid: &str) -> String {
    format!("{DOCUMENT_TYPE}_{uuid}")
}

fn default_document_type() -> String {
    DOCUMENT_TYPE.to_string()
}

fn default_schema_version() -> f64 {
    1.0
}

fn default_uuid() -> String {
    Uuid::new_v4().to_string()
}

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

fn default_tickval() -> f64 {
    0.001
}

fn default_result_code() -> i64 {
    NO_RESULT
}

/// The persisted attributes of a job, one record per uuid.
///
/// Serialized field names are the wire/storage contract; the cas token is
/// deliberately not part of the stored document (it travels out-of-band via
/// `read_with_cas` / `set_with_cas`, and is only deserialized when a loader
/// splices it into the document).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct JobData {
    #[serde(default = "default_document_type")]
    #[builder(default = default_document_type())]
    pub document_type: String,

    #[serde(default)]
    pub job_type: String,

    #[serde(default = "default_schema_version")]
    #[builder(default = 1.0)]
    pub schema_version: f64,

    /// Opaque store token; 0 means "never persisted".
    #[serde(default, skip_serializing)]
    #[builder(default = 0)]
    pub cas: u64,

    #[serde(default = "default_now")]
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[serde(default = "default_now")]
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,

    #[serde(default = "default_uuid")]
    #[builder(default = default_uuid())]
    pub uuid: String,

    /// Derived `{jobType}_{uuid}`, kept on the record for log correlation.
    #[serde(default)]
    #[builder(default)]
    pub log_id: String,

    // last enqueue coordinates; queue_job_id == -1 marks a failed enqueue
    #[serde(default)]
    #[builder(default)]
    pub queue_name: String,

    #[serde(default)]
    #[builder(default)]
    pub queue_kwargs: Map<String, Value>,

    #[serde(default)]
    #[builder(default = 0)]
    pub queue_job_id: i64,

    #[serde(default)]
    #[builder(default)]
    pub events: Vec<Event>,

    #[serde(default)]
    #[builder(default)]
    pub warnings: Vec<WarningEntry>,

    #[serde(default)]
    #[builder(default)]
    pub errors: Vec<ErrorEntry>,

    /// True between worker start-of-run and end-of-run.
    #[serde(default)]
    #[builder(default = false)]
    pub running: bool,

    #[serde(default)]
    #[builder(default = 0)]
    pub error_count: i64,

    #[serde(default)]
    #[builder(default = 0.0)]
    pub completeness: f64,

    #[serde(default)]
    #[builder(default = 0.0)]
    pub tickcount: f64,

    #[serde(default = "default_tickval")]
    #[builder(default = 0.001)]
    pub tickval: f64,

    #[serde(default = "default_result_code")]
    #[builder(default = NO_RESULT)]
    pub result_code: i64,

    /// Handler-specific fields, persisted alongside the base attributes.
    #[serde(flatten)]
    #[builder(default)]
    pub extra: Map<String, Value>,
}

impl JobData {
    /// Whether the job has reached a terminal result.
    pub fn is_finished(&self) -> bool {
        self.result_code != NO_RESULT
    }
}

/// Read-only completeness/result view (`progress` REST collaborator).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completeness: f64,
    pub result: i64,
}

/// Read-only detail view including the audit trails.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub completeness: f64,
    pub result: i64,
    pub events: Vec<Event>,
    pub warnings: Vec<WarningEntry>,
    pub errors: Vec<ErrorEntry>,
}

/// A live job: persisted data plus the handles it persists itself through.
pub struct Job {
    pub data: JobData,
    handler: Option<Box<dyn JobHandler>>,
    datastore: Arc<dyn Datastore>,
    queue: Arc<dyn WorkQueue>,
    keepalive: Option<Arc<dyn KeepAlive>>,
    /// Errors tolerated before `continue_running` turns terminal.
    pub max_errors: i64,
}

impl Job {
    pub fn new(
        mut data: JobData,
        handler: Box<dyn JobHandler>,
        datastore: Arc<dyn Datastore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        if data.uuid.is_empty() {
            data.uuid = default_uuid();
        }
        if data.log_id.is_empty() {
            data.log_id = format!("{}_{}", data.job_type, data.uuid);
        }
        if data.queue_name.is_empty() {
            data.queue_name = queue.tube().to_string();
        }
        Self {
            data,
            handler: Some(handler),
            datastore,
            queue,
            keepalive: None,
            max_errors: MAX_ERRORS,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.data.uuid
    }

    pub fn job_type(&self) -> &str {
        &self.data.job_type
    }

    pub fn log_id(&self) -> &str {
        &self.data.log_id
    }

    /// Datastore key for this job.
    pub fn key(&self) -> String {
        format!("{}_{}", self.data.document_type, self.data.uuid)
    }

    /// Take the handler out for the duration of a run.
    pub fn take_handler(&mut self) -> Option<Box<dyn JobHandler>> {
        self.handler.take()
    }

    pub fn set_handler(&mut self, handler: Box<dyn JobHandler>) {
        self.handler = Some(handler);
    }

    pub fn set_keepalive(&mut self, keepalive: Option<Arc<dyn KeepAlive>>) {
        self.keepalive = keepalive;
    }

    /// Serialize the persisted attributes (cas excluded).
    pub fn dump(&self) -> Value {
        serde_json::to_value(&self.data).unwrap_or(Value::Null)
    }

    /// Save to the datastore, conditional on the last-seen cas.
    pub async fn save(&mut self) -> Result<(), DatastoreError> {
        self.data.updated_at = Utc::now();
        let doc = self.dump();
        let cas = self
            .datastore
            .set_with_cas(&self.key(), &doc, self.data.cas)
            .await?;
        self.data.cas = cas;
        Ok(())
    }

    /// Replace the in-memory image with the stored one, adopting its cas.
    pub async fn reload(&mut self) -> Result<(), DatastoreError> {
        if let Some((doc, cas)) = self.datastore.read_with_cas(&self.key()).await? {
            match serde_json::from_value::<JobData>(doc) {
                Ok(mut data) => {
                    data.cas = cas;
                    self.data = data;
                }
                Err(err) => {
                    error!(log_id = %self.data.log_id, error = %err, "reload produced an unreadable record");
                }
            }
        }
        Ok(())
    }

    /// Apply `mutate` and save, reloading and retrying on contention.
    ///
    /// Up to ten attempts; on exhaustion the mutation is reported as lost
    /// (`false`) and the in-memory image may have diverged from the store.
    pub async fn record_change(&mut self, mut mutate: impl FnMut(&mut JobData) + Send) -> bool {
        for _ in 0..MAX_RECORD_ATTEMPTS {
            mutate(&mut self.data);
            match self.save().await {
                Ok(()) => return true,
                Err(DatastoreError::CasMismatch(_)) => {
                    info!(log_id = %self.data.log_id, "save collision - reloading");
                }
                Err(DatastoreError::Locked(_)) => {
                    info!(log_id = %self.data.log_id, "record locked - reloading");
                }
                Err(err) => {
                    error!(log_id = %self.data.log_id, error = %err, "save failed");
                    return false;
                }
            }

            tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=MAX_JITTER_MS))).await;
            if let Err(err) = self.reload().await {
                error!(log_id = %self.data.log_id, error = %err, "reload failed");
                return false;
            }
        }

        error!(log_id = %self.data.log_id, "save failed - too many collisions");
        false
    }

    /// Set some attributes and save.
    pub async fn update_attrs(&mut self, mutate: impl FnMut(&mut JobData) + Send) -> bool {
        self.record_change(mutate).await
    }

    /// Append to the job's `events` trail.
    pub async fn record_event(&mut self, msg: &str) -> bool {
        let event = Event::new(msg);
        self.record_change(move |data| data.events.push(event.clone()))
            .await
    }

    /// Append to the job's `warnings` trail.
    pub async fn record_warning(&mut self, msg: &str) -> bool {
        let warning = WarningEntry::new(msg);
        self.record_change(move |data| data.warnings.push(warning.clone()))
            .await
    }

    /// Append to the job's `errors` trail and count it toward the retry
    /// budget.
    pub async fn record_error(&mut self, error_code: i64, msg: &str) -> bool {
        let entry = ErrorEntry::new(error_code, msg);
        self.record_change(move |data| {
            data.errors.push(entry.clone());
            data.error_count += 1;
        })
        .await
    }

    /// Record the terminal outcome of the job.
    pub async fn record_result(&mut self, result_code: i64) -> bool {
        self.update_attrs(move |data| {
            data.result_code = result_code;
            data.completeness = 1.0;
        })
        .await
    }

    /// Invoke the worker-supplied lease refresh, if any.
    pub async fn keep_alive(&self) {
        if let Some(keepalive) = &self.keepalive {
            keepalive.ping().await;
        }
    }

    /// Set the absolute completeness, clamped to `[0.0, 1.0]`.
    pub async fn set_completeness(&mut self, completeness: f64) -> bool {
        self.keep_alive().await;
        let setval = completeness.clamp(0.0, 1.0);
        if completeness < 0.0 || completeness > 1.0 {
            warn!(
                log_id = %self.data.log_id,
                completeness, "completeness out of range, clamping"
            );
        }

        let tickcount = self.data.tickcount;
        self.update_attrs(move |data| {
            data.completeness = setval;
            data.tickcount = tickcount;
        })
        .await
    }

    /// Increment completeness, folding in any unflushed ticks.
    pub async fn add_to_completeness(&mut self, delta: f64) -> bool {
        self.set_completeness(self.data.completeness + delta + self.data.tickcount)
            .await
    }

    /// Set the per-tick completeness increment.
    pub async fn set_tick_value(&mut self, tickval: f64) -> bool {
        self.update_attrs(move |data| data.tickval = tickval).await
    }

    /// Accumulate one tick; flushes to the store once the accumulated
    /// amount reaches 0.01, batching persistence for fine-grained progress.
    pub async fn tick(&mut self) -> bool {
        self.data.tickcount += self.data.tickval;
        if self.data.tickcount >= 0.01 {
            let flushed = self.add_to_completeness(0.0).await;
            self.data.tickcount = 0.0;
            return flushed;
        }
        true
    }

    /// Put this job's uuid on its queue.
    ///
    /// Persists first if the job has never been saved. A failed put is
    /// recorded as `queue_job_id == -1`; the record stays persisted and
    /// operators detect the stall by the job never turning terminal.
    pub async fn enqueue(&mut self, delay: u64, ttr: Option<u64>) -> bool {
        if self.data.cas == 0 {
            if let Err(err) = self.save().await {
                error!(log_id = %self.data.log_id, error = %err, "save before enqueue failed");
                return false;
            }
        }

        let ttr = ttr.unwrap_or(DEFAULT_TTR);
        let body = Value::String(self.data.uuid.clone()).to_string();
        let queue_job_id = match self.queue.put(&body, delay, ttr).await {
            Ok(id) if id > 0 => id as i64,
            Ok(_) => {
                warn!(log_id = %self.data.log_id, "enqueue failed");
                -1
            }
            Err(err) => {
                warn!(log_id = %self.data.log_id, error = %err, "enqueue failed");
                -1
            }
        };

        let mut kwargs = Map::new();
        kwargs.insert("delay".to_string(), delay.into());
        kwargs.insert("ttr".to_string(), ttr.into());
        let tube = self.queue.tube().to_string();
        self.update_attrs(move |data| {
            data.queue_name = tube.clone();
            data.queue_kwargs = kwargs.clone();
            data.queue_job_id = queue_job_id;
        })
        .await
    }

    /// Recovery policy consulted by the worker after an interrupted run:
    /// terminal once the error budget is spent, otherwise retry.
    pub fn continue_running(&self) -> i64 {
        if self.data.error_count >= self.max_errors {
            INTERNAL_ERROR
        } else {
            NO_RESULT
        }
    }

    /// Record an event and log it.
    pub async fn job_log_info(&mut self, msg: &str) -> bool {
        info!(log_id = %self.data.log_id, "{msg}");
        self.record_event(msg).await
    }

    /// Record a warning and log it.
    pub async fn job_log_warning(&mut self, msg: &str) -> bool {
        warn!(log_id = %self.data.log_id, "{msg}");
        self.record_warning(msg).await
    }

    /// Record an error and log it.
    pub async fn job_log_error(&mut self, error_code: i64, msg: &str) -> bool {
        error!(log_id = %self.data.log_id, error_code, "{msg}");
        self.record_error(error_code, msg).await
    }

    /// Record an error and hand control back to the worker for a retry.
    pub async fn error_continue(&mut self, error_code: i64, msg: &str) -> Outcome {
        self.job_log_error(error_code, msg).await;
        Outcome::ErrorContinue
    }

    /// Record an error and finish the job with `error_code`.
    pub async fn error_finish(&mut self, error_code: i64, msg: &str) -> Outcome {
        self.job_log_error(error_code, msg).await;
        self.record_result(error_code).await;
        Outcome::ErrorFinish
    }

    /// Record a warning and hand control back to the worker for a retry.
    pub async fn warning_continue(&mut self, msg: &str) -> Outcome {
        self.job_log_warning(msg).await;
        Outcome::WarningContinue
    }

    /// Record a warning and finish the job with `result_code`.
    pub async fn warning_finish(&mut self, result_code: i64, msg: &str) -> Outcome {
        self.job_log_warning(msg).await;
        self.record_result(result_code).await;
        Outcome::WarningFinish
    }

    /// Completeness and result, for polling callers.
    pub fn progress(&self) -> Progress {
        Progress {
            completeness: self.data.completeness,
            result: self.data.result_code,
        }
    }

    /// Completeness, result, and the audit trails.
    pub fn info(&self) -> JobInfo {
        JobInfo {
            completeness: self.data.completeness,
            result: self.data.result_code,
            events: self.data.events.clone(),
            warnings: self.data.warnings.clone(),
            errors: self.data.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::queue::{MemoryBroker, QueueError, ReservedJob};
    use async_trait::async_trait;
    use serde_json::json;

    struct NullHandler;

    #[async_trait]
    impl JobHandler for NullHandler {
        async fn run(&mut self, _job: &mut Job) -> anyhow::Result<Outcome> {
            Ok(Outcome::Done(200))
        }
    }

    fn make_job() -> (Job, Arc<MemoryDatastore>) {
        let datastore = Arc::new(MemoryDatastore::new());
        let broker = MemoryBroker::new();
        let queue = Arc::new(broker.queue("test_jobs"));
        let data = JobData::builder().job_type("test_job").build();
        let job = Job::new(data, Box::new(NullHandler), datastore.clone(), queue);
        (job, datastore)
    }

    #[test]
    fn data_defaults_are_not_persisted_state() {
        let data = JobData::builder().job_type("test_job").build();
        assert_eq!(data.cas, 0);
        assert_eq!(data.result_code, NO_RESULT);
        assert_eq!(data.completeness, 0.0);
        assert_eq!(data.tickval, 0.001);
        assert!(!data.running);
    }

    #[test]
    fn new_job_derives_log_id_and_queue_name() {
        let (job, _) = make_job();
        assert_eq!(job.log_id(), format!("test_job_{}", job.uuid()));
        assert_eq!(job.data.queue_name, "test_jobs");
    }

    #[test]
    fn dump_uses_wire_field_names_and_omits_cas() {
        let (job, _) = make_job();
        let doc = job.dump();
        assert_eq!(doc["documentType"], "zerog_job");
        assert_eq!(doc["jobType"], "test_job");
        assert_eq!(doc["resultCode"], -1);
        assert!(doc.get("cas").is_none());
    }

    #[test]
    fn extra_fields_survive_a_round_trip() {
        let doc = json!({
            "jobType": "test_job",
            "uuid": "u-1",
            "goodness": "gracious",
        });
        let data: JobData = serde_json::from_value(doc).unwrap();
        assert_eq!(data.extra["goodness"], "gracious");
        let back = serde_json::to_value(&data).unwrap();
        assert_eq!(back["goodness"], "gracious");
    }

    #[tokio::test]
    async fn save_then_reload_reproduces_attributes() {
        let (mut job, _) = make_job();
        job.data.completeness = 0.25;
        job.save().await.unwrap();
        let cas = job.data.cas;
        assert!(cas > 0);

        job.data.completeness = 0.9;
        job.reload().await.unwrap();
        assert_eq!(job.data.completeness, 0.25);
        assert_eq!(job.data.cas, cas);
    }

    #[tokio::test]
    async fn record_result_sets_completeness_to_one() {
        let (mut job, _) = make_job();
        assert!(job.record_result(200).await);
        assert_eq!(job.data.result_code, 200);
        assert_eq!(job.data.completeness, 1.0);
        assert!(job.data.is_finished());
    }

    #[tokio::test]
    async fn error_count_tracks_errors_trail() {
        let (mut job, _) = make_job();
        job.record_error(500, "first").await;
        job.record_error(502, "second").await;
        assert_eq!(job.data.error_count, 2);
        assert_eq!(job.data.errors.len(), 2);
        assert_eq!(job.data.errors[1].error_code, 502);
    }

    #[tokio::test]
    async fn completeness_is_clamped_on_write() {
        let (mut job, _) = make_job();
        job.set_completeness(1.5).await;
        assert_eq!(job.data.completeness, 1.0);
        job.set_completeness(-0.5).await;
        assert_eq!(job.data.completeness, 0.0);
    }

    #[tokio::test]
    async fn ticks_batch_until_one_percent() {
        let (mut job, _) = make_job();
        for _ in 0..9 {
            job.tick().await;
        }
        // still accumulating, nothing flushed
        assert_eq!(job.data.completeness, 0.0);
        assert!(job.data.tickcount > 0.008);

        // one or two more ticks crosses the flush threshold (float rounding
        // may leave the ninth sum a hair under 0.01)
        job.tick().await;
        if job.data.completeness == 0.0 {
            job.tick().await;
        }
        assert!(job.data.completeness >= 0.0099);
        assert_eq!(job.data.tickcount, 0.0);
    }

    #[tokio::test]
    async fn concurrent_record_changes_both_land() {
        let datastore: Arc<MemoryDatastore> = Arc::new(MemoryDatastore::new());
        let broker = MemoryBroker::new();
        let queue = Arc::new(broker.queue("test_jobs"));
        let data = JobData::builder().job_type("test_job").uuid("u-1").build();

        let mut first = Job::new(
            data.clone(),
            Box::new(NullHandler),
            datastore.clone(),
            queue.clone(),
        );
        first.save().await.unwrap();

        // second handle loads the same record, then both mutate
        let mut second = Job::new(data, Box::new(NullHandler), datastore.clone(), queue);
        second.reload().await.unwrap();

        assert!(first.record_event("from first").await);
        // second's cas is now stale; the change loop must reload and retry
        assert!(second.record_event("from second").await);

        second.reload().await.unwrap();
        let msgs: Vec<_> = second.data.events.iter().map(|e| e.msg.as_str()).collect();
        assert_eq!(msgs, vec!["from first", "from second"]);
    }

    #[tokio::test]
    async fn enqueue_persists_then_records_coordinates() {
        let datastore: Arc<MemoryDatastore> = Arc::new(MemoryDatastore::new());
        let broker = MemoryBroker::new();
        let queue = Arc::new(broker.queue("test_jobs"));
        let data = JobData::builder().job_type("test_job").build();
        let mut job = Job::new(data, Box::new(NullHandler), datastore.clone(), queue.clone());

        assert_eq!(job.data.cas, 0);
        assert!(job.enqueue(0, None).await);
        assert!(job.data.cas > 0);
        assert!(job.data.queue_job_id > 0);
        assert_eq!(job.data.queue_name, "test_jobs");
        assert_eq!(job.data.queue_kwargs["ttr"], DEFAULT_TTR);

        use crate::queue::WorkQueue as _;
        let reserved = queue
            .reserve(Some(Duration::ZERO))
            .await
            .unwrap()
            .expect("enqueued body");
        let uuid: String = serde_json::from_str(&reserved.body).unwrap();
        assert_eq!(uuid, job.uuid());
    }

    #[tokio::test]
    async fn failed_enqueue_marks_queue_job_id() {
        struct DeadQueue;

        #[async_trait]
        impl crate::queue::WorkQueue for DeadQueue {
            fn tube(&self) -> &str {
                "dead"
            }
            async fn put(&self, _: &str, _: u64, _: u64) -> Result<u64, QueueError> {
                Err(QueueError::Socket("gone".to_string()))
            }
            async fn reserve(
                &self,
                _: Option<Duration>,
            ) -> Result<Option<ReservedJob>, QueueError> {
                Ok(None)
            }
            async fn delete(&self, id: u64) -> Result<(), QueueError> {
                Err(QueueError::NotFound(id))
            }
            async fn release(&self, id: u64, _: u64) -> Result<(), QueueError> {
                Err(QueueError::NotFound(id))
            }
            async fn bury(&self, id: u64) -> Result<(), QueueError> {
                Err(QueueError::NotFound(id))
            }
            async fn touch(&self, id: u64) -> Result<(), QueueError> {
                Err(QueueError::NotFound(id))
            }
            async fn stats_job(&self, id: u64) -> Result<crate::queue::JobStats, QueueError> {
                Err(QueueError::NotFound(id))
            }
            async fn attach(&self) -> Result<(), QueueError> {
                Ok(())
            }
            async fn detach(&self) -> Result<(), QueueError> {
                Ok(())
            }
            async fn list_tubes(&self) -> Result<Vec<String>, QueueError> {
                Ok(vec![])
            }
            async fn stats_tube(
                &self,
                _: &str,
            ) -> Result<crate::queue::TubeStats, QueueError> {
                Ok(crate::queue::TubeStats::default())
            }
        }

        let datastore = Arc::new(MemoryDatastore::new());
        let data = JobData::builder().job_type("test_job").build();
        let mut job = Job::new(data, Box::new(NullHandler), datastore, Arc::new(DeadQueue));

        assert!(job.enqueue(0, None).await);
        assert_eq!(job.data.queue_job_id, -1);
    }

    #[tokio::test]
    async fn continue_running_respects_error_budget() {
        let (mut job, _) = make_job();
        assert_eq!(job.continue_running(), NO_RESULT);
        for n in 0..MAX_ERRORS {
            job.record_error(500, &format!("error {n}")).await;
        }
        assert_eq!(job.continue_running(), INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn finish_helpers_record_and_terminate() {
        let (mut job, _) = make_job();
        let outcome = job.error_finish(476, "it errored to death").await;
        assert_eq!(outcome, Outcome::ErrorFinish);
        assert_eq!(job.data.result_code, 476);
        assert_eq!(job.data.errors.len(), 1);
        assert_eq!(job.data.errors[0].error_code, 476);

        let (mut job, _) = make_job();
        let outcome = job.warning_finish(291, "warning, mon").await;
        assert_eq!(outcome, Outcome::WarningFinish);
        assert_eq!(job.data.result_code, 291);
        assert_eq!(job.data.warnings.len(), 1);
        assert_eq!(job.data.warnings[0].msg, "warning, mon");
    }
}
