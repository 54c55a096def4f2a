//! Registry mapping job type strings to handler factories.
//!
//! The registry is how a worker turns a bare uuid leased from the queue
//! back into a runnable [`Job`]: read the persisted document, pick the
//! factory for its `jobType`, validate the document through the factory's
//! deserializer, and hand back the hydrated job.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::datastore::Datastore;
use crate::jobs::{make_key, Job, JobData, JobHandler};
use crate::queue::WorkQueue;

type LoaderFn = Box<dyn Fn(&Value) -> Result<Box<dyn JobHandler>> + Send + Sync>;

/// A registered job type: its type tag, schema version, and the loader
/// that validates a document and constructs the handler.
///
/// The loader doubles as the schema: deserializing the handler type is the
/// validation step. A factory without a loader is rejected at registration.
pub struct JobFactory {
    pub job_type: String,
    pub schema_version: f64,
    loader: Option<LoaderFn>,
}

impl JobFactory {
    /// Factory for a handler type that deserializes from the job document.
    pub fn for_handler<H>(job_type: &str) -> Self
    where
        H: JobHandler + DeserializeOwned + 'static,
    {
        Self {
            job_type: job_type.to_string(),
            schema_version: 1.0,
            loader: Some(Box::new(|doc| {
                let handler: H = serde_json::from_value(doc.clone())
                    .map_err(|e| anyhow!("job document failed validation: {e}"))?;
                Ok(Box::new(handler))
            })),
        }
    }

    pub fn with_schema_version(mut self, schema_version: f64) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// A factory with no loader; rejected by [`JobRegistry::add_factories`].
    pub fn without_schema(job_type: &str) -> Self {
        Self {
            job_type: job_type.to_string(),
            schema_version: 1.0,
            loader: None,
        }
    }
}

/// Why a factory was not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationError {
    /// The factory carries no job type tag.
    NoJobType,
    /// The factory carries no document loader.
    NoSchema,
}

/// Per-factory registration outcome.
#[derive(Debug)]
pub struct Registration {
    pub job_type: String,
    pub success: bool,
    pub error: Option<RegistrationError>,
}

struct RegisteredFactory {
    schema_version: f64,
    loader: LoaderFn,
}

/// Maps `jobType` strings to factories and hydrates jobs from storage.
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<String, RegisteredFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one handler type under its job type tag.
    pub fn register<H>(&mut self, job_type: &str)
    where
        H: JobHandler + DeserializeOwned + 'static,
    {
        self.add_factories(vec![JobFactory::for_handler::<H>(job_type)]);
    }

    /// Register a batch of factories, reporting per-factory outcomes.
    pub fn add_factories(&mut self, factories: Vec<JobFactory>) -> Vec<Registration> {
        let mut results = Vec::with_capacity(factories.len());
        for factory in factories {
            let job_type = factory.job_type;
            let error = if job_type.is_empty() {
                Some(RegistrationError::NoJobType)
            } else {
                match factory.loader {
                    None => Some(RegistrationError::NoSchema),
                    Some(loader) => {
                        self.factories.insert(
                            job_type.clone(),
                            RegisteredFactory {
                                schema_version: factory.schema_version,
                                loader,
                            },
                        );
                        None
                    }
                }
            };
            results.push(Registration {
                job_type,
                success: error.is_none(),
                error,
            });
        }
        results
    }

    /// Every registered job type tag.
    pub fn registered_types(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }

    /// Schema version registered for a job type.
    pub fn schema_version(&self, job_type: &str) -> Option<f64> {
        self.factories.get(job_type).map(|f| f.schema_version)
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    /// Instantiate a job from document data.
    ///
    /// The type comes from `job_type` or, failing that, from the document's
    /// own `jobType` field. Returns `None` for unknown types; a document
    /// that fails the factory's validation is an error.
    pub fn make_job(
        &self,
        doc: &Value,
        datastore: Arc<dyn Datastore>,
        queue: Arc<dyn WorkQueue>,
        job_type: Option<&str>,
    ) -> Result<Option<Job>> {
        let job_type = job_type
            .map(str::to_string)
            .or_else(|| {
                doc.get("jobType")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let Some(factory) = self.factories.get(&job_type) else {
            warn!(job_type = %job_type, "no factory for job type");
            return Ok(None);
        };

        let handler = (factory.loader)(doc)?;
        let mut data: JobData = serde_json::from_value(doc.clone())?;
        if data.job_type.is_empty() {
            data.job_type = job_type;
        }
        Ok(Some(Job::new(data, handler, datastore, queue)))
    }

    /// Load a persisted job by uuid.
    ///
    /// Reads `{documentType}_{uuid}`, splices the store's cas token into
    /// the document, and hydrates via [`JobRegistry::make_job`].
    pub async fn get_job(
        &self,
        uuid: &str,
        datastore: Arc<dyn Datastore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Result<Option<Job>> {
        let Some((mut doc, cas)) = datastore.read_with_cas(&make_key(uuid)).await? else {
            return Ok(None);
        };
        if let Some(map) = doc.as_object_mut() {
            map.insert("cas".to_string(), cas.into());
        }
        self.make_job(&doc, datastore, queue, None)
    }
}
