//! Key/value persistence with compare-and-swap writes.
//!
//! Jobs persist themselves through this trait; the only write path used by
//! the job lifecycle is [`Datastore::set_with_cas`]. A concrete store maps
//! the `cas` token to whatever it natively exposes (CAS, ETag, version).

mod memory;

pub use memory::MemoryDatastore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Attempts allowed for a timed-out operation. Three timeouts are retried
/// transparently; the fourth propagates.
const MAX_TIMEOUT_ATTEMPTS: u32 = 4;

/// Failure kinds surfaced by a datastore.
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// The stored cas token differs from the caller's.
    #[error("cas mismatch for key {0}")]
    CasMismatch(String),

    /// The record is locked by another caller.
    #[error("key {0} is locked")]
    Locked(String),

    /// The operation timed out.
    #[error("datastore operation timed out")]
    Timeout,

    /// The key does not exist.
    #[error("key {0} not found")]
    Missing(String),

    /// `create` on a key that already exists.
    #[error("key {0} already exists")]
    Exists(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Key/value store with CAS writes and lock/unlock primitives.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Insert a new record. Fails with [`DatastoreError::Exists`] if the key
    /// is already present.
    async fn create(&self, key: &str, value: &Value) -> Result<(), DatastoreError>;

    /// Read a record, or `None` if absent.
    async fn read(&self, key: &str) -> Result<Option<Value>, DatastoreError>;

    /// Read a record together with its cas token, or `None` if absent.
    async fn read_with_cas(&self, key: &str) -> Result<Option<(Value, u64)>, DatastoreError>;

    /// Unconditional upsert.
    async fn set(&self, key: &str, value: &Value) -> Result<(), DatastoreError>;

    /// Conditional upsert. Succeeds as an insert when the key is missing;
    /// otherwise the stored cas must equal `cas`. Returns the new cas token.
    async fn set_with_cas(&self, key: &str, value: &Value, cas: u64)
        -> Result<u64, DatastoreError>;

    /// Delete a record.
    async fn delete(&self, key: &str) -> Result<(), DatastoreError>;

    /// Read and lock a record for exclusive read-modify-write.
    async fn lock(&self, key: &str) -> Result<(Value, u64), DatastoreError>;

    /// Release a lock taken by [`Datastore::lock`].
    async fn unlock(&self, key: &str, cas: u64) -> Result<(), DatastoreError>;
}

/// Retry `op` while it reports a timeout, up to [`MAX_TIMEOUT_ATTEMPTS`] attempts.
async fn with_timeout_retries<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T, DatastoreError>
where
    Fut: std::future::Future<Output = Result<T, DatastoreError>>,
{
    let mut tries = 0;
    loop {
        match op().await {
            Err(DatastoreError::Timeout) => {
                tries += 1;
                if tries == MAX_TIMEOUT_ATTEMPTS {
                    return Err(DatastoreError::Timeout);
                }
                info!(tries, "datastore timeout - retrying");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => return other,
        }
    }
}

/// Decorator that transparently retries timed-out operations.
///
/// Timeouts are retried up to three times; the fourth propagates. All other
/// errors pass straight through.
pub struct RetryDatastore<D> {
    inner: Arc<D>,
}

impl<D: Datastore> RetryDatastore<D> {
    pub fn new(inner: Arc<D>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<D: Datastore> Datastore for RetryDatastore<D> {
    async fn create(&self, key: &str, value: &Value) -> Result<(), DatastoreError> {
        with_timeout_retries(|| self.inner.create(key, value)).await
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, DatastoreError> {
        with_timeout_retries(|| self.inner.read(key)).await
    }

    async fn read_with_cas(&self, key: &str) -> Result<Option<(Value, u64)>, DatastoreError> {
        with_timeout_retries(|| self.inner.read_with_cas(key)).await
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), DatastoreError> {
        with_timeout_retries(|| self.inner.set(key, value)).await
    }

    async fn set_with_cas(
        &self,
        key: &str,
        value: &Value,
        cas: u64,
    ) -> Result<u64, DatastoreError> {
        with_timeout_retries(|| self.inner.set_with_cas(key, value, cas)).await
    }

    async fn delete(&self, key: &str) -> Result<(), DatastoreError> {
        with_timeout_retries(|| self.inner.delete(key)).await
    }

    async fn lock(&self, key: &str) -> Result<(Value, u64), DatastoreError> {
        with_timeout_retries(|| self.inner.lock(key)).await
    }

    async fn unlock(&self, key: &str, cas: u64) -> Result<(), DatastoreError> {
        with_timeout_retries(|| self.inner.unlock(key, cas)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Times out a configurable number of times before succeeding.
    struct FlakyStore {
        timeouts: AtomicU32,
        inner: MemoryDatastore,
    }

    impl FlakyStore {
        fn new(timeouts: u32) -> Self {
            Self {
                timeouts: AtomicU32::new(timeouts),
                inner: MemoryDatastore::new(),
            }
        }

        fn maybe_timeout(&self) -> Result<(), DatastoreError> {
            let remaining = self
                .timeouts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match remaining {
                Ok(_) => Err(DatastoreError::Timeout),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Datastore for FlakyStore {
        async fn create(&self, key: &str, value: &Value) -> Result<(), DatastoreError> {
            self.maybe_timeout()?;
            self.inner.create(key, value).await
        }

        async fn read(&self, key: &str) -> Result<Option<Value>, DatastoreError> {
            self.maybe_timeout()?;
            self.inner.read(key).await
        }

        async fn read_with_cas(
            &self,
            key: &str,
        ) -> Result<Option<(Value, u64)>, DatastoreError> {
            self.maybe_timeout()?;
            self.inner.read_with_cas(key).await
        }

        async fn set(&self, key: &str, value: &Value) -> Result<(), DatastoreError> {
            self.maybe_timeout()?;
            self.inner.set(key, value).await
        }

        async fn set_with_cas(
            &self,
            key: &str,
            value: &Value,
            cas: u64,
        ) -> Result<u64, DatastoreError> {
            self.maybe_timeout()?;
            self.inner.set_with_cas(key, value, cas).await
        }

        async fn delete(&self, key: &str) -> Result<(), DatastoreError> {
            self.maybe_timeout()?;
            self.inner.delete(key).await
        }

        async fn lock(&self, key: &str) -> Result<(Value, u64), DatastoreError> {
            self.maybe_timeout()?;
            self.inner.lock(key).await
        }

        async fn unlock(&self, key: &str, cas: u64) -> Result<(), DatastoreError> {
            self.maybe_timeout()?;
            self.inner.unlock(key, cas).await
        }
    }

    #[tokio::test]
    async fn retries_transient_timeouts() {
        let store = RetryDatastore::new(Arc::new(FlakyStore::new(3)));
        let value = serde_json::json!({"a": 1});
        store.set("k", &value).await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn propagates_persistent_timeouts() {
        let store = RetryDatastore::new(Arc::new(FlakyStore::new(10)));
        let err = store.read("k").await.unwrap_err();
        assert!(matches!(err, DatastoreError::Timeout));
    }
}
