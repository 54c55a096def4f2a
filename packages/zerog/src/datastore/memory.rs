//! In-process datastore with real CAS semantics.
//!
//! Backs tests and single-node development. The cas token is a global
//! sequence number; lock/unlock follow the get-and-lock model where a
//! correct-cas write releases the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Datastore, DatastoreError};

#[derive(Clone)]
struct Entry {
    value: Value,
    cas: u64,
    locked: bool,
}

/// Hash-map datastore used by tests and dev deployments.
#[derive(Default)]
pub struct MemoryDatastore {
    records: Mutex<HashMap<String, Entry>>,
    sequence: AtomicU64,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cas(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn create(&self, key: &str, value: &Value) -> Result<(), DatastoreError> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(key) {
            return Err(DatastoreError::Exists(key.to_string()));
        }
        records.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                cas: self.next_cas(),
                locked: false,
            },
        );
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, DatastoreError> {
        let records = self.records.lock().unwrap();
        Ok(records.get(key).map(|e| e.value.clone()))
    }

    async fn read_with_cas(&self, key: &str) -> Result<Option<(Value, u64)>, DatastoreError> {
        let records = self.records.lock().unwrap();
        Ok(records.get(key).map(|e| (e.value.clone(), e.cas)))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), DatastoreError> {
        let mut records = self.records.lock().unwrap();
        if let Some(entry) = records.get(key) {
            if entry.locked {
                return Err(DatastoreError::Locked(key.to_string()));
            }
        }
        records.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                cas: self.next_cas(),
                locked: false,
            },
        );
        Ok(())
    }

    async fn set_with_cas(
        &self,
        key: &str,
        value: &Value,
        cas: u64,
    ) -> Result<u64, DatastoreError> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(key) {
            None => {
                let new_cas = self.next_cas();
                records.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        cas: new_cas,
                        locked: false,
                    },
                );
                Ok(new_cas)
            }
            Some(entry) => {
                if entry.cas != cas {
                    if entry.locked {
                        return Err(DatastoreError::Locked(key.to_string()));
                    }
                    return Err(DatastoreError::CasMismatch(key.to_string()));
                }
                entry.value = value.clone();
                entry.cas = self.next_cas();
                entry.locked = false;
                Ok(entry.cas)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), DatastoreError> {
        let mut records = self.records.lock().unwrap();
        records
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| DatastoreError::Missing(key.to_string()))
    }

    async fn lock(&self, key: &str) -> Result<(Value, u64), DatastoreError> {
        let mut records = self.records.lock().unwrap();
        let entry = records
            .get_mut(key)
            .ok_or_else(|| DatastoreError::Missing(key.to_string()))?;
        if entry.locked {
            return Err(DatastoreError::Locked(key.to_string()));
        }
        entry.locked = true;
        Ok((entry.value.clone(), entry.cas))
    }

    async fn unlock(&self, key: &str, cas: u64) -> Result<(), DatastoreError> {
        let mut records = self.records.lock().unwrap();
        let entry = records
            .get_mut(key)
            .ok_or_else(|| DatastoreError::Missing(key.to_string()))?;
        if entry.cas != cas {
            return Err(DatastoreError::Locked(key.to_string()));
        }
        entry.locked = false;
        Ok(())
    }
}
