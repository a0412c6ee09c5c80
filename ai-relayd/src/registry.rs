//! Process-wide map of reachable AI services.
//!
//! Written by the discovery listener and the staleness sweeper, read by the
//! relay and the listing API. Every operation takes the single lock for the
//! duration of one in-memory map access, so operations are linearizable and
//! no reader ever sees a half-applied update. Nothing performs I/O while
//! holding the lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use chrono::Utc;
use once_cell::sync::OnceCell;
use shared::types::ServiceRecord;

static SHARED: OnceCell<Arc<ServiceRegistry>> = OnceCell::new();

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, ServiceRecord>>,
}

impl ServiceRegistry {
    /// Create a standalone registry. The daemon uses [`ServiceRegistry::shared`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first call.
    ///
    /// Concurrent first calls race on the `OnceCell`; exactly one registry is
    /// constructed and every caller receives a handle to it.
    pub fn shared() -> Arc<ServiceRegistry> {
        SHARED.get_or_init(|| Arc::new(ServiceRegistry::new())).clone()
    }

    // Critical sections never leave the map half-written, so a poisoned lock
    // still guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServiceRecord>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a service or overwrite the endpoint of an existing one
    pub fn upsert(&self, name: impl Into<String>, endpoint: SocketAddr) {
        self.upsert_record(ServiceRecord::new(name, endpoint));
    }

    /// Insert or replace a full record. `first_seen` of an existing entry is kept.
    pub fn upsert_record(&self, mut record: ServiceRecord) {
        let mut services = self.lock();
        if let Some(existing) = services.get(&record.name) {
            record.first_seen = existing.first_seen;
        }
        services.insert(record.name.clone(), record);
    }

    /// Delete a service. Unknown names are ignored.
    pub fn remove(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    /// Detached copy of the current name-to-endpoint mapping
    pub fn snapshot(&self) -> HashMap<String, SocketAddr> {
        self.lock()
            .iter()
            .map(|(name, record)| (name.clone(), record.endpoint))
            .collect()
    }

    /// Endpoint for `name`, or `None` if the service is not (or no longer) known
    pub fn lookup(&self, name: &str) -> Option<SocketAddr> {
        self.lock().get(name).map(|record| record.endpoint)
    }

    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.lock().get(name).cloned()
    }

    /// Detached copies of all records, sorted by name
    pub fn records(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every record whose last discovery event is older than `max_age`.
    /// Returns the evicted names.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<String> {
        // An age beyond chrono's range predates every record
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        self.lock().retain(|name, record| {
            let fresh = record.last_seen >= cutoff;
            if !fresh {
                evicted.push(name.clone());
            }
            fresh
        });
        evicted
    }
}
