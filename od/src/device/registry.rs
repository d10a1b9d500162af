//! Scoped cache of device handles
//!
//! Handles are created on first acquisition for a task and reused by later
//! steps of the same task. A delegated flow can alias the handle under the
//! peer's correlation id. The cache is bounded; once full, the oldest entry
//! is dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::{ConnectionInfo, Device, DeviceError, DeviceProvider};

struct Entries {
    handles: HashMap<String, Arc<dyn Device>>,
    order: VecDeque<String>,
}

pub struct DeviceRegistry {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "DeviceRegistry::new: called");
        Self {
            entries: Mutex::new(Entries {
                handles: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Cached handle for `key`
    pub fn get(&self, key: &str) -> Option<Arc<dyn Device>> {
        let entries = self.entries.lock().ok()?;
        entries.handles.get(key).cloned()
    }

    pub fn insert(&self, key: &str, device: Arc<dyn Device>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.handles.insert(key.to_string(), device).is_none() {
            entries.order.push_back(key.to_string());
        }
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                info!(key = %oldest, "DeviceRegistry: evicting oldest handle");
                entries.handles.remove(&oldest);
            }
        }
    }

    /// Make the handle under `key` reachable under `alias` as well
    pub fn alias(&self, key: &str, alias: &str) {
        if let Some(device) = self.get(key) {
            self.insert(alias, device);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.handles.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached handle for the task, connecting on first use
    ///
    /// A correlation id takes precedence over the task id so a peer's
    /// follow-up request reuses the handle of the flow it belongs to.
    pub async fn acquire(
        &self,
        task_id: &str,
        correlation_id: Option<&str>,
        conn: &ConnectionInfo,
        provider: &dyn DeviceProvider,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        debug!(%task_id, ?correlation_id, host = %conn.host, "acquire: called");
        if let Some(device) = correlation_id.and_then(|c| self.get(c)) {
            debug!("acquire: reusing handle by correlation id");
            self.insert(task_id, device.clone());
            return Ok(device);
        }
        if let Some(device) = self.get(task_id) {
            debug!("acquire: reusing handle by task id");
            return Ok(device);
        }

        let device = provider.connect(conn).await?;
        self.insert(task_id, device.clone());
        if let Some(correlation_id) = correlation_id {
            self.alias(task_id, correlation_id);
        }
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimDeviceProvider};

    #[tokio::test]
    async fn test_acquire_connects_once_per_task() {
        let provider = SimDeviceProvider::new(SimDevice::new("dev1"));
        let registry = DeviceRegistry::new(8);
        let conn = ConnectionInfo::default();

        let a = registry.acquire("t1", None, &conn, &provider).await.unwrap();
        let b = registry.acquire("t1", None, &conn, &provider).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_correlation_alias_is_shared() {
        let provider = SimDeviceProvider::new(SimDevice::new("dev1"));
        let registry = DeviceRegistry::new(8);
        let conn = ConnectionInfo::default();

        let first = registry.acquire("t1", Some("corr"), &conn, &provider).await.unwrap();
        let second = registry.acquire("t2", Some("corr"), &conn, &provider).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.connect_count(), 1);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_cached() {
        let provider = SimDeviceProvider::new(SimDevice::new("dev1"));
        provider.fail_connect(DeviceError::Request {
            code: 401,
            message: "unauthorized".into(),
        });
        let registry = DeviceRegistry::new(8);

        let err = registry
            .acquire("t1", None, &ConnectionInfo::default(), &provider)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), 401);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_oldest_entry_evicted() {
        let registry = DeviceRegistry::new(2);
        registry.insert("a", Arc::new(SimDevice::new("a")));
        registry.insert("b", Arc::new(SimDevice::new("b")));
        registry.insert("c", Arc::new(SimDevice::new("c")));

        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
        assert!(registry.get("c").is_some());
        assert_eq!(registry.len(), 2);
    }
}
