use dashmap::DashMap;
use std::sync::Arc;

use crate::config::DeviceConfig;

use super::record::DriverRecord;

/// Process-wide map of device-id → driver runtime record (§4.3).
///
/// Writers: only the owning driver worker, one per device id. Readers — the
/// HTTP handlers, the ingestion fan-out, the status printer — take a cheap
/// `Clone` of a single record and never hold a reference across an await
/// point.
#[derive(Debug, Clone)]
pub struct Snapshot {
    drivers: Arc<DashMap<String, DriverRecord>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Snapshot {
            drivers: Arc::new(DashMap::new()),
        }
    }

    /// Seeds one record per configured device. Called once at supervisor
    /// start and again on restart after the map has been cleared.
    pub fn register_device(&self, config: DeviceConfig) {
        self.drivers
            .insert(config.id.clone(), DriverRecord::starting(config));
    }

    /// A consistent copy of one driver's record (§4.3: "a reader seeing
    /// `tags` always sees them from a single scan").
    pub fn get(&self, device_id: &str) -> Option<DriverRecord> {
        self.drivers.get(device_id).map(|r| r.clone())
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.drivers.contains_key(device_id)
    }

    /// Mutates one record in place under the map's per-shard lock. Only the
    /// owning worker should call this for a given device id.
    pub fn with_record_mut<R>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut DriverRecord) -> R,
    ) -> Option<R> {
        self.drivers.get_mut(device_id).map(|mut r| f(&mut r))
    }

    /// Every device id currently tracked.
    pub fn device_ids(&self) -> Vec<String> {
        self.drivers.iter().map(|e| e.key().clone()).collect()
    }

    /// Full snapshot, for `GET /api/dados` and the fan-out tick.
    pub fn all(&self) -> Vec<(String, DriverRecord)> {
        self.drivers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Drops every record. Used during restart between stopping the old
    /// worker set and registering the reloaded configuration (§5).
    pub fn clear(&self) {
        self.drivers.clear();
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}
