//! Persistence collaborator for discovered devices.
//!
//! Processors and feeders only talk to the [`DeviceStore`] trait. Two
//! implementations exist: [`SqliteStore`] (sqlx, used in production) and
//! [`MemoryStore`] (in-process, used when no database is configured and in
//! tests).

mod memory;
mod models;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use models::{
    AddressEntry, DeviceCounts, DeviceId, DeviceIdentity, Record, RecordKind, STAT_WINDOWS_HOURS,
    StoreStats,
};
pub use sqlite::SqliteStore;

use crate::Result;

/// Devices that failed this many consecutive probes are no longer rescanned.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Device repository trait.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert the device if it is new, otherwise mark it reachable again.
    /// Returns `true` when a new device was created.
    async fn upsert_device(&self, id: &DeviceId, identity: &DeviceIdentity) -> Result<bool>;

    /// Count one more failed probe; returns the new retry count.
    async fn mark_unreachable(&self, id: &DeviceId) -> Result<u32>;

    async fn append_record(&self, id: &DeviceId, record: Record) -> Result<()>;

    /// Devices with fewer than `max_retry` failed probes, a known address,
    /// and no status record newer than `max_age`.
    async fn devices_needing_work(
        &self,
        max_age: Duration,
        max_retry: u32,
    ) -> Result<Vec<AddressEntry>>;

    /// Latest address of every device.
    async fn latest_addresses(&self) -> Result<Vec<AddressEntry>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite URL such as `sqlite:devscout.db?mode=rwc`. In-memory when unset.
    pub database_url: Option<String>,
}

/// Open the configured backend.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn DeviceStore>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(SqliteStore::connect(url).await?)),
        None => {
            tracing::warn!("No database configured, device records are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
