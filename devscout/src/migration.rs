//! Bulk re-enqueue of every device already in the store.
//!
//! Used after schema or pipeline changes so that every known device goes
//! through the stages again: once at startup with `devscout serve --requeue`,
//! or at runtime through a feeder kind with a `store_migrate` source.

use tracing::info;

use crate::Result;
use crate::pipeline::{WorkItem, WorkQueue};
use crate::store::DeviceStore;

/// One work item per stored device, at its latest known address.
pub async fn migration_items(store: &dyn DeviceStore, source: &str) -> Result<Vec<WorkItem>> {
    let addresses = store.latest_addresses().await?;
    info!(devices = addresses.len(), "Found devices to requeue");
    Ok(addresses
        .into_iter()
        .map(|entry| WorkItem::new(entry.ip, entry.port, source).with_device(entry.device))
        .collect())
}

/// Put every stored device into `queue` at `level`. Returns how many were
/// enqueued.
pub async fn requeue_known_devices(
    store: &dyn DeviceStore,
    queue: &WorkQueue,
    level: Option<usize>,
) -> Result<usize> {
    let items = migration_items(store, "migration").await?;
    let count = items.len();
    for item in items {
        queue.put(item, level);
    }
    info!(count, "Requeued known devices");
    Ok(count)
}
