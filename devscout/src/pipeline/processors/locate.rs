use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::traits::{Forward, Processor};
use crate::Result;
use crate::pipeline::WorkItem;
use crate::store::{DeviceStore, Record, RecordKind};

/// Attribute keys copied into a location record.
const LOCATION_KEYS: [&str; 6] = ["lat", "lng", "accuracy", "country", "city", "address"];

/// Stores whatever location the earlier stages learned about a device.
///
/// Coordinates and place names come from the item's attributes; the
/// feeder's region is used as a coarse fallback. Items without any location
/// hint are dropped.
pub struct LocationRecorder {
    store: Arc<dyn DeviceStore>,
}

impl LocationRecorder {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }

    fn location_of(item: &WorkItem) -> Option<Value> {
        let mut data: Map<String, Value> = LOCATION_KEYS
            .iter()
            .filter_map(|k| item.attributes.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();

        if let Some(region) = &item.region {
            data.entry("region").or_insert_with(|| json!(region));
        }
        if data.is_empty() {
            return None;
        }

        // 0 = coordinates, 1 = place name, 2 = region only.
        let detail = if data.contains_key("lat") && data.contains_key("lng") {
            0
        } else if data.contains_key("country") || data.contains_key("city") {
            1
        } else {
            2
        };
        data.insert("detail".to_string(), json!(detail));
        Some(Value::Object(data))
    }
}

#[async_trait]
impl Processor for LocationRecorder {
    fn name(&self) -> &'static str {
        "location_recorder"
    }

    async fn process(&self, item: WorkItem) -> Result<Option<Forward>> {
        let Some(location) = Self::location_of(&item) else {
            debug!(addr = %item.addr(), "No location hints");
            return Ok(None);
        };

        let device = item
            .device
            .clone()
            .unwrap_or_else(|| item.identity.device_id(&item.addr_key()));

        let stored = async {
            self.store.upsert_device(&device, &item.identity).await?;
            self.store
                .append_record(&device, Record::new(RecordKind::Location, location))
                .await
        }
        .await;

        if let Err(e) = stored {
            warn!(%device, error = %e, "Failed to store location");
        }
        Ok(None)
    }
}
