use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use strum::IntoEnumIterator;

use super::models::window_label;
use super::{
    AddressEntry, DeviceId, DeviceIdentity, DeviceStore, Record, RecordKind, STAT_WINDOWS_HOURS,
    StoreStats,
};
use crate::{Error, Result};

#[derive(Debug)]
struct DeviceEntry {
    identity: DeviceIdentity,
    retry: u32,
    records: Vec<Record>,
}

impl DeviceEntry {
    fn latest(&self, kind: RecordKind) -> Option<&Record> {
        self.records
            .iter()
            .filter(|r| r.kind == kind)
            .max_by_key(|r| r.at)
    }

    fn latest_address(&self, id: &DeviceId) -> Option<AddressEntry> {
        let record = self.latest(RecordKind::Address)?;
        let (ip, port) = record.as_address()?;
        Some(AddressEntry {
            device: id.clone(),
            ip,
            port,
            at: record.at,
        })
    }
}

/// In-process [`DeviceStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// All records of one device, oldest first.
    pub fn records(&self, id: &DeviceId) -> Vec<Record> {
        self.devices
            .read()
            .get(id)
            .map(|d| d.records.clone())
            .unwrap_or_default()
    }

    pub fn identity(&self, id: &DeviceId) -> Option<DeviceIdentity> {
        self.devices.read().get(id).map(|d| d.identity.clone())
    }

    pub fn retry(&self, id: &DeviceId) -> Option<u32> {
        self.devices.read().get(id).map(|d| d.retry)
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn upsert_device(&self, id: &DeviceId, identity: &DeviceIdentity) -> Result<bool> {
        let mut devices = self.devices.write();
        match devices.get_mut(id) {
            Some(entry) => {
                entry.retry = 0;
                Ok(false)
            }
            None => {
                devices.insert(
                    id.clone(),
                    DeviceEntry {
                        identity: identity.clone(),
                        retry: 0,
                        records: Vec::new(),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn mark_unreachable(&self, id: &DeviceId) -> Result<u32> {
        let mut devices = self.devices.write();
        let entry = devices
            .get_mut(id)
            .ok_or_else(|| Error::store(format!("unknown device {id}")))?;
        entry.retry += 1;
        Ok(entry.retry)
    }

    async fn append_record(&self, id: &DeviceId, record: Record) -> Result<()> {
        let mut devices = self.devices.write();
        let entry = devices
            .get_mut(id)
            .ok_or_else(|| Error::store(format!("unknown device {id}")))?;
        entry.records.push(record);
        Ok(())
    }

    async fn devices_needing_work(
        &self,
        max_age: Duration,
        max_retry: u32,
    ) -> Result<Vec<AddressEntry>> {
        let cutoff = cutoff(max_age);
        let devices = self.devices.read();
        let mut due: Vec<_> = devices
            .iter()
            .filter(|(_, d)| d.retry < max_retry)
            .filter(|(_, d)| {
                d.latest(RecordKind::Status)
                    .is_none_or(|status| status.at <= cutoff)
            })
            .filter_map(|(id, d)| d.latest_address(id))
            .collect();
        due.sort_by(|a, b| a.device.cmp(&b.device));
        Ok(due)
    }

    async fn latest_addresses(&self) -> Result<Vec<AddressEntry>> {
        let devices = self.devices.read();
        let mut addresses: Vec<_> = devices
            .iter()
            .filter_map(|(id, d)| d.latest_address(id))
            .collect();
        addresses.sort_by(|a, b| a.device.cmp(&b.device));
        Ok(addresses)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let now = Utc::now();
        let devices = self.devices.read();
        let mut stats = StoreStats::default();
        stats.devices.total = devices.len() as u64;
        stats.devices.active = devices.values().filter(|d| d.retry == 0).count() as u64;

        let mut records: BTreeMap<RecordKind, u64> =
            RecordKind::iter().map(|k| (k, 0)).collect();
        let mut recent: BTreeMap<String, u64> = STAT_WINDOWS_HOURS
            .iter()
            .map(|h| (window_label(*h), 0))
            .collect();

        for record in devices.values().flat_map(|d| d.records.iter()) {
            *records.entry(record.kind).or_default() += 1;
            for hours in STAT_WINDOWS_HOURS {
                if record.at > now - chrono::Duration::hours(hours) {
                    *recent.entry(window_label(hours)).or_default() += 1;
                }
            }
        }

        stats.records = records;
        stats.recent = recent;
        Ok(stats)
    }
}

fn cutoff(max_age: Duration) -> DateTime<Utc> {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(max_age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
