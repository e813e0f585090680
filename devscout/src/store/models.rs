//! Persisted entities: devices, their time-stamped records and summaries.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Recent-activity windows reported by [`StoreStats`], in hours.
pub const STAT_WINDOWS_HOURS: [i64; 4] = [6, 12, 24, 48];

/// Stable device identifier (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware hints a device reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_id: Option<String>,
}

impl DeviceIdentity {
    pub fn is_empty(&self) -> bool {
        [&self.mac, &self.wifi_mac, &self.hw_id]
            .iter()
            .all(|v| v.as_deref().is_none_or(|s| s.trim().is_empty()))
    }

    /// Derive the device id from the hints, or from `fallback` (usually
    /// `ip:port`) when no hint is present.
    ///
    /// MAC separators and case are ignored, so `AA-BB-..` and `aa:bb:..`
    /// identify the same device.
    pub fn device_id(&self, fallback: &str) -> DeviceId {
        let key = if self.is_empty() {
            fallback.to_ascii_lowercase()
        } else {
            format!(
                "{}|{}|{}",
                normalize_mac(self.mac.as_deref()),
                normalize_mac(self.wifi_mac.as_deref()),
                self.hw_id.as_deref().unwrap_or_default().trim().to_ascii_lowercase()
            )
        };
        DeviceId(hex::encode(Sha256::digest(key.as_bytes())))
    }
}

fn normalize_mac(mac: Option<&str>) -> String {
    mac.unwrap_or_default()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.') && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Kind of a time-stamped record attached to a device.
///
/// The display form is what the `kind` column stores; unknown values read
/// back as [`RecordKind::Other`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "PascalCase")]
pub enum RecordKind {
    Address,
    Status,
    Location,
    Credentials,
    Other,
}

/// One observation about a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Record {
    pub fn new(kind: RecordKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            at: Utc::now(),
            data,
        }
    }

    pub fn address(ip: IpAddr, port: u16) -> Self {
        Self::new(
            RecordKind::Address,
            serde_json::json!({ "ip": ip.to_string(), "port": port }),
        )
    }

    pub fn status(online: bool, latency_ms: Option<u64>) -> Self {
        Self::new(
            RecordKind::Status,
            serde_json::json!({ "online": online, "latency_ms": latency_ms }),
        )
    }

    /// The `(ip, port)` carried by an address record.
    pub fn as_address(&self) -> Option<(IpAddr, u16)> {
        if self.kind != RecordKind::Address {
            return None;
        }
        let ip = self.data.get("ip")?.as_str()?.parse().ok()?;
        let port = u16::try_from(self.data.get("port")?.as_u64()?).ok()?;
        Some((ip, port))
    }
}

/// Latest known address of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressEntry {
    pub device: DeviceId,
    pub ip: IpAddr,
    pub port: u16,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCounts {
    #[serde(rename = "Total")]
    pub total: u64,
    /// Devices that answered their last probe.
    #[serde(rename = "Active")]
    pub active: u64,
}

/// Store-wide statistics served by `GET /status_db`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    #[serde(rename = "Devices")]
    pub devices: DeviceCounts,
    #[serde(rename = "Records")]
    pub records: BTreeMap<RecordKind, u64>,
    /// Records written in each of the [`STAT_WINDOWS_HOURS`] windows,
    /// keyed `last <n>h`.
    #[serde(rename = "Recent")]
    pub recent: BTreeMap<String, u64>,
}

pub(crate) fn window_label(hours: i64) -> String {
    format!("last {hours}h")
}
