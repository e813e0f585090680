use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{DeviceId, DeviceIdentity};
use crate::{Error, Result};

/// A unit of work flowing through the pipeline: one candidate device address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub ip: IpAddr,
    pub port: u16,
    /// Name of the feeder kind that produced the item.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Set when the item comes from a device the store already knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceId>,
    #[serde(default)]
    pub identity: DeviceIdentity,
    pub discovered_at: DateTime<Utc>,
    /// Free-form data gathered by earlier stages.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl WorkItem {
    pub fn new(ip: IpAddr, port: u16, source: impl Into<String>) -> Self {
        Self {
            ip,
            port,
            source: source.into(),
            region: None,
            device: None,
            identity: DeviceIdentity::default(),
            discovered_at: Utc::now(),
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// `ip:port`, used as identity fallback and in logs.
    pub fn addr_key(&self) -> String {
        self.addr().to_string()
    }

    /// Parse one target line: `ip:port`, `[v6]:port`, or `ip port`.
    ///
    /// Anything after the address is split on whitespace into `key=value`
    /// attributes (`mac=`, `wifi_mac=` and `hw_id=` fill the identity).
    pub fn parse_target(line: &str, source: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let head = parts
            .next()
            .ok_or_else(|| Error::validation("empty target line"))?;

        let (addr, rest): (SocketAddr, Vec<&str>) = match head.parse::<SocketAddr>() {
            Ok(addr) => (addr, parts.collect()),
            Err(_) => {
                let ip: IpAddr = head
                    .parse()
                    .map_err(|_| Error::validation(format!("invalid address: {head}")))?;
                let port = parts
                    .next()
                    .ok_or_else(|| Error::validation(format!("missing port for {head}")))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::validation(format!("invalid port: {port}")))?;
                (SocketAddr::new(ip, port), parts.collect())
            }
        };

        let mut item = Self::new(addr.ip(), addr.port(), source);
        for pair in rest {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "mac" => item.identity.mac = Some(value.to_string()),
                "wifi_mac" => item.identity.wifi_mac = Some(value.to_string()),
                "hw_id" => item.identity.hw_id = Some(value.to_string()),
                _ => {
                    item.attributes
                        .insert(key.to_string(), serde_json::Value::from(value));
                }
            }
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_form() {
        let item = WorkItem::parse_target("192.168.0.7:81", "targets").unwrap();
        assert_eq!(item.addr_key(), "192.168.0.7:81");
        assert_eq!(item.source, "targets");
        assert!(item.identity.is_empty());
    }

    #[test]
    fn test_parse_space_form_with_hints() {
        let item =
            WorkItem::parse_target("10.0.0.5 8080 mac=AA:BB:CC:DD:EE:FF model=x1", "targets")
                .unwrap();
        assert_eq!(item.port, 8080);
        assert_eq!(item.identity.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(item.attributes["model"], "x1");
    }

    #[test]
    fn test_parse_ipv6() {
        let item = WorkItem::parse_target("[::1]:554", "targets").unwrap();
        assert!(item.ip.is_ipv6());
        assert_eq!(item.port, 554);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WorkItem::parse_target("", "t").is_err());
        assert!(WorkItem::parse_target("not-an-ip:80", "t").is_err());
        assert!(WorkItem::parse_target("10.0.0.1", "t").is_err());
        assert!(WorkItem::parse_target("10.0.0.1 99999", "t").is_err());
    }
}
