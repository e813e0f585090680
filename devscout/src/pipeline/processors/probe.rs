use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::traits::{Forward, Processor};
use crate::Result;
use crate::pipeline::WorkItem;
use crate::store::{DeviceId, DeviceStore, Record};

/// Checks whether a candidate answers on its TCP port and records the result.
///
/// Reachable devices are upserted, get an address and an online status
/// record, and are forwarded. Known devices that do not answer get an offline
/// status and one more retry; unknown ones are simply dropped.
pub struct TcpProbeProcessor {
    store: Arc<dyn DeviceStore>,
    timeout: Duration,
    forward_level: Option<usize>,
}

impl TcpProbeProcessor {
    pub fn new(store: Arc<dyn DeviceStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            forward_level: None,
        }
    }

    pub fn with_forward_level(mut self, level: Option<usize>) -> Self {
        self.forward_level = level;
        self
    }

    async fn connect(&self, item: &WorkItem) -> Option<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(item.addr())).await {
            Ok(Ok(_stream)) => Some(started.elapsed()),
            Ok(Err(e)) => {
                debug!(addr = %item.addr(), error = %e, "Connection refused or failed");
                None
            }
            Err(_) => {
                debug!(addr = %item.addr(), timeout = ?self.timeout, "Connection timed out");
                None
            }
        }
    }

    async fn record_online(&self, device: &DeviceId, item: &WorkItem, latency_ms: u64) {
        let result = async {
            if self.store.upsert_device(device, &item.identity).await? {
                debug!(%device, addr = %item.addr(), "New device");
            }
            self.store
                .append_record(device, Record::address(item.ip, item.port))
                .await?;
            self.store
                .append_record(device, Record::status(true, Some(latency_ms)))
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(%device, error = %e, "Failed to record reachable device");
        }
    }

    async fn record_offline(&self, device: &DeviceId) {
        let result = async {
            let retry = self.store.mark_unreachable(device).await?;
            self.store
                .append_record(device, Record::status(false, None))
                .await?;
            Ok::<_, crate::Error>(retry)
        }
        .await;

        match result {
            Ok(retry) => debug!(%device, retry, "Known device unreachable"),
            Err(e) => warn!(%device, error = %e, "Failed to record unreachable device"),
        }
    }
}

#[async_trait]
impl Processor for TcpProbeProcessor {
    fn name(&self) -> &'static str {
        "tcp_probe"
    }

    async fn process(&self, mut item: WorkItem) -> Result<Option<Forward>> {
        let known = item.device.clone();
        let device = known
            .clone()
            .unwrap_or_else(|| item.identity.device_id(&item.addr_key()));

        match self.connect(&item).await {
            Some(latency) => {
                let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
                self.record_online(&device, &item, latency_ms).await;
                item.device = Some(device);
                item.attributes
                    .insert("latency_ms".to_string(), latency_ms.into());
                Ok(Some(Forward::new(item).at_level(self.forward_level)))
            }
            None => {
                if known.is_some() {
                    self.record_offline(&device).await;
                }
                Ok(None)
            }
        }
    }
}
