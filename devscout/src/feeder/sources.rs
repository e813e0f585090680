//! Where feeders get their work items from.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::migration;
use crate::pipeline::WorkItem;
use crate::store::{DEFAULT_MAX_RETRY, DeviceStore};
use crate::{Error, Result};

/// One poll's worth of items.
#[derive(Debug, Default)]
pub struct SourceBatch {
    pub items: Vec<WorkItem>,
    /// No further polls will produce anything; the feeder exits.
    pub exhausted: bool,
}

impl SourceBatch {
    pub fn more(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            exhausted: false,
        }
    }

    pub fn last(items: Vec<WorkItem>) -> Self {
        Self {
            items,
            exhausted: true,
        }
    }
}

/// A producer of work items polled by a feeder.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    async fn poll(&self) -> Result<SourceBatch>;

    /// Delay between two polls.
    fn interval(&self) -> Duration;

    /// Worker count reported in status for one running instance.
    fn concurrency(&self) -> usize {
        1
    }
}

fn default_max_age_hours() -> u64 {
    12
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

/// Source definition inside a feeder kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Periodically re-enqueue stored devices whose status is stale.
    StoreRescan {
        #[serde(default = "default_max_age_hours")]
        max_age_hours: u64,
        #[serde(default = "default_interval_secs")]
        interval_secs: u64,
        #[serde(default = "default_max_retry")]
        max_retry: u32,
    },
    /// Read targets from a file once. `{region}` in the path is replaced by
    /// the instance's region.
    TargetFile { path: String },
    /// Enqueue the latest address of every stored device once.
    StoreMigrate,
}

impl SourceConfig {
    pub fn build(
        &self,
        kind: &str,
        region: Option<&str>,
        store: Arc<dyn DeviceStore>,
    ) -> Arc<dyn Source> {
        match self {
            SourceConfig::StoreRescan {
                max_age_hours,
                interval_secs,
                max_retry,
            } => Arc::new(StoreRescanSource {
                kind: kind.to_string(),
                store,
                max_age: Duration::from_secs(max_age_hours.saturating_mul(3600)),
                max_retry: *max_retry,
                interval: Duration::from_secs(*interval_secs),
            }),
            SourceConfig::TargetFile { path } => Arc::new(TargetFileSource::new(
                kind,
                path,
                region.map(str::to_string),
            )),
            SourceConfig::StoreMigrate => Arc::new(StoreMigrateSource {
                kind: kind.to_string(),
                store,
            }),
        }
    }
}

/// Recurring rescan of devices the store reports as due.
pub struct StoreRescanSource {
    kind: String,
    store: Arc<dyn DeviceStore>,
    max_age: Duration,
    max_retry: u32,
    interval: Duration,
}

#[async_trait]
impl Source for StoreRescanSource {
    fn name(&self) -> &'static str {
        "store_rescan"
    }

    async fn poll(&self) -> Result<SourceBatch> {
        match self
            .store
            .devices_needing_work(self.max_age, self.max_retry)
            .await
        {
            Ok(due) => {
                debug!(devices = due.len(), "Devices due for rescan");
                let items = due
                    .into_iter()
                    .map(|entry| WorkItem::new(entry.ip, entry.port, &self.kind).with_device(entry.device))
                    .collect();
                Ok(SourceBatch::more(items))
            }
            Err(e) => {
                warn!(error = %e, "Store unavailable, skipping rescan");
                Ok(SourceBatch::default())
            }
        }
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

/// One-shot list of targets read from a text file.
///
/// One target per line (see [`WorkItem::parse_target`]); blank lines and
/// lines starting with `#` are skipped.
pub struct TargetFileSource {
    kind: String,
    path: PathBuf,
    region: Option<String>,
}

impl TargetFileSource {
    pub fn new(kind: &str, path: &str, region: Option<String>) -> Self {
        let path = match &region {
            Some(region) => path.replace("{region}", region),
            None => path.to_string(),
        };
        Self {
            kind: kind.to_string(),
            path: PathBuf::from(path),
            region,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn parse(&self, content: &str) -> Vec<WorkItem> {
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|line| match WorkItem::parse_target(line, &self.kind) {
                Ok(item) => Some(item.with_region(self.region.clone())),
                Err(e) => {
                    warn!(path = %self.path.display(), line, error = %e, "Skipping invalid target");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Source for TargetFileSource {
    fn name(&self) -> &'static str {
        "target_file"
    }

    async fn poll(&self) -> Result<SourceBatch> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::fatal(format!("cannot read {}: {e}", self.path.display())))?;
        Ok(SourceBatch::last(self.parse(&content)))
    }

    fn interval(&self) -> Duration {
        Duration::ZERO
    }
}

/// One-shot re-enqueue of every stored device.
pub struct StoreMigrateSource {
    kind: String,
    store: Arc<dyn DeviceStore>,
}

#[async_trait]
impl Source for StoreMigrateSource {
    fn name(&self) -> &'static str {
        "store_migrate"
    }

    async fn poll(&self) -> Result<SourceBatch> {
        let items = migration::migration_items(self.store.as_ref(), &self.kind).await?;
        Ok(SourceBatch::last(items))
    }

    fn interval(&self) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Record};
    use std::io::Write;

    #[tokio::test]
    async fn test_target_file_reads_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# cameras").unwrap();
        writeln!(file, "10.0.0.1:80").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file, "10.0.0.2 8080 hw_id=x").unwrap();

        let source = TargetFileSource::new("targets", file.path().to_str().unwrap(), None);
        let batch = source.poll().await.unwrap();
        assert!(batch.exhausted);
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.items[1].identity.hw_id.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_target_file_region_substitution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ES.txt"), "10.0.0.3:81\n").unwrap();
        let template = format!("{}/{{region}}.txt", dir.path().display());

        let source = TargetFileSource::new("regional", &template, Some("ES".into()));
        assert!(source.path().ends_with("ES.txt"));
        let batch = source.poll().await.unwrap();
        assert_eq!(batch.items[0].region.as_deref(), Some("ES"));
    }

    #[tokio::test]
    async fn test_missing_target_file_is_fatal() {
        let source = TargetFileSource::new("targets", "/nonexistent/devscout/targets.txt", None);
        assert!(source.poll().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_store_rescan_emits_due_devices() {
        let store = Arc::new(MemoryStore::new());
        let item = WorkItem::new("10.0.0.4".parse().unwrap(), 80, "x");
        let id = item.identity.device_id(&item.addr_key());
        store.upsert_device(&id, &item.identity).await.unwrap();
        store
            .append_record(&id, Record::address(item.ip, item.port))
            .await
            .unwrap();

        let config = SourceConfig::StoreRescan {
            max_age_hours: 12,
            interval_secs: 60,
            max_retry: 3,
        };
        let source = config.build("rescan", None, store);
        assert_eq!(source.interval(), Duration::from_secs(60));

        let batch = source.poll().await.unwrap();
        assert!(!batch.exhausted);
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].device.as_ref(), Some(&id));
        assert_eq!(batch.items[0].source, "rescan");
    }

    #[tokio::test]
    async fn test_store_rescan_with_unbounded_age() {
        let store = Arc::new(MemoryStore::new());
        let item = WorkItem::new("10.0.0.5".parse().unwrap(), 80, "x");
        let id = item.identity.device_id(&item.addr_key());
        store.upsert_device(&id, &item.identity).await.unwrap();
        store
            .append_record(&id, Record::address(item.ip, item.port))
            .await
            .unwrap();

        let config = SourceConfig::StoreRescan {
            max_age_hours: u64::MAX,
            interval_secs: 60,
            max_retry: 3,
        };
        let source = config.build("rescan", None, store);
        let batch = source.poll().await.unwrap();
        assert_eq!(batch.items.len(), 1);
    }

    #[test]
    fn test_source_config_defaults() {
        let config: SourceConfig = serde_json::from_str(r#"{"type":"store_rescan"}"#).unwrap();
        assert_eq!(
            config,
            SourceConfig::StoreRescan {
                max_age_hours: 12,
                interval_secs: 3600,
                max_retry: 3
            }
        );
    }
}
