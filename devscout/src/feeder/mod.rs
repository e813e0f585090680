//! Feeders: producers that push work items into the first queue.
//!
//! A feeder kind is configured once and may have several running instances
//! (one per region for region-parameterized kinds). Stopped feeders are never
//! resumed; they exit and are pruned.

mod sources;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub use sources::{
    Source, SourceBatch, SourceConfig, StoreMigrateSource, StoreRescanSource, TargetFileSource,
};

use crate::pipeline::WorkQueue;
use crate::process::{IdAllocator, ProcessContext, ProcessControl, ProcessHandle};
use crate::store::DeviceStore;
use crate::{Error, Result};

/// A feeder kind as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeederConfig {
    pub kind: String,
    /// One instance per region when non-empty.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Delay after starting each instance.
    #[serde(default)]
    pub pacing_ms: Option<u64>,
    /// Priority level of produced items; lowest when unset.
    #[serde(default)]
    pub level: Option<usize>,
    /// Start this kind together with the controller.
    #[serde(default)]
    pub autostart: bool,
    pub source: SourceConfig,
}

impl FeederConfig {
    pub fn is_regional(&self) -> bool {
        !self.regions.is_empty()
    }

    pub fn pacing(&self) -> Duration {
        match self.pacing_ms {
            Some(ms) => Duration::from_millis(ms),
            None if self.is_regional() => Duration::from_secs(2),
            None => Duration::from_secs(1),
        }
    }

    /// Regions to start, or a single unnamed instance.
    pub fn instances(&self) -> Vec<Option<String>> {
        if self.is_regional() {
            self.regions.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        }
    }
}

/// Per-kind entry of the status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FeederStatus {
    /// Active instances of a plain kind.
    Count(usize),
    /// Worker count per instance of a region-parameterized kind.
    PerInstance(BTreeMap<usize, usize>),
}

/// Everything a running feeder needs besides its process context.
#[derive(Clone)]
pub struct FeederSpec {
    pub kind: Arc<str>,
    pub source: Arc<dyn Source>,
    pub output: Arc<WorkQueue>,
    pub level: Option<usize>,
}

/// Poll the source and push its items until stopped, terminated, or the
/// source is exhausted.
pub async fn run_feeder(ctx: ProcessContext, spec: FeederSpec) {
    let id = ctx.id();
    let kind = spec.kind.clone();
    info!(kind = %kind, id, source = spec.source.name(), "Feeder started");

    loop {
        if ctx.is_terminated() || !ctx.is_active() {
            break;
        }

        let polled = tokio::select! {
            biased;
            _ = ctx.terminated() => break,
            _ = ctx.deactivated() => break,
            polled = spec.source.poll() => polled,
        };

        match polled {
            Ok(batch) => {
                let count = batch.items.len();
                for item in batch.items {
                    spec.output.put(item, spec.level);
                }
                ctx.heartbeat();
                if count > 0 {
                    info!(kind = %kind, id, count, "Fed items");
                }
                if batch.exhausted {
                    info!(kind = %kind, id, "Source exhausted");
                    break;
                }
            }
            Err(e) if e.is_fatal() => {
                error!(kind = %kind, id, error = %e, "Feeder failed");
                break;
            }
            Err(e) => warn!(kind = %kind, id, error = %e, "Poll failed"),
        }

        tokio::select! {
            biased;
            _ = ctx.terminated() => break,
            _ = ctx.deactivated() => break,
            _ = tokio::time::sleep(spec.source.interval()) => {}
        }
    }

    info!(kind = %kind, id, "Feeder exited");
}

/// Running instances of one feeder kind, in start order.
pub struct FeederPool {
    config: FeederConfig,
    handles: Vec<(ProcessHandle, usize)>,
    ids: IdAllocator,
}

impl FeederPool {
    pub fn new(config: FeederConfig) -> Self {
        Self {
            config,
            handles: Vec::new(),
            ids: IdAllocator::default(),
        }
    }

    pub fn config(&self) -> &FeederConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.handles.iter().filter(|(h, _)| h.is_active()).count()
    }

    /// Start one instance for `region`. Returns its id.
    pub fn start_instance(
        &mut self,
        region: Option<&str>,
        store: Arc<dyn DeviceStore>,
        output: Arc<WorkQueue>,
        heartbeat_ticks: u32,
    ) -> Result<usize> {
        let id = self.ids.acquire()?;
        let source = self.config.source.build(&self.config.kind, region, store);
        let concurrency = source.concurrency();
        let spec = FeederSpec {
            kind: Arc::from(self.config.kind.as_str()),
            source,
            output,
            level: self.config.level,
        };

        let control = ProcessControl::new(id, self.config.kind.as_str(), heartbeat_ticks);
        let handle = ProcessHandle::start(control, move |ctx| run_feeder(ctx, spec));
        debug!(kind = %self.config.kind, id, region, "Feeder instance started");
        self.handles.push((handle, concurrency));
        Ok(id)
    }

    /// Stop the most recently started active instance.
    pub fn stop_latest(&mut self) -> Result<usize> {
        let (handle, _) = self
            .handles
            .iter()
            .rev()
            .find(|(h, _)| h.is_active())
            .ok_or_else(|| Error::NoActiveFeeder(self.config.kind.clone()))?;
        handle.stop();
        Ok(handle.id())
    }

    /// Drop instances that exited or were stopped.
    pub fn prune(&mut self) -> usize {
        let before = self.handles.len();
        let ids = &mut self.ids;
        self.handles.retain(|(h, _)| {
            let keep = h.is_alive() && h.is_active();
            if !keep {
                h.terminate();
                ids.release(h.id());
            }
            keep
        });
        before - self.handles.len()
    }

    pub fn status(&self) -> FeederStatus {
        if self.config.is_regional() {
            FeederStatus::PerInstance(
                self.handles
                    .iter()
                    .enumerate()
                    .map(|(index, (h, concurrency))| {
                        (index, if h.is_active() { *concurrency } else { 0 })
                    })
                    .collect(),
            )
        } else {
            FeederStatus::Count(self.active_count())
        }
    }

    pub fn terminate_all(&mut self) {
        for (handle, _) in &self.handles {
            handle.terminate();
        }
    }

    /// Terminate every instance and hand the handles over for joining.
    pub fn take_handles(&mut self) -> Vec<ProcessHandle> {
        self.terminate_all();
        for (handle, _) in &self.handles {
            self.ids.release(handle.id());
        }
        std::mem::take(&mut self.handles)
            .into_iter()
            .map(|(handle, _)| handle)
            .collect()
    }
}

impl Drop for FeederPool {
    fn drop(&mut self) {
        self.terminate_all();
    }
}
