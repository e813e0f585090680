//! Per-item processors run by stage workers.

mod locate;
mod probe;
mod traits;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use locate::LocationRecorder;
pub use probe::TcpProbeProcessor;
pub use traits::{Forward, Processor};

use crate::store::DeviceStore;

fn default_probe_timeout_ms() -> u64 {
    3000
}

/// Processor selection in a stage definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorConfig {
    TcpProbe {
        #[serde(default = "default_probe_timeout_ms")]
        timeout_ms: u64,
        /// Priority level for forwarded items.
        #[serde(default)]
        forward_level: Option<usize>,
    },
    LocationRecorder,
}

impl ProcessorConfig {
    pub fn build(&self, store: Arc<dyn DeviceStore>) -> Arc<dyn Processor> {
        match self {
            ProcessorConfig::TcpProbe {
                timeout_ms,
                forward_level,
            } => Arc::new(
                TcpProbeProcessor::new(store, Duration::from_millis(*timeout_ms))
                    .with_forward_level(*forward_level),
            ),
            ProcessorConfig::LocationRecorder => Arc::new(LocationRecorder::new(store)),
        }
    }
}
