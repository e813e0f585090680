//! Processor trait and related types.

use async_trait::async_trait;

use crate::Result;
use crate::pipeline::WorkItem;

/// An item handed to the next stage's input queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub item: WorkItem,
    /// Target priority level; `None` means the queue's lowest priority.
    pub level: Option<usize>,
}

impl Forward {
    pub fn new(item: WorkItem) -> Self {
        Self { item, level: None }
    }

    pub fn at_level(mut self, level: Option<usize>) -> Self {
        self.level = level;
        self
    }
}

/// Per-item work performed by a stage worker.
///
/// Returning `Ok(None)` drops the item (nothing to forward, or last stage).
/// An error marked fatal (see [`crate::Error::is_fatal`]) terminates the
/// worker; any other error is logged and the worker moves on.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn process(&self, item: WorkItem) -> Result<Option<Forward>>;
}
