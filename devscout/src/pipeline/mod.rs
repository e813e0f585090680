//! Staged processing pipeline.
//!
//! Stage `i` reads queue `i` and writes queue `i + 1`; the last stage has no
//! output queue. Each stage owns a [`StagePool`] of workers that the
//! controller grows and shrinks from the depth of the stage's input queue.

mod item;
pub mod processors;
pub mod scaling;
mod stage;
mod worker;

pub use item::WorkItem;
pub use processors::{Forward, Processor, ProcessorConfig};
pub use scaling::{ScalingFormula, ScalingTerm, ideal_workers};
pub use stage::{HangReport, ScaleOutcome, StageConfig, StagePool};
pub use worker::{WorkerSpec, run_stage_worker};

/// Queue of work items between two stages.
pub type WorkQueue = work_queue::PriorityQueue<WorkItem>;
