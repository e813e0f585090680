//! The loop run by every stage worker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use work_queue::PriorityQueue;

use super::WorkItem;
use super::processors::Processor;
use crate::Error;
use crate::process::ProcessContext;

/// Everything a worker needs besides its process context.
#[derive(Clone)]
pub struct WorkerSpec {
    pub stage: Arc<str>,
    pub input: Arc<PriorityQueue<WorkItem>>,
    /// `None` for the last stage.
    pub output: Option<Arc<PriorityQueue<WorkItem>>>,
    pub processor: Arc<dyn Processor>,
    /// Heartbeat period while idle or paused.
    pub idle_heartbeat: Duration,
}

/// Pull items from the input queue and process them until terminated or a
/// fatal error occurs.
///
/// While paused the worker idles without touching the queue. An interrupt
/// abandons the item being processed.
pub async fn run_stage_worker(ctx: ProcessContext, spec: WorkerSpec) {
    let id = ctx.id();
    let stage = spec.stage.clone();
    info!(stage = %stage, id, "Worker started");

    loop {
        if ctx.is_terminated() {
            break;
        }

        if !ctx.is_active() {
            debug!(stage = %stage, id, "Worker paused");
            if !ctx.wait_until_active(spec.idle_heartbeat).await {
                break;
            }
            debug!(stage = %stage, id, "Worker resumed");
            continue;
        }

        let item = tokio::select! {
            biased;
            _ = ctx.terminated() => break,
            _ = ctx.deactivated() => continue,
            item = spec.input.get() => item,
            _ = tokio::time::sleep(spec.idle_heartbeat) => {
                ctx.heartbeat();
                continue;
            }
        };

        let addr = item.addr();
        // Termination lets the current item finish; only an interrupt cuts it short.
        let result = tokio::select! {
            result = spec.processor.process(item) => result,
            _ = ctx.interrupted() => Err(Error::Interrupted),
        };

        match result {
            Ok(Some(forward)) => match &spec.output {
                Some(output) => {
                    output.put(forward.item, forward.level);
                }
                None => debug!(stage = %stage, id, %addr, "Last stage, dropping forwarded item"),
            },
            Ok(None) => {}
            Err(e) if e.is_fatal() => {
                error!(stage = %stage, id, %addr, error = %e, "Worker failed");
                break;
            }
            Err(Error::Interrupted) => {
                warn!(stage = %stage, id, %addr, "Processing interrupted, item abandoned");
            }
            Err(e) => {
                warn!(stage = %stage, id, %addr, error = %e, "Item failed");
            }
        }

        ctx.heartbeat();
    }

    info!(stage = %stage, id, "Worker exited");
}
