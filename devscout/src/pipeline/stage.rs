//! A stage's worker pool and its reconciliation toward an ideal size.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::processors::ProcessorConfig;
use super::worker::{WorkerSpec, run_stage_worker};
use crate::process::{IdAllocator, ProcessControl, ProcessHandle};

/// One pipeline stage as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub processor: ProcessorConfig,
    /// Upper bound on workers regardless of queue depth.
    #[serde(default)]
    pub max_workers: Option<usize>,
}

/// What one call to [`StagePool::scale_to`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub stopped: usize,
    pub resumed: usize,
    pub created: usize,
}

impl ScaleOutcome {
    /// Signed change in active workers.
    pub fn delta(&self) -> i64 {
        (self.resumed + self.created) as i64 - self.stopped as i64
    }

    pub fn is_noop(&self) -> bool {
        self.delta() == 0
    }
}

/// Result of one hang check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HangReport {
    pub interrupted: Vec<usize>,
    pub aborted: Vec<usize>,
}

impl HangReport {
    pub fn is_empty(&self) -> bool {
        self.interrupted.is_empty() && self.aborted.is_empty()
    }
}

/// The workers of one stage, in creation order.
pub struct StagePool {
    spec: WorkerSpec,
    heartbeat_ticks: u32,
    workers: Vec<ProcessHandle>,
    ids: IdAllocator,
}

impl StagePool {
    pub fn new(spec: WorkerSpec, heartbeat_ticks: u32) -> Self {
        Self {
            spec,
            heartbeat_ticks,
            workers: Vec::new(),
            ids: IdAllocator::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.stage
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_active()).count()
    }

    pub fn ids(&self) -> Vec<usize> {
        self.workers.iter().map(ProcessHandle::id).collect()
    }

    pub fn workers(&self) -> &[ProcessHandle] {
        &self.workers
    }

    /// Drop workers whose task has ended and free their ids.
    pub fn prune(&mut self) -> usize {
        let before = self.workers.len();
        let ids = &mut self.ids;
        self.workers.retain(|w| {
            let alive = w.is_alive();
            if !alive {
                ids.release(w.id());
            }
            alive
        });
        before - self.workers.len()
    }

    /// Count down every worker's heartbeat and deal with the ones at zero.
    ///
    /// A worker at zero is interrupted. If it already ignored
    /// `max_interrupts` interrupts in a row it is aborted instead.
    pub fn check_hangs(&mut self, max_interrupts: u32) -> HangReport {
        let mut report = HangReport::default();
        for worker in &self.workers {
            if worker.beat() > 0 {
                continue;
            }
            if worker.control().missed_interrupts() >= max_interrupts {
                worker.abort();
                report.aborted.push(worker.id());
            } else {
                worker.interrupt();
                report.interrupted.push(worker.id());
            }
        }
        report
    }

    /// Move the number of active workers toward `ideal`.
    ///
    /// Scaling down stops the most recently created active workers first.
    /// Scaling up resumes paused workers oldest first and only creates new
    /// ones, with the smallest free ids, when none are left to resume.
    pub fn scale_to(&mut self, ideal: usize) -> ScaleOutcome {
        let mut outcome = ScaleOutcome::default();
        let active = self.active_count();

        if ideal < active {
            let mut excess = active - ideal;
            for worker in self.workers.iter().rev() {
                if excess == 0 {
                    break;
                }
                if worker.is_active() && worker.stop() {
                    excess -= 1;
                    outcome.stopped += 1;
                }
            }
        } else if ideal > active {
            let mut missing = ideal - active;
            for worker in &self.workers {
                if missing == 0 {
                    break;
                }
                if worker.is_paused() && worker.resume() {
                    missing -= 1;
                    outcome.resumed += 1;
                }
            }
            while missing > 0 {
                match self.spawn_worker() {
                    Some(_) => {
                        missing -= 1;
                        outcome.created += 1;
                    }
                    None => break,
                }
            }
        }

        outcome
    }

    /// Terminate every paused worker. Returns how many were told to exit.
    pub fn terminate_paused(&mut self) -> usize {
        let mut count = 0;
        for worker in &self.workers {
            if worker.is_paused() {
                worker.terminate();
                count += 1;
            }
        }
        count
    }

    pub fn terminate_all(&mut self) {
        for worker in &self.workers {
            worker.terminate();
        }
    }

    /// Terminate every worker and hand the handles over for joining.
    pub fn take_workers(&mut self) -> Vec<ProcessHandle> {
        self.terminate_all();
        for worker in &self.workers {
            self.ids.release(worker.id());
        }
        std::mem::take(&mut self.workers)
    }

    fn spawn_worker(&mut self) -> Option<usize> {
        let id = match self.ids.acquire() {
            Ok(id) => id,
            Err(e) => {
                error!(stage = %self.spec.stage, error = %e, "Cannot create worker");
                return None;
            }
        };

        let control = ProcessControl::new(id, self.spec.stage.clone(), self.heartbeat_ticks);
        let spec = self.spec.clone();
        let handle = ProcessHandle::start(control, move |ctx| run_stage_worker(ctx, spec));
        debug!(stage = %self.spec.stage, id, "Worker created");
        self.workers.push(handle);
        Some(id)
    }
}

impl Drop for StagePool {
    fn drop(&mut self) {
        self.terminate_all();
    }
}
