use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::control::{AliveGuard, ProcessContext, ProcessControl, ProcessState};

/// Controller-side handle to a running feeder or stage worker.
pub struct ProcessHandle {
    control: Arc<ProcessControl>,
    task: JoinHandle<()>,
}

impl ProcessHandle {
    /// Spawn `body` as a managed process on the current runtime.
    ///
    /// The process is alive and active from the moment this returns. `alive`
    /// flips to `false` when `body` completes, returns early, or panics.
    pub fn start<F, Fut>(control: Arc<ProcessControl>, body: F) -> Self
    where
        F: FnOnce(ProcessContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ctx = ProcessContext::new(control.clone());
        let guard = AliveGuard(control.clone());
        let fut = body(ctx.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            ctx.mark_started();
            fut.await;
        });

        Self { control, task }
    }

    pub fn id(&self) -> usize {
        self.control.id()
    }

    pub fn role(&self) -> &str {
        self.control.role()
    }

    pub fn is_alive(&self) -> bool {
        self.control.is_alive() && !self.task.is_finished()
    }

    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    /// Alive, not active, and not on its way out.
    pub fn is_paused(&self) -> bool {
        self.is_alive() && !self.is_active() && !self.control.is_terminating()
    }

    pub fn state(&self) -> ProcessState {
        if self.task.is_finished() {
            ProcessState::Terminated
        } else {
            self.control.state()
        }
    }

    /// Clear the activity flag. The process finishes its current item and
    /// idles; feeders exit instead.
    pub fn stop(&self) -> bool {
        let changed = self.control.set_active(false);
        if changed {
            debug!(role = %self.role(), id = self.id(), "process stopped");
        }
        changed
    }

    /// Set the activity flag again. Has no effect on a terminating process.
    pub fn resume(&self) -> bool {
        if self.control.is_terminating() || !self.is_alive() {
            return false;
        }
        let changed = self.control.set_active(true);
        if changed {
            debug!(role = %self.role(), id = self.id(), "process resumed");
        }
        changed
    }

    /// Ask the process to exit at its next await point.
    pub fn terminate(&self) {
        self.control.cancel();
    }

    /// Wake the process out of its current wait. Returns how many interrupts
    /// have gone unanswered by a heartbeat, including this one.
    pub fn interrupt(&self) -> u32 {
        self.control.interrupt()
    }

    /// One tick of the heartbeat countdown; returns the remaining budget.
    pub fn beat(&self) -> u32 {
        self.control.beat()
    }

    /// Forcefully cancel the underlying task.
    pub fn abort(&self) {
        warn!(role = %self.role(), id = self.id(), "aborting unresponsive process");
        self.control.cancel();
        self.task.abort();
    }

    pub fn control(&self) -> &Arc<ProcessControl> {
        &self.control
    }

    /// Wait for the task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(role = %self.control.role(), id = self.control.id(), "process panicked");
            }
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("role", &self.role())
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
