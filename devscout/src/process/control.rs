//! Shared lifecycle state of a managed process.
//!
//! One [`ProcessControl`] exists per feeder or stage worker. The controller
//! reaches it through a [`ProcessHandle`](super::ProcessHandle); the task
//! itself sees it through a [`ProcessContext`].
//!
//! ```text
//!   Starting ──► Running(active) ◄──► Paused(inactive, alive) ──► Terminated
//!                   │                                               ▲
//!                   └──────── fatal error / panic / terminate ──────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

/// Observable lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ProcessState {
    /// Created, task not yet scheduled.
    Starting,
    /// Alive and pulling work.
    Running,
    /// Alive but idle; can be resumed without creating a new process.
    Paused,
    /// Task has exited.
    Terminated,
}

/// State shared between a process and its controller.
pub struct ProcessControl {
    id: usize,
    role: Arc<str>,
    started: AtomicBool,
    alive: AtomicBool,
    active: watch::Sender<bool>,
    heartbeat: AtomicU32,
    heartbeat_ceiling: u32,
    missed_interrupts: AtomicU32,
    interrupt: Notify,
    terminate: CancellationToken,
}

impl ProcessControl {
    /// Create the state for a new process. It starts alive and active.
    pub fn new(id: usize, role: impl Into<Arc<str>>, heartbeat_ceiling: u32) -> Arc<Self> {
        let (active, _) = watch::channel(true);
        let heartbeat_ceiling = heartbeat_ceiling.max(1);
        Arc::new(Self {
            id,
            role: role.into(),
            started: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            active,
            heartbeat: AtomicU32::new(heartbeat_ceiling),
            heartbeat_ceiling,
            missed_interrupts: AtomicU32::new(0),
            interrupt: Notify::new(),
            terminate: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn state(&self) -> ProcessState {
        if !self.is_alive() {
            ProcessState::Terminated
        } else if !self.started.load(Ordering::SeqCst) {
            ProcessState::Starting
        } else if self.is_active() {
            ProcessState::Running
        } else {
            ProcessState::Paused
        }
    }

    /// Set the logical activity flag. Returns `true` if the value changed.
    pub(super) fn set_active(&self, active: bool) -> bool {
        self.active.send_if_modified(|current| {
            if *current == active {
                false
            } else {
                *current = active;
                true
            }
        })
    }

    pub(super) fn cancel(&self) {
        self.set_active(false);
        self.terminate.cancel();
    }

    /// Wake the process out of whatever it is currently awaiting.
    ///
    /// Only a process that is waiting right now sees the signal; nothing is
    /// stored for later.
    pub(super) fn interrupt(&self) -> u32 {
        self.interrupt.notify_waiters();
        self.missed_interrupts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the heartbeat budget and return what remains.
    pub(super) fn beat(&self) -> u32 {
        let previous = self
            .heartbeat
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                Some(b.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn heartbeat_budget(&self) -> u32 {
        self.heartbeat.load(Ordering::SeqCst)
    }

    pub fn missed_interrupts(&self) -> u32 {
        self.missed_interrupts.load(Ordering::SeqCst)
    }

    fn heartbeat(&self) {
        self.heartbeat
            .store(self.heartbeat_ceiling, Ordering::SeqCst);
        self.missed_interrupts.store(0, Ordering::SeqCst);
    }
}

/// The process-side view of its own [`ProcessControl`].
#[derive(Clone)]
pub struct ProcessContext {
    control: Arc<ProcessControl>,
}

impl ProcessContext {
    pub(super) fn new(control: Arc<ProcessControl>) -> Self {
        Self { control }
    }

    pub fn id(&self) -> usize {
        self.control.id
    }

    pub fn role(&self) -> &str {
        &self.control.role
    }

    /// Report forward progress; resets the heartbeat budget to its ceiling.
    pub fn heartbeat(&self) {
        self.control.heartbeat();
    }

    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    pub fn is_terminated(&self) -> bool {
        self.control.is_terminating()
    }

    /// Resolves once the process has been told to terminate.
    pub async fn terminated(&self) {
        self.control.terminate.cancelled().await
    }

    /// Resolves once the process is stopped (paused) or terminated.
    pub async fn deactivated(&self) {
        let mut rx = self.control.active.subscribe();
        // The sender lives inside `control`, so `wait_for` only errors if it is gone.
        let _ = rx.wait_for(|active| !*active).await;
    }

    /// Resolves on the next interrupt delivered by the controller.
    pub async fn interrupted(&self) {
        self.control.interrupt.notified().await
    }

    /// Idle while paused, heartbeating every `idle_heartbeat`.
    ///
    /// Returns `true` once resumed, `false` if terminated instead.
    pub async fn wait_until_active(&self, idle_heartbeat: Duration) -> bool {
        let mut rx = self.control.active.subscribe();
        loop {
            if self.is_terminated() {
                return false;
            }
            if *rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.control.terminate.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = tokio::time::sleep(idle_heartbeat) => self.heartbeat(),
            }
        }
    }

    pub(super) fn mark_started(&self) {
        self.control.started.store(true, Ordering::SeqCst);
    }
}

/// Flips `alive` off when the process task ends, including by panic.
pub(super) struct AliveGuard(pub(super) Arc<ProcessControl>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::SeqCst);
        self.0.set_active(false);
    }
}
