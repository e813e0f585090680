//! The reconciliation loop.
//!
//! Every tick the controller:
//!
//! 1. prunes feeders that were stopped or exited, and stage workers that died;
//! 2. counts down worker heartbeats, interrupting (and eventually aborting)
//!    the ones that stopped reporting progress;
//! 3. reads the depth of every queue;
//! 4. moves each stage's active worker count toward the ideal computed from
//!    its input queue, reusing paused workers before creating new ones.
//!
//! Clearing the run flag makes every ideal zero; the loop exits once all
//! stage workers are gone.

mod command_log;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub use command_log::{COMMAND_LOG_CAPACITY, CommandAction, CommandLog};

use crate::config::AppConfig;
use crate::feeder::{FeederPool, FeederStatus};
use crate::pipeline::{
    HangReport, ScaleOutcome, ScalingFormula, StagePool, WorkQueue, WorkerSpec, ideal_workers,
};
use crate::store::DeviceStore;
use crate::{Error, Result};

/// How long shutdown waits for each process to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_heartbeat_ticks() -> u32 {
    6
}

fn default_max_interrupts() -> u32 {
    3
}

fn default_idle_heartbeat_secs() -> u64 {
    5
}

/// Timing of the reconciliation loop and of hang detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Ticks without a heartbeat before a worker is considered hung.
    #[serde(default = "default_heartbeat_ticks")]
    pub heartbeat_ticks: u32,
    /// Interrupts a hung worker may ignore before it is aborted.
    #[serde(default = "default_max_interrupts")]
    pub max_interrupts: u32,
    /// Heartbeat period of idle and paused workers.
    #[serde(default = "default_idle_heartbeat_secs")]
    pub idle_heartbeat_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            heartbeat_ticks: default_heartbeat_ticks(),
            max_interrupts: default_max_interrupts(),
            idle_heartbeat_secs: default_idle_heartbeat_secs(),
        }
    }
}

impl ControllerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn idle_heartbeat(&self) -> Duration {
        Duration::from_secs(self.idle_heartbeat_secs)
    }
}

/// Snapshot returned by `GET /status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    /// Total depth of every queue, in stage order.
    #[serde(rename = "Queues")]
    pub queues: Vec<usize>,
    /// Active workers per stage.
    #[serde(rename = "Workers")]
    pub workers: BTreeMap<String, usize>,
    #[serde(rename = "Feeders")]
    pub feeders: BTreeMap<String, FeederStatus>,
}

/// What one stage did during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTick {
    pub name: String,
    pub active: usize,
    pub ideal: usize,
    pub outcome: ScaleOutcome,
    pub hangs: HangReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub depths: Vec<usize>,
    pub stages: Vec<StageTick>,
}

struct ControllerState {
    running: bool,
    stages: Vec<StagePool>,
    feeders: BTreeMap<String, FeederPool>,
}

/// Owns the queues, the stage pools and the feeders.
pub struct Controller {
    config: ControllerConfig,
    formula: ScalingFormula,
    max_workers: Vec<Option<usize>>,
    queues: Vec<Arc<WorkQueue>>,
    store: Arc<dyn DeviceStore>,
    state: Mutex<ControllerState>,
    commands: CommandLog,
    wake: Notify,
}

impl Controller {
    pub fn new(config: &AppConfig, store: Arc<dyn DeviceStore>) -> Result<Self> {
        config.validate()?;

        let queues: Vec<Arc<WorkQueue>> = config
            .queues
            .levels
            .iter()
            .map(|levels| WorkQueue::try_new(*levels).map(Arc::new))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::config(e.to_string()))?;

        let stages = config
            .stages
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                let spec = WorkerSpec {
                    stage: Arc::from(stage.name.as_str()),
                    input: queues[i].clone(),
                    output: queues.get(i + 1).cloned(),
                    processor: stage.processor.build(store.clone()),
                    idle_heartbeat: config.controller.idle_heartbeat(),
                };
                StagePool::new(spec, config.controller.heartbeat_ticks)
            })
            .collect();

        let feeders = config
            .feeders
            .iter()
            .map(|f| (f.kind.clone(), FeederPool::new(f.clone())))
            .collect();

        Ok(Self {
            config: config.controller.clone(),
            formula: config.scaling.clone(),
            max_workers: config.stages.iter().map(|s| s.max_workers).collect(),
            queues,
            store,
            state: Mutex::new(ControllerState {
                running: true,
                stages,
                feeders,
            }),
            commands: CommandLog::default(),
            wake: Notify::new(),
        })
    }

    /// Queue feeding the first stage.
    pub fn input_queue(&self) -> &Arc<WorkQueue> {
        &self.queues[0]
    }

    pub fn queues(&self) -> &[Arc<WorkQueue>] {
        &self.queues
    }

    pub fn store(&self) -> &Arc<dyn DeviceStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Clear the run flag. The loop drains the stages and exits.
    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        if state.running {
            state.running = false;
            info!("Stop requested, draining stages");
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Drive the reconciliation loop until the run flag is cleared and every
    /// stage worker has exited, then terminate the remaining feeders.
    pub async fn run(self: Arc<Self>) {
        info!(
            stages = self.queues.len(),
            tick_interval = ?self.config.tick_interval(),
            "Processing started"
        );

        while self.should_continue() {
            self.tick();
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
                _ = self.wake.notified() => {}
            }
        }

        self.shutdown().await;
        info!("Processing finished");
    }

    fn should_continue(&self) -> bool {
        let state = self.state.lock();
        state.running || state.stages.iter().any(|s| !s.is_empty())
    }

    /// One reconciliation pass.
    pub fn tick(&self) -> TickReport {
        let mut state = self.state.lock();
        let running = state.running;

        for pool in state.feeders.values_mut() {
            let pruned = pool.prune();
            if pruned > 0 {
                debug!(kind = %pool.config().kind, pruned, "Pruned feeders");
            }
        }

        let mut hangs = Vec::with_capacity(state.stages.len());
        for pool in &mut state.stages {
            let pruned = pool.prune();
            if pruned > 0 {
                warn!(stage = %pool.name(), pruned, "Removed dead workers");
            }

            let report = pool.check_hangs(self.config.max_interrupts);
            if !report.interrupted.is_empty() {
                warn!(stage = %pool.name(), ids = ?report.interrupted, "Unlocking hung workers");
            }
            if !report.aborted.is_empty() {
                error!(stage = %pool.name(), ids = ?report.aborted, "Aborted unresponsive workers");
                pool.prune();
            }
            hangs.push(report);
        }

        let depths: Vec<usize> = self.queues.iter().map(|q| q.total_size()).collect();
        for (i, depth) in depths.iter().enumerate() {
            info!("Status Q{}: {} elements", i + 1, depth);
        }

        let mut stages = Vec::with_capacity(state.stages.len());
        for (i, (pool, hangs)) in state.stages.iter_mut().zip(hangs).enumerate() {
            let ideal = if running {
                ideal_workers(depths[i], &self.formula, self.max_workers[i])
            } else {
                0
            };
            let active = pool.active_count();
            info!("{}: {} of {}", pool.name(), active, ideal);

            let outcome = pool.scale_to(ideal);
            let delta = outcome.delta();
            if delta > 0 {
                info!(
                    resumed = outcome.resumed,
                    created = outcome.created,
                    "{}: +{}",
                    pool.name(),
                    delta
                );
            } else if delta < 0 {
                info!("{}: {}", pool.name(), delta);
            }

            if !running {
                let terminated = pool.terminate_paused();
                if terminated > 0 {
                    debug!(stage = %pool.name(), terminated, "Terminated paused workers");
                }
            }

            stages.push(StageTick {
                name: pool.name().to_string(),
                active,
                ideal,
                outcome,
                hangs,
            });
        }

        TickReport { depths, stages }
    }

    /// Start every instance of a feeder kind. Returns how many were started.
    ///
    /// Instances are started one at a time with the kind's pacing delay
    /// after each.
    pub async fn start_feeder(&self, kind: &str) -> Result<usize> {
        let result = self.start_feeder_instances(kind).await;
        match &result {
            Err(Error::NotRunning) => {}
            Ok(started) => {
                info!(kind, started, "Feeder started");
                self.commands.record(CommandAction::Start, kind, true);
            }
            Err(e) => {
                warn!(kind, error = %e, "Failed to start feeder");
                self.commands.record(CommandAction::Start, kind, false);
            }
        }
        result
    }

    async fn start_feeder_instances(&self, kind: &str) -> Result<usize> {
        let (instances, pacing) = {
            let state = self.state.lock();
            if !state.running {
                return Err(Error::NotRunning);
            }
            let pool = state
                .feeders
                .get(kind)
                .ok_or_else(|| Error::UnknownFeeder(kind.to_string()))?;
            (pool.config().instances(), pool.config().pacing())
        };

        let mut started = 0;
        for region in instances {
            {
                let mut state = self.state.lock();
                if !state.running {
                    break;
                }
                let pool = state
                    .feeders
                    .get_mut(kind)
                    .ok_or_else(|| Error::UnknownFeeder(kind.to_string()))?;
                pool.start_instance(
                    region.as_deref(),
                    self.store.clone(),
                    self.queues[0].clone(),
                    self.config.heartbeat_ticks,
                )?;
            }
            started += 1;
            tokio::time::sleep(pacing).await;
        }
        Ok(started)
    }

    /// Stop the most recently started active instance of `kind`. Returns its
    /// id.
    pub fn stop_feeder(&self, kind: &str) -> Result<usize> {
        let result = {
            let mut state = self.state.lock();
            if !state.running {
                return Err(Error::NotRunning);
            }
            match state.feeders.get_mut(kind) {
                Some(pool) => pool.stop_latest(),
                None => Err(Error::UnknownFeeder(kind.to_string())),
            }
        };

        match &result {
            Ok(id) => {
                info!(kind, id, "Feeder stopped");
                self.commands.record(CommandAction::Stop, kind, true);
            }
            Err(e) => {
                warn!(kind, error = %e, "Failed to stop feeder");
                self.commands.record(CommandAction::Stop, kind, false);
            }
        }
        result
    }

    /// Start every feeder kind configured with `autostart`.
    pub async fn start_autostart_feeders(&self) {
        let kinds: Vec<String> = {
            let state = self.state.lock();
            state
                .feeders
                .values()
                .filter(|p| p.config().autostart)
                .map(|p| p.config().kind.clone())
                .collect()
        };
        for kind in kinds {
            // Failures are logged and recorded by start_feeder.
            let _ = self.start_feeder(&kind).await;
        }
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.state.lock();
        ControllerStatus {
            queues: self.queues.iter().map(|q| q.total_size()).collect(),
            workers: state
                .stages
                .iter()
                .map(|s| (s.name().to_string(), s.active_count()))
                .collect(),
            feeders: state
                .feeders
                .iter()
                .map(|(kind, pool)| (kind.clone(), pool.status()))
                .collect(),
        }
    }

    /// Recent feeder commands, oldest first.
    pub fn command_log(&self) -> Vec<String> {
        self.commands.entries()
    }

    /// Ids of the live workers of each stage, in creation order.
    pub fn worker_ids(&self) -> BTreeMap<String, Vec<usize>> {
        let state = self.state.lock();
        state
            .stages
            .iter()
            .map(|s| (s.name().to_string(), s.ids()))
            .collect()
    }

    /// Terminate every feeder and stage worker and wait for them to exit.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut state = self.state.lock();
            state.running = false;
            let mut handles = Vec::new();
            for pool in state.feeders.values_mut() {
                handles.extend(pool.take_handles());
            }
            for pool in &mut state.stages {
                handles.extend(pool.take_workers());
            }
            handles
        };

        if handles.is_empty() {
            return;
        }
        info!(processes = handles.len(), "Waiting for processes to exit");
        let joins = handles.into_iter().map(|handle| async move {
            let control = handle.control().clone();
            if tokio::time::timeout(JOIN_TIMEOUT, handle.join()).await.is_err() {
                warn!(role = %control.role(), id = control.id(), "Process did not exit in time");
            }
        });
        join_all(joins).await;
    }
}
