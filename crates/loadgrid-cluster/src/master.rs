//! The master orchestrator.
//!
//! A single task owns the [`Master`]: it is the only mutator of the
//! worker table, driven by worker envelopes, operator commands, and a
//! supervision tick. Ramping runs as a separate dispatch task that only
//! reads a snapshot of the fleet and sends instructions; the worker
//! table itself is never touched from that task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use loadgrid_core::{
    Envelope, Event, EventBus, ExceptionTable, Message, OccurrenceMap, RunnerState, SpawnPayload,
    UserClass, WorkerState,
};
use loadgrid_dispatch::{CONTROL_INTERVAL, DispatchPlan, WorkerSlot, weight_users};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::node::WorkerNode;
use crate::transport::{FleetSender, MessageReceiver};

/// Per-worker spawn rate above which ramp accuracy degrades.
const MAX_PER_WORKER_RATE: f64 = 100.0;

/// Grace period for workers to report back after a stop instruction
/// before the master declares the run stopped anyway.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Operator commands accepted by the master loop.
#[derive(Debug, Clone)]
pub enum MasterCommand {
    /// Ramp the fleet to `total_users` at `spawn_rate` users per second.
    Start { total_users: u64, spawn_rate: f64 },
    /// Stop the current run; workers stay connected for the next one.
    StopRun,
    /// Stop the run and dismiss the fleet.
    Quit,
}

/// The fleet orchestrator.
pub struct Master {
    config: ClusterConfig,
    classes: Vec<UserClass>,
    fleet: Arc<dyn FleetSender>,
    events: Arc<EventBus>,
    workers: BTreeMap<String, WorkerNode>,
    state: RunnerState,
    /// Fleet-wide per-class target of the current run.
    target: OccurrenceMap,
    spawn_rate: f64,
    dispatch_task: Option<JoinHandle<()>>,
    /// `spawning_complete` fired for the current ramp.
    spawning_complete_fired: bool,
    exceptions: ExceptionTable,
    /// Workers already warned about for CPU overload.
    cpu_warned: BTreeSet<String>,
    stop_deadline: Option<Instant>,
    quitting: bool,
    quit_deadline: Option<Instant>,
    /// Source of strictly increasing spawn-instruction timestamps,
    /// shared with the dispatch task.
    spawn_clock: Arc<AtomicU64>,
}

impl Master {
    pub fn new(
        classes: Vec<UserClass>,
        config: ClusterConfig,
        fleet: Arc<dyn FleetSender>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            classes,
            fleet,
            events,
            workers: BTreeMap::new(),
            state: RunnerState::Init,
            target: OccurrenceMap::new(),
            spawn_rate: 0.0,
            dispatch_task: None,
            spawning_complete_fired: false,
            exceptions: ExceptionTable::new(),
            cpu_warned: BTreeSet::new(),
            stop_deadline: None,
            quitting: false,
            quit_deadline: None,
            spawn_clock: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn workers(&self) -> &BTreeMap<String, WorkerNode> {
        &self.workers
    }

    /// Users across the fleet, missing workers excluded.
    pub fn user_count(&self) -> u64 {
        self.workers
            .values()
            .filter(|w| w.state != WorkerState::Missing)
            .map(WorkerNode::user_count)
            .sum()
    }

    /// Fleet-wide deduplicated exception table.
    pub fn exceptions(&self) -> &ExceptionTable {
        &self.exceptions
    }

    /// Whether any worker exceeded the CPU warning threshold at any
    /// point. Sticky for the life of the master.
    pub fn overload_occurred(&self) -> bool {
        !self.cpu_warned.is_empty()
    }

    /// Begin (or retarget) a run.
    ///
    /// With no connected workers this is a logged no-op, not an error;
    /// the run starts when operators retry after workers connect.
    pub fn start(&mut self, total_users: u64, spawn_rate: f64) -> ClusterResult<()> {
        if !spawn_rate.is_finite() || spawn_rate <= 0.0 {
            return Err(ClusterError::Config(format!(
                "spawn rate must be positive, got {spawn_rate}"
            )));
        }

        if !self.state.can_spawn() {
            warn!(state = ?self.state, "start ignored while a stop is in progress");
            return Ok(());
        }
        let ready = self.dispatchable_workers();
        if ready.is_empty() {
            warn!("start requested with no connected workers, ignoring");
            return Ok(());
        }
        if spawn_rate / ready.len() as f64 > MAX_PER_WORKER_RATE {
            warn!(
                spawn_rate,
                workers = ready.len(),
                "spawn rate exceeds {MAX_PER_WORKER_RATE} users/s per worker, \
                 ramp pacing will be inaccurate"
            );
        }

        if matches!(self.state, RunnerState::Init | RunnerState::Stopped) {
            self.events.fire(&Event::TestStart);
        }
        self.target = weight_users(&self.classes, total_users);
        self.spawn_rate = spawn_rate;
        self.state = RunnerState::Spawning;
        self.spawning_complete_fired = false;
        self.stop_deadline = None;
        info!(total_users, spawn_rate, workers = ready.len(), "starting run");

        self.start_dispatch();
        Ok(())
    }

    /// Stop the current run. Workers report back `client_stopped` and
    /// re-announce readiness; the run is declared stopped when none are
    /// still winding down, or when the grace period expires.
    pub fn stop_run(&mut self) {
        if matches!(self.state, RunnerState::Init | RunnerState::Stopped) {
            return;
        }
        self.abort_dispatch();
        info!("stopping run");
        self.state = RunnerState::Stopping;
        let grace = self.config.stop_timeout().unwrap_or(DEFAULT_STOP_GRACE);
        self.stop_deadline = Some(Instant::now() + grace + self.config.heartbeat_interval());

        for worker in self.workers.values_mut() {
            if worker.state == WorkerState::Missing {
                continue;
            }
            worker.state = WorkerState::Stopping;
            if let Err(error) = self.fleet.send_to(&worker.id, Message::Stop) {
                warn!(worker = %worker.id, %error, "failed to send stop");
            }
        }
        self.check_stop_completion();
    }

    /// Stop the run and dismiss every worker. The master loop keeps
    /// draining messages briefly so final statistics are not lost.
    pub fn quit(&mut self) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        self.abort_dispatch();
        info!("quitting, dismissing workers");
        self.events.fire(&Event::Quitting);

        for id in self.workers.keys() {
            if let Err(error) = self.fleet.send_to(id, Message::Quit) {
                warn!(worker = %id, %error, "failed to send quit");
            }
        }
        self.quit_deadline = Some(Instant::now() + self.config.fallback_interval());
        self.state = RunnerState::Stopped;
    }

    /// Apply one envelope from a worker.
    pub fn handle_message(&mut self, envelope: Envelope) {
        let node_id = envelope.node_id;
        match envelope.message {
            Message::ClientReady => {
                info!(worker = %node_id, total = self.workers.len() + 1, "worker ready");
                let liveness = self.config.heartbeat_liveness;
                self.workers
                    .insert(node_id.clone(), WorkerNode::new(node_id, liveness));
                if matches!(self.state, RunnerState::Spawning | RunnerState::Running) {
                    // A new worker mid-run takes its share: redistribute
                    // the unchanged target across the grown fleet.
                    info!("redistributing users across the fleet");
                    self.state = RunnerState::Spawning;
                    self.spawning_complete_fired = false;
                    self.start_dispatch();
                }
                self.check_stop_completion();
            }
            Message::ClientStopped => {
                debug!(worker = %node_id, "worker stopped its users");
                self.workers.remove(&node_id);
                self.check_stop_completion();
                self.check_fleet_alive();
            }
            Message::Heartbeat(heartbeat) => {
                let Some(worker) = self.workers.get_mut(&node_id) else {
                    debug!(worker = %node_id, "heartbeat from unknown worker");
                    return;
                };
                if worker.state == WorkerState::Missing {
                    info!(worker = %node_id, "missing worker came back");
                    worker.state = heartbeat.state;
                }
                worker.heartbeat_liveness = self.config.heartbeat_liveness;
                worker.cpu_usage = heartbeat.current_cpu_usage;
                worker.user_class_occurrences = heartbeat.user_class_occurrences;
                if heartbeat.current_cpu_usage > self.config.cpu_warning_threshold
                    && self.cpu_warned.insert(node_id.clone())
                {
                    warn!(
                        worker = %node_id,
                        cpu = heartbeat.current_cpu_usage,
                        "worker CPU usage above threshold, results may be unreliable"
                    );
                }
            }
            Message::Stats(data) => {
                self.events.fire(&Event::WorkerReport {
                    client_id: node_id,
                    data,
                });
            }
            Message::Spawning => {
                if let Some(worker) = self.workers.get_mut(&node_id) {
                    worker.state = WorkerState::Spawning;
                }
            }
            Message::SpawningComplete {
                user_class_occurrences,
            } => {
                if let Some(worker) = self.workers.get_mut(&node_id) {
                    worker.state = WorkerState::Running;
                    worker.user_class_occurrences = user_class_occurrences;
                }
                self.check_spawning_complete();
            }
            Message::Exception { msg, traceback } => {
                warn!(worker = %node_id, %msg, "worker reported exception");
                self.exceptions.record(&node_id, &msg, &traceback);
            }
            Message::Quit => {
                info!(worker = %node_id, "worker quit");
                self.workers.remove(&node_id);
                self.check_stop_completion();
                self.check_fleet_alive();
            }
            Message::Spawn(_) | Message::Stop => {
                warn!(worker = %node_id, "ignoring master-bound instruction from worker");
            }
        }
    }

    /// One supervision tick: advance liveness counters, declare missing
    /// workers, and enforce stop deadlines.
    pub fn tick(&mut self) {
        for worker in self.workers.values_mut() {
            if worker.state == WorkerState::Missing {
                continue;
            }
            worker.heartbeat_liveness = worker.heartbeat_liveness.saturating_sub(1);
            if worker.heartbeat_liveness == 0 {
                warn!(worker = %worker.id, "worker missed too many heartbeats, marking missing");
                worker.state = WorkerState::Missing;
            }
        }
        self.check_fleet_alive();

        if self.state == RunnerState::Stopping
            && self.stop_deadline.is_some_and(|d| Instant::now() >= d)
        {
            warn!("workers did not confirm stop in time, declaring run stopped");
            self.finish_stop();
        }
    }

    /// Run the master loop until quit completes or the transport closes.
    /// Returns the master for post-run inspection.
    pub async fn run(
        mut self,
        mut inbox: impl MessageReceiver,
        mut commands: mpsc::UnboundedReceiver<MasterCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.handle_message(envelope),
                    None => break,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(MasterCommand::Start { total_users, spawn_rate }) => {
                        if let Err(error) = self.start(total_users, spawn_rate) {
                            error!(%error, "start rejected");
                        }
                    }
                    Some(MasterCommand::StopRun) => self.stop_run(),
                    Some(MasterCommand::Quit) => self.quit(),
                    None => {
                        commands_open = false;
                        self.quit();
                    }
                },
                _ = shutdown.changed(), if !self.quitting => self.quit(),
            }

            if self.quitting
                && (self.workers.is_empty()
                    || self.quit_deadline.is_some_and(|d| Instant::now() >= d))
            {
                break;
            }
        }
        self.abort_dispatch();
        self
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn dispatchable_workers(&self) -> Vec<WorkerSlot> {
        self.workers
            .values()
            .filter(|w| w.state.accepts_work())
            .map(|w| WorkerSlot {
                node_id: w.id.clone(),
                occurrences: w.user_class_occurrences.clone(),
            })
            .collect()
    }

    /// Start (or restart) the ramp toward the current target. Any
    /// in-flight ramp is superseded: its task is aborted and workers
    /// reconcile via instruction timestamps.
    fn start_dispatch(&mut self) {
        self.abort_dispatch();

        let slots = self.dispatchable_workers();
        let plan = DispatchPlan::new(&slots, self.target.clone(), self.spawn_rate);
        let fleet = self.fleet.clone();
        let clock = self.spawn_clock.clone();
        let host = self.config.host.clone();
        let stop_timeout = self.config.stop_timeout_secs;

        self.dispatch_task = Some(tokio::spawn(async move {
            let mut first = true;
            for snapshot in plan {
                if !first {
                    tokio::time::sleep(CONTROL_INTERVAL).await;
                }
                first = false;
                let timestamp = clock.fetch_add(1, Ordering::SeqCst) as f64;
                for (node_id, occurrences) in snapshot {
                    let payload = SpawnPayload {
                        timestamp,
                        user_class_occurrences: occurrences,
                        host: host.clone(),
                        stop_timeout,
                    };
                    if let Err(error) = fleet.send_to(&node_id, Message::Spawn(payload)) {
                        warn!(worker = %node_id, %error, "failed to send spawn instruction");
                    }
                }
            }
        }));
    }

    fn abort_dispatch(&mut self) {
        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }
    }

    // ── State transitions ────────────────────────────────────────────

    fn check_spawning_complete(&mut self) {
        if self.spawning_complete_fired {
            return;
        }
        let target_total: u64 = self.target.values().sum();
        let none_spawning = self
            .workers
            .values()
            .all(|w| w.state != WorkerState::Spawning);
        let reached = self.user_count();
        if none_spawning && reached >= target_total {
            self.spawning_complete_fired = true;
            self.state = RunnerState::Running;
            info!(users = reached, "all workers finished spawning");
            self.events
                .fire(&Event::SpawningComplete { user_count: reached });
        }
    }

    fn check_stop_completion(&mut self) {
        if self.state != RunnerState::Stopping {
            return;
        }
        let none_active = self.workers.values().all(|w| {
            !matches!(
                w.state,
                WorkerState::Spawning | WorkerState::Running | WorkerState::Stopping
            )
        });
        if none_active {
            self.finish_stop();
        }
    }

    fn finish_stop(&mut self) {
        self.state = RunnerState::Stopped;
        self.stop_deadline = None;
        info!("run stopped");
        self.events.fire(&Event::TestStop);
    }

    /// A run with no live workers cannot continue.
    fn check_fleet_alive(&mut self) {
        if !matches!(self.state, RunnerState::Spawning | RunnerState::Running) {
            return;
        }
        if self.workers.values().all(|w| w.state == WorkerState::Missing) {
            warn!("no live workers left, stopping run");
            self.stop_run();
        }
    }
}
