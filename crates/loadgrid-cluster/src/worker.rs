//! The worker agent: a local runner driven by master instructions.
//!
//! The agent owns its [`LocalRunner`] outright; instructions arrive over
//! the worker receiver and reports flow back over the sender. Spawn
//! instructions carry the worker's complete per-class target, so the
//! agent reconciles by delta: spawn what is missing first, then stop the
//! excess, and report the resulting counts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use loadgrid_core::{
    Envelope, Event, EventBus, HeartbeatPayload, Message, OccurrenceMap, RunnerState, SpawnPayload,
    UserClass, WorkerState,
};
use loadgrid_runner::{
    CpuMonitor, CpuReading, LocalRunner, ProcStatSampler, RunnerConfig, UserFactory,
};

use crate::config::ClusterConfig;
use crate::transport::{WorkerReceiver, WorkerSender};

const SEND_ATTEMPTS: u32 = 3;

#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    Quit,
}

/// One worker process: local runner, heartbeat loop, and the channel
/// back to the master.
pub struct WorkerAgent<S: WorkerSender> {
    node_id: String,
    config: ClusterConfig,
    runner: LocalRunner,
    tx: S,
    events: Arc<EventBus>,
    host: Option<String>,
    /// Timestamp of the newest applied spawn instruction. Older
    /// instructions still in flight are discarded.
    last_instruction: f64,
}

impl<S: WorkerSender> WorkerAgent<S> {
    pub fn new(
        node_id: impl Into<String>,
        specs: Vec<(UserClass, Arc<dyn UserFactory>)>,
        config: ClusterConfig,
        tx: S,
        events: Arc<EventBus>,
    ) -> Self {
        let node_id = node_id.into();
        let runner_config = RunnerConfig {
            stop_timeout: config.stop_timeout().unwrap_or(Duration::from_secs(10)),
            node_label: node_id.clone(),
        };
        Self {
            node_id,
            config,
            runner: LocalRunner::new(specs, events.clone(), runner_config),
            tx,
            events,
            host: None,
            last_instruction: -1.0,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn runner(&self) -> &LocalRunner {
        &self.runner
    }

    /// Target host from the newest spawn instruction.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Run until dismissed or the master channel closes. Returns the
    /// agent for post-run inspection.
    pub async fn run(
        mut self,
        mut rx: impl WorkerReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let monitor = CpuMonitor::start(ProcStatSampler::new(), self.config.heartbeat_interval());
        let cpu = monitor.reading();

        self.send_with_retry(Message::ClientReady).await;
        info!(node = %self.node_id, "worker connected");

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so the
        // first heartbeat lands one interval after connecting.
        ticker.tick().await;

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => {
                        if self.handle_instruction(message).await == Flow::Quit {
                            break;
                        }
                    }
                    None => {
                        warn!(node = %self.node_id, "master channel closed, stopping");
                        self.runner.stop_all().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.report(&cpu).await,
                _ = shutdown.changed() => {
                    self.dismiss().await;
                    break;
                }
            }
        }
        self
    }

    async fn handle_instruction(&mut self, message: Message) -> Flow {
        match message {
            Message::Spawn(payload) => {
                self.apply_spawn(payload).await;
                Flow::Continue
            }
            Message::Stop => {
                info!(node = %self.node_id, "stopping all users");
                self.runner.stop_all().await;
                self.events.fire(&Event::TestStop);
                self.send_with_retry(Message::ClientStopped).await;
                self.send_with_retry(Message::ClientReady).await;
                Flow::Continue
            }
            Message::Quit => {
                self.dismiss().await;
                Flow::Quit
            }
            other => {
                warn!(node = %self.node_id, ?other, "ignoring unexpected instruction");
                Flow::Continue
            }
        }
    }

    /// Reconcile the runner against the instructed per-class target.
    async fn apply_spawn(&mut self, payload: SpawnPayload) {
        if payload.timestamp <= self.last_instruction {
            debug!(
                timestamp = payload.timestamp,
                newest = self.last_instruction,
                "discarding outdated spawn instruction"
            );
            return;
        }
        self.last_instruction = payload.timestamp;
        self.host = payload.host;
        if let Some(secs) = payload.stop_timeout {
            self.runner.set_stop_timeout(Duration::from_secs_f64(secs));
        }

        if matches!(self.runner.state(), RunnerState::Init | RunnerState::Stopped) {
            self.events.fire(&Event::TestStart);
        }
        self.send_with_retry(Message::Spawning).await;

        let current = self.runner.user_class_occurrences();
        let mut names: BTreeSet<&String> = payload.user_class_occurrences.keys().collect();
        names.extend(current.keys());

        let mut to_spawn = OccurrenceMap::new();
        let mut to_stop = OccurrenceMap::new();
        for name in names {
            let want = payload
                .user_class_occurrences
                .get(name)
                .copied()
                .unwrap_or(0);
            let have = current.get(name).copied().unwrap_or(0);
            if want > have {
                to_spawn.insert(name.clone(), want - have);
            } else if have > want {
                to_stop.insert(name.clone(), have - want);
            }
        }

        // Spawn first, stop second: running capacity never dips below
        // both the old and the new target mid-instruction.
        if let Err(error) = self.runner.spawn(&to_spawn, true).await {
            warn!(node = %self.node_id, %error, "spawn instruction named an unknown class");
        }
        self.runner.stop(&to_stop).await;

        self.send_with_retry(Message::SpawningComplete {
            user_class_occurrences: self.runner.user_class_occurrences(),
        })
        .await;
    }

    /// One report interval: flush captured errors, heartbeat, stats.
    async fn report(&mut self, cpu: &CpuReading) {
        self.flush_errors().await;
        let heartbeat = HeartbeatPayload {
            state: self.worker_state(),
            current_cpu_usage: cpu.current(),
            user_class_occurrences: self.runner.user_class_occurrences(),
        };
        self.send_with_retry(Message::Heartbeat(heartbeat)).await;
        self.send_stats().await;
    }

    /// Stop everything and leave the fleet, flushing final reports so
    /// the master's aggregates stay complete.
    async fn dismiss(&mut self) {
        info!(node = %self.node_id, "dismissed, shutting down");
        self.runner.stop_all().await;
        self.events.fire(&Event::Quitting);
        self.flush_errors().await;
        self.send_stats().await;
        self.send_with_retry(Message::Quit).await;
    }

    async fn flush_errors(&mut self) {
        for report in self.runner.drain_errors() {
            self.send_with_retry(Message::Exception {
                msg: report.msg,
                traceback: report.traceback,
            })
            .await;
        }
    }

    async fn send_stats(&mut self) {
        let data = serde_json::json!({
            "user_count": self.runner.user_count(),
            "user_class_occurrences": self.runner.user_class_occurrences(),
        });
        self.events.fire(&Event::ReportToMaster {
            client_id: self.node_id.clone(),
            data: data.clone(),
        });
        self.send_with_retry(Message::Stats(data)).await;
    }

    fn worker_state(&self) -> WorkerState {
        match self.runner.state() {
            RunnerState::Init | RunnerState::Stopped => WorkerState::Ready,
            RunnerState::Spawning => WorkerState::Spawning,
            RunnerState::Running => WorkerState::Running,
            RunnerState::Cleanup | RunnerState::Stopping => WorkerState::Stopping,
        }
    }

    /// Send with bounded retries; the fleet heals through heartbeat
    /// timeouts if the channel stays down.
    async fn send_with_retry(&self, message: Message) {
        let mut attempts = 0;
        loop {
            match self
                .tx
                .send(Envelope::new(self.node_id.clone(), message.clone()))
            {
                Ok(()) => return,
                Err(error) => {
                    attempts += 1;
                    if attempts >= SEND_ATTEMPTS {
                        warn!(node = %self.node_id, %error, "dropping message after {SEND_ATTEMPTS} attempts");
                        return;
                    }
                    debug!(node = %self.node_id, %error, "send failed, retrying");
                    tokio::time::sleep(self.config.fallback_interval()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FleetSender, InProcGrid, MasterInbox, MessageReceiver};
    use loadgrid_runner::{TickFuture, User};

    struct IdleUser;

    impl User for IdleUser {
        fn tick(&mut self) -> TickFuture<'_> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(())
            })
        }
    }

    fn specs() -> Vec<(UserClass, Arc<dyn UserFactory>)> {
        vec![(
            UserClass::new("a", 1.0),
            Arc::new(|| Box::new(IdleUser) as Box<dyn User>),
        )]
    }

    fn spawn_payload(timestamp: f64, count: u64) -> Message {
        Message::Spawn(SpawnPayload {
            timestamp,
            user_class_occurrences: [("a".to_string(), count)].into(),
            host: None,
            stop_timeout: None,
        })
    }

    async fn recv_matching(
        inbox: &mut MasterInbox,
        mut pred: impl FnMut(&Message) -> bool,
    ) -> Message {
        loop {
            let envelope = inbox.recv().await.expect("transport closed");
            if pred(&envelope.message) {
                return envelope.message;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn agent_announces_ready_then_heartbeats() {
        let (grid, mut inbox) = InProcGrid::new();
        let (tx, rx) = grid.connect("w1");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = WorkerAgent::new(
            "w1",
            specs(),
            ClusterConfig::default(),
            tx,
            Arc::new(EventBus::new()),
        );
        let _task = tokio::spawn(agent.run(rx, shutdown_rx));

        let first = inbox.recv().await.unwrap();
        assert!(matches!(first.message, Message::ClientReady));
        assert_eq!(first.node_id, "w1");

        let heartbeat =
            recv_matching(&mut inbox, |m| matches!(m, Message::Heartbeat(_))).await;
        match heartbeat {
            Message::Heartbeat(payload) => {
                assert_eq!(payload.state, WorkerState::Ready);
                assert_eq!(payload.user_class_occurrences.get("a"), Some(&0));
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_instruction_reconciles_and_reports_completion() {
        let (grid, mut inbox) = InProcGrid::new();
        let (tx, rx) = grid.connect("w1");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = WorkerAgent::new(
            "w1",
            specs(),
            ClusterConfig::default(),
            tx,
            Arc::new(EventBus::new()),
        );
        let task = tokio::spawn(agent.run(rx, shutdown_rx));

        grid.send_to("w1", spawn_payload(1.0, 3)).unwrap();
        let complete =
            recv_matching(&mut inbox, |m| matches!(m, Message::SpawningComplete { .. })).await;
        match complete {
            Message::SpawningComplete {
                user_class_occurrences,
            } => assert_eq!(user_class_occurrences.get("a"), Some(&3)),
            other => panic!("expected completion, got {other:?}"),
        }

        grid.send_to("w1", Message::Quit).unwrap();
        let agent = task.await.unwrap();
        assert_eq!(agent.runner().user_count(), 0);
        assert_eq!(agent.runner().state(), RunnerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn outdated_spawn_instruction_is_discarded() {
        let (grid, mut inbox) = InProcGrid::new();
        let (tx, rx) = grid.connect("w1");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = WorkerAgent::new(
            "w1",
            specs(),
            ClusterConfig::default(),
            tx,
            Arc::new(EventBus::new()),
        );
        let task = tokio::spawn(agent.run(rx, shutdown_rx));

        grid.send_to("w1", spawn_payload(5.0, 2)).unwrap();
        grid.send_to("w1", spawn_payload(4.0, 9)).unwrap();
        grid.send_to("w1", Message::Quit).unwrap();

        let mut completions = Vec::new();
        loop {
            let envelope = inbox.recv().await.unwrap();
            match envelope.message {
                Message::SpawningComplete {
                    user_class_occurrences,
                } => completions.push(user_class_occurrences),
                Message::Quit => break,
                _ => {}
            }
        }
        // Only the newer instruction was applied.
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].get("a"), Some(&2));

        let agent = task.await.unwrap();
        assert_eq!(agent.runner().user_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_instruction_reannounces_readiness() {
        let (grid, mut inbox) = InProcGrid::new();
        let (tx, rx) = grid.connect("w1");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = WorkerAgent::new(
            "w1",
            specs(),
            ClusterConfig::default(),
            tx,
            Arc::new(EventBus::new()),
        );
        let task = tokio::spawn(agent.run(rx, shutdown_rx));

        grid.send_to("w1", spawn_payload(1.0, 2)).unwrap();
        recv_matching(&mut inbox, |m| matches!(m, Message::SpawningComplete { .. })).await;

        grid.send_to("w1", Message::Stop).unwrap();
        recv_matching(&mut inbox, |m| matches!(m, Message::ClientStopped)).await;
        recv_matching(&mut inbox, |m| matches!(m, Message::ClientReady)).await;

        grid.send_to("w1", Message::Quit).unwrap();
        let agent = task.await.unwrap();
        assert_eq!(agent.runner().user_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dismissal_flushes_final_stats_before_quit() {
        let (grid, mut inbox) = InProcGrid::new();
        let (tx, rx) = grid.connect("w1");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = WorkerAgent::new(
            "w1",
            specs(),
            ClusterConfig::default(),
            tx,
            Arc::new(EventBus::new()),
        );
        let task = tokio::spawn(agent.run(rx, shutdown_rx));

        grid.send_to("w1", Message::Quit).unwrap();
        let mut saw_stats_before_quit = false;
        loop {
            let envelope = inbox.recv().await.unwrap();
            match envelope.message {
                Message::Stats(_) => saw_stats_before_quit = true,
                Message::Quit => break,
                _ => {}
            }
        }
        assert!(saw_stats_before_quit);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_signal_dismisses_the_agent() {
        let (grid, mut inbox) = InProcGrid::new();
        let (tx, rx) = grid.connect("w1");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = WorkerAgent::new(
            "w1",
            specs(),
            ClusterConfig::default(),
            tx,
            Arc::new(EventBus::new()),
        );
        let task = tokio::spawn(agent.run(rx, shutdown_rx));
        recv_matching(&mut inbox, |m| matches!(m, Message::ClientReady)).await;

        shutdown_tx.send(true).unwrap();
        recv_matching(&mut inbox, |m| matches!(m, Message::Quit)).await;
        let agent = task.await.unwrap();
        assert_eq!(agent.runner().state(), RunnerState::Stopped);
    }
}
