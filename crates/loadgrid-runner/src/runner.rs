//! The local control loop.
//!
//! `LocalRunner` owns every live user instance on this process. Instances
//! run as supervised tokio tasks; the runner is the only mutator of the
//! registry, and other tasks talk to it through messages and events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use loadgrid_core::{
    Event, EventBus, ExceptionTable, OccurrenceMap, RunnerState, UserClass, complete_map,
    total_occurrences,
};

use crate::error::{RunnerError, RunnerResult};
use crate::registry::{InstanceHandle, InstanceRegistry};
use crate::user::{User, UserFactory};

tokio::task_local! {
    /// Set for the duration of each instance task, so a stop request can
    /// recognize an instance stopping itself.
    static INSTANCE_ID: u64;
}

/// A captured user-instance error, ready to forward to the master.
#[derive(Debug, Clone)]
pub struct UserErrorReport {
    pub class_name: String,
    pub msg: String,
    pub traceback: String,
}

/// Runner knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long a graceful stop waits before killing the instance task.
    pub stop_timeout: Duration,
    /// Node label used in the local exception table.
    pub node_label: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            node_label: "local".to_string(),
        }
    }
}

/// The local control loop: spawns and stops user instances by
/// class-occurrence delta and tracks aggregate counts.
pub struct LocalRunner {
    classes: Vec<UserClass>,
    factories: BTreeMap<String, Arc<dyn UserFactory>>,
    registry: InstanceRegistry,
    state: RunnerState,
    events: Arc<EventBus>,
    config: RunnerConfig,
    /// Started-signals for spawns not yet joined.
    pending_started: Vec<oneshot::Receiver<()>>,
    errors_tx: mpsc::UnboundedSender<UserErrorReport>,
    errors_rx: mpsc::UnboundedReceiver<UserErrorReport>,
    exceptions: ExceptionTable,
}

impl LocalRunner {
    pub fn new(
        specs: Vec<(UserClass, Arc<dyn UserFactory>)>,
        events: Arc<EventBus>,
        config: RunnerConfig,
    ) -> Self {
        let mut classes = Vec::new();
        let mut factories = BTreeMap::new();
        for (class, factory) in specs {
            factories.insert(class.name.clone(), factory);
            classes.push(class);
        }
        classes.sort_by(|a, b| a.name.cmp(&b.name));

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            classes,
            factories,
            registry: InstanceRegistry::new(),
            state: RunnerState::Init,
            events,
            config,
            pending_started: Vec::new(),
            errors_tx,
            errors_rx,
            exceptions: ExceptionTable::new(),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn classes(&self) -> &[UserClass] {
        &self.classes
    }

    /// Total live instances.
    pub fn user_count(&self) -> u64 {
        self.registry.total()
    }

    /// Live instances grouped by class, every declared class present.
    pub fn user_class_occurrences(&self) -> OccurrenceMap {
        complete_map(&self.classes, &self.registry.occurrences())
    }

    /// Local deduplicated exception table.
    pub fn exceptions(&self) -> &ExceptionTable {
        &self.exceptions
    }

    /// Override the graceful stop timeout, e.g. from a spawn instruction.
    pub fn set_stop_timeout(&mut self, timeout: Duration) {
        self.config.stop_timeout = timeout;
    }

    /// Spawn `delta` new instances per class.
    ///
    /// A zero-total delta is a no-op: no state transition, no churn.
    /// With `wait` the call returns once every new instance has started;
    /// otherwise starting proceeds concurrently and can be joined later
    /// with [`join_spawning`](Self::join_spawning).
    pub async fn spawn(&mut self, delta: &OccurrenceMap, wait: bool) -> RunnerResult<()> {
        if total_occurrences(delta) == 0 {
            return Ok(());
        }
        for name in delta.keys() {
            if !self.factories.contains_key(name) {
                return Err(RunnerError::UnknownClass(name.clone()));
            }
        }

        if !matches!(self.state, RunnerState::Running | RunnerState::Spawning) {
            self.state = RunnerState::Spawning;
        }

        for (name, &count) in delta {
            for _ in 0..count {
                let started = self.launch_instance(name);
                self.pending_started.push(started);
            }
            if count > 0 {
                debug!(class = %name, count, "spawning instances");
            }
        }

        if wait {
            self.join_spawning().await;
        }
        Ok(())
    }

    /// Block until every outstanding spawn has started, then transition
    /// to running.
    pub async fn join_spawning(&mut self) {
        for started in self.pending_started.drain(..) {
            let _ = started.await;
        }
        if self.state == RunnerState::Spawning {
            self.state = RunnerState::Running;
            info!(users = self.registry.total(), "spawning complete");
        }
    }

    /// Stop `delta` instances per class, most-recently-started first.
    ///
    /// Stops are graceful up to the configured stop timeout, then forced.
    /// An instance stopping itself is signalled but never awaited.
    /// A zero-total delta is a no-op.
    pub async fn stop(&mut self, delta: &OccurrenceMap) {
        if total_occurrences(delta) == 0 {
            return;
        }
        let calling_instance = INSTANCE_ID.try_with(|id| *id).ok();

        let mut victims = Vec::new();
        for (name, &count) in delta {
            if count > 0 {
                victims.extend(self.registry.take_newest(name, count));
            }
        }
        debug!(count = victims.len(), "stopping instances");
        for handle in victims {
            self.halt_instance(handle, calling_instance).await;
        }
    }

    /// Stop every instance: cleanup → stopped.
    pub async fn stop_all(&mut self) {
        self.state = RunnerState::Cleanup;
        self.pending_started.clear();
        let calling_instance = INSTANCE_ID.try_with(|id| *id).ok();

        let victims = self.registry.take_all();
        info!(count = victims.len(), "stopping all users");
        for handle in victims {
            self.halt_instance(handle, calling_instance).await;
        }
        self.state = RunnerState::Stopped;
    }

    /// Process captured instance errors: deduplicate locally, fire
    /// `user_error` events, and hand the reports back for forwarding.
    pub fn drain_errors(&mut self) -> Vec<UserErrorReport> {
        let mut reports = Vec::new();
        while let Ok(report) = self.errors_rx.try_recv() {
            self.exceptions.record(
                &self.config.node_label,
                &report.msg,
                &report.traceback,
            );
            self.events.fire(&Event::UserError {
                class_name: report.class_name.clone(),
                msg: report.msg.clone(),
                traceback: report.traceback.clone(),
            });
            reports.push(report);
        }
        reports
    }

    fn launch_instance(&mut self, class_name: &str) -> oneshot::Receiver<()> {
        let factory = self
            .factories
            .get(class_name)
            .expect("class checked by caller")
            .clone();
        let id = self.registry.allocate_id();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (started_tx, started_rx) = oneshot::channel();
        let errors = self.errors_tx.clone();
        let class = class_name.to_string();

        let join = tokio::spawn(INSTANCE_ID.scope(
            id,
            run_instance(factory, class.clone(), started_tx, stop_rx, errors),
        ));

        self.registry.register(InstanceHandle {
            id,
            class_name: class,
            stop_tx,
            join,
        });
        started_rx
    }

    async fn halt_instance(&self, handle: InstanceHandle, calling_instance: Option<u64>) {
        let _ = handle.stop_tx.send(true);
        if Some(handle.id) == calling_instance {
            // Stopping ourselves: signalled, never joined.
            return;
        }
        let mut join = handle.join;
        if tokio::time::timeout(self.config.stop_timeout, &mut join)
            .await
            .is_err()
        {
            warn!(
                class = %handle.class_name,
                instance = handle.id,
                "instance did not stop within timeout, killing"
            );
            join.abort();
        }
    }
}

/// One instance's task loop: announce started, then tick until told to
/// stop. Errors are captured and reported, never propagated; the
/// instance continues unless the error requests termination.
async fn run_instance(
    factory: Arc<dyn UserFactory>,
    class_name: String,
    started: oneshot::Sender<()>,
    stop: watch::Receiver<bool>,
    errors: mpsc::UnboundedSender<UserErrorReport>,
) {
    let mut user: Box<dyn User> = factory.create();
    let _ = started.send(());

    loop {
        if *stop.borrow() {
            break;
        }
        if let Err(error) = user.tick().await {
            let _ = errors.send(UserErrorReport {
                class_name: class_name.clone(),
                msg: error.msg.clone(),
                traceback: error.traceback.clone(),
            });
            if error.terminate {
                break;
            }
        }
    }
}
