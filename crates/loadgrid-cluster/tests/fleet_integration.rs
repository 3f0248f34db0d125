//! End-to-end fleet test: master and three worker agents over the
//! in-process transport, driven entirely through operator commands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use loadgrid_cluster::{ClusterConfig, InProcGrid, Master, MasterCommand, WorkerAgent};
use loadgrid_core::{Event, EventBus, RunnerState, UserClass};
use loadgrid_runner::{TickFuture, User, UserFactory};

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
    vec![
        (
            UserClass::new("browse", 1.0),
            Arc::new(|| Box::new(IdleUser) as Box<dyn User>) as Arc<dyn UserFactory>,
        ),
        (
            UserClass::new("checkout", 3.0),
            Arc::new(|| Box::new(IdleUser) as Box<dyn User>) as Arc<dyn UserFactory>,
        ),
    ]
}

fn classes() -> Vec<UserClass> {
    vec![UserClass::new("browse", 1.0), UserClass::new("checkout", 3.0)]
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(start_paused = true)]
async fn fleet_ramps_stops_restarts_and_quits() {
    init_tracing();
    let (grid, inbox) = InProcGrid::new();
    let events = Arc::new(EventBus::new());

    let (complete_tx, mut complete_rx) = mpsc::unbounded_channel();
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    {
        let complete_tx = complete_tx.clone();
        events.subscribe(move |event| match event {
            Event::SpawningComplete { user_count } => {
                let _ = complete_tx.send(*user_count);
            }
            Event::TestStop => {
                let _ = stopped_tx.send(());
            }
            _ => {}
        });
    }

    let master = Master::new(
        classes(),
        ClusterConfig::default(),
        Arc::new(grid.clone()),
        events.clone(),
    );
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let master_task = tokio::spawn(master.run(inbox, command_rx, shutdown_rx.clone()));

    let mut worker_tasks = Vec::new();
    for i in 0..3 {
        let id = format!("worker-{i}");
        let (tx, rx) = grid.connect(&id);
        let agent = WorkerAgent::new(
            &id,
            specs(),
            ClusterConfig::default(),
            tx,
            Arc::new(EventBus::new()),
        );
        worker_tasks.push(tokio::spawn(agent.run(rx, shutdown_rx.clone())));
    }

    // Let the ready announcements reach the master.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Ramp to 100 users at 10/s and wait for fleet-wide completion.
    command_tx
        .send(MasterCommand::Start {
            total_users: 100,
            spawn_rate: 10.0,
        })
        .unwrap();
    let reached = complete_rx.recv().await.unwrap();
    assert_eq!(reached, 100);

    // Stop: workers wind down and re-announce readiness.
    command_tx.send(MasterCommand::StopRun).unwrap();
    stopped_rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The same fleet runs again without reconnecting.
    command_tx
        .send(MasterCommand::Start {
            total_users: 20,
            spawn_rate: 20.0,
        })
        .unwrap();
    let reached = complete_rx.recv().await.unwrap();
    assert_eq!(reached, 20);

    // Quit dismisses everyone; both sides settle stopped and empty.
    command_tx.send(MasterCommand::Quit).unwrap();
    let master = master_task.await.unwrap();
    assert_eq!(master.state(), RunnerState::Stopped);
    assert_eq!(master.user_count(), 0);
    assert!(master.workers().is_empty());
    assert_eq!(master.exceptions().len(), 0);

    for task in worker_tasks {
        let agent = task.await.unwrap();
        assert_eq!(agent.runner().user_count(), 0);
        assert_eq!(agent.runner().state(), RunnerState::Stopped);
    }
    drop(shutdown_tx);
}
