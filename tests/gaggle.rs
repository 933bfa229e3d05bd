use serial_test::serial;
use std::time::Duration;

use flock::gaggle::common::WorkerStatus;
use flock::prelude::*;

mod common;

const USERS: usize = 10;
const EXPECT_WORKERS: usize = 2;

// Test task.
pub async fn get_index(user: &mut FlockUser) -> TaskResult {
    user.request("GET", "/", None).await;
    Ok(())
}

fn visitor() -> UserSpec {
    user!("Visitor")
        .register_task(task!(get_index))
        .set_wait_time(Duration::from_millis(20), Duration::from_millis(20))
        .unwrap()
}

// Build a Worker, its options must be valid for a Worker.
fn worker(custom: Vec<&str>) -> Flock {
    let mut options = vec!["--worker", "--heartbeat-interval", "100", "--report-interval", "200"];
    options.extend_from_slice(&custom);
    common::build_load_test(common::build_configuration(options), visitor(), None, None)
}

#[test]
/// Users are spread across Workers, and move when a Worker goes missing.
fn memory_gaggle_rebalances() {
    let (manager_transport, connector) = memory_transport();
    let users = USERS.to_string();
    let expect_workers = EXPECT_WORKERS.to_string();
    let configuration = common::build_configuration(vec![
        "--master",
        "--expect-workers",
        &expect_workers,
        "--users",
        &users,
        "--hatch-rate",
        "100",
        "--run-time",
        "0",
        "--heartbeat-interval",
        "100",
        "--heartbeat-liveness",
        "3",
    ]);
    let master = common::build_load_test(configuration, visitor(), None, None)
        .set_master_transport(manager_transport);
    let controller = master.controller();

    let first = connector.connect();
    let first_link = first.link();
    let second = connector.connect();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let master_handle = tokio::spawn(master.run());
        let first_handle = tokio::spawn(worker(vec![]).set_worker_transport(first).run());
        let second_handle = tokio::spawn(worker(vec![]).set_worker_transport(second).run());
        let timeout = Duration::from_secs(10);

        // Once both Workers report in, each runs half the users.
        let snapshot = common::wait_for(&controller, timeout, |s| {
            s.state == RunState::Running && s.current_user_count == USERS
        })
        .await;
        assert_eq!(snapshot.workers.len(), EXPECT_WORKERS);
        for worker in &snapshot.workers {
            assert_eq!(worker.status, WorkerStatus::Running);
            assert_eq!(worker.user_count, USERS / EXPECT_WORKERS);
        }

        // The first Worker loses its connection; the second takes over its users.
        first_link.disconnect();
        let snapshot = common::wait_for(&controller, timeout, |s| {
            s.state == RunState::Running
                && s.current_user_count == USERS
                && s.workers
                    .iter()
                    .any(|w| w.status == WorkerStatus::Missing)
        })
        .await;
        let remaining: Vec<usize> = snapshot
            .workers
            .iter()
            .filter(|w| w.status != WorkerStatus::Missing)
            .map(|w| w.user_count)
            .collect();
        assert_eq!(remaining, vec![USERS]);

        // Back online, the first Worker registers again and gets its share back.
        first_link.reconnect();
        common::wait_for(&controller, timeout, |s| {
            s.state == RunState::Running
                && s.current_user_count == USERS
                && s.workers.len() == EXPECT_WORKERS
                && s
                    .workers
                    .iter()
                    .all(|w| w.status == WorkerStatus::Running && w.user_count == USERS / 2)
        })
        .await;

        controller.quit().unwrap();
        let metrics = tokio::time::timeout(timeout, master_handle)
            .await
            .expect("master didn't quit")
            .unwrap()
            .unwrap();
        assert!(metrics.stats.num_requests() > 0);
        // Counts overlap briefly while users move between Workers.
        assert!(metrics.users >= USERS);

        for handle in vec![first_handle, second_handle] {
            let worker_metrics = tokio::time::timeout(timeout, handle)
                .await
                .expect("worker didn't quit")
                .unwrap()
                .unwrap();
            assert!(worker_metrics.stats.num_requests() > 0);
        }
    });
}

#[test]
/// Stopping a gaggle stops every Worker, and it can be started again.
fn memory_gaggle_stop_and_restart() {
    let (manager_transport, connector) = memory_transport();
    let configuration = common::build_configuration(vec![
        "--master",
        "--no-autostart",
        "--run-time",
        "0",
        "--heartbeat-interval",
        "100",
    ]);
    let master = common::build_load_test(configuration, visitor(), None, None)
        .set_master_transport(manager_transport);
    let controller = master.controller();
    let transport = connector.connect();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let master_handle = tokio::spawn(master.run());
        let worker_handle = tokio::spawn(worker(vec![]).set_worker_transport(transport).run());
        let timeout = Duration::from_secs(10);

        common::wait_for(&controller, timeout, |s| {
            s.workers.len() == 1 && s.workers[0].status == WorkerStatus::Ready
        })
        .await;

        for users in vec![3, 5] {
            controller.start(users, 100.0).unwrap();
            common::wait_for(&controller, timeout, |s| {
                s.state == RunState::Running && s.current_user_count == users
            })
            .await;
            controller.stop().unwrap();
            let snapshot = common::wait_for(&controller, timeout, |s| {
                s.state == RunState::Stopped
            })
            .await;
            assert_eq!(snapshot.current_user_count, 0);
        }

        controller.quit().unwrap();
        let metrics = tokio::time::timeout(timeout, master_handle)
            .await
            .expect("master didn't quit")
            .unwrap()
            .unwrap();
        assert!(metrics.stats.num_requests() > 0);
        tokio::time::timeout(timeout, worker_handle)
            .await
            .expect("worker didn't quit")
            .unwrap()
            .unwrap();
    });
}

#[test]
/// A Master follows a load shape, splitting its users across Workers.
fn memory_gaggle_load_shape() {
    let (manager_transport, connector) = memory_transport();
    let expect_workers = EXPECT_WORKERS.to_string();
    let configuration = common::build_configuration(vec![
        "--master",
        "--expect-workers",
        &expect_workers,
        "--heartbeat-interval",
        "100",
    ]);
    let master = common::build_load_test(configuration, visitor(), None, None)
        .set_master_transport(manager_transport)
        .set_load_shape(StagesShape::new(vec![LoadStage::new(
            Duration::from_secs(2),
            4,
            100.0,
        )]));
    let controller = master.controller();
    let first = connector.connect();
    let second = connector.connect();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let master_handle = tokio::spawn(master.run());
        let worker_handles = vec![
            tokio::spawn(worker(vec![]).set_worker_transport(first).run()),
            tokio::spawn(worker(vec![]).set_worker_transport(second).run()),
        ];
        let timeout = Duration::from_secs(10);

        let snapshot = common::wait_for(&controller, timeout, |s| {
            s.state == RunState::Running && s.current_user_count == 4
        })
        .await;
        for worker in &snapshot.workers {
            assert_eq!(worker.user_count, 4 / EXPECT_WORKERS);
        }

        // The shape ends the load test, which stops the Workers and quits.
        let metrics = tokio::time::timeout(timeout, master_handle)
            .await
            .expect("master didn't quit")
            .unwrap()
            .unwrap();
        assert_eq!(metrics.users, 4);
        assert!(metrics.stats.num_requests() > 0);
        for handle in worker_handles {
            tokio::time::timeout(timeout, handle)
                .await
                .expect("worker didn't quit")
                .unwrap()
                .unwrap();
        }
    });
}

#[test]
#[serial]
/// A Master and two Workers over WebSockets run until the run time expires.
fn websocket_gaggle() {
    let master_configuration = common::build_configuration(vec![
        "--master",
        "--master-bind-host",
        "127.0.0.1",
        "--master-bind-port",
        "5125",
        "--expect-workers",
        "2",
        "--users",
        "4",
        "--hatch-rate",
        "100",
        "--run-time",
        "2",
    ]);
    let master = common::build_load_test(master_configuration, visitor(), None, None);

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let master_handle = tokio::spawn(master.run());
        let worker_handles: Vec<_> = (0..2)
            .map(|_| {
                let worker = worker(vec!["--master-host", "127.0.0.1", "--master-port", "5125"]);
                tokio::spawn(worker.run())
            })
            .collect();

        let timeout = Duration::from_secs(20);
        let metrics = tokio::time::timeout(timeout, master_handle)
            .await
            .expect("master didn't finish")
            .unwrap()
            .unwrap();
        assert!(metrics.duration >= 2);
        assert_eq!(metrics.users, 4);
        let index = metrics.stats.get("GET", "/").unwrap();
        assert!(index.num_requests > 0);

        // Every request a Worker made was reported to the Master.
        let mut worker_requests = 0;
        for handle in worker_handles {
            let worker_metrics = tokio::time::timeout(timeout, handle)
                .await
                .expect("worker didn't quit")
                .unwrap()
                .unwrap();
            worker_requests += worker_metrics.stats.num_requests();
        }
        assert_eq!(worker_requests, index.num_requests);
    });
}
