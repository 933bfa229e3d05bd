use serial_test::serial;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use flock::prelude::*;

mod common;

const TELNET_PORT: &str = "5226";
const PROMPT: &str = "flock> ";
const USERS: usize = 4;

// Test task.
pub async fn get_index(user: &mut FlockUser) -> TaskResult {
    user.request("GET", "/", None).await;
    Ok(())
}

fn build_load_test(custom: Vec<&str>) -> Flock {
    let mut options = vec!["--no-autostart", "--run-time", "0"];
    options.extend_from_slice(&custom);
    common::build_load_test(
        common::build_configuration(options),
        user!("Visitor")
            .register_task(task!(get_index))
            .set_wait_time(Duration::from_millis(10), Duration::from_millis(10))
            .unwrap(),
        None,
        None,
    )
}

// A telnet client that reads until the next prompt.
struct TelnetClient {
    stream: TcpStream,
}
impl TelnetClient {
    async fn connect() -> TelnetClient {
        let address = format!("127.0.0.1:{}", TELNET_PORT);
        let started = Instant::now();
        // The controller may not be listening yet.
        let stream = loop {
            match TcpStream::connect(&address).await {
                Ok(stream) => break stream,
                Err(e) if started.elapsed() > Duration::from_secs(5) => {
                    panic!("failed to connect to controller: {}", e)
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        };
        let mut client = TelnetClient { stream };
        let greeting = client.read_reply().await;
        assert_eq!(greeting, PROMPT);
        client
    }

    // Everything up to and including the prompt, or until the connection closes.
    async fn read_reply(&mut self) -> String {
        let mut reply = Vec::new();
        let mut buf = [0; 2048];
        loop {
            let read = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("controller didn't reply")
                .unwrap();
            if read == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..read]);
            if reply.ends_with(PROMPT.as_bytes()) {
                break;
            }
        }
        String::from_utf8(reply).unwrap()
    }

    async fn command(&mut self, command: &str) -> String {
        self.stream
            .write_all(format!("{}\r\n", command).as_bytes())
            .await
            .unwrap();
        self.read_reply().await
    }

    // Repeat `state` until the reply contains `expected`.
    async fn wait_for_state(&mut self, expected: &str) -> String {
        let started = Instant::now();
        loop {
            let reply = self.command("state").await;
            if reply.contains(expected) {
                return reply;
            }
            if started.elapsed() > Duration::from_secs(10) {
                panic!("timed out waiting for {}, last reply: {}", expected, reply);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[test]
#[serial]
/// Drive a load test from start to quit through the telnet Controller.
fn telnet_controller() {
    let flock = build_load_test(vec!["--telnet-host", "127.0.0.1", "--telnet-port", TELNET_PORT]);

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let load_test = tokio::spawn(flock.run());
        let mut client = TelnetClient::connect().await;

        let help = client.command("help").await;
        assert!(help.contains("start USERS RATE"));
        assert!(help.contains("quit"));

        let reply = client.command("fly away").await;
        assert!(reply.starts_with("unrecognized command"));

        let reply = client.command("state").await;
        assert!(reply.contains("state: Idle"));

        let reply = client.command(&format!("start {} 100", USERS)).await;
        assert!(reply.starts_with(&format!("starting {} users", USERS)));
        client
            .wait_for_state(&format!("state: Running, users: {}/{}", USERS, USERS))
            .await;

        // Re-targeting while running.
        client.command("start 2 100").await;
        client.wait_for_state("state: Running, users: 2/2").await;

        let reply = client.command("stats").await;
        assert!(reply.contains("GET"));

        let reply = client.command("reset").await;
        assert!(reply.starts_with("stats reset"));

        let reply = client.command("stop").await;
        assert!(reply.starts_with("stopping"));
        client.wait_for_state("state: Stopped, users: 0/0").await;

        // Quitting disconnects the client and ends the load test.
        let reply = client.command("quit").await;
        assert!(reply.starts_with("quitting"));
        assert!(!reply.ends_with(PROMPT));

        let metrics = tokio::time::timeout(Duration::from_secs(5), load_test)
            .await
            .expect("load test didn't quit")
            .unwrap()
            .unwrap();
        assert_eq!(metrics.users, USERS);
    });
}

#[test]
#[serial]
/// Several telnet clients can be connected at once.
fn telnet_controller_clients() {
    let flock = build_load_test(vec!["--telnet-host", "127.0.0.1", "--telnet-port", TELNET_PORT]);

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let load_test = tokio::spawn(flock.run());
        let mut first = TelnetClient::connect().await;
        let mut second = TelnetClient::connect().await;

        first.command("start 2 100").await;
        second.wait_for_state("state: Running, users: 2/2").await;

        // Exiting only disconnects that client.
        let reply = second.command("exit").await;
        assert!(reply.starts_with("goodbye"));
        let reply = first.command("state").await;
        assert!(reply.contains("state: Running"));

        first.command("quit").await;
        tokio::time::timeout(Duration::from_secs(5), load_test)
            .await
            .expect("load test didn't quit")
            .unwrap()
            .unwrap();
    });
}

#[test]
/// Subscribers see every state change, and periodic snapshots.
fn control_handle_events() {
    let flock = build_load_test(vec![]);
    let controller = flock.controller();
    // Subscribing before the load test runs is allowed.
    let events = controller.subscribe().unwrap();

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let load_test = tokio::spawn(flock.run());

        controller.start(USERS, 100.0).unwrap();
        common::wait_for(&controller, Duration::from_secs(5), |s| {
            s.state == RunState::Running
        })
        .await;
        // Snapshots are published every second.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        controller.stop().unwrap();
        common::wait_for(&controller, Duration::from_secs(5), |s| {
            s.state == RunState::Stopped
        })
        .await;
        controller.quit().unwrap();
        load_test.await.unwrap().unwrap();

        // Commands fail once the load test is gone.
        assert!(controller.stop().is_err());
        assert!(controller.snapshot().await.is_err());
    });

    let mut transitions = Vec::new();
    let mut snapshots = 0;
    for event in events.drain() {
        match event {
            RunnerEvent::StateChanged { from, to } => transitions.push((from, to)),
            RunnerEvent::Snapshot(snapshot) => {
                snapshots += 1;
                assert_eq!(snapshot.mode, RunnerMode::Local);
            }
            RunnerEvent::Warning(warning) => panic!("unexpected warning: {}", warning),
        }
    }
    assert!(snapshots >= 1);
    assert_eq!(
        transitions,
        vec![
            (RunState::Idle, RunState::Spawning),
            (RunState::Spawning, RunState::Running),
            (RunState::Running, RunState::Stopping),
            (RunState::Stopping, RunState::Stopped),
            (RunState::Stopped, RunState::Quitting),
            (RunState::Quitting, RunState::Cleanup),
        ]
    );
}
