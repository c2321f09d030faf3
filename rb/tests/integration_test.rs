//! Integration tests for resbroker
//!
//! These tests run the real `rb` binary against a fake resource manager:
//! a Unix-socket listener speaking the manager-side half of the codec,
//! recording every request it sees.

use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use resbroker::broker;
use resbroker::manager::messages::{self, Capabilities, MessageKind, Reply, Request};
use resbroker::subordinate;

// =============================================================================
// Fake resource manager
// =============================================================================

/// What the fake manager should do with an acquire request
#[derive(Clone, Copy)]
enum AcquirePolicy {
    Grant,
    Deny { status: i32 },
    GrantAfter(Duration),
}

/// One observed request
struct Exchange {
    kind: MessageKind,
    at: SystemTime,
}

/// Serve one broker session; returns the observed requests in order
fn fake_manager(listener: UnixListener, policy: AcquirePolicy) -> thread::JoinHandle<Vec<Exchange>> {
    thread::spawn(move || {
        let mut seen = Vec::new();
        let (mut stream, _) = listener.accept().expect("accept");
        loop {
            let payload = match read_frame_sync(&mut stream) {
                Ok(payload) => payload,
                Err(_) => break, // broker hung up
            };
            let (request, _id, reqno) =
                messages::decode_request(&payload).expect("well-formed request");
            let kind = request.kind();

            let reply = match request {
                Request::Register { .. } => Some(Reply {
                    kind: MessageKind::Register,
                    id: 1,
                    reqno,
                    status: 0,
                    granted: Capabilities::empty(),
                }),
                Request::Acquire => {
                    let status = match policy {
                        AcquirePolicy::Grant => 0,
                        AcquirePolicy::Deny { status } => status,
                        AcquirePolicy::GrantAfter(delay) => {
                            thread::sleep(delay);
                            0
                        }
                    };
                    let granted = if status == 0 {
                        Capabilities::VIDEO_PLAYBACK
                    } else {
                        Capabilities::empty()
                    };
                    Some(Reply {
                        kind: MessageKind::Grant,
                        id: 1,
                        reqno,
                        status,
                        granted,
                    })
                }
                Request::Video { .. } => Some(Reply {
                    kind: MessageKind::Video,
                    id: 1,
                    reqno,
                    status: 0,
                    granted: Capabilities::empty(),
                }),
                Request::Release => None,
                other => panic!("unexpected request: {other:?}"),
            };

            seen.push(Exchange {
                kind,
                at: SystemTime::now(),
            });
            if let Some(reply) = reply {
                write_frame_sync(&mut stream, &messages::encode_reply(&reply))
                    .expect("write reply");
            }
        }
        seen
    })
}

fn read_frame_sync(stream: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn write_frame_sync(stream: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)
}

/// The rb binary pointed at the fake manager, hermetic in `home`
fn rb(socket: &Path, home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("rb").expect("rb binary");
    cmd.env("RESBROKER_SOCKET", socket)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("XDG_DATA_HOME", home.join(".local/share"))
        .env_remove("XDG_RUNTIME_DIR")
        .current_dir(home);
    cmd
}

fn kinds(seen: &[Exchange]) -> Vec<MessageKind> {
    seen.iter().map(|e| e.kind).collect()
}

const FULL_BRACKET: [MessageKind; 4] = [
    MessageKind::Register,
    MessageKind::Acquire,
    MessageKind::Video,
    MessageKind::Release,
];

// =============================================================================
// Golden path
// =============================================================================

#[test]
fn test_golden_path_runs_command_and_releases_once() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Grant);

    rb(&socket, tmp.path())
        .args(["echo", "hi"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"));

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
}

#[test]
fn test_release_arrives_after_subordinate_exit() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Grant);

    rb(&socket, tmp.path())
        .args(["sh", "-c", "sleep 1"])
        .assert()
        .success();

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
    let configured_at = seen[2].at;
    let released_at = seen[3].at;
    let held_for = released_at
        .duration_since(configured_at)
        .unwrap_or(Duration::ZERO);
    assert!(
        held_for >= Duration::from_millis(800),
        "release after {held_for:?}, before the subordinate could have exited"
    );
}

#[test]
fn test_subordinate_starts_only_after_grant() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let marker = tmp.path().join("started");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::GrantAfter(Duration::from_millis(500)));

    rb(&socket, tmp.path())
        .args(["sh", "-c", &format!("touch {}", marker.display())])
        .assert()
        .success();

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
    let granted_at = seen[1].at;
    let started_at = std::fs::metadata(&marker).unwrap().modified().unwrap();
    assert!(
        started_at >= granted_at - Duration::from_millis(50),
        "subordinate ran before the grant"
    );
}

#[test]
fn test_broker_survives_interrupt_while_holding() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Grant);

    // the subordinate interrupts its own controller; the hold must survive
    rb(&socket, tmp.path())
        .args(["sh", "-c", "kill -INT $PPID; sleep 0.2; echo survived"])
        .assert()
        .success()
        .stdout(predicate::str::contains("survived"));

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
}

// =============================================================================
// Denial
// =============================================================================

#[test]
fn test_denied_acquisition_never_runs_the_command() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Deny { status: 1 });

    rb(&socket, tmp.path())
        .args(["sh", "-c", "echo should-not-run"])
        .assert()
        .code(broker::EXIT_DENIED)
        .stdout(predicate::str::contains("should-not-run").not());

    let seen = manager.join().unwrap();
    // no configure, and crucially zero releases
    assert_eq!(kinds(&seen), [MessageKind::Register, MessageKind::Acquire]);
}

#[test]
fn test_unreachable_manager_aborts_before_running() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock"); // never bound

    rb(&socket, tmp.path())
        .args(["sh", "-c", "echo should-not-run"])
        .assert()
        .code(broker::EXIT_UNAVAILABLE)
        .stdout(predicate::str::contains("should-not-run").not());
}

// =============================================================================
// Subordinate failure modes
// =============================================================================

#[test]
fn test_release_still_sent_when_subordinate_fails() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Grant);

    rb(&socket, tmp.path())
        .args(["sh", "-c", "exit 3"])
        .assert()
        .code(3);

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
}

#[test]
fn test_signal_death_is_mirrored_and_released() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Grant);

    rb(&socket, tmp.path())
        .args(["sh", "-c", "kill -9 $$"])
        .assert()
        .code(137); // 128 + SIGKILL

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
}

#[test]
fn test_unresolvable_command_fails_inside_the_subordinate() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Grant);

    // resolution happens only after release, inside the subordinate, so the
    // full bracket still runs
    rb(&socket, tmp.path())
        .arg("definitely-not-a-real-command-4242")
        .assert()
        .code(subordinate::EXIT_WAIT_NOTFOUND);

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
}

// =============================================================================
// Empty command
// =============================================================================

#[test]
fn test_empty_command_still_brackets() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Grant);

    rb(&socket, tmp.path()).assert().success();

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
}

#[test]
fn test_run_subcommand_without_command_still_brackets() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let manager = fake_manager(listener, AcquirePolicy::Grant);

    rb(&socket, tmp.path()).arg("run").assert().success();

    let seen = manager.join().unwrap();
    assert_eq!(kinds(&seen), FULL_BRACKET);
}

// =============================================================================
// Ping
// =============================================================================

#[test]
fn test_ping_reports_reachability() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("manager.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    // accept and hold the connection open; ping never sends a message
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    rb(&socket, tmp.path())
        .arg("ping")
        .assert()
        .success()
        .stdout(predicate::str::contains("reachable"));
    server.join().unwrap();

    let tmp2 = TempDir::new().unwrap();
    rb(&tmp2.path().join("missing.sock"), tmp2.path())
        .arg("ping")
        .assert()
        .code(broker::EXIT_UNAVAILABLE);
}

// =============================================================================
// Rendezvous plumbing via the real binary
// =============================================================================

#[tokio::test]
async fn test_spawner_holds_subordinate_until_released() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("ran");
    let spawner = resbroker::SubordinateSpawner::with_shim(
        std::path::PathBuf::from(env!("CARGO_BIN_EXE_rb")),
    );

    let mut handle = spawner
        .spawn_paused(&[
            "sh".into(),
            "-c".into(),
            format!("touch {}", marker.display()).into(),
        ])
        .unwrap();
    assert!(handle.pid() > 0);

    // paused: nothing may have run yet
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!marker.exists(), "subordinate ran before release");

    handle.release().unwrap();
    let status = handle.await_exit().await.unwrap();
    assert!(status.success());
    assert!(marker.exists());

    assert!(matches!(
        handle.release(),
        Err(resbroker::SyncError::AlreadyReleased)
    ));
}

#[tokio::test]
async fn test_terminated_subordinate_never_runs() {
    let tmp = TempDir::new().unwrap();
    let marker = tmp.path().join("ran");
    let spawner = resbroker::SubordinateSpawner::with_shim(
        std::path::PathBuf::from(env!("CARGO_BIN_EXE_rb")),
    );

    let mut handle = spawner
        .spawn_paused(&[
            "sh".into(),
            "-c".into(),
            format!("touch {}", marker.display()).into(),
        ])
        .unwrap();
    handle.terminate().await.unwrap();
    assert!(!marker.exists());
}
