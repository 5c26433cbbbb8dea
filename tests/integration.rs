//! End-to-end tests driving a real `taskord-server` process over real FIFOs.
//! Each test gets its own `TASKORD_RUNTIME_DIR` and output directory so
//! tests never collide with each other or with a real daemon on the same
//! host.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

struct TestServer {
    child: Child,
    runtime_dir: tempfile::TempDir,
    output_dir: tempfile::TempDir,
}

impl TestServer {
    fn spawn(ntasks: u32, policy: &str) -> TestServer {
        let runtime_dir = tempfile::tempdir().unwrap();
        let output_dir = tempfile::tempdir().unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_taskord-server"))
            .arg(output_dir.path())
            .arg(ntasks.to_string())
            .arg(policy)
            .env("TASKORD_RUNTIME_DIR", runtime_dir.path())
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn taskord-server");

        let server_fifo = runtime_dir.path().join("server.fifo");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server_fifo.exists() {
            if Instant::now() > deadline {
                panic!("server did not create its FIFO in time");
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        TestServer {
            child,
            runtime_dir,
            output_dir,
        }
    }

    fn client(&self, args: &[&str]) -> std::process::Output {
        Command::new(env!("CARGO_BIN_EXE_taskord"))
            .args(args)
            .env("TASKORD_RUNTIME_DIR", self.runtime_dir.path())
            .env("RUST_LOG", "warn")
            .output()
            .expect("failed to run taskord client")
    }

    fn output_path(&self, name: &str) -> std::path::PathBuf {
        self.output_dir.path().join(name)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn read_file(path: &Path) -> String {
    let mut s = String::new();
    std::fs::File::open(path)
        .unwrap_or_else(|e| panic!("could not open {}: {}", path.display(), e))
        .read_to_string(&mut s)
        .unwrap();
    s
}

fn wait_for(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Scenario 1: submit a single command, expect id 1, captured stdout, and a
/// later status listing showing it DONE.
#[test]
fn submit_single_command_and_observe_status() {
    let server = TestServer::spawn(2, "fcfs");

    let submit = server.client(&["execute", "100", "-u", "echo hi"]);
    assert!(submit.status.success(), "submit failed: {:?}", submit);
    assert_eq!(stdout_of(&submit).trim(), "TASK_ID=1");

    let out_path = server.output_path("1.out");
    assert!(wait_for(|| out_path.exists(), Duration::from_secs(5)));
    assert_eq!(read_file(&out_path), "hi\n");

    assert!(wait_for(
        || {
            let status = server.client(&["status"]);
            stdout_of(&status).contains("Done") && stdout_of(&status).contains("id=1")
        },
        Duration::from_secs(5)
    ));
}

/// Scenario 2: with a single execution slot held busy, three tasks queued
/// behind it complete in ascending `expected_ms` order under SJF, not
/// submission order.
#[test]
fn sjf_orders_by_expected_ms() {
    let server = TestServer::spawn(1, "sjf");

    let dummy = server.client(&["execute", "500", "-u", "sleep 0.3"]);
    assert_eq!(stdout_of(&dummy).trim(), "TASK_ID=1");
    assert!(wait_for(|| stdout_of(&server.client(&["status"])).contains("Executing"), Duration::from_secs(5)));

    // Submitted in id order 2, 3, 4 with expected_ms 300, 100, 200 — SJF
    // must complete them 3 (100), 4 (200), 2 (300).
    assert_eq!(stdout_of(&server.client(&["execute", "300", "-u", "echo a"])).trim(), "TASK_ID=2");
    assert_eq!(stdout_of(&server.client(&["execute", "100", "-u", "echo b"])).trim(), "TASK_ID=3");
    assert_eq!(stdout_of(&server.client(&["execute", "200", "-u", "echo c"])).trim(), "TASK_ID=4");

    assert!(wait_for(
        || {
            let text = stdout_of(&server.client(&["status"]));
            ["id=1", "id=2", "id=3", "id=4"].iter().all(|needle| {
                text.lines().filter(|l| l.contains(needle)).any(|l| l.starts_with("Done"))
            })
        },
        Duration::from_secs(5)
    ));

    let final_status = stdout_of(&server.client(&["status"]));
    let pos = |needle: &str| final_status.find(needle).unwrap_or_else(|| panic!("missing {} in:\n{}", needle, final_status));
    assert!(pos("id=3") < pos("id=4"), "id=3 (100ms) must complete before id=4 (200ms)");
    assert!(pos("id=4") < pos("id=2"), "id=4 (200ms) must complete before id=2 (300ms)");
}

/// Scenario 3: a two-stage pipeline's stdout is the last stage's output.
#[test]
fn pipeline_captures_last_stage_output() {
    let server = TestServer::spawn(2, "fcfs");

    let submit = server.client(&["execute", "50", "-p", "echo a | wc -c"]);
    assert_eq!(stdout_of(&submit).trim(), "TASK_ID=1");

    let out_path = server.output_path("1.out");
    assert!(wait_for(|| out_path.exists(), Duration::from_secs(5)));
    assert_eq!(read_file(&out_path).trim(), "2");
}

/// Scenario 4: a failing command is still captured, and status later shows
/// it DONE with the error flag set.
#[test]
fn failing_command_is_flagged_in_status() {
    let server = TestServer::spawn(2, "fcfs");

    let submit = server.client(&["execute", "10", "-u", "nonexistent_cmd_xyz"]);
    assert_eq!(stdout_of(&submit).trim(), "TASK_ID=1");

    assert!(wait_for(
        || {
            let status = server.client(&["status"]);
            let text = stdout_of(&status);
            text.contains("id=1") && text.contains("error=true")
        },
        Duration::from_secs(5)
    ));
}

/// Scenario 5: a malformed command line is rejected with exit code 2 and
/// does not consume an id.
#[test]
fn malformed_quote_is_rejected_without_consuming_an_id() {
    let server = TestServer::spawn(2, "fcfs");

    let bad = server.client(&["execute", "10", "-u", "echo \"unterminated"]);
    assert_eq!(bad.status.code(), Some(2));

    let good = server.client(&["execute", "10", "-u", "echo ok"]);
    assert_eq!(stdout_of(&good).trim(), "TASK_ID=1");
}

/// SEND_PROGRAM (`-u`) rejects a pipeline.
#[test]
fn dash_u_rejects_a_pipeline() {
    let server = TestServer::spawn(2, "fcfs");

    let submit = server.client(&["execute", "10", "-u", "echo a | wc -c"]);
    assert_eq!(submit.status.code(), Some(2));
}

/// A STATUS request against a server with nothing submitted yet returns an
/// empty listing, not an error.
#[test]
fn status_on_idle_server_is_empty() {
    let server = TestServer::spawn(2, "fcfs");
    let status = server.client(&["status"]);
    assert!(status.status.success());
    assert!(stdout_of(&status).trim().is_empty());
}
