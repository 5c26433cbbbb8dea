//! Task runner: spawns a pipeline (or invokes a procedure task) in a
//! forked child, wires file descriptors, and reports completion.

use crate::bus::endpoint::Endpoint;
use crate::config;
use crate::protocol::message::Message;
use crate::task::{Program, TaggedTask, TaskKind, Timestamp};
use log::{error, warn};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Number of `send_retrying` attempts a runner/status child makes before
/// giving up on telling the server it's done.
const TASK_DONE_SEND_ATTEMPTS: u32 = 8;

/// Entry point invoked in the child right after `fork()` in
/// `Scheduler::dispatch_possible`. Runs to completion, reports `TASK_DONE`
/// to the server, and returns the exit code the caller should pass to
/// `_exit`.
pub fn run_child(task: TaggedTask, slot: usize, output_dir: &Path) -> i32 {
    let TaggedTask { id, kind, .. } = task;
    match kind {
        // The status subsystem's procedure reports its own TASK_DONE (with
        // is_status=true) once it has finished streaming STATUS_RESPs; this
        // function must not send a second, incorrectly-flagged one on its
        // behalf.
        TaskKind::Internal(mut procedure) => procedure(slot),
        TaskKind::Pipeline(programs) => {
            let exit_code = run_pipeline(id, &programs, output_dir);
            report_done(slot, false, false);
            exit_code
        }
    }
}

/// Sends the `TASK_DONE` frame for this child, swallowing (but logging)
/// any failure: a runner that can't tell the server it's finished has no
/// other recourse — it's about to `_exit` regardless.
pub fn report_done(slot: usize, is_status: bool, error: bool) {
    let mut endpoint = Endpoint::for_sending();
    if let Err(e) = endpoint.open_sending_to_server() {
        warn!("could not connect to server to deliver TASK_DONE for slot {}: {}", slot, e);
        return;
    }
    let message = Message::TaskDone {
        slot: slot as u32,
        ended_ts: Timestamp::now(),
        is_status,
        error,
    };
    let payload = match message.encode() {
        Ok(p) => p,
        Err(e) => {
            error!("failed to encode TASK_DONE for slot {}: {}", slot, e);
            return;
        }
    };
    if let Err(e) = endpoint.send_retrying(&payload, TASK_DONE_SEND_ATTEMPTS) {
        warn!("could not deliver TASK_DONE for slot {}: {}", slot, e);
    }
}

fn cstring_argv(program: &Program) -> Vec<CString> {
    program
        .argv()
        .iter()
        .map(|s| CString::new(s.as_bytes()).unwrap_or_else(|_| CString::new("?").unwrap()))
        .collect()
}

/// Opens `<dir>/<id>.out` and `<dir>/<id>.err`, creating/truncating with
/// mode 0640. Falls back to the runner's own inherited stdout/stderr on
/// open failure.
fn open_capture_files(output_dir: &Path, id: u32) -> (RawFd, RawFd) {
    let out_path = config::stdout_path(output_dir, id);
    let err_path = config::stderr_path(output_dir, id);
    let flags = OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC;
    let mode = Mode::from_bits_truncate(0o640);

    let out_fd = match open(&out_path, flags, mode) {
        Ok(fd) => fd,
        Err(e) => {
            error!("failed to open {}: {} (falling back to inherited stdout)", out_path.display(), e);
            1
        }
    };
    let err_fd = match open(&err_path, flags, mode) {
        Ok(fd) => fd,
        Err(e) => {
            error!("failed to open {}: {} (falling back to inherited stderr)", err_path.display(), e);
            2
        }
    };
    (out_fd, err_fd)
}

fn write_exec_diagnostic(err_fd: RawFd, program: &Program, cause: nix::Error) {
    let msg = format!(
        "taskord: failed to execute '{}': {}\n",
        program.executable(),
        cause
    );
    let _ = nix::unistd::write(err_fd, msg.as_bytes());
}

/// Spawns one pipeline stage. Must be called from within the already-forked
/// runner process; this function itself forks once more per stage.
fn spawn_stage(
    program: &Program,
    stdin_src: Option<RawFd>,
    stdout_dst: RawFd,
    stderr_dst: RawFd,
    all_fds_to_close: &[RawFd],
) -> Result<Pid, nix::Error> {
    match unsafe { fork() }? {
        ForkResult::Child => {
            match stdin_src {
                Some(fd) => {
                    let _ = dup2(fd, 0);
                }
                None => {
                    // First stage: close stdin rather than leave it attached
                    // to whatever the server inherited.
                    let _ = close(0);
                }
            }
            let _ = dup2(stdout_dst, 1);
            let _ = dup2(stderr_dst, 2);
            for &fd in all_fds_to_close {
                if fd > 2 {
                    let _ = close(fd);
                }
            }

            let argv = cstring_argv(program);
            let exe = CString::new(program.executable()).unwrap_or_else(|_| CString::new("?").unwrap());
            match execvp(&exe, &argv) {
                Ok(_) => unreachable!("execvp does not return on success"),
                Err(e) => {
                    write_exec_diagnostic(2, program, e);
                    unsafe { libc::_exit(1) };
                }
            }
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

/// Runs a `k`-stage pipeline, wiring `k-1` pipes between consecutive
/// stages, waits for all stages, and returns the last stage's exit status
/// as this runner's own exit code (shell-style pipeline semantics), so the
/// scheduler's `mark_done` can tell success from failure by waiting on the
/// runner itself.
fn run_pipeline(id: u32, programs: &[Program], output_dir: &Path) -> i32 {
    let (out_fd, err_fd) = open_capture_files(output_dir, id);
    let k = programs.len();

    let mut pipes: Vec<(RawFd, RawFd)> = Vec::with_capacity(k.saturating_sub(1));
    for _ in 0..k.saturating_sub(1) {
        match pipe() {
            Ok((r, w)) => pipes.push((r, w)),
            Err(e) => {
                error!("failed to create pipe for task {}: {}", id, e);
                return 1;
            }
        }
    }

    let mut all_fds: Vec<RawFd> = pipes.iter().flat_map(|&(r, w)| [r, w]).collect();
    all_fds.push(out_fd);
    all_fds.push(err_fd);

    let mut children: Vec<Pid> = Vec::with_capacity(k);
    for (i, program) in programs.iter().enumerate() {
        let stdin_src = if i == 0 { None } else { Some(pipes[i - 1].0) };
        let stdout_dst = if i == k - 1 { out_fd } else { pipes[i].1 };
        match spawn_stage(program, stdin_src, stdout_dst, err_fd, &all_fds) {
            Ok(pid) => children.push(pid),
            Err(e) => error!("failed to spawn stage {} ('{}') of task {}: {}", i, program.executable(), id, e),
        }
    }

    for &fd in &all_fds {
        if fd > 2 {
            let _ = close(fd);
        }
    }

    let last_child = children.last().copied();
    let mut statuses: HashMap<Pid, i32> = HashMap::new();
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                statuses.insert(pid, code);
            }
            Ok(WaitStatus::Signaled(pid, ..)) => {
                statuses.insert(pid, 128);
            }
            Ok(_) => continue,
            Err(nix::Error::ECHILD) => break,
            Err(nix::Error::EINTR) => continue,
            Err(e) => {
                warn!("waitpid failed while reaping pipeline {}: {}", id, e);
                break;
            }
        }
    }

    match last_child.and_then(|pid| statuses.get(&pid)) {
        Some(&code) => code,
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Program;

    #[test]
    fn cstring_argv_converts_every_argument() {
        let program = Program::new(vec!["echo".into(), "hi".into()]).unwrap();
        let argv = cstring_argv(&program);
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[0].to_str().unwrap(), "echo");
    }
}
