//! Status subsystem: builds the procedure task the server forks in response
//! to a STATUS request.

use crate::bus::endpoint::Endpoint;
use crate::logfile::LogFile;
use crate::protocol::message::{Message, TaskStatus};
use crate::runner;
use crate::scheduler::Scheduler;
use crate::task::{Phase, Procedure, Timestamp, PHASE_COUNT};
use log::warn;
use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

/// Classifies a task's lifecycle stamps into the STATUS_RESP status enum:
/// `COMPLETED` set -> DONE; else `DISPATCHED` set -> EXECUTING; else QUEUED.
fn classify(stamps: &[Timestamp; PHASE_COUNT]) -> TaskStatus {
    if stamps[Phase::Completed as usize].is_set() {
        TaskStatus::Done
    } else if stamps[Phase::Dispatched as usize].is_set() {
        TaskStatus::Executing
    } else {
        TaskStatus::Queued
    }
}

/// Computes the four STATUS_RESP timing doubles (microseconds) as
/// differences between adjacent lifecycle phases; absent pairs yield NaN.
fn timings(stamps: &[Timestamp; PHASE_COUNT]) -> (f64, f64, f64, f64) {
    let sent = stamps[Phase::Sent as usize];
    let arrived = stamps[Phase::Arrived as usize];
    let dispatched = stamps[Phase::Dispatched as usize];
    let ended = stamps[Phase::Ended as usize];
    let completed = stamps[Phase::Completed as usize];
    (
        arrived.diff_micros(&sent),
        dispatched.diff_micros(&arrived),
        ended.diff_micros(&dispatched),
        completed.diff_micros(&ended),
    )
}

fn send_status_resp(
    endpoint: &Endpoint,
    id: u32,
    error: bool,
    stamps: &[Timestamp; PHASE_COUNT],
    command_line: &str,
) {
    let (c2s_fifo_us, waiting_us, executing_us, s2s_fifo_us) = timings(stamps);
    let message = Message::StatusResp {
        status: classify(stamps),
        id,
        error,
        c2s_fifo_us,
        waiting_us,
        executing_us,
        s2s_fifo_us,
        command_line: command_line.to_string(),
    };
    match message.encode() {
        Ok(payload) => {
            if let Err(e) = endpoint.send(&payload) {
                warn!("failed to send STATUS_RESP for task {}: {}", id, e);
            }
        }
        Err(e) => warn!("failed to encode STATUS_RESP for task {}: {}", id, e),
    }
}

/// Builds the procedure task the server enqueues into the status scheduler
/// in response to a STATUS request. `log` and `task_scheduler` are shared
/// with the live server state via `Rc<RefCell<_>>` so that, once forked,
/// the child's copy-on-write address space holds exactly the state the
/// parent had at fork time — a consistent snapshot for free, with no manual
/// snapshotting.
pub fn make_status_procedure(
    client_pid: libc::pid_t,
    log: Rc<RefCell<LogFile>>,
    task_scheduler: Rc<RefCell<Scheduler>>,
) -> Procedure {
    Box::new(move |slot| run_status_child(client_pid, &log, &task_scheduler, slot))
}

/// Runs in the forked status child: opens a send-only connection to the
/// requesting client, replays the log and the task scheduler's
/// running/queued snapshots as STATUS_RESP frames, closes the connection,
/// then reports its own completion to the server.
fn run_status_child(
    client_pid: libc::pid_t,
    log: &Rc<RefCell<LogFile>>,
    task_scheduler: &Rc<RefCell<Scheduler>>,
    slot: usize,
) -> i32 {
    let mut endpoint = Endpoint::for_sending();
    if let Err(e) = endpoint.open_sending_to_client(client_pid) {
        warn!("status child could not connect to client {}: {}", client_pid, e);
        runner::report_done(slot, true, true);
        return 1;
    }

    let mut had_error = false;

    if let Err(e) = log.borrow_mut().read_tasks(|record| {
        send_status_resp(&endpoint, record.id, record.error, &record.stamps(), &record.command_line);
        ControlFlow::Continue(())
    }) {
        warn!("status child failed to replay log for client {}: {}", client_pid, e);
        had_error = true;
    }

    task_scheduler.borrow().enumerate_running(|task| {
        send_status_resp(&endpoint, task.id, false, &task.stamps(), &task.command_line);
        ControlFlow::Continue(())
    });
    task_scheduler.borrow().enumerate_queued(|task| {
        send_status_resp(&endpoint, task.id, false, &task.stamps(), &task.command_line);
        ControlFlow::Continue(())
    });

    endpoint.close_sending();
    runner::report_done(slot, true, had_error);
    if had_error {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamps_with(set: &[Phase]) -> [Timestamp; PHASE_COUNT] {
        let mut out = [Timestamp::ZERO; PHASE_COUNT];
        for &p in set {
            out[p as usize] = Timestamp::now();
        }
        out
    }

    #[test]
    fn classify_queued_when_only_sent_and_arrived() {
        let stamps = stamps_with(&[Phase::Sent, Phase::Arrived]);
        assert_eq!(classify(&stamps), TaskStatus::Queued);
    }

    #[test]
    fn classify_executing_when_dispatched_but_not_completed() {
        let stamps = stamps_with(&[Phase::Sent, Phase::Arrived, Phase::Dispatched]);
        assert_eq!(classify(&stamps), TaskStatus::Executing);
    }

    #[test]
    fn classify_done_when_completed() {
        let stamps = stamps_with(&[
            Phase::Sent,
            Phase::Arrived,
            Phase::Dispatched,
            Phase::Ended,
            Phase::Completed,
        ]);
        assert_eq!(classify(&stamps), TaskStatus::Done);
    }

    #[test]
    fn timings_are_nan_for_absent_pairs() {
        let stamps = stamps_with(&[Phase::Sent, Phase::Arrived]);
        let (c2s, waiting, executing, s2s) = timings(&stamps);
        assert!(c2s.is_finite());
        assert!(waiting.is_nan());
        assert!(executing.is_nan());
        assert!(s2s.is_nan());
    }
}
