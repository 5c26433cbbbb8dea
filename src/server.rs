//! Server request loop: owns the bus endpoint, both schedulers, the id
//! counter, and the log file, and dispatches incoming messages to them.

use crate::bus::endpoint::Endpoint;
use crate::bus::listen::listen;
use crate::config::{self, Policy, STATUS_SLOTS};
use crate::error::{Error, ErrorKind};
use crate::logfile::LogFile;
use crate::parser;
use crate::protocol::message::Message;
use crate::scheduler::Scheduler;
use crate::status;
use crate::task::{Phase, TaggedTask, TaskKind, Timestamp};
use log::{error, info, warn};
use std::cell::RefCell;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::rc::Rc;

/// Owns everything the request loop needs before the loop starts. The task
/// scheduler and log are shared (`Rc<RefCell<_>>`) with the status
/// subsystem's procedure closures, which read them again after `fork()`;
/// `run` destructures this into independently borrowed pieces so the listen
/// loop's two callbacks never need to borrow all of `Server` mutably at
/// once.
pub struct Server {
    endpoint: Endpoint,
    tasks: Rc<RefCell<Scheduler>>,
    statuses: Rc<RefCell<Scheduler>>,
    log: Rc<RefCell<LogFile>>,
    next_id: u32,
}

impl Server {
    /// Binds the server's well-known FIFO and opens the log file for this
    /// run. Fails with `AlreadyExists` if the FIFO is already there (see
    /// `Endpoint::new_server`), which the CLI surfaces as a startup failure.
    pub fn new(policy: Policy, n: usize, output_dir: impl Into<PathBuf>) -> Result<Server, Error> {
        let output_dir = output_dir.into();
        let endpoint = Endpoint::new_server()?;
        let tasks = Scheduler::new(policy, n, output_dir.clone())?;
        let statuses = Scheduler::new(policy, STATUS_SLOTS, output_dir.clone())?;
        let log_path = output_dir.join(config::log_file_name());
        let log = LogFile::create_for_writing(&log_path)?;
        Ok(Server {
            endpoint,
            tasks: Rc::new(RefCell::new(tasks)),
            statuses: Rc::new(RefCell::new(statuses)),
            log: Rc::new(RefCell::new(log)),
            next_id: 1,
        })
    }

    /// Runs the request loop. This never returns under normal operation:
    /// the protocol has no shutdown message, so every `on_message`/
    /// `on_before_block` outcome here is `ControlFlow::Continue`.
    pub fn run(self) -> i32 {
        let Server {
            endpoint,
            tasks,
            statuses,
            log,
            next_id,
        } = self;
        let next_id = RefCell::new(next_id);

        listen(
            &endpoint,
            |payload| {
                handle_message(&tasks, &statuses, &log, &next_id, payload);
                ControlFlow::Continue(())
            },
            || {
                tasks.borrow_mut().dispatch_possible();
                statuses.borrow_mut().dispatch_possible();
                ControlFlow::Continue(())
            },
        )
    }
}

fn handle_message(
    tasks: &Rc<RefCell<Scheduler>>,
    statuses: &Rc<RefCell<Scheduler>>,
    log: &Rc<RefCell<LogFile>>,
    next_id: &RefCell<u32>,
    payload: &[u8],
) {
    let message = match Message::decode(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("dropping undecodable message: {}", e);
            return;
        }
    };
    match message {
        Message::SendProgram {
            client_pid,
            sent_ts,
            expected_ms,
            command_line,
        } => handle_submit(tasks, next_id, client_pid, sent_ts, expected_ms, command_line, true),
        Message::SendTask {
            client_pid,
            sent_ts,
            expected_ms,
            command_line,
        } => handle_submit(tasks, next_id, client_pid, sent_ts, expected_ms, command_line, false),
        Message::TaskDone {
            slot,
            ended_ts,
            is_status,
            error,
        } => handle_task_done(tasks, statuses, log, slot as usize, ended_ts, is_status, error),
        Message::Status { client_pid } => handle_status(statuses, tasks, log, client_pid),
        // Replies are never sent to the server; receiving one here means a
        // buggy or malicious peer wrote a server-to-client message to the
        // server FIFO.
        Message::Error { .. } | Message::TaskId { .. } | Message::StatusResp { .. } => {
            warn!("dropping reply-only message type received on the server FIFO");
        }
    }
}

/// Handles SEND_PROGRAM / SEND_TASK. `single_program_only` distinguishes
/// SEND_PROGRAM (must parse to exactly one program) from SEND_TASK
/// (pipelines permitted).
fn handle_submit(
    tasks: &Rc<RefCell<Scheduler>>,
    next_id: &RefCell<u32>,
    client_pid: i32,
    sent_ts: Timestamp,
    expected_ms: u32,
    command_line: String,
    single_program_only: bool,
) {
    let parsed = parser::parse_pipeline(&command_line).and_then(|programs| {
        if single_program_only && programs.len() != 1 {
            Err(Error::new(
                ErrorKind::InvalidArgument,
                "SEND_PROGRAM command line must not contain a pipe",
            ))
        } else {
            TaskKind::pipeline(programs)
        }
    });

    let kind = match parsed {
        Ok(kind) => kind,
        Err(e) => {
            info!("rejecting submission from client {}: {}", client_pid, e);
            reply(client_pid, &Message::Error { text: "Parsing failure".to_string() });
            return;
        }
    };

    let id = *next_id.borrow();
    let mut task = TaggedTask::new(id, expected_ms, command_line, kind);
    task.set_stamp(Phase::Sent, sent_ts);
    task.set_stamp(Phase::Arrived, Timestamp::now());
    tasks.borrow_mut().add(task);
    *next_id.borrow_mut() += 1;

    reply(client_pid, &Message::TaskId { id });
}

/// Handles TASK_DONE: routed by `is_status` to the matching scheduler's
/// `mark_done`; non-status completions are logged with the error flag
/// `mark_done` derived from the reaped child's own exit status, not the
/// flag carried on the wire (see DESIGN.md).
fn handle_task_done(
    tasks: &Rc<RefCell<Scheduler>>,
    statuses: &Rc<RefCell<Scheduler>>,
    log: &Rc<RefCell<LogFile>>,
    slot: usize,
    ended_ts: Timestamp,
    is_status: bool,
    error: bool,
) {
    let scheduler = if is_status { statuses } else { tasks };
    match scheduler.borrow_mut().mark_done(slot, ended_ts) {
        Ok((task, reaped_error)) => {
            if is_status {
                if error || reaped_error {
                    warn!("status query (slot {}) finished with an error", slot);
                }
            } else if let Err(e) = log.borrow_mut().append(&task, reaped_error) {
                error!("failed to log completed task {}: {}", task.id, e);
            }
        }
        Err(e) => {
            warn!("failed to reap slot {} (is_status={}): {}", slot, is_status, e);
        }
    }
}

/// Handles STATUS: enqueues a procedure task into the status scheduler, or
/// replies with an error if it has no capacity.
fn handle_status(
    statuses: &Rc<RefCell<Scheduler>>,
    tasks: &Rc<RefCell<Scheduler>>,
    log: &Rc<RefCell<LogFile>>,
    client_pid: i32,
) {
    if !statuses.borrow().can_schedule_now() {
        reply(client_pid, &Message::Error { text: "No capacity available".to_string() });
        return;
    }
    let procedure = status::make_status_procedure(client_pid, Rc::clone(log), Rc::clone(tasks));
    let task = TaggedTask::new(0, 0, "<status>".to_string(), TaskKind::Internal(procedure));
    statuses.borrow_mut().add(task);
}

fn reply(client_pid: i32, message: &Message) {
    let payload = match message.encode() {
        Ok(p) => p,
        Err(e) => {
            error!("failed to encode reply to client {}: {}", client_pid, e);
            return;
        }
    };
    let mut endpoint = Endpoint::for_sending();
    if let Err(e) = endpoint.open_sending_to_client(client_pid) {
        warn!("failed to connect to client {} to deliver reply: {}", client_pid, e);
        return;
    }
    if let Err(e) = endpoint.send(&payload) {
        warn!("failed to deliver reply to client {}: {}", client_pid, e);
    }
}
