//! Client-side request helpers: used by the `taskord` binary and by
//! integration tests, which are themselves just another consumer of this
//! module rather than a separate protocol implementation.

use crate::bus::endpoint::Endpoint;
use crate::config;
use crate::error::{Error, ErrorKind};
use crate::protocol::frame::{self, ParseOutcome};
use crate::protocol::message::{Message, TaskStatus};
use crate::task::Timestamp;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, getpid, read};
use std::ops::ControlFlow;

/// One STATUS_RESP, already unpacked for display.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    pub status: TaskStatus,
    pub id: u32,
    pub error: bool,
    pub c2s_fifo_us: f64,
    pub waiting_us: f64,
    pub executing_us: f64,
    pub s2s_fifo_us: f64,
    pub command_line: String,
}

/// Outcome of a submit request: either the server's assigned id, or the
/// text of an ERROR reply (e.g. a parse failure). A server-level rejection
/// like this is not a transport failure, so it is not an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Id(u32),
    Rejected(String),
}

/// Outcome of a status request, mirroring `SubmitOutcome`: a server-level
/// rejection (status scheduler at capacity) is a successful round trip that
/// carries bad news, not a transport `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    Lines(Vec<StatusLine>),
    Rejected(String),
}

/// Submits one command line. `allow_pipeline` selects SEND_TASK (`-p`,
/// pipes permitted) vs SEND_PROGRAM (`-u`, exactly one program required).
pub fn submit(expected_ms: u32, command_line: &str, allow_pipeline: bool) -> Result<SubmitOutcome, Error> {
    let pid = getpid().as_raw();
    let mut endpoint = Endpoint::new_client(pid)?;
    let message = if allow_pipeline {
        Message::SendTask {
            client_pid: pid,
            sent_ts: Timestamp::now(),
            expected_ms,
            command_line: command_line.to_string(),
        }
    } else {
        Message::SendProgram {
            client_pid: pid,
            sent_ts: Timestamp::now(),
            expected_ms,
            command_line: command_line.to_string(),
        }
    };
    endpoint.send(&message.encode()?)?;

    let mut outcome = None;
    recv_frames(pid, |reply| {
        match reply {
            Message::TaskId { id } => outcome = Some(SubmitOutcome::Id(id)),
            Message::Error { text } => outcome = Some(SubmitOutcome::Rejected(text)),
            other => {
                outcome = Some(SubmitOutcome::Rejected(format!("unexpected reply from server: {:?}", other)));
            }
        }
        ControlFlow::Break(())
    })?;

    outcome.ok_or_else(|| Error::new(ErrorKind::NotFound, "server closed the connection without a reply"))
}

/// Requests a status listing; collects one `StatusLine` per STATUS_RESP
/// until the status child closes the connection. An ERROR reply (status
/// scheduler at capacity) comes back as `StatusOutcome::Rejected`, not an
/// `Err` — only a transport-level failure (server not running, malformed
/// frame) is an `Err` here.
pub fn status() -> Result<StatusOutcome, Error> {
    let pid = getpid().as_raw();
    let mut endpoint = Endpoint::new_client(pid)?;
    endpoint.send(&Message::Status { client_pid: pid }.encode()?)?;

    let mut lines = Vec::new();
    let mut rejection = None;
    recv_frames(pid, |reply| match reply {
        Message::StatusResp {
            status,
            id,
            error,
            c2s_fifo_us,
            waiting_us,
            executing_us,
            s2s_fifo_us,
            command_line,
        } => {
            lines.push(StatusLine {
                status,
                id,
                error,
                c2s_fifo_us,
                waiting_us,
                executing_us,
                s2s_fifo_us,
                command_line,
            });
            ControlFlow::Continue(())
        }
        Message::Error { text } => {
            rejection = Some(text);
            ControlFlow::Break(())
        }
        _ => ControlFlow::Continue(()),
    })?;

    match rejection {
        Some(text) => Ok(StatusOutcome::Rejected(text)),
        None => Ok(StatusOutcome::Lines(lines)),
    }
}

/// Formats a STATUS_RESP timing value the way the client prints it: a
/// missing timestamp pair decodes to NaN on the wire and is rendered as
/// `|-?-|` rather than the literal string "NaN".
pub fn format_timing_us(v: f64) -> String {
    if v.is_nan() {
        "|-?-|".to_string()
    } else {
        format!("{:.0}", v)
    }
}

/// Opens this client's own FIFO for reading and decodes frames from it
/// until `on_message` breaks or the writer(s) close (clean EOF).
fn recv_frames<F>(client_pid: i32, mut on_message: F) -> Result<(), Error>
where
    F: FnMut(Message) -> ControlFlow<()>,
{
    let path = config::client_fifo_path(client_pid);
    let fd = open(&path, OFlag::O_RDONLY, Mode::empty())?;
    let mut buf = vec![0u8; 4 * frame::pipe_buf()];
    let mut residual: Vec<u8> = Vec::new();

    let result = 'outer: loop {
        match read(fd, &mut buf) {
            Ok(0) => break 'outer Ok(()),
            Ok(n) => {
                residual.extend_from_slice(&buf[..n]);
                loop {
                    match frame::parse_header(&residual) {
                        ParseOutcome::Frame {
                            payload_start,
                            payload_len,
                            consumed,
                        } => {
                            let payload = residual[payload_start..payload_start + payload_len].to_vec();
                            residual.drain(0..consumed);
                            match Message::decode(&payload) {
                                Ok(message) => {
                                    if let ControlFlow::Break(()) = on_message(message) {
                                        break 'outer Ok(());
                                    }
                                }
                                Err(e) => break 'outer Err(e),
                            }
                        }
                        ParseOutcome::NeedMore => break,
                        ParseOutcome::Invalid => {
                            break 'outer Err(Error::new(ErrorKind::IllegalByteSequence, "invalid frame from server"));
                        }
                    }
                }
            }
            Err(nix::Error::EINTR) => continue,
            Err(e) => break 'outer Err(e.into()),
        }
    };

    let _ = close(fd);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_timing_renders_nan_as_placeholder() {
        assert_eq!(format_timing_us(f64::NAN), "|-?-|");
    }

    #[test]
    fn format_timing_renders_finite_values() {
        assert_eq!(format_timing_us(1234.0), "1234");
    }
}
