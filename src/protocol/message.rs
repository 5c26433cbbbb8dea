//! Message codec: discriminated message types.
//!
//! The wire payload packs fields with platform-native layout (this is
//! local-host IPC only, so endianness never needs to cross a wire) rather
//! than going through `serde`; every message is small and fixed-shape apart
//! from one trailing variable-length string, so hand-rolled (de)serialization
//! is both simpler and avoids pulling in a framework for a handful of
//! packed structs.

use crate::error::{Error, ErrorKind};
use crate::protocol::frame::max_payload_len;
use crate::task::Timestamp;
use bitflags::bitflags;

bitflags! {
    /// Bit flags carried by a `TASK_DONE` frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskDoneFlags: u8 {
        const IS_STATUS = 0b01;
        const ERROR     = 0b10;
    }
}

/// `status` field of a `STATUS_RESP` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Done = 0,
    Executing = 1,
    Queued = 2,
}

impl TaskStatus {
    fn from_u8(b: u8) -> Result<TaskStatus, Error> {
        match b {
            0 => Ok(TaskStatus::Done),
            1 => Ok(TaskStatus::Executing),
            2 => Ok(TaskStatus::Queued),
            _ => Err(Error::new(
                ErrorKind::IllegalByteSequence,
                format!("unknown task status discriminant {}", b),
            )),
        }
    }
}

/// Message-type discriminant, the leading byte of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    SendProgram = 1,
    SendTask = 2,
    TaskDone = 3,
    Status = 4,
    Error = 5,
    TaskId = 6,
    StatusResp = 7,
}

impl Tag {
    fn from_u8(b: u8) -> Result<Tag, Error> {
        Ok(match b {
            1 => Tag::SendProgram,
            2 => Tag::SendTask,
            3 => Tag::TaskDone,
            4 => Tag::Status,
            5 => Tag::Error,
            6 => Tag::TaskId,
            7 => Tag::StatusResp,
            other => {
                return Err(Error::new(
                    ErrorKind::IllegalByteSequence,
                    format!("unknown message tag {}", other),
                ))
            }
        })
    }
}

/// A decoded application message.
#[derive(Debug, Clone)]
pub enum Message {
    /// Client -> server. Forbids pipes: the decoded command line must parse
    /// to exactly one program.
    SendProgram {
        client_pid: i32,
        sent_ts: Timestamp,
        expected_ms: u32,
        command_line: String,
    },
    /// Client -> server. Permits pipelines.
    SendTask {
        client_pid: i32,
        sent_ts: Timestamp,
        expected_ms: u32,
        command_line: String,
    },
    /// Runner/status child -> server.
    TaskDone {
        slot: u32,
        ended_ts: Timestamp,
        is_status: bool,
        error: bool,
    },
    /// Client -> server.
    Status { client_pid: i32 },
    /// Server -> client: human-readable error text.
    Error { text: String },
    /// Server -> client: submission receipt.
    TaskId { id: u32 },
    /// Server -> client: one reported task.
    StatusResp {
        status: TaskStatus,
        id: u32,
        error: bool,
        c2s_fifo_us: f64,
        waiting_us: f64,
        executing_us: f64,
        s2s_fifo_us: f64,
        command_line: String,
    },
}

const PID_LEN: usize = 4;
const U32_LEN: usize = 4;
const F64_LEN: usize = 8;
const BOOL_LEN: usize = 1;

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
}

fn bool_byte(b: bool) -> u8 {
    if b {
        1
    } else {
        0
    }
}

impl Message {
    /// Serializes this message to a payload, checking that any variable
    /// trailing text fits under the wire cap.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        match self {
            Message::SendProgram {
                client_pid,
                sent_ts,
                expected_ms,
                command_line,
            }
            | Message::SendTask {
                client_pid,
                sent_ts,
                expected_ms,
                command_line,
            } => {
                let tag = if matches!(self, Message::SendProgram { .. }) {
                    Tag::SendProgram
                } else {
                    Tag::SendTask
                };
                buf.push(tag as u8);
                buf.extend_from_slice(&client_pid.to_ne_bytes());
                buf.extend_from_slice(&sent_ts.to_bytes());
                buf.extend_from_slice(&expected_ms.to_ne_bytes());
                push_str(&mut buf, command_line);
            }
            Message::TaskDone {
                slot,
                ended_ts,
                is_status,
                error,
            } => {
                buf.push(Tag::TaskDone as u8);
                buf.extend_from_slice(&slot.to_ne_bytes());
                buf.extend_from_slice(&ended_ts.to_bytes());
                let mut flags = TaskDoneFlags::empty();
                flags.set(TaskDoneFlags::IS_STATUS, *is_status);
                flags.set(TaskDoneFlags::ERROR, *error);
                buf.push(flags.bits());
            }
            Message::Status { client_pid } => {
                buf.push(Tag::Status as u8);
                buf.extend_from_slice(&client_pid.to_ne_bytes());
            }
            Message::Error { text } => {
                buf.push(Tag::Error as u8);
                push_str(&mut buf, text);
            }
            Message::TaskId { id } => {
                buf.push(Tag::TaskId as u8);
                buf.extend_from_slice(&id.to_ne_bytes());
            }
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
                buf.push(Tag::StatusResp as u8);
                buf.push(*status as u8);
                buf.extend_from_slice(&id.to_ne_bytes());
                buf.push(bool_byte(*error));
                buf.extend_from_slice(&c2s_fifo_us.to_ne_bytes());
                buf.extend_from_slice(&waiting_us.to_ne_bytes());
                buf.extend_from_slice(&executing_us.to_ne_bytes());
                buf.extend_from_slice(&s2s_fifo_us.to_ne_bytes());
                push_str(&mut buf, command_line);
            }
        }
        if buf.len() > max_payload_len() {
            return Err(Error::new(
                ErrorKind::MessageSize,
                format!(
                    "encoded message of {} bytes exceeds the {}-byte frame cap",
                    buf.len(),
                    max_payload_len()
                ),
            ));
        }
        Ok(buf)
    }

    /// Decodes a payload previously produced by `encode`. The variable tail
    /// length for messages with a trailing string is recovered from the
    /// payload's own length, since it isn't encoded separately.
    pub fn decode(payload: &[u8]) -> Result<Message, Error> {
        if payload.is_empty() {
            return Err(Error::new(ErrorKind::MessageSize, "empty payload"));
        }
        let tag = Tag::from_u8(payload[0])?;
        let body = &payload[1..];
        match tag {
            Tag::SendProgram | Tag::SendTask => {
                let fixed = PID_LEN + Timestamp::WIRE_LEN + U32_LEN;
                require_len(body, fixed, "SEND_PROGRAM/SEND_TASK")?;
                let client_pid = i32::from_ne_bytes(body[0..4].try_into().unwrap());
                let sent_ts = Timestamp::from_bytes(&body[4..4 + Timestamp::WIRE_LEN]);
                let off = 4 + Timestamp::WIRE_LEN;
                let expected_ms = u32::from_ne_bytes(body[off..off + 4].try_into().unwrap());
                let command_line = read_tail_str(body, off + 4)?;
                Ok(if tag == Tag::SendProgram {
                    Message::SendProgram {
                        client_pid,
                        sent_ts,
                        expected_ms,
                        command_line,
                    }
                } else {
                    Message::SendTask {
                        client_pid,
                        sent_ts,
                        expected_ms,
                        command_line,
                    }
                })
            }
            Tag::TaskDone => {
                let fixed = U32_LEN + Timestamp::WIRE_LEN + 1;
                require_len(body, fixed, "TASK_DONE")?;
                let slot = u32::from_ne_bytes(body[0..4].try_into().unwrap());
                let ended_ts = Timestamp::from_bytes(&body[4..4 + Timestamp::WIRE_LEN]);
                let off = 4 + Timestamp::WIRE_LEN;
                let flags = TaskDoneFlags::from_bits_truncate(body[off]);
                Ok(Message::TaskDone {
                    slot,
                    ended_ts,
                    is_status: flags.contains(TaskDoneFlags::IS_STATUS),
                    error: flags.contains(TaskDoneFlags::ERROR),
                })
            }
            Tag::Status => {
                require_len(body, PID_LEN, "STATUS")?;
                let client_pid = i32::from_ne_bytes(body[0..4].try_into().unwrap());
                Ok(Message::Status { client_pid })
            }
            Tag::Error => {
                let text = read_tail_str(body, 0)?;
                Ok(Message::Error { text })
            }
            Tag::TaskId => {
                require_len(body, U32_LEN, "TASK_ID")?;
                let id = u32::from_ne_bytes(body[0..4].try_into().unwrap());
                Ok(Message::TaskId { id })
            }
            Tag::StatusResp => {
                let fixed = 1 + U32_LEN + BOOL_LEN + 4 * F64_LEN;
                require_len(body, fixed, "STATUS_RESP")?;
                let status = TaskStatus::from_u8(body[0])?;
                let id = u32::from_ne_bytes(body[1..5].try_into().unwrap());
                let error = body[5] != 0;
                let mut off = 6;
                let mut next_f64 = || {
                    let v = f64::from_ne_bytes(body[off..off + 8].try_into().unwrap());
                    off += 8;
                    v
                };
                let c2s_fifo_us = next_f64();
                let waiting_us = next_f64();
                let executing_us = next_f64();
                let s2s_fifo_us = next_f64();
                let command_line = read_tail_str(body, off)?;
                Ok(Message::StatusResp {
                    status,
                    id,
                    error,
                    c2s_fifo_us,
                    waiting_us,
                    executing_us,
                    s2s_fifo_us,
                    command_line,
                })
            }
        }
    }
}

fn require_len(body: &[u8], min: usize, what: &str) -> Result<(), Error> {
    if body.len() < min {
        return Err(Error::new(
            ErrorKind::MessageSize,
            format!("{} payload too short: {} < {}", what, body.len(), min),
        ));
    }
    Ok(())
}

fn read_tail_str(body: &[u8], off: usize) -> Result<String, Error> {
    if off > body.len() {
        return Err(Error::new(ErrorKind::MessageSize, "truncated payload"));
    }
    String::from_utf8(body[off..].to_vec())
        .map_err(|e| Error::with_source(ErrorKind::IllegalByteSequence, "non-utf8 command line", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips() {
        let m = Message::TaskId { id: 42 };
        let bytes = m.encode().unwrap();
        match Message::decode(&bytes).unwrap() {
            Message::TaskId { id } => assert_eq!(id, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn send_task_round_trips_with_command_line() {
        let m = Message::SendTask {
            client_pid: 1234,
            sent_ts: Timestamp::now(),
            expected_ms: 500,
            command_line: "echo hi | wc -c".to_string(),
        };
        let bytes = m.encode().unwrap();
        match Message::decode(&bytes).unwrap() {
            Message::SendTask { command_line, expected_ms, .. } => {
                assert_eq!(command_line, "echo hi | wc -c");
                assert_eq!(expected_ms, 500);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn task_done_flags_round_trip() {
        let m = Message::TaskDone {
            slot: 3,
            ended_ts: Timestamp::now(),
            is_status: true,
            error: false,
        };
        let bytes = m.encode().unwrap();
        match Message::decode(&bytes).unwrap() {
            Message::TaskDone { is_status, error, slot, .. } => {
                assert!(is_status);
                assert!(!error);
                assert_eq!(slot, 3);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = vec![200u8];
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn status_resp_nan_timings_round_trip() {
        let m = Message::StatusResp {
            status: TaskStatus::Queued,
            id: 7,
            error: false,
            c2s_fifo_us: f64::NAN,
            waiting_us: 1.5,
            executing_us: f64::NAN,
            s2s_fifo_us: f64::NAN,
            command_line: "sleep 1".to_string(),
        };
        let bytes = m.encode().unwrap();
        match Message::decode(&bytes).unwrap() {
            Message::StatusResp { waiting_us, c2s_fifo_us, .. } => {
                assert_eq!(waiting_us, 1.5);
                assert!(c2s_fifo_us.is_nan());
            }
            _ => panic!("wrong variant"),
        }
    }
}
