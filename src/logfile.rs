//! Append-only log of completed tasks, with bounded replay.

use crate::error::{Error, ErrorKind};
use crate::task::{Phase, TaggedTask, Timestamp, PHASE_COUNT};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::Path;

/// Maximum command-line text a log record can hold without truncation.
/// Comfortably larger than any command line the wire protocol can carry
/// (the frame cap is `PIPE_BUF - 8`, a few KiB at most).
pub const COMMAND_LINE_CAP: usize = 4096;

const FIXED_LEN: usize = 4 /* id */
    + 4 /* command_len */
    + 4 /* expected_ms */
    + 1 /* error flag */
    + Timestamp::WIRE_LEN * PHASE_COUNT;

pub const RECORD_LEN: usize = FIXED_LEN + COMMAND_LINE_CAP;

/// One completed-task record as read back from the log.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: u32,
    pub expected_ms: u32,
    pub error: bool,
    pub command_line: String,
    stamps: [Timestamp; PHASE_COUNT],
}

impl LogRecord {
    pub fn stamp(&self, phase: Phase) -> Timestamp {
        self.stamps[phase as usize]
    }

    pub fn stamps(&self) -> [Timestamp; PHASE_COUNT] {
        self.stamps
    }
}

fn encode_record(task: &TaggedTask, error: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_LEN);
    buf.extend_from_slice(&task.id.to_ne_bytes());
    let cmd_bytes = task.command_line.as_bytes();
    let cmd_len = cmd_bytes.len().min(COMMAND_LINE_CAP);
    buf.extend_from_slice(&(cmd_len as u32).to_ne_bytes());
    buf.extend_from_slice(&task.expected_ms.to_ne_bytes());
    buf.push(if error { 1 } else { 0 });
    for phase in [
        Phase::Sent,
        Phase::Arrived,
        Phase::Dispatched,
        Phase::Ended,
        Phase::Completed,
    ] {
        buf.extend_from_slice(&task.stamp(phase).to_bytes());
    }
    let mut cmd_buf = vec![0u8; COMMAND_LINE_CAP];
    cmd_buf[..cmd_len].copy_from_slice(&cmd_bytes[..cmd_len]);
    buf.extend_from_slice(&cmd_buf);
    debug_assert_eq!(buf.len(), RECORD_LEN);
    buf
}

fn decode_record(bytes: &[u8]) -> Result<LogRecord, Error> {
    if bytes.len() != RECORD_LEN {
        return Err(Error::new(
            ErrorKind::IllegalByteSequence,
            format!("log record has {} bytes, expected {}", bytes.len(), RECORD_LEN),
        ));
    }
    let id = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
    let cmd_len = u32::from_ne_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if cmd_len > COMMAND_LINE_CAP {
        return Err(Error::new(
            ErrorKind::IllegalByteSequence,
            format!("log record command length {} exceeds cap {}", cmd_len, COMMAND_LINE_CAP),
        ));
    }
    let expected_ms = u32::from_ne_bytes(bytes[8..12].try_into().unwrap());
    let error = bytes[12] != 0;
    let mut off = 13;
    let mut stamps = [Timestamp::ZERO; PHASE_COUNT];
    for s in stamps.iter_mut() {
        *s = Timestamp::from_bytes(&bytes[off..off + Timestamp::WIRE_LEN]);
        off += Timestamp::WIRE_LEN;
    }
    debug_assert_eq!(off, FIXED_LEN);
    let command_line = String::from_utf8_lossy(&bytes[off..off + cmd_len]).into_owned();
    Ok(LogRecord {
        id,
        expected_ms,
        error,
        command_line,
        stamps,
    })
}

/// The on-disk task log. A forked child inherits the parent's
/// `written_count` for free (it's plain process memory, duplicated by
/// `fork()`): a status child never observes records the parent writes
/// after the fork.
pub struct LogFile {
    file: File,
    written_count: usize,
}

impl LogFile {
    /// Opens (creating if absent) and truncates the log for a fresh server
    /// run. The file offset is held at end-of-file between writes, so we
    /// seek there once and append from there on.
    pub fn create_for_writing(path: &Path) -> Result<LogFile, Error> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(LogFile { file, written_count: 0 })
    }

    /// Opens the log read-only, e.g. for a status query against a server
    /// that isn't the one running this process. A freshly opened reader
    /// caps replay at 0 records until it observes otherwise; in this
    /// codebase that only happens via inheriting a writer's handle across
    /// `fork()`, so a bare read-only open is mostly useful for tests and
    /// offline inspection.
    pub fn open_read_only(path: &Path) -> Result<LogFile, Error> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(LogFile { file, written_count: 0 })
    }

    pub fn written_count(&self) -> usize {
        self.written_count
    }

    /// Appends one record in a single `write` call, atomically.
    pub fn append(&mut self, task: &TaggedTask, error: bool) -> Result<(), Error> {
        self.file.seek(SeekFrom::End(0))?;
        let record = encode_record(task, error);
        self.file.write_all(&record)?;
        self.written_count += 1;
        Ok(())
    }

    /// Replays up to `written_count` records from the start of the file,
    /// in batches of 4, invoking `on_record` for each. Stops early if
    /// `on_record` returns `ControlFlow::Break`. Always leaves the file
    /// offset at EOF on return, matching the file's append-only contract.
    pub fn read_tasks<F>(&mut self, mut on_record: F) -> Result<(), Error>
    where
        F: FnMut(LogRecord) -> ControlFlow<()>,
    {
        let result = self.read_tasks_inner(&mut on_record);
        let _ = self.file.seek(SeekFrom::End(0));
        result
    }

    fn read_tasks_inner<F>(&mut self, on_record: &mut F) -> Result<(), Error>
    where
        F: FnMut(LogRecord) -> ControlFlow<()>,
    {
        self.file.seek(SeekFrom::Start(0))?;
        const BATCH: usize = 4;
        let mut batch_buf = vec![0u8; RECORD_LEN * BATCH];
        let mut consumed = 0usize;
        while consumed < self.written_count {
            let remaining = self.written_count - consumed;
            let this_batch = remaining.min(BATCH);
            let want = this_batch * RECORD_LEN;
            self.file.read_exact(&mut batch_buf[..want])?;
            for i in 0..this_batch {
                let start = i * RECORD_LEN;
                let record = decode_record(&batch_buf[start..start + RECORD_LEN])?;
                consumed += 1;
                if let ControlFlow::Break(()) = on_record(record) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Phase, TaskKind, Timestamp};

    fn sample_task(id: u32) -> TaggedTask {
        let program = crate::task::Program::new(vec!["echo".into()]).unwrap();
        let mut t = TaggedTask::new(
            id,
            100,
            format!("echo {}", id),
            TaskKind::pipeline(vec![program]).unwrap(),
        );
        t.set_stamp(Phase::Sent, Timestamp::now());
        t.set_stamp(Phase::Arrived, Timestamp::now());
        t.set_stamp(Phase::Dispatched, Timestamp::now());
        t.set_stamp(Phase::Ended, Timestamp::now());
        t.set_stamp(Phase::Completed, Timestamp::now());
        t
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut log = LogFile::create_for_writing(&path).unwrap();
        log.append(&sample_task(1), false).unwrap();
        log.append(&sample_task(2), true).unwrap();

        let mut seen = Vec::new();
        log.read_tasks(|r| {
            seen.push((r.id, r.error, r.command_line.clone()));
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(seen, vec![(1, false, "echo 1".to_string()), (2, true, "echo 2".to_string())]);
    }

    #[test]
    fn replay_is_bounded_by_written_count_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut log = LogFile::create_for_writing(&path).unwrap();
        log.append(&sample_task(1), false).unwrap();

        // Simulate a forked child's inherited snapshot: same count, even
        // though the file on disk later gains a second record.
        let snapshot_count = log.written_count();
        log.append(&sample_task(2), false).unwrap();

        let mut reader = LogFile::open_read_only(&path).unwrap();
        reader.written_count = snapshot_count;
        let mut seen = Vec::new();
        reader
            .read_tasks(|r| {
                seen.push(r.id);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn fresh_reader_replays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");
        LogFile::create_for_writing(&path).unwrap();
        let mut reader = LogFile::open_read_only(&path).unwrap();
        let mut count = 0;
        reader
            .read_tasks(|_| {
                count += 1;
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
