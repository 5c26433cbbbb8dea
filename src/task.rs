//! Data model: `Program`, `Task`, `TaggedTask`, lifecycle timestamps.

use crate::error::{Error, ErrorKind};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A monotonic-ish wall clock stamp, stored as seconds + nanoseconds since
/// the epoch. A zeroed stamp means "absent".
///
/// Ordering needs to hold both within one process and across the
/// client/server boundary (the `SENT` stamp is self-reported by a separate
/// process). `SystemTime` serves both: it is monotonically non-decreasing in
/// practice for the lifetime of a single task (seconds to minutes) and is
/// what lets a client's `sent_ts` and the server's `arrived_ts` be compared
/// at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };

    pub fn is_set(&self) -> bool {
        *self != Timestamp::ZERO
    }

    pub fn now() -> Timestamp {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }

    /// Microsecond difference `self - earlier`, or `NaN` if either stamp is
    /// absent.
    pub fn diff_micros(&self, earlier: &Timestamp) -> f64 {
        if !self.is_set() || !earlier.is_set() {
            return f64::NAN;
        }
        let a = self.secs as i64 * 1_000_000 + self.nanos as i64 / 1_000;
        let b = earlier.secs as i64 * 1_000_000 + earlier.nanos as i64 / 1_000;
        (a - b) as f64
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..8].copy_from_slice(&self.secs.to_ne_bytes());
        out[8..12].copy_from_slice(&self.nanos.to_ne_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Timestamp {
        let secs = u64::from_ne_bytes(b[0..8].try_into().unwrap());
        let nanos = u32::from_ne_bytes(b[8..12].try_into().unwrap());
        Timestamp { secs, nanos }
    }

    pub const WIRE_LEN: usize = 12;
}

/// Lifecycle phases, in the order they are required to be monotonically
/// non-decreasing when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sent = 0,
    Arrived = 1,
    Dispatched = 2,
    Ended = 3,
    Completed = 4,
}

pub const PHASE_COUNT: usize = 5;

/// A non-empty ordered sequence of argument strings; the first is the
/// executable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    argv: Vec<String>,
}

impl Program {
    pub fn new(argv: Vec<String>) -> Result<Program, Error> {
        if argv.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "a program must have at least one argument (its own name)",
            ));
        }
        Ok(Program { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn executable(&self) -> &str {
        &self.argv[0]
    }
}

/// Opaque hook used only by the status subsystem. The scheduler treats this
/// exactly like a pipeline task; only the runner cares which variant it has.
/// Not `Send`: the only way it ever crosses a process boundary is `fork()`,
/// which duplicates the whole address space rather than handing the
/// closure to another thread, so the usual `Send` requirement for
/// crossing execution contexts doesn't apply here.
pub type Procedure = Box<dyn FnMut(usize) -> i32>;

/// A tagged union: either a pipeline of programs, or an internal procedure.
pub enum TaskKind {
    Pipeline(Vec<Program>),
    Internal(Procedure),
}

impl TaskKind {
    pub fn pipeline(programs: Vec<Program>) -> Result<TaskKind, Error> {
        if programs.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "a pipeline task must contain at least one program",
            ));
        }
        Ok(TaskKind::Pipeline(programs))
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self, TaskKind::Pipeline(_))
    }

    pub fn pipeline_len(&self) -> Option<usize> {
        match self {
            TaskKind::Pipeline(v) => Some(v.len()),
            TaskKind::Internal(_) => None,
        }
    }
}

impl std::fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Pipeline(v) => f.debug_tuple("Pipeline").field(v).finish(),
            TaskKind::Internal(_) => f.write_str("Internal(..)"),
        }
    }
}

/// A `Task` plus id, expected duration, command-line text, and lifecycle
/// timestamps.
pub struct TaggedTask {
    pub id: u32,
    pub expected_ms: u32,
    pub command_line: String,
    pub kind: TaskKind,
    stamps: [Timestamp; PHASE_COUNT],
}

impl TaggedTask {
    pub fn new(id: u32, expected_ms: u32, command_line: String, kind: TaskKind) -> TaggedTask {
        TaggedTask {
            id,
            expected_ms,
            command_line,
            kind,
            stamps: [Timestamp::ZERO; PHASE_COUNT],
        }
    }

    pub fn stamp(&self, phase: Phase) -> Timestamp {
        self.stamps[phase as usize]
    }

    pub fn stamps(&self) -> [Timestamp; PHASE_COUNT] {
        self.stamps
    }

    /// Records `at` for `phase`. Debug builds assert monotonicity against
    /// the previous stamp in the ordering; this is a programmer error, not a
    /// runtime condition, so it is not a recoverable `Result`. The
    /// `Sent` -> `Arrived` pair is exempt: `Sent` is self-reported by the
    /// client over the wire, so a client that reports a clock-skewed or
    /// future `sent_ts` must not be able to panic the server.
    pub fn set_stamp(&mut self, phase: Phase, at: Timestamp) {
        debug_assert!(
            phase as usize == 0 || phase == Phase::Arrived || {
                let prev = self.stamps[phase as usize - 1];
                !prev.is_set() || !at.is_set() || prev.secs < at.secs
                    || (prev.secs == at.secs && prev.nanos <= at.nanos)
            },
            "timestamps must be monotonically non-decreasing"
        );
        self.stamps[phase as usize] = at;
    }

    pub fn is_pipeline(&self) -> bool {
        self.kind.is_pipeline()
    }
}

impl Clone for TaggedTask {
    /// Clones the pipeline-form of a task. Cloning an `Internal` task is a
    /// programmer error (procedure tasks are never queued/cloned; they are
    /// consumed once by the status scheduler), hence the panic.
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            TaskKind::Pipeline(v) => TaskKind::Pipeline(v.clone()),
            TaskKind::Internal(_) => panic!("internal procedure tasks cannot be cloned"),
        };
        TaggedTask {
            id: self.id,
            expected_ms: self.expected_ms,
            command_line: self.command_line.clone(),
            kind,
            stamps: self.stamps,
        }
    }
}

impl std::fmt::Debug for TaggedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedTask")
            .field("id", &self.id)
            .field("expected_ms", &self.expected_ms)
            .field("command_line", &self.command_line)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_micros_nan_when_absent() {
        let a = Timestamp::now();
        let b = Timestamp::ZERO;
        assert!(a.diff_micros(&b).is_nan());
    }

    #[test]
    fn timestamp_round_trips_through_bytes() {
        let t = Timestamp { secs: 123, nanos: 456 };
        assert_eq!(Timestamp::from_bytes(&t.to_bytes()), t);
    }

    #[test]
    fn program_rejects_empty_argv() {
        assert!(Program::new(vec![]).is_err());
    }

    #[test]
    fn future_sent_stamp_does_not_panic_on_arrived() {
        let program = Program::new(vec!["echo".into()]).unwrap();
        let mut t = TaggedTask::new(1, 10, "echo".into(), TaskKind::pipeline(vec![program]).unwrap());
        let far_future = Timestamp { secs: Timestamp::now().secs + 3600, nanos: 0 };
        t.set_stamp(Phase::Sent, far_future);
        t.set_stamp(Phase::Arrived, Timestamp::now());
    }
}
