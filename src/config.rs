//! Well-known paths and scheduling policy.

use crate::error::{Error, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;

/// Root directory holding the server FIFO and per-client FIFOs. Overridable
/// via `TASKORD_RUNTIME_DIR` so integration tests never collide with a real
/// daemon, or with each other, on the same host.
pub fn runtime_dir() -> PathBuf {
    std::env::var_os("TASKORD_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/taskord"))
}

/// Path of the server's well-known FIFO.
pub fn server_fifo_path() -> PathBuf {
    runtime_dir().join("server.fifo")
}

/// Path of a client's FIFO, parameterized by its pid.
pub fn client_fifo_path(pid: libc::pid_t) -> PathBuf {
    runtime_dir().join(format!("client-{}.fifo", pid))
}

/// Name of the binary log file under the output directory.
pub fn log_file_name() -> &'static str {
    "log.bin"
}

pub fn stdout_path(output_dir: &std::path::Path, id: u32) -> PathBuf {
    output_dir.join(format!("{}.out", id))
}

pub fn stderr_path(output_dir: &std::path::Path, id: u32) -> PathBuf {
    output_dir.join(format!("{}.err", id))
}

/// Scheduling policy for the task scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Order by ARRIVED timestamp ascending.
    Fcfs,
    /// Order by expected_ms ascending.
    Sjf,
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fcfs" => Ok(Policy::Fcfs),
            "sjf" => Ok(Policy::Sjf),
            other => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("unknown policy '{}', expected 'fcfs' or 'sjf'", other),
            )),
        }
    }
}

/// Number of slots reserved for the status scheduler.
pub const STATUS_SLOTS: usize = 32;
