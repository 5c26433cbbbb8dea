//! FIFO-backed message bus endpoint.

use crate::config;
use crate::error::{Error, ErrorKind};
use crate::protocol::frame;
use log::{debug, warn};
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{close, mkfifo, write};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Which role this endpoint plays on the bus. Only affects which well-known
/// path it owns for receiving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
    /// A transient, send-only endpoint used by a forked runner or status
    /// child: it owns no FIFO of its own, it only ever writes to others'.
    Transient,
}

/// One side of the bus: optionally owns a FIFO it listens on, and (once
/// opened) a file descriptor it can write frames to, plus the path that
/// descriptor was opened against so a dropped connection can be reopened.
pub struct Endpoint {
    role: Role,
    own_fifo: PathBuf,
    peer_path: Option<PathBuf>,
    send_fd: Option<RawFd>,
}

/// Creates a FIFO a peer may already have left behind; reusing a stale one
/// is fine for a client's own inbox, since it's keyed by pid and nothing
/// else can be listening on it.
fn create_fifo_reusing_stale(path: &Path, mode: u32) -> Result<(), Error> {
    match mkfifo(path, Mode::from_bits_truncate(mode)) {
        Ok(()) => Ok(()),
        Err(nix::Error::EEXIST) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Endpoint {
    /// Creates the server's endpoint. `EEXIST` on the well-known server FIFO
    /// means another server is already listening on it and is reported as
    /// `ErrorKind::AlreadyExists` rather than silently reused, matching
    /// `mkfifo`'s own "Another server running?" interpretation of `EEXIST`.
    pub fn new_server() -> Result<Endpoint, Error> {
        let dir = config::runtime_dir();
        std::fs::create_dir_all(&dir)?;
        let path = config::server_fifo_path();
        match mkfifo(&path, Mode::from_bits_truncate(0o620)) {
            Ok(()) => {}
            Err(nix::Error::EEXIST) => {
                return Err(Error::new(
                    ErrorKind::AlreadyExists,
                    format!("server FIFO {} already exists; another server running?", path.display()),
                ));
            }
            Err(e) => return Err(e.into()),
        }
        debug!("server endpoint listening on {}", path.display());
        Ok(Endpoint {
            role: Role::Server,
            own_fifo: path,
            peer_path: None,
            send_fd: None,
        })
    }

    /// Creates a client endpoint for the current process and immediately
    /// opens the server's FIFO for writing. That open blocks until the
    /// server is listening, which is the intended client/server rendezvous.
    pub fn new_client(pid: libc::pid_t) -> Result<Endpoint, Error> {
        let dir = config::runtime_dir();
        std::fs::create_dir_all(&dir)?;
        let own = config::client_fifo_path(pid);
        create_fifo_reusing_stale(&own, 0o622)?;
        let mut endpoint = Endpoint {
            role: Role::Client,
            own_fifo: own,
            peer_path: None,
            send_fd: None,
        };
        endpoint.open_sending_to_server()?;
        debug!("client endpoint {} connected to server", pid);
        Ok(endpoint)
    }

    /// A send-only endpoint for a forked runner/status child: it reports
    /// back over the well-known server FIFO or an originating client's
    /// FIFO, but never listens on one of its own.
    pub fn for_sending() -> Endpoint {
        Endpoint {
            role: Role::Transient,
            own_fifo: PathBuf::new(),
            peer_path: None,
            send_fd: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn own_path(&self) -> &Path {
        &self.own_fifo
    }

    fn open_sending_path(&mut self, path: PathBuf) -> Result<(), Error> {
        let fd = open(&path, OFlag::O_WRONLY, Mode::empty()).map_err(|e| {
            if e == nix::Error::ENOENT {
                Error::new(ErrorKind::NotFound, format!("peer FIFO {} not found", path.display()))
            } else {
                e.into()
            }
        })?;
        if let Some(old) = self.send_fd.replace(fd) {
            let _ = close(old);
        }
        self.peer_path = Some(path);
        Ok(())
    }

    /// Opens (or reopens) the send side to a given client's FIFO (used by
    /// the server, and by a status child relaying results to the client
    /// that asked for them).
    pub fn open_sending_to_client(&mut self, client_pid: libc::pid_t) -> Result<(), Error> {
        self.open_sending_path(config::client_fifo_path(client_pid))
    }

    /// Opens (or reopens) the send side to the server's well-known FIFO
    /// (used by runner/status children reporting `TASK_DONE`).
    pub fn open_sending_to_server(&mut self) -> Result<(), Error> {
        self.open_sending_path(config::server_fifo_path())
    }

    pub fn close_sending(&mut self) {
        if let Some(fd) = self.send_fd.take() {
            let _ = close(fd);
        }
    }

    fn sigpipe_default() {
        unsafe {
            let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
        }
    }

    fn sigpipe_ignore() {
        unsafe {
            let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }
    }

    /// Sends one frame. Fails with `invalid-argument` if the send side
    /// isn't open. SIGPIPE disposition is left at the process default
    /// (terminate): a peer that vanished mid-write kills this process
    /// rather than returning an error here.
    pub fn send(&self, payload: &[u8]) -> Result<(), Error> {
        let fd = self
            .send_fd
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "send side is not open"))?;
        if payload.is_empty() || payload.len() > frame::max_payload_len() {
            return Err(Error::new(
                ErrorKind::MessageSize,
                format!("payload length {} out of range", payload.len()),
            ));
        }
        Self::sigpipe_default();
        let frame = frame::encode(payload);
        write(fd, &frame)?;
        Ok(())
    }

    /// Sends one frame, ignoring SIGPIPE and instead reopening the peer's
    /// FIFO (the last path passed to `open_sending_to_client`/
    /// `open_sending_to_server`) and reissuing the write on
    /// `EPIPE`/`EINTR`, up to `max_attempts` times.
    pub fn send_retrying(&mut self, payload: &[u8], max_attempts: u32) -> Result<(), Error> {
        if payload.is_empty() || payload.len() > frame::max_payload_len() {
            return Err(Error::new(
                ErrorKind::MessageSize,
                format!("payload length {} out of range", payload.len()),
            ));
        }
        let peer_path = self
            .peer_path
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "no peer to retry against"))?;
        Self::sigpipe_ignore();
        let frame = frame::encode(payload);
        for attempt in 0..max_attempts {
            let fd = match self.send_fd {
                Some(fd) => fd,
                None => {
                    self.open_sending_path(peer_path.clone())?;
                    self.send_fd.unwrap()
                }
            };
            match write(fd, &frame) {
                Ok(_) => return Ok(()),
                Err(e @ nix::Error::EPIPE) | Err(e @ nix::Error::EINTR) => {
                    warn!("send attempt {} to {} failed ({}), reopening", attempt + 1, peer_path.display(), e);
                    self.close_sending();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::new(
            ErrorKind::TimedOut,
            format!("exhausted {} send attempts to {}", max_attempts, peer_path.display()),
        ))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close_sending();
    }
}
