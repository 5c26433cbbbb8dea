//! The blocking listen loop shared by both endpoint roles.

use crate::bus::endpoint::Endpoint;
use crate::protocol::frame::{self, ParseOutcome};
use log::{trace, warn};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, read};
use std::ops::ControlFlow;
use std::os::unix::io::RawFd;

/// Reads until a clean EOF (all writers closed), discarding bytes. Used to
/// drain the rest of a FIFO session once an invalid frame has desynced the
/// reader, so a misbehaving writer can't wedge the loop on a partial frame.
fn drain_to_eof(fd: RawFd) {
    let mut scratch = [0u8; 4096];
    loop {
        match read(fd, &mut scratch) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(nix::Error::EINTR) => continue,
            Err(_) => break,
        }
    }
}

/// Repeatedly opens the endpoint's own FIFO for reading, decodes frames,
/// and dispatches them to `on_message`. Returns the terminal code once
/// either callback returns `ControlFlow::Break`.
///
/// `on_message` receives a decoded frame's payload; `on_before_block` is
/// invoked whenever every writer has gone away and the loop is about to
/// reopen (and therefore block on) the FIFO again.
pub fn listen<M, B>(endpoint: &Endpoint, mut on_message: M, mut on_before_block: B) -> i32
where
    M: FnMut(&[u8]) -> ControlFlow<i32>,
    B: FnMut() -> ControlFlow<i32>,
{
    let read_buf_len = 4 * frame::pipe_buf();
    let mut read_buf = vec![0u8; read_buf_len];
    let mut residual: Vec<u8> = Vec::new();

    loop {
        let fd = match open(endpoint.own_path(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("failed to open {} for reading: {}", endpoint.own_path().display(), e);
                return 1;
            }
        };

        let mut broken = false;
        'session: loop {
            match read(fd, &mut read_buf) {
                Ok(0) => break 'session,
                Ok(n) => {
                    residual.extend_from_slice(&read_buf[..n]);
                    loop {
                        match frame::parse_header(&residual) {
                            ParseOutcome::Frame {
                                payload_start,
                                payload_len,
                                consumed,
                            } => {
                                let payload =
                                    residual[payload_start..payload_start + payload_len].to_vec();
                                residual.drain(0..consumed);
                                if let ControlFlow::Break(code) = on_message(&payload) {
                                    drain_to_eof(fd);
                                    let _ = close(fd);
                                    return code;
                                }
                            }
                            ParseOutcome::NeedMore => break,
                            ParseOutcome::Invalid => {
                                warn!(
                                    "dropping invalid frame on {}, draining session",
                                    endpoint.own_path().display()
                                );
                                residual.clear();
                                broken = true;
                                break;
                            }
                        }
                    }
                    if broken {
                        drain_to_eof(fd);
                        break 'session;
                    }
                }
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    warn!("read error on {}: {}", endpoint.own_path().display(), e);
                    break 'session;
                }
            }
        }

        if !residual.is_empty() {
            trace!(
                "dropping {} trailing residual bytes at EOF on {}",
                residual.len(),
                endpoint.own_path().display()
            );
            residual.clear();
        }

        let _ = close(fd);

        if let ControlFlow::Break(code) = on_before_block() {
            return code;
        }
    }
}
