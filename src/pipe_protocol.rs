//! Line-oriented framing for the two pipe protocols described in
//! `spec.md` §4.1: the worker→master status protocol carried on
//! `worker_write`, and the simpler master/mold→mold fork-request
//! protocol carried on `fork_pipe`.
//!
//! Each `WorkerMessage` is one line: a single ASCII tag byte, an
//! optional `pid[:payload]` body, and a trailing `\n` — except
//! [`WorkerMessage::Wakeup`], which is a single byte with no
//! terminator, matching the self-pipe trick (`spec.md` §4.1, tag `!`).
//!
//! Reads/writes go through raw fds with `O_NONBLOCK` set by the caller
//! (`signal::make_nonblocking`), the same non-blocking-I/O-with-error-
//! suppression style `process_manager.rs` uses for child I/O.

use std::os::fd::RawFd;

use dusa_collection_utils::core::errors::ErrorArrayItem;
use nix::errno::Errno;
use nix::unistd::{read, write};
use serde_json::Value;

use crate::errors;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// `b` — worker announces it has bound and is ready to serve.
    Boot { pid: i32, index: u32 },
    /// `p` — periodic liveness + metrics snapshot.
    Ping { pid: i32, metrics: Value },
    /// `f` — mold announces it forked a new worker.
    Fork { pid: i32, index: u32 },
    /// `e` — worker received SIGTERM from outside the cluster.
    ExternalTerm { pid: i32 },
    /// `t` — worker is exiting on its own.
    Term { pid: i32 },
    /// `i` — toggle idle-state membership for `pid`.
    Idle { pid: i32 },
    /// `!` — self-pipe wakeup byte; carries no identity.
    Wakeup,
}

impl WorkerMessage {
    fn tag(&self) -> u8 {
        match self {
            WorkerMessage::Boot { .. } => b'b',
            WorkerMessage::Ping { .. } => b'p',
            WorkerMessage::Fork { .. } => b'f',
            WorkerMessage::ExternalTerm { .. } => b'e',
            WorkerMessage::Term { .. } => b't',
            WorkerMessage::Idle { .. } => b'i',
            WorkerMessage::Wakeup => b'!',
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        if matches!(self, WorkerMessage::Wakeup) {
            return vec![b'!'];
        }
        let mut line = vec![self.tag()];
        match self {
            WorkerMessage::Boot { pid, index } | WorkerMessage::Fork { pid, index } => {
                line.extend_from_slice(format!("{pid}:{index}").as_bytes());
            }
            WorkerMessage::Ping { pid, metrics } => {
                line.extend_from_slice(format!("{pid}{metrics}").as_bytes());
            }
            WorkerMessage::ExternalTerm { pid }
            | WorkerMessage::Term { pid }
            | WorkerMessage::Idle { pid } => {
                line.extend_from_slice(pid.to_string().as_bytes());
            }
            WorkerMessage::Wakeup => unreachable!(),
        }
        line.push(b'\n');
        line
    }

    fn decode_line(tag: u8, body: &str) -> Result<Self, ErrorArrayItem> {
        match tag {
            b'b' | b'f' => {
                let (pid, index) = body
                    .split_once(':')
                    .ok_or_else(|| errors::transient_io("malformed BOOT/FORK line"))?;
                let pid: i32 = pid
                    .parse()
                    .map_err(|_| errors::transient_io("malformed pid in BOOT/FORK"))?;
                let index: u32 = index
                    .parse()
                    .map_err(|_| errors::transient_io("malformed index in BOOT/FORK"))?;
                Ok(if tag == b'b' {
                    WorkerMessage::Boot { pid, index }
                } else {
                    WorkerMessage::Fork { pid, index }
                })
            }
            b'p' => {
                let split = body
                    .find('{')
                    .ok_or_else(|| errors::transient_io("PING missing metrics payload"))?;
                let (pid, json) = body.split_at(split);
                let pid: i32 = pid
                    .parse()
                    .map_err(|_| errors::transient_io("malformed pid in PING"))?;
                let metrics: Value = serde_json::from_str(json)
                    .map_err(|e| errors::transient_io(format!("bad PING metrics json: {e}")))?;
                Ok(WorkerMessage::Ping { pid, metrics })
            }
            b'e' | b't' | b'i' => {
                let pid: i32 = body
                    .trim()
                    .parse()
                    .map_err(|_| errors::transient_io("malformed pid"))?;
                Ok(match tag {
                    b'e' => WorkerMessage::ExternalTerm { pid },
                    b't' => WorkerMessage::Term { pid },
                    _ => WorkerMessage::Idle { pid },
                })
            }
            other => Err(errors::transient_io(format!(
                "unknown pipe protocol tag {other:#04x}"
            ))),
        }
    }
}

/// Non-blocking, best-effort write: a broken pipe (peer gone) is
/// swallowed rather than propagated, matching `spec.md` §4.1 ("All
/// writes must be non-blocking with error suppression if the peer has
/// gone").
pub fn send(fd: RawFd, message: &WorkerMessage) -> Result<(), ErrorArrayItem> {
    let bytes = message.encode();
    match write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &bytes) {
        Ok(_) => Ok(()),
        Err(Errno::EPIPE) | Err(Errno::EAGAIN) => Ok(()),
        Err(e) => Err(errors::transient_io(format!("pipe write failed: {e}"))),
    }
}

/// Buffers partial reads across non-blocking poll iterations and
/// yields fully-framed [`WorkerMessage`]s.
pub struct PipeReader {
    fd: RawFd,
    buf: Vec<u8>,
}

impl PipeReader {
    pub fn new(fd: RawFd) -> Self {
        PipeReader { fd, buf: Vec::new() }
    }

    /// Drains everything currently available on the fd (non-blocking)
    /// and returns any messages that completed as a result. Partial
    /// trailing data is retained for the next call.
    pub fn poll_messages(&mut self) -> Result<Vec<WorkerMessage>, ErrorArrayItem> {
        let mut chunk = [0u8; 4096];
        loop {
            match read(self.fd, &mut chunk) {
                Ok(0) => break, // EOF: peer closed its write end
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(errors::transient_io(format!("pipe read failed: {e}"))),
            }
        }
        self.drain_complete_messages()
    }

    fn drain_complete_messages(&mut self) -> Result<Vec<WorkerMessage>, ErrorArrayItem> {
        let mut messages = Vec::new();
        loop {
            if self.buf.is_empty() {
                break;
            }
            let tag = self.buf[0];
            if tag == b'!' {
                messages.push(WorkerMessage::Wakeup);
                self.buf.drain(..1);
                continue;
            }
            let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
                break; // incomplete line, wait for more bytes
            };
            let line = String::from_utf8_lossy(&self.buf[1..newline]).into_owned();
            messages.push(WorkerMessage::decode_line(tag, &line)?);
            self.buf.drain(..=newline);
        }
        Ok(messages)
    }
}

/// Sentinel and positive-index requests sent down `fork_pipe` /
/// `fork_writer` (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRequest {
    /// `-1`: stop serving, run the pre-refork hook.
    BeginRefork,
    /// `-2`: refork cycle complete, run the post-refork hook.
    ReforkComplete,
    /// `0`: legacy "restart server" request.
    RestartServer,
    /// `n > 0`: fork a new worker at this index.
    ForkWorker(u32),
}

impl ForkRequest {
    pub fn encode(&self) -> Vec<u8> {
        let n: i64 = match self {
            ForkRequest::BeginRefork => -1,
            ForkRequest::ReforkComplete => -2,
            ForkRequest::RestartServer => 0,
            ForkRequest::ForkWorker(idx) => *idx as i64,
        };
        format!("{n}\n").into_bytes()
    }

    pub fn decode(line: &str) -> Result<Self, ErrorArrayItem> {
        let n: i64 = line
            .trim()
            .parse()
            .map_err(|_| errors::transient_io("malformed fork_pipe line"))?;
        Ok(match n {
            -1 => ForkRequest::BeginRefork,
            -2 => ForkRequest::ReforkComplete,
            0 => ForkRequest::RestartServer,
            n if n > 0 => ForkRequest::ForkWorker(n as u32),
            other => return Err(errors::transient_io(format!("bad fork_pipe value {other}"))),
        })
    }

    pub fn send(fd: RawFd, request: ForkRequest) -> Result<(), ErrorArrayItem> {
        match write(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) },
            &request.encode(),
        ) {
            Ok(_) => Ok(()),
            Err(Errno::EPIPE) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(errors::transient_io(format!("fork_pipe write failed: {e}"))),
        }
    }
}
