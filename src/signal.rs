//! Self-pipe signal plumbing (`spec.md` §4.1, §5: "all signal handling
//! happens asynchronously via the self-pipe trick").
//!
//! The handler itself only writes one byte to a pre-opened pipe — no
//! locks, no allocation, nothing that isn't async-signal-safe. The
//! master's `nix::poll` loop reads that pipe and maps bytes back to
//! [`SignalKind`] outside signal context.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use dusa_collection_utils::core::errors::ErrorArrayItem;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe, read, write};

use crate::errors;

/// Written by the signal handler to identify which signal fired, read
/// back by the master after waking up from `poll`.
static WAKEUP_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Int,
    Term,
    Chld,
    Urg,
    Ttin,
    Ttou,
}

impl SignalKind {
    /// The byte a handler writes to the wakeup pipe to identify itself;
    /// exposed so tests (and anything else writing to the pipe
    /// directly) can produce the same encoding `from_byte` decodes.
    pub fn byte(self) -> u8 {
        match self {
            SignalKind::Int => 1,
            SignalKind::Term => 2,
            SignalKind::Chld => 3,
            SignalKind::Urg => 4,
            SignalKind::Ttin => 5,
            SignalKind::Ttou => 6,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(SignalKind::Int),
            2 => Some(SignalKind::Term),
            3 => Some(SignalKind::Chld),
            4 => Some(SignalKind::Urg),
            5 => Some(SignalKind::Ttin),
            6 => Some(SignalKind::Ttou),
            _ => None,
        }
    }

    fn signal(self) -> Signal {
        match self {
            SignalKind::Int => Signal::SIGINT,
            SignalKind::Term => Signal::SIGTERM,
            SignalKind::Chld => Signal::SIGCHLD,
            SignalKind::Urg => Signal::SIGURG,
            SignalKind::Ttin => Signal::SIGTTIN,
            SignalKind::Ttou => Signal::SIGTTOU,
        }
    }
}

/// Sets `O_NONBLOCK` on `fd`, matching the non-blocking I/O style
/// `process_manager.rs` uses for piped child I/O.
pub fn make_nonblocking(fd: RawFd) -> Result<(), ErrorArrayItem> {
    let current = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| errors::transient_io(format!("fcntl(F_GETFL) failed: {e}")))?;
    let mut flags = OFlag::from_bits_truncate(current);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| errors::transient_io(format!("fcntl(F_SETFL) failed: {e}")))?;
    Ok(())
}

/// Opens the wakeup pipe and records its write end for the signal
/// handler to use. Returns `(read_fd, write_fd)`.
pub fn create_wakeup_pipe() -> Result<(RawFd, RawFd), ErrorArrayItem> {
    let (read_fd, write_fd) =
        pipe().map_err(|e| errors::transient_io(format!("pipe() failed: {e}")))?;
    let read_fd = std::os::fd::IntoRawFd::into_raw_fd(read_fd);
    let write_fd = std::os::fd::IntoRawFd::into_raw_fd(write_fd);
    make_nonblocking(read_fd)?;
    make_nonblocking(write_fd)?;
    WAKEUP_WRITE_FD.store(write_fd, Ordering::SeqCst);
    Ok((read_fd, write_fd))
}

extern "C" fn handle_signal(signum: libc::c_int) {
    let Some(kind) = [
        SignalKind::Int,
        SignalKind::Term,
        SignalKind::Chld,
        SignalKind::Urg,
        SignalKind::Ttin,
        SignalKind::Ttou,
    ]
    .into_iter()
    .find(|k| k.signal() as libc::c_int == signum) else {
        return;
    };
    let fd = WAKEUP_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let _ = write(unsafe { BorrowedFd::borrow_raw(fd) }, &[kind.byte()]);
    }
}

/// Installs `handle_signal` for every signal the master cares about.
/// Must run before any worker is forked, from the single master thread.
pub fn install_handlers() -> Result<(), ErrorArrayItem> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for kind in [
        SignalKind::Int,
        SignalKind::Term,
        SignalKind::Chld,
        SignalKind::Urg,
        SignalKind::Ttin,
        SignalKind::Ttou,
    ] {
        unsafe { sigaction(kind.signal(), &action) }
            .map_err(|e| errors::transient_io(format!("sigaction({:?}) failed: {e}", kind.signal())))?;
    }
    Ok(())
}

/// Non-blocking drain of every signal byte currently buffered on the
/// wakeup pipe's read end, decoded back into [`SignalKind`]s in arrival
/// order. Called from the master loop after `poll` reports the fd
/// readable, outside any signal context.
pub fn drain_signals(wakeup_read: RawFd) -> Result<Vec<SignalKind>, ErrorArrayItem> {
    let mut kinds = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        match read(wakeup_read, &mut chunk) {
            Ok(0) => break,
            Ok(n) => kinds.extend(chunk[..n].iter().filter_map(|&b| SignalKind::from_byte(b))),
            Err(Errno::EAGAIN) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(errors::transient_io(format!("wakeup pipe read failed: {e}"))),
        }
    }
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_kind_byte_roundtrip() {
        for kind in [
            SignalKind::Int,
            SignalKind::Term,
            SignalKind::Chld,
            SignalKind::Urg,
            SignalKind::Ttin,
            SignalKind::Ttou,
        ] {
            assert_eq!(SignalKind::from_byte(kind.byte()), Some(kind));
        }
    }

    #[test]
    fn from_byte_rejects_unknown_values() {
        assert_eq!(SignalKind::from_byte(0), None);
        assert_eq!(SignalKind::from_byte(200), None);
    }

    #[test]
    fn wakeup_pipe_is_nonblocking_and_writable() {
        let (read_fd, write_fd) = create_wakeup_pipe().unwrap();
        write(
            unsafe { BorrowedFd::borrow_raw(write_fd) },
            &[SignalKind::Term.byte()],
        )
        .unwrap();
        let mut buf = [0u8; 1];
        let n = nix::unistd::read(read_fd, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(SignalKind::from_byte(buf[0]), Some(SignalKind::Term));
        let _ = nix::unistd::close(read_fd);
        let _ = nix::unistd::close(write_fd);
    }

    #[test]
    fn drain_signals_decodes_every_buffered_byte_in_order() {
        let (read_fd, write_fd) = create_wakeup_pipe().unwrap();
        write(
            unsafe { BorrowedFd::borrow_raw(write_fd) },
            &[SignalKind::Ttin.byte(), SignalKind::Chld.byte()],
        )
        .unwrap();
        let kinds = drain_signals(read_fd).unwrap();
        assert_eq!(kinds, vec![SignalKind::Ttin, SignalKind::Chld]);
        assert_eq!(drain_signals(read_fd).unwrap(), Vec::new());
        let _ = nix::unistd::close(read_fd);
        let _ = nix::unistd::close(write_fd);
    }
}
