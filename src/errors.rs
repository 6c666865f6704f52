//! Error-kind constructors mapping `spec.md` §7's error taxonomy onto
//! [`dusa_collection_utils`]'s generic [`ErrorArrayItem`]/[`Errors`] pair.
//!
//! Call sites use these instead of `ErrorArrayItem::new(Errors::X, ...)`
//! directly so the §7 kind a given failure belongs to stays legible at
//! the call site.

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};

/// A write or read on a pipe whose peer is gone. Treated as "peer gone",
/// never retried.
pub fn transient_io<M: Into<String>>(msg: M) -> ErrorArrayItem {
    ErrorArrayItem::new(Errors::InputOutput, msg.into())
}

/// `waitpid`/`kill` raced with a process that already exited or was
/// reparented away (ECHILD/ESRCH). Expected during reaping, not fatal.
pub fn child_gone(pid: i32) -> ErrorArrayItem {
    ErrorArrayItem::new(
        Errors::SupervisedChildLost,
        format!("pid {pid} is no longer ours to reap"),
    )
}

/// A worker's `start_server` raised before it could send BOOT.
pub fn boot_failure<M: Into<String>>(msg: M) -> ErrorArrayItem {
    ErrorArrayItem::new(Errors::SupervisedChildFat, msg.into())
}

/// Missing or unparsable configuration; fatal before any worker spawns.
pub fn config_fatal<M: Into<String>>(msg: M) -> ErrorArrayItem {
    ErrorArrayItem::new(Errors::ConfigReading, msg.into())
}

/// SIGINT observed while the master was already winding down.
pub fn supervisor_interrupt() -> ErrorArrayItem {
    ErrorArrayItem::new(
        Errors::GeneralError,
        "interrupted while waiting for workers to exit".to_owned(),
    )
}
