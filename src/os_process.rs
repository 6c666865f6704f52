//! Thin abstraction over pid lookups and signal delivery
//! (`spec.md` §9, "Global process state (pid, cwd, proc-title)").
//!
//! `WorkerHandle`/`Supervisor` call through an `OsProcess` rather than
//! `libc::kill`/`libc::getpid` directly, so tests can swap in
//! [`FakeOsProcess`] and assert on exactly what signals were sent
//! without actually killing anything.

use std::collections::HashMap;
use std::sync::Mutex;

use dusa_collection_utils::core::errors::ErrorArrayItem;
use libc::{c_int, pid_t};

use crate::errors;

pub trait OsProcess: Send + Sync {
    /// Send `signal` to `pid`. Mirrors `process_manager::is_pid_active`'s
    /// treatment of ESRCH vs EPERM: ESRCH is success-with-already-gone
    /// (`Ok(false)`), EPERM means it exists but we can't touch it
    /// (`Ok(true)`), anything else is a real I/O error.
    fn send_signal(&self, pid: pid_t, signal: c_int) -> Result<bool, ErrorArrayItem>;

    /// Non-destructive liveness probe (`kill(pid, 0)`).
    fn is_alive(&self, pid: pid_t) -> bool;

    /// Sets this process's `argv[0]`-visible title. A best-effort,
    /// platform-dependent operation; failures are not fatal.
    fn set_process_title(&self, title: &str);
}

/// Real implementation: `libc::kill`.
pub struct RealOsProcess;

impl OsProcess for RealOsProcess {
    fn send_signal(&self, pid: pid_t, signal: c_int) -> Result<bool, ErrorArrayItem> {
        let ret = unsafe { libc::kill(pid, signal) };
        if ret == 0 {
            return Ok(true);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => Ok(false),
            Some(libc::EPERM) => Ok(true),
            Some(errno) => Err(errors::transient_io(format!(
                "kill({pid}, {signal}) failed: errno {errno}"
            ))),
            None => Err(errors::transient_io("kill() failed with unknown errno")),
        }
    }

    fn is_alive(&self, pid: pid_t) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    fn set_process_title(&self, title: &str) {
        // setproctitle-equivalent is not portable without an extra
        // dependency; we settle for updating the thread/process name
        // via prctl on Linux, best-effort.
        #[cfg(target_os = "linux")]
        {
            let mut name = title.as_bytes().to_vec();
            name.truncate(15);
            name.push(0);
            unsafe {
                libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = title;
        }
    }
}

/// Formats the `"<name>: cluster <role> <index>: <master_pid>"` title
/// from `spec.md` §6, with `" [<tag>]"` appended when `tag` is set.
pub fn process_title(
    app_name: &str,
    role: &str,
    index: u32,
    master_pid: pid_t,
    tag: Option<&str>,
) -> String {
    let mut title = format!("{app_name}: cluster {role} {index}: {master_pid}");
    if let Some(tag) = tag.filter(|t| !t.is_empty()) {
        title.push_str(&format!(" [{tag}]"));
    }
    title
}

/// Test double recording every signal sent, keyed by pid, and letting
/// tests decide which pids are "alive".
#[derive(Default)]
pub struct FakeOsProcess {
    pub signals_sent: Mutex<Vec<(pid_t, c_int)>>,
    pub alive: Mutex<HashMap<pid_t, bool>>,
}

impl FakeOsProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_alive(&self, pid: pid_t, alive: bool) {
        self.alive.lock().unwrap().insert(pid, alive);
    }
}

impl OsProcess for FakeOsProcess {
    fn send_signal(&self, pid: pid_t, signal: c_int) -> Result<bool, ErrorArrayItem> {
        self.signals_sent.lock().unwrap().push((pid, signal));
        Ok(self.is_alive(pid))
    }

    fn is_alive(&self, pid: pid_t) -> bool {
        *self.alive.lock().unwrap().get(&pid).unwrap_or(&true)
    }

    fn set_process_title(&self, _title: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_without_tag() {
        assert_eq!(
            process_title("app", "worker", 2, 123, None),
            "app: cluster worker 2: 123"
        );
    }

    #[test]
    fn title_with_tag() {
        assert_eq!(
            process_title("app", "mold", 0, 123, Some("blue")),
            "app: cluster mold 0: 123 [blue]"
        );
    }

    #[test]
    fn title_with_empty_tag_is_omitted() {
        assert_eq!(
            process_title("app", "worker", 0, 1, Some("")),
            "app: cluster worker 0: 1"
        );
    }

    #[test]
    fn fake_records_signals() {
        let fake = FakeOsProcess::new();
        fake.mark_alive(10, true);
        assert!(fake.send_signal(10, libc::SIGTERM).unwrap());
        fake.mark_alive(10, false);
        assert!(!fake.send_signal(10, libc::SIGKILL).unwrap());
        assert_eq!(
            *fake.signals_sent.lock().unwrap(),
            vec![(10, libc::SIGTERM), (10, libc::SIGKILL)]
        );
    }
}
