//! Master-side per-worker bookkeeping (`spec.md` §3, §4.3).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dusa_collection_utils::core::errors::ErrorArrayItem;
use libc::{SIGHUP, SIGKILL, SIGTERM};
use serde_json::Value;

use crate::config::ClusterConfig;
use crate::os_process::OsProcess;

/// `spec.md` §3: "Transitions are monotone": declaration order defines
/// the `Ord` used by `term()`'s `stage < Termed` guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Spawning,
    Booted,
    Termed,
    Killed,
}

/// One live worker (or the Mold slot) as tracked by the master.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub index: u32,
    pub pid: Option<i32>,
    pub phase: u64,
    pub started_at: DateTime<Utc>,
    pub last_checkin: DateTime<Utc>,
    pub last_status: HashMap<String, i64>,
    pub stage: Stage,
}

impl WorkerHandle {
    /// A freshly-requested worker: no pid yet (resolved on BOOT/FORK).
    pub fn spawning(index: u32, phase: u64) -> Self {
        let now = Utc::now();
        WorkerHandle {
            index,
            pid: None,
            phase,
            started_at: now,
            last_checkin: now,
            last_status: HashMap::new(),
            stage: Stage::Spawning,
        }
    }

    /// Directly-forked worker whose pid the master already knows
    /// (no mold indirection).
    pub fn spawning_with_pid(index: u32, phase: u64, pid: i32) -> Self {
        let mut handle = Self::spawning(index, phase);
        handle.pid = Some(pid);
        handle
    }

    /// Sends SIGTERM if not already Termed/Killed and records the
    /// transition. Idempotent past the first call.
    pub fn term(&mut self, os: &dyn OsProcess) -> Result<(), ErrorArrayItem> {
        if self.stage < Stage::Termed {
            if let Some(pid) = self.pid {
                os.send_signal(pid, SIGTERM)?;
            }
            self.stage = Stage::Termed;
        }
        Ok(())
    }

    /// Sends SIGKILL unconditionally and marks Killed.
    pub fn kill(&mut self, os: &dyn OsProcess) -> Result<(), ErrorArrayItem> {
        if let Some(pid) = self.pid {
            os.send_signal(pid, SIGKILL)?;
        }
        self.stage = Stage::Killed;
        Ok(())
    }

    /// Sends SIGHUP for log-rotation fanout without changing stage.
    pub fn hup(&self, os: &dyn OsProcess) -> Result<(), ErrorArrayItem> {
        if let Some(pid) = self.pid {
            os.send_signal(pid, SIGHUP)?;
        }
        Ok(())
    }

    /// BOOT received: Spawning -> Booted, pid resolved, checkin stamped.
    pub fn boot(&mut self, pid: i32) {
        if self.stage == Stage::Spawning {
            self.stage = Stage::Booted;
        }
        self.pid = Some(pid);
        self.last_checkin = Utc::now();
    }

    /// PING received: merge the metrics payload and stamp the checkin.
    /// `last_checkin` only ever moves forward (`spec.md` §8).
    pub fn ping(&mut self, metrics: &Value) {
        if let Some(obj) = metrics.as_object() {
            for (key, value) in obj {
                if let Some(n) = value.as_i64() {
                    self.last_status.insert(key.clone(), n);
                }
            }
        }
        let now = Utc::now();
        if now > self.last_checkin {
            self.last_checkin = now;
        }
    }

    /// EXTERNAL_TERM received: mark Termed without signalling (the
    /// worker already told us it's on its way out).
    pub fn term_reported(&mut self) {
        if self.stage < Stage::Termed {
            self.stage = Stage::Termed;
        }
    }

    /// Deadline past which the master should kill this worker for not
    /// checking in (`spec.md` §3).
    pub fn ping_timeout(&self, config: &ClusterConfig) -> DateTime<Utc> {
        match self.stage {
            Stage::Booted | Stage::Termed | Stage::Killed => {
                self.last_checkin + Duration::seconds(config.worker_timeout as i64)
            }
            Stage::Spawning => {
                self.started_at + Duration::seconds(config.worker_boot_timeout as i64)
            }
        }
    }

    pub fn requests_count(&self) -> i64 {
        *self.last_status.get("requests_count").unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os_process::FakeOsProcess;

    fn config() -> ClusterConfig {
        ClusterConfig::default()
    }

    #[test]
    fn boot_transitions_spawning_to_booted_and_resolves_pid() {
        let mut handle = WorkerHandle::spawning(0, 0);
        assert_eq!(handle.stage, Stage::Spawning);
        handle.boot(123);
        assert_eq!(handle.stage, Stage::Booted);
        assert_eq!(handle.pid, Some(123));
    }

    #[test]
    fn term_sends_sigterm_once() {
        let os = FakeOsProcess::new();
        os.mark_alive(5, true);
        let mut handle = WorkerHandle::spawning_with_pid(0, 0, 5);
        handle.boot(5);
        handle.term(&os).unwrap();
        handle.term(&os).unwrap(); // idempotent, no second SIGTERM
        assert_eq!(
            *os.signals_sent.lock().unwrap(),
            vec![(5, libc::SIGTERM)]
        );
        assert_eq!(handle.stage, Stage::Termed);
    }

    #[test]
    fn kill_sends_sigkill_and_marks_killed() {
        let os = FakeOsProcess::new();
        os.mark_alive(5, true);
        let mut handle = WorkerHandle::spawning_with_pid(0, 0, 5);
        handle.kill(&os).unwrap();
        assert_eq!(handle.stage, Stage::Killed);
        assert_eq!(*os.signals_sent.lock().unwrap(), vec![(5, libc::SIGKILL)]);
    }

    #[test]
    fn ping_merges_metrics_and_checkin_is_monotonic() {
        let mut handle = WorkerHandle::spawning(0, 0);
        handle.boot(1);
        let first_checkin = handle.last_checkin;
        handle.ping(&serde_json::json!({"requests_count": 10}));
        assert_eq!(handle.requests_count(), 10);
        assert!(handle.last_checkin >= first_checkin);
        handle.ping(&serde_json::json!({"requests_count": 11}));
        assert_eq!(handle.requests_count(), 11);
    }

    #[test]
    fn ping_timeout_uses_boot_timeout_before_boot() {
        let handle = WorkerHandle::spawning(0, 0);
        let cfg = config();
        let expected = handle.started_at + Duration::seconds(cfg.worker_boot_timeout as i64);
        assert_eq!(handle.ping_timeout(&cfg), expected);
    }

    #[test]
    fn ping_timeout_uses_worker_timeout_after_boot() {
        let mut handle = WorkerHandle::spawning(0, 0);
        handle.boot(1);
        let cfg = config();
        let expected = handle.last_checkin + Duration::seconds(cfg.worker_timeout as i64);
        assert_eq!(handle.ping_timeout(&cfg), expected);
    }

    #[test]
    fn external_term_marks_termed_without_signalling() {
        let os = FakeOsProcess::new();
        let mut handle = WorkerHandle::spawning_with_pid(0, 0, 5);
        handle.term_reported();
        assert_eq!(handle.stage, Stage::Termed);
        assert!(os.signals_sent.lock().unwrap().is_empty());
    }
}
