//! Master-side phase/restart state machine (`spec.md` §4.4): pool
//! sizing, reaping, timeouts, mold promotion and signal policy. The
//! single-threaded, `poll`-driven shape is grounded on `process_manager.rs`'s
//! child-lifecycle bookkeeping, adapted from async/await to the
//! synchronous loop §5 requires so `fork()` stays safe to call.

use std::collections::HashSet;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dusa_collection_utils::core::errors::ErrorArrayItem;
use dusa_collection_utils::log;
use dusa_collection_utils::core::logger::LogLevel;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::config::{ClusterConfig, CullingStrategy};
use crate::engine::EngineFactory;
use crate::errors;
use crate::hooks::Hooks;
use crate::os_process::OsProcess;
use crate::pipe_protocol::{ForkRequest, PipeReader, WorkerMessage};
use crate::signal::{self, SignalKind};
use crate::worker::WorkerContext;
use crate::worker_handle::{Stage, WorkerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Run,
    Stop,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhasedRestart {
    None,
    Normal,
    Refork,
}

/// The raw fds `Supervisor::run` needs: the master's read end of
/// `worker_write`, the write/read ends handed to forked children, and
/// the read end of the self-pipe signal handlers write into.
#[derive(Debug, Clone, Copy)]
pub struct MasterPipes {
    pub worker_write_read: RawFd,
    pub worker_write_for_children: RawFd,
    pub check_pipe_for_children: RawFd,
    pub wakeup_read: RawFd,
}

pub struct Supervisor {
    pub config: ClusterConfig,
    pub hooks: Hooks,
    pub workers: Vec<WorkerHandle>,
    pub mold: Option<WorkerHandle>,
    pub phase: u64,
    pub status: Status,
    pub phased_restart: PhasedRestart,
    pub idle_workers: HashSet<i32>,
    pub started_at: DateTime<Utc>,
    workers_not_booted: u32,
    /// Write end of `fork_pipe`, present only while a mold is alive.
    pub fork_writer: Option<RawFd>,
    /// Wall clock at which the next health sweep runs (`spec.md` §3):
    /// `min(next_check, earliest worker ping_timeout)`, recomputed at
    /// the end of every `check_workers` pass.
    pub next_check: DateTime<Utc>,
}

impl Supervisor {
    pub fn new(config: ClusterConfig, hooks: Hooks) -> Self {
        Supervisor {
            config,
            hooks,
            workers: Vec::new(),
            mold: None,
            phase: 0,
            status: Status::Run,
            phased_restart: PhasedRestart::None,
            idle_workers: HashSet::new(),
            started_at: Utc::now(),
            workers_not_booted: 0,
            fork_writer: None,
            next_check: Utc::now(),
        }
    }

    fn next_free_index(&self) -> u32 {
        let mut used: Vec<u32> = self.workers.iter().map(|w| w.index).collect();
        if let Some(mold) = &self.mold {
            used.push(mold.index);
        }
        let mut idx = 0;
        while used.contains(&idx) {
            idx += 1;
        }
        idx
    }

    fn find_by_pid(&mut self, pid: i32) -> Option<&mut WorkerHandle> {
        self.workers
            .iter_mut()
            .chain(self.mold.iter_mut())
            .find(|h| h.pid == Some(pid))
    }

    fn find_by_index(&mut self, index: u32) -> Option<&mut WorkerHandle> {
        self.workers
            .iter_mut()
            .chain(self.mold.iter_mut())
            .find(|h| h.index == index)
    }

    /// §4.4 step 1: SIGKILL any non-Termed handle past its `ping_timeout`.
    pub fn timeout_workers(&mut self, os: &dyn OsProcess, now: DateTime<Utc>) -> Vec<u32> {
        let mut killed = Vec::new();
        for handle in self.workers.iter_mut().chain(self.mold.iter_mut()) {
            if handle.stage < Stage::Termed && handle.ping_timeout(&self.config) <= now {
                let reason = if handle.stage == Stage::Spawning {
                    "boot timeout"
                } else {
                    "check-in timeout"
                };
                log!(
                    LogLevel::Warn,
                    "Terminating timed out worker (worker {} failed {}: pid={:?})",
                    handle.index,
                    reason,
                    handle.pid
                );
                let _ = handle.kill(os);
                killed.push(handle.index);
            }
        }
        killed
    }

    /// §4.4 step 2: non-blocking reap of all children, matched back
    /// against handles by pid. Unknown pids are logged and dropped.
    pub fn wait_workers(&mut self) -> Vec<i32> {
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    reaped.push(pid.as_raw());
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        for pid in &reaped {
            if self.find_by_pid(*pid).is_none() {
                log!(LogLevel::Warn, "reaped unknown child process pid={pid}");
            }
        }
        self.workers.retain(|w| match w.pid {
            Some(pid) => !reaped.contains(&pid),
            None => true,
        });
        if let Some(mold) = &self.mold {
            if let Some(pid) = mold.pid {
                if reaped.contains(&pid) {
                    self.mold = None;
                }
            }
        }
        reaped
    }

    /// §4.4 step 3: retire workers above the configured pool size.
    pub fn cull_workers(&mut self, os: &dyn OsProcess) -> Vec<u32> {
        let target = self.config.workers as usize;
        if self.workers.len() <= target {
            return Vec::new();
        }
        let diff = self.workers.len() - target;
        let fork_worker = self.config.fork_worker.enabled();

        let mut candidates: Vec<usize> = (0..self.workers.len())
            .filter(|&i| !(fork_worker && self.workers[i].index == 0))
            .collect();
        candidates.sort_by_key(|&i| self.workers[i].started_at);
        if self.config.worker_culling_strategy == CullingStrategy::Youngest {
            candidates.reverse();
        }
        candidates.truncate(diff);

        let mut culled = Vec::new();
        for &i in &candidates {
            let _ = self.workers[i].term(os);
            culled.push(self.workers[i].index);
        }
        culled
    }

    /// §4.4 step 4 (fork-worker only): promote the Booted handle with
    /// the most requests served and a matching phase into the mold slot.
    pub fn promote_mold(&mut self) -> Option<u32> {
        if !self.config.fork_worker.enabled() || self.mold.is_some() {
            return None;
        }
        let missing = self.config.workers.saturating_sub(self.workers.len() as u32);
        if missing == 0 {
            return None;
        }
        let phase = self.phase;
        let candidate = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.stage == Stage::Booted && w.phase == phase)
            .max_by_key(|(_, w)| w.requests_count())
            .map(|(i, _)| i)?;

        let mut promoted = self.workers.remove(candidate);
        promoted.stage = Stage::Booted;
        let index = promoted.index;
        self.mold = Some(promoted);
        Some(index)
    }

    /// §4.4 step 5: fill every missing slot, either by asking the mold
    /// to fork (if one is alive) or by forking directly.
    pub fn spawn_workers(
        &mut self,
        engine_factory: &EngineFactory,
        os: &dyn OsProcess,
        master_pid: i32,
        worker_write: RawFd,
        check_pipe: RawFd,
    ) -> Result<(), ErrorArrayItem> {
        let missing = self.config.workers.saturating_sub(self.workers.len() as u32);
        for _ in 0..missing {
            let index = self.next_free_index();
            if let (Some(mold), Some(fork_writer)) = (&self.mold, self.fork_writer) {
                if mold.pid.is_some() {
                    ForkRequest::send(fork_writer, ForkRequest::ForkWorker(index))?;
                    self.workers.push(WorkerHandle::spawning(index, self.phase));
                    continue;
                }
            }

            match unsafe { fork() }.map_err(|e| errors::transient_io(format!("fork() failed: {e}")))?
            {
                ForkResult::Parent { child } => {
                    self.workers
                        .push(WorkerHandle::spawning_with_pid(index, self.phase, child.as_raw()));
                }
                ForkResult::Child => {
                    let ctx = WorkerContext {
                        index,
                        phase: self.phase,
                        master_pid,
                        config: self.config.clone(),
                        hooks: self.hooks.clone(),
                        engine_factory: engine_factory.clone(),
                        worker_write,
                        check_pipe,
                        fork_pipe: None,
                    };
                    let engine = engine_factory();
                    let runtime = tokio::runtime::Runtime::new()
                        .expect("failed to build per-worker tokio runtime");
                    let _guard = runtime.enter();
                    crate::worker::run(ctx, engine, os);
                }
            }
        }
        Ok(())
    }

    /// Applies one message read off `worker_write` to the state machine
    /// (§4.4's dispatch table).
    pub fn apply_message(&mut self, message: WorkerMessage, os: &dyn OsProcess) {
        match message {
            WorkerMessage::Boot { pid, index } => {
                if let Some(handle) = self.find_by_index(index) {
                    handle.boot(pid);
                    log!(LogLevel::Info, "worker {index} booted (pid {pid})");
                    if self.workers_not_booted > 0 {
                        self.workers_not_booted -= 1;
                    }
                }
            }
            WorkerMessage::Ping { pid, metrics } => {
                if let Some(handle) = self.find_by_pid(pid) {
                    handle.ping(&metrics);
                }
                self.maybe_auto_refork(pid, os);
            }
            WorkerMessage::ExternalTerm { pid } => {
                if let Some(handle) = self.find_by_pid(pid) {
                    handle.term_reported();
                }
            }
            WorkerMessage::Term { pid } => {
                if let Some(handle) = self.find_by_pid(pid) {
                    if handle.stage < Stage::Termed {
                        let _ = handle.term(os);
                    }
                }
            }
            WorkerMessage::Idle { pid } => {
                if !self.idle_workers.remove(&pid) {
                    self.idle_workers.insert(pid);
                }
            }
            WorkerMessage::Fork { pid, index } => {
                if let Some(handle) = self.find_by_index(index) {
                    if handle.pid.is_none() {
                        handle.pid = Some(pid);
                    }
                }
            }
            WorkerMessage::Wakeup => {}
        }
    }

    /// `on :ping!` auto-refork (§4.4 signal policy): worker 0 crossing
    /// the configured request threshold on phase 0 triggers a refork.
    fn maybe_auto_refork(&mut self, pid: i32, os: &dyn OsProcess) {
        let Some(threshold) = self.config.fork_worker.auto_refork_threshold() else {
            return;
        };
        let Some(handle) = self.workers.iter().find(|w| w.pid == Some(pid)) else {
            return;
        };
        if handle.index == 0 && handle.phase == 0 && handle.requests_count() as u64 >= threshold {
            self.begin_refork(os);
        }
    }

    /// SIGURG `fork_worker!` (§4.4 master signal policy): the worker
    /// serving the most requests is advanced to the next phase so it
    /// survives the refork as the new mold candidate, the current mold
    /// (if any) is termed, and a refork cycle is scheduled.
    pub fn begin_refork(&mut self, os: &dyn OsProcess) {
        let next_phase = self.phase + 1;
        if let Some(candidate) = self.workers.iter_mut().max_by_key(|w| w.requests_count()) {
            log!(
                LogLevel::Info,
                "fork_worker!: advancing worker {} (requests={}) to phase {next_phase}",
                candidate.index,
                candidate.requests_count()
            );
            candidate.phase = next_phase;
        }
        if let Some(mold) = &mut self.mold {
            let _ = mold.term(os);
        }
        self.phased_restart = PhasedRestart::Refork;
    }

    pub fn begin_phased_restart(&mut self) {
        self.phased_restart = PhasedRestart::Normal;
    }

    /// Applies a pending phased restart: bump `phase`, reset the
    /// not-booted counter (refork keeps worker 0 alive as the mold).
    pub fn apply_phased_restart(&mut self) {
        if self.phased_restart == PhasedRestart::None {
            return;
        }
        self.phase += 1;
        self.workers_not_booted = self.config.workers;
        if self.phased_restart == PhasedRestart::Refork {
            self.workers_not_booted = self.workers_not_booted.saturating_sub(1);
        }
        self.phased_restart = PhasedRestart::None;
    }

    /// §4.4's tail check: if every worker is booted and at least one
    /// still carries the old phase, retire it (refork never picks
    /// index 0).
    pub fn phase_upgrade_candidate(&self) -> Option<u32> {
        if self.workers.iter().any(|w| w.stage != Stage::Booted) {
            return None;
        }
        self.workers
            .iter()
            .find(|w| w.phase != self.phase && w.index != 0)
            .map(|w| w.index)
    }

    /// SIGINT / SIGTERM: request the cluster wind down.
    pub fn stop(&mut self) {
        self.status = Status::Stop;
    }

    /// `stop_workers`: term everything, then poll (every 200ms) until
    /// all handles clear their pid or an interrupt cancels the wait.
    pub fn stop_workers(&mut self, os: &dyn OsProcess) -> Result<(), ErrorArrayItem> {
        for handle in self.workers.iter_mut().chain(self.mold.iter_mut()) {
            let _ = handle.term(os);
        }
        loop {
            self.wait_workers();
            if self.workers.is_empty() && self.mold.is_none() {
                return Ok(());
            }
            if self.status == Status::Halt {
                return Err(errors::supervisor_interrupt());
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// TTIN: grow the pool by one worker.
    pub fn grow(&mut self) {
        self.config.workers = self.config.workers.saturating_add(1);
    }

    /// TTOU: shrink the pool by one, never below one worker.
    pub fn shrink(&mut self) {
        self.config.workers = self.config.workers.saturating_sub(1).max(1);
    }

    /// §4.4's `check_workers` orchestrator: the five sub-steps in their
    /// fixed order, followed by the phase-upgrade tail check and a
    /// recomputed `next_check`.
    pub fn check_workers(
        &mut self,
        os: &dyn OsProcess,
        engine_factory: &EngineFactory,
        master_pid: i32,
        worker_write: RawFd,
        check_pipe: RawFd,
    ) -> Result<(), ErrorArrayItem> {
        let now = Utc::now();
        self.timeout_workers(os, now);
        self.wait_workers();
        self.cull_workers(os);
        self.promote_mold();
        self.spawn_workers(engine_factory, os, master_pid, worker_write, check_pipe)?;

        if let Some(index) = self.phase_upgrade_candidate() {
            if let Some(handle) = self.find_by_index(index) {
                log!(LogLevel::Info, "phase upgrade: retiring worker {index} still on phase {}", handle.phase);
                let _ = handle.term(os);
            }
        }

        self.recompute_next_check();
        Ok(())
    }

    /// `next_check = min(next_check, earliest worker ping_timeout)`
    /// (`spec.md` §3), falling back to one `worker_check_interval` out
    /// when there are no workers yet to bound on.
    fn recompute_next_check(&mut self) {
        let now = Utc::now();
        let earliest = self
            .workers
            .iter()
            .chain(self.mold.iter())
            .map(|w| w.ping_timeout(&self.config))
            .min();
        let fallback = now + ChronoDuration::seconds(self.config.worker_check_interval as i64);
        self.next_check = match earliest {
            Some(deadline) => deadline.min(fallback),
            None => fallback,
        };
    }

    fn all_workers_idle(&self) -> bool {
        !self.workers.is_empty()
            && self
                .workers
                .iter()
                .all(|w| w.pid.map(|pid| self.idle_workers.contains(&pid)).unwrap_or(false))
    }

    /// Blocks on `fds` (via `nix::poll`) until one becomes readable or
    /// `timeout` elapses, matching §4.4's `wait_readable(master_read, up
    /// to next_check - now)`. A clamped-negative `timeout` (deadline
    /// already past) polls without blocking.
    fn wait_readable(&self, fds: &[RawFd], timeout: Duration) -> Result<(), ErrorArrayItem> {
        let mut poll_fds: Vec<PollFd> = fds
            .iter()
            .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
            .collect();
        let poll_timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        match poll(&mut poll_fds, poll_timeout) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EINTR) => Ok(()),
            Err(e) => Err(errors::transient_io(format!("poll failed: {e}"))),
        }
    }

    /// §4.4 top-level master loop: `while status == Run`, sequencing
    /// `check_workers`, a bounded wait on `worker_write`/the wakeup
    /// pipe, signal dispatch, and worker-message dispatch. Runs on the
    /// single master thread — no tokio reactor here, so `fork()` inside
    /// `check_workers`/`spawn_workers` stays safe to call.
    pub fn run(
        &mut self,
        os: &dyn OsProcess,
        engine_factory: &EngineFactory,
        master_pid: i32,
        pipes: MasterPipes,
    ) -> Result<(), ErrorArrayItem> {
        let mut worker_reader = PipeReader::new(pipes.worker_write_read);
        let mut restart_in_progress = false;

        while self.status == Status::Run {
            if self.config.idle_timeout && self.all_workers_idle() {
                log!(LogLevel::Info, "all workers idle past idle_timeout, winding down");
                break;
            }

            if self.phased_restart != PhasedRestart::None {
                self.apply_phased_restart();
                restart_in_progress = true;
            }

            self.check_workers(
                os,
                engine_factory,
                master_pid,
                pipes.worker_write_for_children,
                pipes.check_pipe_for_children,
            )?;

            let now = Utc::now();
            let timeout = (self.next_check - now).to_std().unwrap_or(Duration::ZERO);
            self.wait_readable(&[pipes.worker_write_read, pipes.wakeup_read], timeout)?;

            for kind in signal::drain_signals(pipes.wakeup_read)? {
                match kind {
                    SignalKind::Int => self.stop(),
                    SignalKind::Term => {
                        self.stop_workers(os)?;
                        self.status = Status::Stop;
                        log!(LogLevel::Info, "SIGTERM: cluster stopped");
                        std::process::exit(0);
                    }
                    SignalKind::Chld => self.next_check = Utc::now(),
                    SignalKind::Ttin => self.grow(),
                    SignalKind::Ttou => self.shrink(),
                    SignalKind::Urg => {
                        if self.config.fork_worker.enabled() {
                            self.begin_refork(os);
                        }
                    }
                }
            }

            for message in worker_reader.poll_messages()? {
                self.apply_message(message, os);
            }

            if restart_in_progress && self.workers_not_booted == 0 {
                log!(LogLevel::Info, "phased restart complete (phase {})", self.phase);
                restart_in_progress = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForkWorker;
    use crate::os_process::FakeOsProcess;
    use chrono::Duration as ChronoDuration;

    fn supervisor() -> Supervisor {
        Supervisor::new(ClusterConfig::default(), Hooks::default())
    }

    #[test]
    fn timeout_workers_kills_past_deadline_and_leaves_others() {
        let mut sup = supervisor();
        sup.config.worker_timeout = 60;
        let mut fresh = WorkerHandle::spawning(0, 0);
        fresh.boot(1);
        let mut stale = WorkerHandle::spawning(1, 0);
        stale.boot(2);
        stale.last_checkin = Utc::now() - ChronoDuration::seconds(120);
        sup.workers = vec![fresh, stale];

        let os = FakeOsProcess::new();
        os.mark_alive(1, true);
        os.mark_alive(2, true);
        let killed = sup.timeout_workers(&os, Utc::now());

        assert_eq!(killed, vec![1]);
        assert_eq!(sup.workers[0].stage, Stage::Booted);
        assert_eq!(sup.workers[1].stage, Stage::Killed);
    }

    #[test]
    fn cull_workers_never_culls_index_zero_in_fork_worker_mode() {
        let mut sup = supervisor();
        sup.config.workers = 1;
        sup.config.fork_worker = ForkWorker::Threshold(1000);
        let mut zero = WorkerHandle::spawning_with_pid(0, 0, 10);
        zero.boot(10);
        let mut one = WorkerHandle::spawning_with_pid(1, 0, 11);
        one.boot(11);
        sup.workers = vec![zero, one];

        let os = FakeOsProcess::new();
        let culled = sup.cull_workers(&os);
        assert_eq!(culled, vec![1]);
    }

    #[test]
    fn cull_workers_respects_oldest_strategy() {
        let mut sup = supervisor();
        sup.config.workers = 1;
        let mut older = WorkerHandle::spawning_with_pid(0, 0, 10);
        older.started_at = Utc::now() - ChronoDuration::seconds(100);
        let newer = WorkerHandle::spawning_with_pid(1, 0, 11);
        sup.workers = vec![older, newer];

        let os = FakeOsProcess::new();
        let culled = sup.cull_workers(&os);
        assert_eq!(culled, vec![0]);
    }

    #[test]
    fn promote_mold_picks_highest_requests_count_on_current_phase() {
        let mut sup = supervisor();
        sup.config.workers = 3;
        sup.config.fork_worker = ForkWorker::Threshold(1000);
        let mut low = WorkerHandle::spawning_with_pid(0, 0, 10);
        low.boot(10);
        low.last_status.insert("requests_count".into(), 5);
        let mut high = WorkerHandle::spawning_with_pid(1, 0, 11);
        high.boot(11);
        high.last_status.insert("requests_count".into(), 50);
        sup.workers = vec![low, high]; // 2 live, 3 configured -> one slot missing

        let promoted = sup.promote_mold();
        assert_eq!(promoted, Some(1));
        assert!(sup.mold.is_some());
        assert_eq!(sup.workers.len(), 1);
    }

    #[test]
    fn apply_message_boot_resolves_pid_and_decrements_counter() {
        let mut sup = supervisor();
        sup.workers = vec![WorkerHandle::spawning(0, 0)];
        sup.workers_not_booted = 1;
        let os = FakeOsProcess::new();
        sup.apply_message(WorkerMessage::Boot { pid: 42, index: 0 }, &os);
        assert_eq!(sup.workers[0].pid, Some(42));
        assert_eq!(sup.workers[0].stage, Stage::Booted);
        assert_eq!(sup.workers_not_booted, 0);
    }

    #[test]
    fn apply_message_idle_toggles_membership() {
        let mut sup = supervisor();
        let os = FakeOsProcess::new();
        sup.apply_message(WorkerMessage::Idle { pid: 7 }, &os);
        assert!(sup.idle_workers.contains(&7));
        sup.apply_message(WorkerMessage::Idle { pid: 7 }, &os);
        assert!(!sup.idle_workers.contains(&7));
    }

    #[test]
    fn phased_restart_bumps_phase_and_counts_refork_offset() {
        let mut sup = supervisor();
        sup.config.workers = 3;
        let os = FakeOsProcess::new();
        sup.begin_refork(&os);
        sup.apply_phased_restart();
        assert_eq!(sup.phase, 1);
        assert_eq!(sup.workers_not_booted, 2);
    }

    #[test]
    fn begin_refork_advances_busiest_worker_and_terms_mold() {
        let mut sup = supervisor();
        sup.config.workers = 2;
        sup.config.fork_worker = ForkWorker::Threshold(1000);
        let mut quiet = WorkerHandle::spawning_with_pid(0, 0, 10);
        quiet.boot(10);
        quiet.last_status.insert("requests_count".into(), 5);
        let mut busy = WorkerHandle::spawning_with_pid(1, 0, 11);
        busy.boot(11);
        busy.last_status.insert("requests_count".into(), 500);
        sup.workers = vec![quiet, busy];
        let mut mold = WorkerHandle::spawning_with_pid(2, 0, 20);
        mold.boot(20);
        sup.mold = Some(mold);

        let os = FakeOsProcess::new();
        os.mark_alive(20, true);
        sup.begin_refork(&os);

        assert_eq!(sup.workers[1].phase, 1);
        assert_eq!(sup.workers[0].phase, 0);
        assert_eq!(sup.mold.as_ref().unwrap().stage, Stage::Termed);
        assert_eq!(sup.phased_restart, PhasedRestart::Refork);
        assert_eq!(*os.signals_sent.lock().unwrap(), vec![(20, libc::SIGTERM)]);
    }

    #[test]
    fn phase_upgrade_never_picks_index_zero() {
        let mut sup = supervisor();
        sup.phase = 1;
        let mut zero = WorkerHandle::spawning_with_pid(0, 0, 10);
        zero.boot(10);
        let mut one = WorkerHandle::spawning_with_pid(1, 0, 11);
        one.boot(11);
        sup.workers = vec![zero, one];
        assert_eq!(sup.phase_upgrade_candidate(), Some(1));
    }

    #[test]
    fn recompute_next_check_picks_earliest_worker_deadline() {
        let mut sup = supervisor();
        sup.config.worker_timeout = 3600;
        let mut soon = WorkerHandle::spawning(0, 0);
        soon.boot(1);
        soon.last_checkin = Utc::now() - ChronoDuration::seconds(3599);
        let mut later = WorkerHandle::spawning(1, 0);
        later.boot(2);
        sup.workers = vec![soon.clone(), later];

        sup.recompute_next_check();

        assert_eq!(sup.next_check, soon.ping_timeout(&sup.config));
    }

    #[test]
    fn all_workers_idle_requires_every_worker_to_be_idle() {
        let mut sup = supervisor();
        let mut a = WorkerHandle::spawning_with_pid(0, 0, 1);
        a.boot(1);
        let mut b = WorkerHandle::spawning_with_pid(1, 0, 2);
        b.boot(2);
        sup.workers = vec![a, b];

        assert!(!sup.all_workers_idle());
        sup.idle_workers.insert(1);
        assert!(!sup.all_workers_idle());
        sup.idle_workers.insert(2);
        assert!(sup.all_workers_idle());
    }

    #[test]
    fn grow_and_shrink_clamp_at_one() {
        let mut sup = supervisor();
        sup.config.workers = 1;
        sup.shrink();
        assert_eq!(sup.config.workers, 1);
        sup.grow();
        assert_eq!(sup.config.workers, 2);
    }
}
