//! Child-side run loop (`spec.md` §4.2): serve, ping, obey the master's
//! restart/term/mold signals, and — once promoted — fork further
//! workers. Grounded on `process_manager.rs`'s pattern of a dedicated
//! thread per concern (I/O pump, reaper) feeding state back through
//! shared, lock-guarded structures.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use dusa_collection_utils::core::errors::ErrorArrayItem;
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{fork, ForkResult};
use serde_json::Value;

use crate::config::ClusterConfig;
use crate::engine::{Engine, EngineFactory};
use crate::errors;
use crate::hooks::Hooks;
use crate::os_process::{process_title, OsProcess};
use crate::pipe_protocol::{self, ForkRequest, WorkerMessage};

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);
static MOLD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_: libc::c_int) {
    TERM_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigurg(_: libc::c_int) {
    MOLD_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs the per-worker signal policy from §4.2 contract item 1:
/// SIGINT ignored, SIGCHLD left default, SIGTERM always handled, SIGURG
/// handled only when fork-worker mode is enabled.
pub fn install_worker_signal_policy(fork_worker_enabled: bool) -> Result<(), ErrorArrayItem> {
    unsafe {
        sigaction(
            Signal::SIGINT,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )
        .map_err(|e| errors::transient_io(format!("sigaction(SIGINT) failed: {e}")))?;
        sigaction(
            Signal::SIGTERM,
            &SigAction::new(
                SigHandler::Handler(on_sigterm),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            ),
        )
        .map_err(|e| errors::transient_io(format!("sigaction(SIGTERM) failed: {e}")))?;
        if fork_worker_enabled {
            sigaction(
                Signal::SIGURG,
                &SigAction::new(
                    SigHandler::Handler(on_sigurg),
                    SaFlags::SA_RESTART,
                    SigSet::empty(),
                ),
            )
            .map_err(|e| errors::transient_io(format!("sigaction(SIGURG) failed: {e}")))?;
        }
    }
    Ok(())
}

/// The "single-element signal restart-server gate" from `spec.md` §9:
/// a counted queue of `{Continue, Stop}` the main thread drains to
/// decide whether to run the serving engine again.
pub struct RestartGate {
    queue: Mutex<VecDeque<bool>>,
    cvar: Condvar,
}

impl RestartGate {
    /// Starts primed `[true, false]` so the server runs exactly once
    /// before the worker needs a fresh restart request.
    pub fn new() -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(true);
        queue.push_back(false);
        RestartGate {
            queue: Mutex::new(queue),
            cvar: Condvar::new(),
        }
    }

    /// `begin_restart`: clear the queue and repush `[true, false]`.
    pub fn request_restart(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.clear();
        queue.push_back(true);
        queue.push_back(false);
        self.cvar.notify_all();
    }

    /// Drains one value, blocking until one is available.
    pub fn pop(&self) -> bool {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(v) = queue.pop_front() {
                return v;
            }
            queue = self.cvar.wait(queue).unwrap();
        }
    }
}

impl Default for RestartGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker process needs that isn't the engine itself.
pub struct WorkerContext {
    pub index: u32,
    pub phase: u64,
    pub master_pid: i32,
    pub config: ClusterConfig,
    pub hooks: Hooks,
    /// Builds a fresh `Engine`; carried along so a promoted mold can
    /// build one for every worker it forks (`spec.md` §4.2 item 8).
    pub engine_factory: EngineFactory,
    /// Write end of `worker_write`, shared with the master.
    pub worker_write: RawFd,
    /// Read end of `check_pipe`; EOF means the master died.
    pub check_pipe: RawFd,
    /// Read end of `fork_pipe`, present only once this worker molds.
    pub fork_pipe: Option<RawFd>,
}

fn metrics_payload(engine: &dyn Engine) -> Value {
    serde_json::json!({
        "backlog": engine.backlog(),
        "running": engine.running(),
        "pool_capacity": engine.pool_capacity(),
        "max_threads": engine.max_threads(),
        "requests_count": engine.requests_count(),
        "busy_threads": engine.busy_threads(),
    })
}

fn send_message(fd: RawFd, message: WorkerMessage) {
    let _ = pipe_protocol::send(fd, &message);
}

/// Blocks on `check_pipe` readability; on EOF the master is gone and
/// `spec.md` §4.2 item 1 mandates an immediate `exit(1)`.
fn spawn_parent_watchdog(check_pipe: RawFd) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 1];
        loop {
            match nix::unistd::read(check_pipe, &mut buf) {
                Ok(0) => {
                    log!(LogLevel::Error, "parent died, exiting");
                    process::exit(1);
                }
                Ok(_) => continue, // stray byte; keep watching for EOF
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => {
                    process::exit(1);
                }
            }
        }
    })
}

/// The stat-ping thread from §4.2 item 5: writes PING at every
/// `worker_check_interval` with the engine's current metrics.
fn spawn_stat_thread(
    worker_write: RawFd,
    pid: i32,
    interval: Duration,
    engine: Arc<dyn Engine>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(interval);
            if stop.load(Ordering::SeqCst) {
                break;
            }
            send_message(
                worker_write,
                WorkerMessage::Ping {
                    pid,
                    metrics: metrics_payload(engine.as_ref()),
                },
            );
        }
    })
}

/// Runs the worker contract to completion; always exits the process
/// rather than returning. The caller must invoke this with a tokio
/// runtime already entered on the current thread (so `Engine::start`'s
/// `tokio::spawn` works) without driving it via `block_on` — this
/// function does its own blocking with plain `std::thread` primitives.
pub fn run(ctx: WorkerContext, engine: Arc<dyn Engine>, os: &dyn OsProcess) -> ! {
    let fork_worker_enabled = ctx.config.fork_worker.enabled();
    if let Err(e) = install_worker_signal_policy(fork_worker_enabled) {
        log!(LogLevel::Error, "failed to install signal policy: {e}");
        process::exit(1);
    }

    let title = process_title(
        &ctx.config.app_name,
        "worker",
        ctx.index,
        ctx.master_pid,
        ctx.config.tag.as_deref(),
    );
    os.set_process_title(&title);

    let watchdog = spawn_parent_watchdog(ctx.check_pipe);

    let mut log_sink = std::io::stderr();
    ctx.hooks
        .before_worker_boot(ctx.index, &mut log_sink, &Value::Null);

    let pid = process::id() as i32;
    let gate = RestartGate::new();
    let stat_stop = Arc::new(AtomicBool::new(false));
    let stat_thread = spawn_stat_thread(
        ctx.worker_write,
        pid,
        Duration::from_secs(ctx.config.worker_check_interval),
        engine.clone(),
        stat_stop.clone(),
    );

    let mut sent_boot = false;
    let mut promote_to_mold = false;

    while gate.pop() {
        let handle = engine.start();
        if !sent_boot {
            send_message(
                ctx.worker_write,
                WorkerMessage::Boot { pid, index: ctx.index },
            );
            sent_boot = true;
        }

        loop {
            if handle.is_finished() {
                break;
            }
            if TERM_REQUESTED.load(Ordering::SeqCst) {
                send_message(ctx.worker_write, WorkerMessage::ExternalTerm { pid });
                engine.stop();
                break;
            }
            if fork_worker_enabled
                && ctx.index == 0
                && MOLD_REQUESTED.swap(false, Ordering::SeqCst)
            {
                engine.begin_restart(true);
                promote_to_mold = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        if TERM_REQUESTED.load(Ordering::SeqCst) || promote_to_mold {
            break;
        }
        gate.request_restart();
    }

    stat_stop.store(true, Ordering::SeqCst);
    let _ = stat_thread.join();

    if promote_to_mold {
        mold_loop(&ctx, os, &mut log_sink);
    }

    send_message(ctx.worker_write, WorkerMessage::Term { pid });
    let _ = watchdog; // daemon-style; the process exits out from under it
    process::exit(0);
}

/// §4.2 item 8: once promoted, a worker stops serving and becomes a
/// pure fork dispatcher reading indices off `fork_pipe`.
fn mold_loop(ctx: &WorkerContext, os: &dyn OsProcess, log_sink: &mut dyn std::io::Write) {
    ctx.hooks.on_mold_promotion(ctx.index, log_sink, &Value::Null);

    let Some(fork_pipe) = ctx.fork_pipe else {
        return;
    };

    // Mold installs its own SIGTERM handler that closes fork_pipe's
    // read end; modeled here as TERM_REQUESTED breaking the loop, the
    // fd itself is closed by the caller on the way out.
    loop {
        if TERM_REQUESTED.load(Ordering::SeqCst) {
            break;
        }
        // Keep pinging so the master's ping_timeout doesn't fire on the
        // mold while it waits for fork requests (§4.2 item 8).
        send_message(
            ctx.worker_write,
            WorkerMessage::Ping {
                pid: process::id() as i32,
                metrics: serde_json::json!({"requests_count": 0}),
            },
        );

        match read_fork_request(fork_pipe) {
            MoldPipeEvent::Request(ForkRequest::ForkWorker(idx)) => {
                fork_new_worker(ctx, idx, os)
            }
            MoldPipeEvent::Request(ForkRequest::BeginRefork) => {
                ctx.hooks.before_refork(ctx.index, log_sink, &Value::Null);
            }
            MoldPipeEvent::Request(ForkRequest::ReforkComplete) => {
                ctx.hooks.after_refork(ctx.index, log_sink, &Value::Null);
            }
            MoldPipeEvent::Request(ForkRequest::RestartServer) | MoldPipeEvent::NoData => {}
            MoldPipeEvent::Closed => break,
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    ctx.hooks.on_mold_shutdown(ctx.index, log_sink, &Value::Null);
}

enum MoldPipeEvent {
    Request(ForkRequest),
    NoData,
    Closed,
}

/// `fork_pipe` is opened non-blocking; EOF (peer closed, i.e. master
/// gone) is distinguished from "nothing to read yet" so the mold knows
/// when to run `on_mold_shutdown` and exit (§4.2 item 8).
fn read_fork_request(fork_pipe: RawFd) -> MoldPipeEvent {
    let mut buf = [0u8; 64];
    match nix::unistd::read(fork_pipe, &mut buf) {
        Ok(0) => MoldPipeEvent::Closed,
        Ok(n) => {
            let line = String::from_utf8_lossy(&buf[..n]);
            match ForkRequest::decode(line.trim()) {
                Ok(req) => MoldPipeEvent::Request(req),
                Err(_) => MoldPipeEvent::NoData,
            }
        }
        Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => MoldPipeEvent::NoData,
        Err(_) => MoldPipeEvent::Closed,
    }
}

/// `fork()`s a fresh worker off the mold and reports it upstream with
/// a FORK message, per §4.2 item 8. The spawned child never returns
/// from this function: it rebuilds its own tokio runtime and `Engine`
/// and runs the worker contract from the top, exactly as a direct
/// master fork would (`spec.md` §4.4 item 5, "passing pipes unchanged").
fn fork_new_worker(ctx: &WorkerContext, index: u32, os: &dyn OsProcess) {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            send_message(
                ctx.worker_write,
                WorkerMessage::Fork {
                    pid: child.as_raw(),
                    index,
                },
            );
        }
        Ok(ForkResult::Child) => {
            let child_ctx = WorkerContext {
                index,
                phase: ctx.phase,
                master_pid: ctx.master_pid,
                config: ctx.config.clone(),
                hooks: ctx.hooks.clone(),
                engine_factory: ctx.engine_factory.clone(),
                worker_write: ctx.worker_write,
                check_pipe: ctx.check_pipe,
                fork_pipe: None,
            };
            let engine = (child_ctx.engine_factory)();
            let runtime = tokio::runtime::Runtime::new()
                .expect("failed to build per-worker tokio runtime");
            let _guard = runtime.enter();
            run(child_ctx, engine, os);
        }
        Err(e) => {
            log!(LogLevel::Error, "fork_new_worker failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_gate_runs_exactly_once_before_blocking() {
        let gate = RestartGate::new();
        assert!(gate.pop());
        assert!(!gate.pop());
    }

    #[test]
    fn request_restart_reprimes_the_gate() {
        let gate = RestartGate::new();
        assert!(gate.pop());
        assert!(!gate.pop());
        gate.request_restart();
        assert!(gate.pop());
        assert!(!gate.pop());
    }

    #[test]
    fn metrics_payload_reports_all_engine_fields() {
        let engine = crate::engine::null_engine::NullEngine::new();
        engine.serve_one();
        let payload = metrics_payload(&engine);
        assert_eq!(payload["requests_count"], 1);
        assert_eq!(payload["pool_capacity"], 1);
    }
}
