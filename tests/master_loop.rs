//! Exercises the real `Supervisor::run` master loop (`spec.md` §4.4):
//! boots a worker through a real `fork()`, then simulates a SIGINT by
//! writing straight to the wakeup pipe the way `signal::handle_signal`
//! would, and confirms the loop itself notices and returns.

use std::os::fd::{BorrowedFd, IntoRawFd};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cluster_supervisor::config::ClusterConfig;
use cluster_supervisor::engine::null_engine::NullEngine;
use cluster_supervisor::engine::{Engine, EngineFactory};
use cluster_supervisor::hooks::Hooks;
use cluster_supervisor::os_process::RealOsProcess;
use cluster_supervisor::signal::{create_wakeup_pipe, make_nonblocking, SignalKind};
use cluster_supervisor::supervisor::{MasterPipes, Status, Supervisor};

#[test]
fn run_loop_boots_a_worker_and_exits_on_simulated_sigint() {
    let (worker_write_read, worker_write_write) = nix::unistd::pipe().unwrap();
    let (check_pipe_read, check_pipe_write) = nix::unistd::pipe().unwrap();
    let worker_write_read = worker_write_read.into_raw_fd();
    let worker_write_write = worker_write_write.into_raw_fd();
    let check_pipe_read = check_pipe_read.into_raw_fd();
    let check_pipe_write = check_pipe_write.into_raw_fd();
    make_nonblocking(worker_write_read).unwrap();
    let (wakeup_read, wakeup_write) = create_wakeup_pipe().unwrap();

    let config = ClusterConfig {
        workers: 1,
        ..ClusterConfig::default()
    };
    let mut supervisor = Supervisor::new(config, Hooks::default());
    let os = RealOsProcess;
    let engine_factory: EngineFactory = Arc::new(|| Arc::new(NullEngine::new()) as Arc<dyn Engine>);
    let master_pid = std::process::id() as i32;
    let pipes = MasterPipes {
        worker_write_read,
        worker_write_for_children: worker_write_write,
        check_pipe_for_children: check_pipe_read,
        wakeup_read,
    };

    let (tx, rx) = mpsc::channel();
    let join_handle = thread::spawn(move || {
        let result = supervisor.run(&os, &engine_factory, master_pid, pipes);
        tx.send(supervisor).expect("test harness still listening");
        result
    });

    thread::sleep(Duration::from_millis(300));
    nix::unistd::write(
        unsafe { BorrowedFd::borrow_raw(wakeup_write) },
        &[SignalKind::Int.byte()],
    )
    .unwrap();

    let result = join_handle
        .join()
        .expect("master loop thread should not panic");
    assert!(result.is_ok(), "run() should return Ok on SIGINT: {result:?}");

    let mut supervisor = rx.recv().expect("run() should hand the supervisor back");
    assert_eq!(supervisor.status, Status::Stop);
    assert_eq!(supervisor.workers.len(), 1);
    assert!(supervisor.workers[0].pid.is_some());

    supervisor
        .stop_workers(&RealOsProcess)
        .expect("workers should wind down");

    let _ = nix::unistd::close(worker_write_read);
    let _ = nix::unistd::close(worker_write_write);
    let _ = nix::unistd::close(check_pipe_read);
    let _ = nix::unistd::close(check_pipe_write);
    let _ = nix::unistd::close(wakeup_read);
    let _ = nix::unistd::close(wakeup_write);
}
