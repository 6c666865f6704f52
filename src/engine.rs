//! The pluggable server contract a worker process drives
//! (`spec.md` §6, "External interfaces").
//!
//! The cluster core never knows what an `Engine` actually serves — HTTP,
//! a queue consumer, anything with a run loop and some request-shaped
//! metrics. Each worker owns exactly one `Engine` instance, started
//! inside the fresh `tokio::Runtime` it builds after `fork()`.

use std::sync::Arc;

use tokio::task::JoinHandle;

/// Builds a fresh `Engine` for a newly-forked worker. Supplied by the
/// embedding application; the supervisor core is deliberately agnostic
/// to what it serves (`spec.md` §1 Out-of-scope). Shared by the master's
/// direct `fork()` path and a mold's `fork_pipe`-driven one, since both
/// need to construct a brand new `Engine` in the freshly forked child.
pub type EngineFactory = Arc<dyn Fn() -> Arc<dyn Engine> + Send + Sync>;

/// Implemented by the application embedding this crate. All methods run
/// on the worker's own tokio runtime, never the master's.
pub trait Engine: Send + Sync + 'static {
    /// Starts serving and returns a handle the worker awaits at shutdown.
    fn start(&self) -> JoinHandle<()>;

    /// Stops accepting new work immediately (used by `kill`-path teardown).
    fn stop(&self);

    /// Begins a graceful shutdown. `drain == true` means finish in-flight
    /// requests before returning; `false` means stop as soon as possible.
    fn begin_restart(&self, drain: bool);

    /// Requests queued but not yet being served.
    fn backlog(&self) -> i64;
    /// `true` once `start()` has completed its bind/listen step.
    fn running(&self) -> bool;
    /// Configured worker-thread pool size.
    fn pool_capacity(&self) -> i64;
    /// Hard ceiling on pool growth.
    fn max_threads(&self) -> i64;
    /// Monotonic lifetime request counter, reported in PING (`spec.md` §4.2).
    fn requests_count(&self) -> i64;
    /// Threads currently handling a request.
    fn busy_threads(&self) -> i64;
}

/// Minimal reference `Engine` used by this crate's own tests and
/// integration scenarios. Not meant for production use: it serves
/// nothing, just tracks the counters the protocol needs.
pub mod null_engine {
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    use tokio::task::JoinHandle;

    use super::Engine;

    #[derive(Default)]
    pub struct NullEngine {
        running: AtomicBool,
        requests_count: AtomicI64,
    }

    impl NullEngine {
        pub fn new() -> Self {
            Self::default()
        }

        /// Test hook: simulate a served request.
        pub fn serve_one(&self) {
            self.requests_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Engine for NullEngine {
        fn start(&self) -> JoinHandle<()> {
            self.running.store(true, Ordering::SeqCst);
            tokio::spawn(async {})
        }

        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn begin_restart(&self, _drain: bool) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn backlog(&self) -> i64 {
            0
        }

        fn running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn pool_capacity(&self) -> i64 {
            1
        }

        fn max_threads(&self) -> i64 {
            1
        }

        fn requests_count(&self) -> i64 {
            self.requests_count.load(Ordering::SeqCst)
        }

        fn busy_threads(&self) -> i64 {
            0
        }
    }
}
