//! Lifecycle hook points an embedding application can install
//! (`spec.md` §6). Mirrors Puma's `Events`/hook table: every hook is an
//! optional closure invoked with the worker `index`, a writer to log
//! through, and a small JSON blob of hook-specific data.

use std::io::Write;
use std::sync::Arc;

use serde_json::Value;

/// `(worker_index, log_writer, hook_data)`.
pub type Hook = Arc<dyn Fn(u32, &mut dyn Write, &Value) + Send + Sync>;

/// One slot per hook point named in `spec.md` §6. All optional; a
/// missing hook is a no-op.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Runs once in the master before the first worker is forked.
    pub before_fork: Option<Hook>,
    /// Runs in the master immediately before forking a given worker.
    pub before_worker_fork: Option<Hook>,
    /// Runs in the master immediately after forking, still pre-boot.
    pub after_worker_fork: Option<Hook>,
    /// Runs in the child, before `Engine::start` is called.
    pub before_worker_boot: Option<Hook>,
    /// Runs in the worker about to become a mold, before it stops serving.
    pub before_refork: Option<Hook>,
    /// Runs in the mold after a refork cycle completes.
    pub after_refork: Option<Hook>,
    /// Runs when a worker is promoted to mold (fork-worker mode).
    pub on_mold_promotion: Option<Hook>,
    /// Runs when the mold is torn down and reverts to serving directly.
    pub on_mold_shutdown: Option<Hook>,
    /// Runs in the worker just before it begins its shutdown sequence.
    pub before_worker_shutdown: Option<Hook>,
}

macro_rules! invoke {
    ($name:ident) => {
        /// Invokes the hook if set; a no-op otherwise.
        pub fn $name(&self, index: u32, log: &mut dyn Write, data: &Value) {
            if let Some(hook) = &self.$name {
                hook(index, log, data);
            }
        }
    };
}

impl Hooks {
    invoke!(before_fork);
    invoke!(before_worker_fork);
    invoke!(after_worker_fork);
    invoke!(before_worker_boot);
    invoke!(before_refork);
    invoke!(after_refork);
    invoke!(on_mold_promotion);
    invoke!(on_mold_shutdown);
    invoke!(before_worker_shutdown);
}
