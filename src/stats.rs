//! Aggregated master view (`spec.md` §4.5): the snapshot returned to
//! whatever control surface (CLI, control socket) an embedder wires up.
//! Deliberately just a data shape — producing one from live state lives
//! in `supervisor.rs`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::worker_handle::{Stage, WorkerHandle};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub index: u32,
    pub pid: Option<i32>,
    pub phase: u64,
    pub started_at: DateTime<Utc>,
    pub booted: bool,
    pub last_checkin: DateTime<Utc>,
    pub last_status: HashMap<String, i64>,
}

impl From<&WorkerHandle> for WorkerStats {
    fn from(handle: &WorkerHandle) -> Self {
        WorkerStats {
            index: handle.index,
            pid: handle.pid,
            phase: handle.phase,
            started_at: handle.started_at,
            booted: handle.stage != Stage::Spawning,
            last_checkin: handle.last_checkin,
            last_status: handle.last_status.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub started_at: DateTime<Utc>,
    pub configured_workers: u32,
    pub phase: u64,
    pub booted_workers: usize,
    pub old_phase_workers: usize,
    pub workers: Vec<WorkerStats>,
}

impl ClusterStats {
    /// Builds a snapshot from the master's live handle set. Called with
    /// an empty `handles` slice in a child process, per §4.5.
    pub fn snapshot(
        started_at: DateTime<Utc>,
        configured_workers: u32,
        phase: u64,
        handles: &[WorkerHandle],
    ) -> Self {
        let booted_workers = handles
            .iter()
            .filter(|h| h.stage != Stage::Spawning)
            .count();
        let old_phase_workers = handles.iter().filter(|h| h.phase != phase).count();
        ClusterStats {
            started_at,
            configured_workers,
            phase,
            booted_workers,
            old_phase_workers,
            workers: handles.iter().map(WorkerStats::from).collect(),
        }
    }
}
