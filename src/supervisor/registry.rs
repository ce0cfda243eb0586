//! Worker registry
//!
//! In-memory map from worker id to its runtime record, owned by the
//! [`Supervisor`](super::Supervisor) and only touched under its lock.
//!
//! ## Rules
//! - membership implies a live process or a pending respawn timer
//! - `remove` cancels the entry's timer in the same step, so a removed id can
//!   never re-arm
//! - every control-plane mutation bumps a per-id sequence number, letting a
//!   slow boot reconciliation detect that its data is stale for that id

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::task::JoinHandle;

use crate::worker::{ExecutionHandle, WorkerSpec};

/// Observable lifecycle state of a registered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    RespawnScheduled,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Running => write!(f, "running"),
            WorkerState::RespawnScheduled => write!(f, "respawn_scheduled"),
        }
    }
}

/// Read-only view of one worker as served by `GET /workers`
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub source: String,
    pub env: BTreeMap<String, String>,
    #[serde(rename = "reconnectTimeout")]
    pub reconnect_timeout: Option<u64>,
    pub state: WorkerState,
    pub pid: Option<u32>,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    pub restarts: u32,
}

/// Runtime record for one worker id
pub(crate) struct WorkerEntry {
    pub spec: WorkerSpec,
    pub execution: Option<ExecutionHandle>,
    pub pending_respawn: Option<JoinHandle<()>>,
    pub restarts: u32,
}

impl WorkerEntry {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            execution: None,
            pending_respawn: None,
            restarts: 0,
        }
    }

    /// Generation of the current execution handle, if any
    pub fn generation(&self) -> Option<u64> {
        self.execution.as_ref().map(ExecutionHandle::generation)
    }

    pub fn cancel_respawn(&mut self) {
        if let Some(timer) = self.pending_respawn.take() {
            timer.abort();
        }
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            id: self.spec.id.clone(),
            source: self.spec.source.clone(),
            env: self.spec.env.clone(),
            reconnect_timeout: self.spec.reconnect_timeout_ms,
            state: if self.pending_respawn.is_some() {
                WorkerState::RespawnScheduled
            } else {
                WorkerState::Running
            },
            pid: self.execution.as_ref().and_then(ExecutionHandle::pid),
            started_at: self.execution.as_ref().map(ExecutionHandle::started_at),
            restarts: self.restarts,
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    workers: HashMap<String, WorkerEntry>,
    touched: HashMap<String, u64>,
    seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current control-plane sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Record a control-plane mutation of `id`
    pub fn touch(&mut self, id: &str) {
        self.seq += 1;
        self.touched.insert(id.to_string(), self.seq);
    }

    /// True if `id` was mutated by the control plane after `seq`
    pub fn touched_since(&self, id: &str, seq: u64) -> bool {
        self.touched.get(id).is_some_and(|&s| s > seq)
    }

    pub fn get(&self, id: &str) -> Option<&WorkerEntry> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkerEntry> {
        self.workers.get_mut(id)
    }

    /// Insert an entry; the caller must have removed any previous one
    pub fn insert(&mut self, entry: WorkerEntry) {
        let id = entry.spec.id.clone();
        if let Some(mut displaced) = self.workers.insert(id, entry) {
            displaced.cancel_respawn();
        }
    }

    /// Remove an entry and cancel its pending respawn in one step
    pub fn remove(&mut self, id: &str) -> Option<WorkerEntry> {
        let mut entry = self.workers.remove(id)?;
        entry.cancel_respawn();
        Some(entry)
    }

    /// Remove every entry, cancelling all timers
    pub fn drain(&mut self) -> Vec<WorkerEntry> {
        self.workers
            .drain()
            .map(|(_, mut entry)| {
                entry.cancel_respawn();
                entry
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Consistent id-ordered snapshot of all workers
    pub fn snapshot(&self) -> BTreeMap<String, WorkerSummary> {
        self.workers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.summary()))
            .collect()
    }
}
