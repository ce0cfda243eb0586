//! Supervisor
//!
//! Reconciles locally running workers against the desired state held in the
//! remote store, applies control-plane mutations and respawns workers that
//! exit unexpectedly.
//!
//! ## Architecture
//! ```text
//! ControlAPI ──► upsert_worker / delete_worker ──► RemoteStore (hset / hdel)
//!                        │                               ▲
//!                        ▼                               │ hgetall
//!                  Registry (Mutex) ◄── reconcile_from_remote (boot)
//!                        ▲
//!                        │ Exited { id, generation }
//!   WorkerLauncher ──► event loop ──► on_worker_exit ──► respawn timer
//! ```
//!
//! ## Rules
//! - remote write first, local install second; a failed write leaves local state untouched
//! - mutations run on their own task, so a dropped caller never stops one halfway
//! - replacement holds the registry lock across teardown and install, so one id
//!   never has two live processes
//! - exit events carry the handle generation; events from a handle that is no
//!   longer registered are ignored
//! - a respawn timer re-checks membership and generation before launching

pub mod registry;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{HatcheryError, Result};
use crate::remote::RemoteStore;
use crate::worker::{StoredSpec, WorkerEvent, WorkerLauncher, WorkerSpec};

pub use registry::{WorkerState, WorkerSummary};
use registry::{Registry, WorkerEntry};

/// Owner of the worker registry
pub struct Supervisor {
    id: String,
    key_prefix: String,
    store: Arc<dyn RemoteStore>,
    launcher: WorkerLauncher,
    registry: Mutex<Registry>,
    respawn_timeout: Duration,
    reconcile_retry: Duration,
    cleanup_grace: Duration,
    me: Weak<Supervisor>,
}

impl Supervisor {
    /// Create a supervisor and start its worker event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &AppConfig, store: Arc<dyn RemoteStore>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new_cyclic(|me| Self {
            id: config.supervisor.id.clone(),
            key_prefix: config.supervisor.key_prefix.clone(),
            store,
            launcher: WorkerLauncher::new(config.worker.clone(), events_tx),
            registry: Mutex::new(Registry::new()),
            respawn_timeout: config.supervisor.respawn_timeout(),
            reconcile_retry: config.supervisor.reconcile_retry(),
            cleanup_grace: config.worker.cleanup_grace(),
            me: me.clone(),
        });

        supervisor.spawn_event_loop(events_rx);
        supervisor
    }

    /// This supervisor's identity
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote hash holding this supervisor's desired state
    pub fn key(&self) -> String {
        format!("{}:{}:workers", self.key_prefix, self.id)
    }

    fn spawn_event_loop(&self, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(supervisor) = me.upgrade() else {
                    break;
                };
                supervisor.handle_event(event).await;
            }
            debug!("worker event loop stopped");
        });
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message { id, generation, line } => {
                info!(worker = %id, generation, "{}", line);
            }
            WorkerEvent::Diagnostic { id, generation, line } => {
                warn!(worker = %id, generation, "{}", line);
            }
            WorkerEvent::Exited { id, generation, status } => {
                self.on_worker_exit(&id, generation, status).await;
            }
        }
    }

    async fn on_worker_exit(
        &self,
        id: &str,
        generation: u64,
        status: Option<std::process::ExitStatus>,
    ) {
        let mut registry = self.registry.lock().await;
        let Some(entry) = registry.get_mut(id) else {
            debug!(worker = %id, generation, "exit of unregistered worker ignored");
            return;
        };
        if entry.generation() != Some(generation) {
            debug!(worker = %id, generation, "exit of replaced worker ignored");
            return;
        }
        if entry.pending_respawn.is_some() {
            return;
        }

        let delay = entry.spec.respawn_delay(self.respawn_timeout);
        warn!(
            worker = %id,
            generation,
            status = ?status,
            delay_ms = delay.as_millis() as u64,
            "worker exited unexpectedly, respawn scheduled"
        );
        entry.pending_respawn = Some(self.schedule_respawn(id, Some(generation), delay));
    }

    /// Arm a one-shot respawn for `id`, valid only while its generation is unchanged
    fn schedule_respawn(
        &self,
        id: &str,
        expected_generation: Option<u64>,
        delay: Duration,
    ) -> JoinHandle<()> {
        let me = self.me.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(supervisor) = me.upgrade() {
                supervisor.respawn(&id, expected_generation).await;
            }
        })
    }

    async fn respawn(&self, id: &str, expected_generation: Option<u64>) {
        let mut registry = self.registry.lock().await;
        let Some(entry) = registry.get_mut(id) else {
            debug!(worker = %id, "worker removed before respawn");
            return;
        };
        if entry.generation() != expected_generation {
            debug!(worker = %id, "worker replaced before respawn");
            return;
        }

        // This task is the timer; detach rather than abort it
        drop(entry.pending_respawn.take());
        if let Some(old) = entry.execution.take() {
            old.terminate().await;
        }

        match self.launcher.launch(&entry.spec).await {
            Ok(handle) => {
                entry.restarts += 1;
                info!(
                    worker = %id,
                    generation = handle.generation(),
                    restarts = entry.restarts,
                    "worker respawned"
                );
                entry.execution = Some(handle);
            }
            Err(e) => {
                let delay = entry.spec.respawn_delay(self.respawn_timeout);
                error!(worker = %id, error = %e, "respawn failed, retrying");
                entry.pending_respawn = Some(self.schedule_respawn(id, None, delay));
            }
        }
    }

    /// Tear down any current runtime for `spec.id` and start a fresh one.
    ///
    /// With a `fence`, nothing happens if the control plane touched the id
    /// after that sequence number. Returns whether the worker was installed.
    async fn install(&self, spec: WorkerSpec, fence: Option<u64>) -> bool {
        let mut registry = self.registry.lock().await;

        match fence {
            Some(seq) if registry.touched_since(&spec.id, seq) => {
                debug!(worker = %spec.id, "stale desired state skipped");
                return false;
            }
            Some(_) => {}
            None => registry.touch(&spec.id),
        }

        if let Some(mut old) = registry.remove(&spec.id) {
            if let Some(execution) = old.execution.take() {
                debug!(worker = %spec.id, generation = execution.generation(), "replacing worker");
                execution.terminate().await;
            }
        }

        let mut entry = WorkerEntry::new(spec);
        match self.launcher.launch(&entry.spec).await {
            Ok(handle) => entry.execution = Some(handle),
            Err(e) => {
                let delay = entry.spec.respawn_delay(self.respawn_timeout);
                error!(
                    worker = %entry.spec.id,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "worker failed to start, respawn scheduled"
                );
                entry.pending_respawn = Some(self.schedule_respawn(&entry.spec.id, None, delay));
            }
        }
        registry.insert(entry);
        true
    }

    /// Run a control-plane mutation on its own task.
    ///
    /// The mutation spans a remote write and a local install; it must finish
    /// even when the caller's future is dropped halfway (e.g. the HTTP client
    /// disconnected), or the two sides diverge.
    async fn detached<F, Fut, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let me = self.me.upgrade().ok_or(HatcheryError::ShuttingDown)?;
        tokio::spawn(work(me)).await?
    }

    /// Persist a worker spec remotely, then (re)start it locally.
    ///
    /// Runs to completion even if the returned future is dropped.
    pub async fn upsert_worker(&self, spec: WorkerSpec) -> Result<()> {
        spec.validate()?;
        self.detached(|me| async move { me.apply_upsert(spec).await })
            .await
    }

    async fn apply_upsert(&self, spec: WorkerSpec) -> Result<()> {
        let record = serde_json::to_string(&spec.to_stored())?;
        self.store.hset(&self.key(), &spec.id, &record).await?;

        info!(worker = %spec.id, "worker spec stored");
        self.install(spec, None).await;
        Ok(())
    }

    /// Remove a worker remotely, then stop it locally. Idempotent.
    ///
    /// Runs to completion even if the returned future is dropped. The entry
    /// leaves the registry before the cleanup grace period, so an upsert of
    /// the same id during that window may start its process while the
    /// deleted one is still exiting.
    pub async fn delete_worker(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(HatcheryError::Validation("Missing worker _id.".to_string()));
        }
        let id = id.to_string();
        self.detached(|me| async move { me.apply_delete(&id).await })
            .await
    }

    async fn apply_delete(&self, id: &str) -> Result<()> {
        self.store.hdel(&self.key(), id).await?;

        let removed = {
            let mut registry = self.registry.lock().await;
            registry.touch(id);
            registry.remove(id)
        };

        let Some(mut entry) = removed else {
            debug!(worker = %id, "delete of unknown worker");
            return Ok(());
        };

        if let Some(mut execution) = entry.execution.take() {
            execution.send_cleanup().await;
            tokio::time::sleep(self.cleanup_grace).await;
            execution.terminate().await;
        }
        info!(worker = %id, "worker deleted");
        Ok(())
    }

    /// Snapshot of all registered workers
    pub async fn list_workers(&self) -> BTreeMap<String, WorkerSummary> {
        self.registry.lock().await.snapshot()
    }

    /// Summary of one worker, if registered
    pub async fn worker(&self, id: &str) -> Option<WorkerSummary> {
        self.registry.lock().await.get(id).map(WorkerEntry::summary)
    }

    /// Number of registered workers
    pub async fn worker_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Forward a ping to the remote store
    pub async fn ping_remote(&self) -> Result<String> {
        self.store.ping().await
    }

    /// One pass of boot reconciliation; returns how many workers were started
    pub async fn reconcile_once(&self) -> Result<usize> {
        let fence = self.registry.lock().await.seq();
        let desired = self.store.hgetall(&self.key()).await?;

        let mut started = 0;
        for (id, raw) in desired {
            let stored = match serde_json::from_str::<StoredSpec>(&raw) {
                Ok(stored) => stored,
                Err(e) => {
                    error!(worker = %id, error = %e, "unreadable worker spec skipped");
                    continue;
                }
            };
            let spec = WorkerSpec::from_stored(&id, stored);
            if let Err(e) = spec.validate() {
                error!(worker = %id, error = %e, "invalid worker spec skipped");
                continue;
            }
            if self.install(spec, Some(fence)).await {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Pull the full desired state, retrying on a fixed delay until it succeeds
    pub async fn reconcile_from_remote(&self) {
        loop {
            match self.reconcile_once().await {
                Ok(started) => {
                    info!(started, "boot reconciliation complete");
                    return;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_ms = self.reconcile_retry.as_millis() as u64,
                        "boot reconciliation failed"
                    );
                    tokio::time::sleep(self.reconcile_retry).await;
                }
            }
        }
    }

    /// Stop every local worker. Remote state is left intact.
    pub async fn shutdown(&self) {
        let entries = {
            let mut registry = self.registry.lock().await;
            if registry.is_empty() {
                return;
            }
            registry.drain()
        };

        info!(count = entries.len(), "stopping workers");
        for mut entry in entries {
            if let Some(execution) = entry.execution.take() {
                execution.terminate().await;
            }
        }
    }
}
