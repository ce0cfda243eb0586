//! Worker runtime
//!
//! A worker is one child process running remotely supplied source through the
//! configured interpreter. The source is written once to a content-addressed
//! file, so identical sources share a script and source + env fully determine
//! what runs.
//!
//! The process talks back to the supervisor only through [`WorkerEvent`]s:
//! - every stdout line becomes a `Message`
//! - every stderr line becomes a `Diagnostic`
//! - a natural exit becomes `Exited`
//!
//! A hard kill requested through [`ExecutionHandle::terminate`] never produces
//! an `Exited` event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{HatcheryError, Result};

/// Line written to a worker's stdin before it is terminated
pub const CLEANUP_NOTICE: &str = "cleanup";

static SCRIPT_WRITES: AtomicU64 = AtomicU64::new(0);

/// Desired state of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub id: String,
    pub source: String,
    pub env: BTreeMap<String, String>,
    /// Respawn delay override in milliseconds
    pub reconnect_timeout_ms: Option<u64>,
}

/// Form persisted as the hash field value in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSpec {
    pub source: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(
        rename = "reconnectTimeout",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reconnect_timeout: Option<u64>,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            env: BTreeMap::new(),
            reconnect_timeout_ms: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_reconnect_timeout(mut self, ms: u64) -> Self {
        self.reconnect_timeout_ms = Some(ms);
        self
    }

    /// Rejects specs missing an id or source
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(HatcheryError::Validation("Missing worker _id.".to_string()));
        }
        if self.source.is_empty() {
            return Err(HatcheryError::Validation(
                "Missing worker source.".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before respawning after an unexpected exit; zero falls back to the default
    pub fn respawn_delay(&self, default: Duration) -> Duration {
        match self.reconnect_timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => default,
        }
    }

    pub fn to_stored(&self) -> StoredSpec {
        StoredSpec {
            source: self.source.clone(),
            env: self.env.clone(),
            reconnect_timeout: self.reconnect_timeout_ms,
        }
    }

    pub fn from_stored(id: &str, stored: StoredSpec) -> Self {
        Self {
            id: id.to_string(),
            source: stored.source,
            env: stored.env,
            reconnect_timeout_ms: stored.reconnect_timeout,
        }
    }
}

/// Notification from a running worker to its supervisor
#[derive(Debug)]
pub enum WorkerEvent {
    Message {
        id: String,
        generation: u64,
        line: String,
    },
    Diagnostic {
        id: String,
        generation: u64,
        line: String,
    },
    Exited {
        id: String,
        generation: u64,
        status: Option<ExitStatus>,
    },
}

/// Build a worker environment; later layers win on key conflicts
pub fn compose_env<I>(
    base: &HashMap<String, String>,
    marker: (&str, &Path),
    inherited: I,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = base
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.insert(marker.0.to_string(), marker.1.display().to_string());
    env.extend(inherited);
    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Variables of the supervisor process that are valid UTF-8
fn inherited_env() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

/// Live child process owned by exactly one registry entry
pub struct ExecutionHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

impl ExecutionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Best-effort out-of-band notice that the worker is about to be stopped
    pub async fn send_cleanup(&mut self) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        let line = format!("{CLEANUP_NOTICE}\n");
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(generation = self.generation, error = %e, "cleanup notice not delivered");
            return;
        }
        let _ = stdin.flush().await;
    }

    /// Hard-kill the process (if still running) and wait until it is reaped
    pub async fn terminate(mut self) {
        drop(self.stdin.take());
        if let Some(kill_tx) = self.kill_tx.take() {
            // Fails only when the monitor already saw a natural exit
            let _ = kill_tx.send(());
        }
        if let Err(e) = self.monitor.await {
            warn!(generation = self.generation, error = %e, "worker monitor task failed");
        }
    }
}

/// Starts worker processes and wires their output into the event channel
pub struct WorkerLauncher {
    config: WorkerConfig,
    dirname: PathBuf,
    events: mpsc::UnboundedSender<WorkerEvent>,
    next_generation: AtomicU64,
}

impl WorkerLauncher {
    pub fn new(config: WorkerConfig, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        let dirname = config.resolved_dirname();
        Self {
            config,
            dirname,
            events,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Path of the content-addressed script for a source
    pub fn script_path(&self, source: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        let name = if self.config.script_extension.is_empty() {
            digest
        } else {
            format!("{digest}.{}", self.config.script_extension)
        };
        self.config.scripts_dir.join(name)
    }

    async fn materialize(&self, source: &str) -> std::io::Result<PathBuf> {
        let path = self.script_path(source);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.config.scripts_dir).await?;
        // Write then rename so a concurrent launch never executes a partial file
        let seq = SCRIPT_WRITES.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp-{}-{seq}", std::process::id()));
        tokio::fs::write(&tmp, source).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    /// Start a new execution unit for `spec`
    pub async fn launch(&self, spec: &WorkerSpec) -> Result<ExecutionHandle> {
        let start_err = |reason: String| HatcheryError::WorkerStart {
            id: spec.id.clone(),
            reason,
        };

        let script = self
            .materialize(&spec.source)
            .await
            .map_err(|e| start_err(format!("cannot write script: {e}")))?;

        let env = compose_env(
            &self.config.base_env,
            (&self.config.dirname_var, &self.dirname),
            inherited_env(),
            &spec.env,
        );

        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&self.config.interpreter_args)
            .arg(&script)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| start_err(format!("failed to launch {}: {e}", self.config.interpreter)))?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let stdin = child.stdin.take();

        if let Some(stdout) = child.stdout.take() {
            let id = spec.id.clone();
            let events = self.events.clone();
            tokio::spawn(forward_lines(stdout, move |line| WorkerEvent::Message {
                id: id.clone(),
                generation,
                line,
            }, events));
        }
        if let Some(stderr) = child.stderr.take() {
            let id = spec.id.clone();
            let events = self.events.clone();
            tokio::spawn(forward_lines(stderr, move |line| WorkerEvent::Diagnostic {
                id: id.clone(),
                generation,
                line,
            }, events));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let id = spec.id.clone();
        let events = self.events.clone();
        let monitor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let status = match status {
                        Ok(status) => Some(status),
                        Err(e) => {
                            warn!(worker = %id, generation, error = %e, "failed to wait for worker");
                            None
                        }
                    };
                    let _ = events.send(WorkerEvent::Exited { id, generation, status });
                }
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!(worker = %id, generation, error = %e, "kill failed");
                    }
                    let _ = child.wait().await;
                    debug!(worker = %id, generation, "worker terminated");
                }
            }
        });

        info!(
            worker = %spec.id,
            generation,
            pid,
            script = %script.display(),
            "spawned worker"
        );

        Ok(ExecutionHandle {
            generation,
            pid,
            started_at: Utc::now(),
            stdin,
            kill_tx: Some(kill_tx),
            monitor,
        })
    }
}

async fn forward_lines<R, F>(reader: R, make: F, events: mpsc::UnboundedSender<WorkerEvent>)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> WorkerEvent,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if events.send(make(line)).is_err() {
            break;
        }
    }
}
