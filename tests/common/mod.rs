#![allow(dead_code)]

use async_trait::async_trait;
use hatchery::config::{AppConfig, WorkerConfig};
use hatchery::error::{HatcheryError, Result};
use hatchery::remote::RemoteStore;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Remote store backed by a local map
#[derive(Default)]
pub struct MemoryStore {
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    failing: AtomicBool,
    writes: AtomicUsize,
    reads_started: AtomicUsize,
    read_gate: tokio::sync::Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(self, key: &str, field: &str, value: &str) -> Self {
        self.hashes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold back `hgetall` replies until the guard is dropped.
    /// The reply is the snapshot taken when the read began.
    pub async fn hold_reads(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.read_gate.lock().await
    }

    pub fn reads_started(&self) -> usize {
        self.reads_started.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn field(&self, key: &str, field: &str) -> Option<String> {
        self.hashes
            .lock()
            .unwrap()
            .get(key)
            .and_then(|hash| hash.get(field).cloned())
    }

    pub fn fields(&self, key: &str) -> HashMap<String, String> {
        self.hashes
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HatcheryError::RemoteUnavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check()?;
        let snapshot = self.fields(key);
        self.reads_started.fetch_add(1, Ordering::SeqCst);
        let _gate = self.read_gate.lock().await;
        Ok(snapshot)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.hashes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(hash) = self.hashes.lock().unwrap().get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<String> {
        self.check()?;
        Ok("PONG".to_string())
    }
}

/// Supervisor config running sources through `sh` out of a temporary directory
pub fn test_config(id: &str) -> (AppConfig, TempDir) {
    let scripts = tempfile::tempdir().unwrap();
    let mut config = AppConfig::for_supervisor(id, "http://127.0.0.1:9/");
    config.supervisor.respawn_timeout_ms = 200;
    config.supervisor.reconcile_retry_ms = 50;
    config.worker = WorkerConfig {
        interpreter: "sh".to_string(),
        script_extension: "sh".to_string(),
        scripts_dir: scripts.path().join("scripts"),
        dirname: Some(PathBuf::from("/opt/hatchery")),
        cleanup_grace_ms: 200,
        ..WorkerConfig::default()
    };
    (config, scripts)
}

pub fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

pub async fn read_file(path: &Path) -> String {
    tokio::fs::read_to_string(path).await.unwrap_or_default()
}

/// Poll `check` every 20ms until it holds or `limit` elapses
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
