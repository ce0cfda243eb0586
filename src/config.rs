use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Identity of this supervisor; also namespaces the remote hash key
    #[serde(default)]
    pub id: String,
    /// First segment of the remote hash key `<prefix>:<id>:workers`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Default delay before respawning an exited worker (ms)
    #[serde(default = "default_respawn_timeout")]
    pub respawn_timeout_ms: u64,
    /// Delay between boot reconciliation attempts (ms)
    #[serde(default = "default_reconcile_retry")]
    pub reconcile_retry_ms: u64,
}

fn default_key_prefix() -> String {
    "ppp-aspirant".to_string()
}

fn default_respawn_timeout() -> u64 {
    1000
}

fn default_reconcile_retry() -> u64 {
    1000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            key_prefix: default_key_prefix(),
            respawn_timeout_ms: default_respawn_timeout(),
            reconcile_retry_ms: default_reconcile_retry(),
        }
    }
}

impl SupervisorConfig {
    pub fn respawn_timeout(&self) -> Duration {
        Duration::from_millis(self.respawn_timeout_ms)
    }

    pub fn reconcile_retry(&self) -> Duration {
        Duration::from_millis(self.reconcile_retry_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the service machine proxying the key-value store
    #[serde(default)]
    pub service_url: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_request_timeout() -> u64 {
    10_000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            request_timeout_ms: default_request_timeout(),
            store: StoreConfig::default(),
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Connection parameters forwarded verbatim to the proxy
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Program used to execute worker sources (e.g. "node", "python3", "sh")
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Arguments placed before the script path
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// File extension given to materialized sources
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
    /// Where materialized sources are written
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    /// Name of the directory-marker variable exported to every worker
    #[serde(default = "default_dirname_var")]
    pub dirname_var: String,
    /// Value of the directory marker; defaults to the supervisor binary's directory
    #[serde(default)]
    pub dirname: Option<PathBuf>,
    /// Interpreter base environment, lowest precedence
    #[serde(default)]
    pub base_env: HashMap<String, String>,
    /// Grace period between the cleanup notice and the hard kill (ms)
    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace_ms: u64,
}

fn default_interpreter() -> String {
    "node".to_string()
}

fn default_script_extension() -> String {
    "mjs".to_string()
}

fn default_scripts_dir() -> PathBuf {
    std::env::temp_dir().join("hatchery").join("scripts")
}

fn default_dirname_var() -> String {
    "HATCHERY_DIRNAME".to_string()
}

fn default_cleanup_grace() -> u64 {
    100
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: Vec::new(),
            script_extension: default_script_extension(),
            scripts_dir: default_scripts_dir(),
            dirname_var: default_dirname_var(),
            dirname: None,
            base_env: HashMap::new(),
            cleanup_grace_ms: default_cleanup_grace(),
        }
    }
}

impl WorkerConfig {
    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    /// Resolve the directory marker value
    pub fn resolved_dirname(&self) -> PathBuf {
        if let Some(dir) = &self.dirname {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Debugger URL reported by `/inspector_url`
    #[serde(default)]
    pub inspector_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    32456
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            inspector_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rotated log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Values given on the command line, applied on top of every other source
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub supervisor_id: Option<String>,
    pub service_url: Option<String>,
    pub port: Option<u16>,
    pub respawn_timeout_ms: Option<u64>,
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config", &CliOverrides::default())
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(
        config_dir: P,
        overrides: &CliOverrides,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("supervisor.respawn_timeout_ms", 1000)?
            .set_default("supervisor.reconcile_retry_ms", 1000)?
            .set_default("server.port", 32456)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("HATCHERY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (HATCHERY_SUPERVISOR__ID, etc.)
            .add_source(
                Environment::with_prefix("HATCHERY")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("supervisor.id", overrides.supervisor_id.clone())?
            .set_override_option("remote.service_url", overrides.service_url.clone())?
            .set_override_option("server.port", overrides.port.map(i64::from))?
            .set_override_option(
                "supervisor.respawn_timeout_ms",
                overrides.respawn_timeout_ms.map(|ms| ms as i64),
            )?;

        builder.build()?.try_deserialize()
    }

    /// Create a configuration with defaults for everything but identity
    pub fn for_supervisor(id: &str, service_url: &str) -> Self {
        Self {
            supervisor: SupervisorConfig {
                id: id.to_string(),
                ..SupervisorConfig::default()
            },
            remote: RemoteConfig {
                service_url: service_url.to_string(),
                ..RemoteConfig::default()
            },
            worker: WorkerConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.supervisor.id.trim().is_empty() {
            errors.push("supervisor id must be provided".to_string());
        }

        if self.remote.service_url.trim().is_empty() {
            errors.push("missing service machine URL".to_string());
        } else if url::Url::parse(&self.remote.service_url).is_err() {
            errors.push(format!(
                "service machine URL is not a valid URL: {}",
                self.remote.service_url
            ));
        }

        if self.supervisor.key_prefix.trim().is_empty() {
            errors.push("supervisor.key_prefix must not be empty".to_string());
        }

        if self.worker.interpreter.trim().is_empty() {
            errors.push("worker.interpreter must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::for_supervisor("a1", "http://localhost:9000/");
        assert_eq!(cfg.supervisor.respawn_timeout(), Duration::from_millis(1000));
        assert_eq!(cfg.worker.cleanup_grace(), Duration::from_millis(100));
        assert_eq!(cfg.server.port, 32456);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.supervisor.key_prefix, "ppp-aspirant");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_identity_and_service_url() {
        let cfg = AppConfig::for_supervisor("", "");
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("supervisor id"));
        assert!(errors[1].contains("service machine URL"));
    }

    #[test]
    fn test_validate_rejects_malformed_url() {
        let cfg = AppConfig::for_supervisor("a1", "not a url");
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_overrides_win_over_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
[supervisor]
id = "from-file"
respawn_timeout_ms = 5000

[remote]
service_url = "http://file.example/"

[remote.store]
host = "redis.internal"
port = 6380
tls = true
"#,
        )
        .unwrap();

        let overrides = CliOverrides {
            supervisor_id: Some("from-cli".to_string()),
            port: Some(40000),
            ..Default::default()
        };
        let cfg = AppConfig::load_from(dir.path(), &overrides).unwrap();

        assert_eq!(cfg.supervisor.id, "from-cli");
        assert_eq!(cfg.supervisor.respawn_timeout_ms, 5000);
        assert_eq!(cfg.remote.service_url, "http://file.example/");
        assert_eq!(cfg.remote.store.host.as_deref(), Some("redis.internal"));
        assert_eq!(cfg.remote.store.port, Some(6380));
        assert!(cfg.remote.store.tls);
        assert_eq!(cfg.server.port, 40000);
    }
}
