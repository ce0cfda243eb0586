use clap::Parser;
use std::path::PathBuf;

use crate::config::CliOverrides;

#[derive(Parser, Debug)]
#[command(name = "hatchery")]
#[command(version)]
#[command(
    about = "Supervisor that keeps remotely specified worker processes running",
    long_about = None
)]
pub struct Cli {
    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config")]
    pub config_dir: PathBuf,

    /// Identity of this supervisor
    #[arg(long, env = "SUPERVISOR_ID")]
    pub id: Option<String>,

    /// Base URL of the service machine proxying the key-value store
    #[arg(long, env = "SERVICE_MACHINE_URL")]
    pub service_url: Option<String>,

    /// Control API port
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Default respawn delay in milliseconds
    #[arg(long, env = "RESPAWN_TIMEOUT")]
    pub respawn_timeout: Option<u64>,
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            supervisor_id: self.id.clone().filter(|id| !id.is_empty()),
            service_url: self.service_url.clone().filter(|url| !url.is_empty()),
            port: self.port,
            respawn_timeout_ms: self.respawn_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "hatchery",
            "--id",
            "sup-1",
            "--service-url",
            "http://svc:9000/",
            "--port",
            "4000",
            "--respawn-timeout",
            "250",
        ])
        .unwrap();

        let overrides = cli.overrides();
        assert_eq!(overrides.supervisor_id.as_deref(), Some("sup-1"));
        assert_eq!(overrides.service_url.as_deref(), Some("http://svc:9000/"));
        assert_eq!(overrides.port, Some(4000));
        assert_eq!(overrides.respawn_timeout_ms, Some(250));
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_empty_id_is_not_an_override() {
        let cli = Cli::try_parse_from(["hatchery", "--id", ""]).unwrap();
        assert!(cli.overrides().supervisor_id.is_none());
    }

    #[test]
    fn test_rejects_non_numeric_port() {
        assert!(Cli::try_parse_from(["hatchery", "--port", "abc"]).is_err());
    }
}
