//! Remote state client
//!
//! Talks to the key-value store through the service machine's HTTP proxy.
//! Every call is a single POST of `{options, command, args}`; failures are
//! returned to the caller untouched and retry policy is left to the supervisor.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use url::Url;

use crate::config::{RemoteConfig, StoreConfig};
use crate::error::{HatcheryError, Result};

/// Commands understood by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteCommand {
    Hgetall,
    Hset,
    Hdel,
    Ping,
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCommand::Hgetall => write!(f, "hgetall"),
            RemoteCommand::Hset => write!(f, "hset"),
            RemoteCommand::Hdel => write!(f, "hdel"),
            RemoteCommand::Ping => write!(f, "ping"),
        }
    }
}

/// Typed view of the remote store used by the supervisor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All fields of a hash
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Set one field of a hash
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Remove one field of a hash
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    /// Liveness probe; returns the store's reply verbatim
    async fn ping(&self) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct TlsOptions<'a> {
    servername: &'a str,
}

#[derive(Debug, Serialize)]
struct ConnectionOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<TlsOptions<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

impl<'a> ConnectionOptions<'a> {
    fn from_store(store: &'a StoreConfig) -> Self {
        let host = store.host.as_deref();
        Self {
            host,
            port: store.port,
            tls: if store.tls {
                Some(TlsOptions {
                    servername: host.unwrap_or_default(),
                })
            } else {
                None
            },
            username: store.username.as_deref(),
            db: store.db,
            password: store.password.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RemoteRequest<'a> {
    options: ConnectionOptions<'a>,
    command: RemoteCommand,
    args: &'a [String],
}

/// HTTP client for the key-value proxy
#[derive(Clone)]
pub struct RemoteStateClient {
    client: Client,
    endpoint: Url,
    store: StoreConfig,
}

impl RemoteStateClient {
    /// Create a client from remote configuration
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let base = Url::parse(&config.service_url).map_err(|e| {
            HatcheryError::InvalidConfig(vec![format!(
                "invalid service machine URL {}: {}",
                config.service_url, e
            )])
        })?;
        let endpoint = base.join("redis").map_err(|e| {
            HatcheryError::InvalidConfig(vec![format!("cannot build proxy endpoint: {}", e)])
        })?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint,
            store: config.store.clone(),
        })
    }

    /// Proxy endpoint this client posts to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Issue one command and return the raw response body
    pub async fn call(&self, command: RemoteCommand, args: &[String]) -> Result<String> {
        let request = RemoteRequest {
            options: ConnectionOptions::from_store(&self.store),
            command,
            args,
        };

        debug!(%command, args = args.len(), "remote store call");

        let resp = self
            .client
            .post(self.endpoint.clone())
            .header("Cache-Control", "no-cache")
            .json(&request)
            .send()
            .await
            .map_err(|e| HatcheryError::RemoteUnavailable(format!("{command}: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| HatcheryError::RemoteUnavailable(format!("{command}: {e}")))?;

        if !status.is_success() {
            return Err(HatcheryError::RemoteUnavailable(format!(
                "{command}: HTTP {status}: {body}"
            )));
        }

        Ok(body)
    }
}

/// Decode an `hgetall` reply; `null` means the hash does not exist
fn parse_hash(body: &str) -> Result<HashMap<String, String>> {
    match serde_json::from_str::<Value>(body)? {
        Value::Null => Ok(HashMap::new()),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(field, value)| match value {
                Value::String(s) => (field, s),
                other => (field, other.to_string()),
            })
            .collect()),
        other => Err(HatcheryError::RemoteUnavailable(format!(
            "hgetall: unexpected reply {other}"
        ))),
    }
}

#[async_trait]
impl RemoteStore for RemoteStateClient {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let body = self
            .call(RemoteCommand::Hgetall, &[key.to_string()])
            .await?;
        parse_hash(&body)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.call(
            RemoteCommand::Hset,
            &[key.to_string(), field.to_string(), value.to_string()],
        )
        .await
        .map(|_| ())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.call(RemoteCommand::Hdel, &[key.to_string(), field.to_string()])
            .await
            .map(|_| ())
    }

    async fn ping(&self) -> Result<String> {
        self.call(RemoteCommand::Ping, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> StoreConfig {
        StoreConfig {
            host: Some("redis.internal".to_string()),
            port: Some(6379),
            tls: true,
            username: Some("default".to_string()),
            password: Some("secret".to_string()),
            db: Some(2),
        }
    }

    #[test]
    fn test_request_shape() {
        let store = store();
        let args = vec!["hatchery:a1:workers".to_string(), "w1".to_string()];
        let request = RemoteRequest {
            options: ConnectionOptions::from_store(&store),
            command: RemoteCommand::Hdel,
            args: &args,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "options": {
                    "host": "redis.internal",
                    "port": 6379,
                    "tls": { "servername": "redis.internal" },
                    "username": "default",
                    "db": 2,
                    "password": "secret"
                },
                "command": "hdel",
                "args": ["hatchery:a1:workers", "w1"]
            })
        );
    }

    #[test]
    fn test_tls_omitted_when_disabled() {
        let mut store = store();
        store.tls = false;
        let value = serde_json::to_value(ConnectionOptions::from_store(&store)).unwrap();
        assert!(value.get("tls").is_none());
    }

    #[test]
    fn test_endpoint_joins_redis_path() {
        let mut config = RemoteConfig::default();
        config.service_url = "https://service.example/".to_string();
        let client = RemoteStateClient::new(&config).unwrap();
        assert_eq!(client.endpoint().as_str(), "https://service.example/redis");
    }

    #[test]
    fn test_invalid_service_url_is_rejected() {
        let mut config = RemoteConfig::default();
        config.service_url = "::nope".to_string();
        assert!(matches!(
            RemoteStateClient::new(&config),
            Err(HatcheryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_parse_hash() {
        let map = parse_hash(r#"{"w1":"{\"source\":\"x\"}"}"#).unwrap();
        assert_eq!(map.get("w1").map(String::as_str), Some(r#"{"source":"x"}"#));
        assert!(parse_hash("null").unwrap().is_empty());
        assert!(parse_hash("[1,2]").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_remote_unavailable() {
        let mut config = RemoteConfig::default();
        // Port 9 (discard) on loopback is closed in test environments
        config.service_url = "http://127.0.0.1:9/".to_string();
        config.request_timeout_ms = 500;
        let client = RemoteStateClient::new(&config).unwrap();

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, HatcheryError::RemoteUnavailable(_)));
    }
}
