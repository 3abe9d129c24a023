//! Configuration management for Quotagate.
//!
//! Configuration is layered with the `config` crate: built-in defaults, then an
//! optional yaml file, then a `.env` file in the working directory, then the
//! process environment. Environment keys use the flat names operators already
//! deploy with (`RATE_LIMIT_DEFAULT_REQUESTS`, `RATE_LIMIT_TOKEN_0`, `REDIS_HOST`, ...).

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat, Map};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{QuotaError, Result};

/// Dotenv file read from the working directory when present.
pub const DOTENV_FILE: &str = ".env";

/// Main configuration for the Quotagate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotagateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota store selector; `"redis"` selects the shared store
    #[serde(default = "default_cache")]
    pub cache: String,

    /// Redis connection settings, used when `cache` is `"redis"`
    #[serde(default)]
    pub redis: RedisConfig,

    /// Quota configuration
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

impl Default for QuotagateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: default_cache(),
            redis: RedisConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

fn default_cache() -> String {
    "inmemory".to_string()
}

/// The quota store implementations a process can be started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    /// Process-local volatile store
    Memory,
    /// Shared Redis store
    Redis,
}

impl CacheBackend {
    /// Map a selector string to a backend. Anything but `"redis"` is in-memory.
    pub fn from_selector(selector: &str) -> Self {
        if selector == "redis" {
            CacheBackend::Redis
        } else {
            CacheBackend::Memory
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub db: i64,

    /// Upper bound for a single backend call in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: String::new(),
            db: 0,
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_timeout_ms() -> u64 {
    1000
}

impl RedisConfig {
    /// Connection URL in the form accepted by `redis::Client::open`.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Quota configuration: a default plus per-IP and per-token overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Quota applied to keys without an override
    #[serde(default)]
    pub default: DefaultQuota,

    /// Ordered per-IP overrides
    #[serde(default)]
    pub ip: Vec<IpQuota>,

    /// Ordered per-token overrides
    #[serde(default)]
    pub token: Vec<TokenQuota>,

    /// What to do when the quota store cannot be read
    #[serde(default)]
    pub on_backend_error: BackendErrorPolicy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default: DefaultQuota::default(),
            ip: Vec::new(),
            token: Vec::new(),
            on_backend_error: BackendErrorPolicy::default(),
        }
    }
}

/// The default `(requests, every)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultQuota {
    /// Requests allowed per window; 0 disables limiting
    #[serde(default = "default_requests")]
    pub requests: u64,
    /// Window length in seconds
    #[serde(default = "default_every")]
    pub every: u64,
}

impl Default for DefaultQuota {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            every: default_every(),
        }
    }
}

fn default_requests() -> u64 {
    10
}

fn default_every() -> u64 {
    60
}

/// Quota override for a single client IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpQuota {
    pub ip: String,
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub every: u64,
}

/// Quota override for a single API token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenQuota {
    pub token: String,
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub every: u64,
}

/// Behavior when a quota lookup fails for reasons other than a missing key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorPolicy {
    /// Treat the failure as a miss and start a new window (fail open)
    #[default]
    ResetWindow,
    /// Deny the request (fail closed)
    Deny,
}

impl FromStr for BackendErrorPolicy {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset_window" | "reset" | "open" => Ok(BackendErrorPolicy::ResetWindow),
            "deny" | "closed" => Ok(BackendErrorPolicy::Deny),
            other => Err(QuotaError::Config(format!(
                "unknown backend error policy '{}'",
                other
            ))),
        }
    }
}

impl QuotagateConfig {
    /// Load configuration from an optional yaml file, then `.env`, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_layers(path, Path::new(DOTENV_FILE), Environment::default())
    }

    fn load_layers(path: Option<&Path>, dotenv: &Path, environment: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path));
        }
        if let Some(vars) = dotenv_vars(dotenv)? {
            info!(path = %dotenv.display(), "Loading dotenv file");
            builder = builder.add_source(Environment::default().source(Some(vars)));
        }
        let source = builder.add_source(environment).build()?;
        Self::from_source(&source)
    }

    /// Build the configuration from an already assembled source.
    ///
    /// Nested keys (as written in yaml) are deserialized first; flat
    /// environment-style keys are applied on top of them.
    pub fn from_source(source: &Config) -> Result<Self> {
        let mut config: QuotagateConfig = source.clone().try_deserialize()?;
        config.apply_flat_keys(source)?;
        Ok(config)
    }

    /// Which quota store this configuration selects.
    pub fn backend(&self) -> CacheBackend {
        CacheBackend::from_selector(&self.cache)
    }

    fn apply_flat_keys(&mut self, source: &Config) -> Result<()> {
        if let Some(addr) = lookup::<String>(source, "listen_addr")? {
            self.server.listen_addr = addr.parse().map_err(|e| {
                QuotaError::Config(format!("invalid listen address '{}': {}", addr, e))
            })?;
        }

        if let Some(host) = lookup(source, "redis_host")? {
            self.redis.host = host;
        }
        if let Some(port) = lookup(source, "redis_port")? {
            self.redis.port = port;
        }
        if let Some(password) = lookup(source, "redis_password")? {
            self.redis.password = password;
        }
        if let Some(db) = lookup(source, "redis_db")? {
            self.redis.db = db;
        }
        if let Some(timeout_ms) = lookup(source, "redis_timeout_ms")? {
            self.redis.timeout_ms = timeout_ms;
        }

        let limits = &mut self.rate_limiter;
        if let Some(requests) = lookup(source, "rate_limit_default_requests")? {
            limits.default.requests = requests;
        }
        if let Some(every) = lookup(source, "rate_limit_default_every")? {
            limits.default.every = every;
        }
        if let Some(policy) = lookup::<String>(source, "rate_limit_on_backend_error")? {
            limits.on_backend_error = policy.parse()?;
        }

        let ips = indexed_overrides(source, "rate_limit_ip")?;
        if !ips.is_empty() {
            limits.ip = ips
                .into_iter()
                .map(|(ip, requests, every)| IpQuota { ip, requests, every })
                .collect();
        }

        let tokens = indexed_overrides(source, "rate_limit_token")?;
        if !tokens.is_empty() {
            limits.token = tokens
                .into_iter()
                .map(|(token, requests, every)| TokenQuota {
                    token,
                    requests,
                    every,
                })
                .collect();
        }

        Ok(())
    }
}

/// `KEY=VALUE` lines of a dotenv file, or `None` when there is no such file.
///
/// The variables are fed through an [`Environment`] source so they are keyed
/// exactly like the process environment.
fn dotenv_vars(path: &Path) -> Result<Option<Map<String, String>>> {
    if !path.is_file() {
        return Ok(None);
    }

    let values: Map<String, String> = Config::builder()
        .add_source(File::from(path).format(FileFormat::Ini))
        .build()?
        .try_deserialize()?;

    Ok(Some(
        values
            .into_iter()
            .map(|(key, value)| (key.to_uppercase(), value))
            .collect(),
    ))
}

/// Read an optional key, distinguishing "absent" from "present but malformed".
fn lookup<T: DeserializeOwned>(source: &Config, key: &str) -> Result<Option<T>> {
    match source.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Collect `<prefix>_<i>`, `<prefix>_<i>_requests`, `<prefix>_<i>_every` triples
/// for i = 0, 1, ... until the first missing index.
fn indexed_overrides(source: &Config, prefix: &str) -> Result<Vec<(String, u64, u64)>> {
    let mut entries = Vec::new();
    for index in 0usize.. {
        let Some(subject) = lookup::<String>(source, &format!("{}_{}", prefix, index))? else {
            break;
        };
        let requests = lookup(source, &format!("{}_{}_requests", prefix, index))?.unwrap_or(0);
        let every = lookup(source, &format!("{}_{}_every", prefix, index))?.unwrap_or(0);
        entries.push((subject, requests, every));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> QuotagateConfig {
        let source = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap();
        QuotagateConfig::from_source(&source).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = QuotagateConfig::default();
        assert_eq!(config.backend(), CacheBackend::Memory);
        assert_eq!(config.rate_limiter.default.requests, 10);
        assert_eq!(config.rate_limiter.default.every, 60);
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.redis.url(), "redis://localhost:6379/0");
        assert_eq!(config.rate_limiter.on_backend_error, BackendErrorPolicy::ResetWindow);
    }

    #[test]
    fn test_backend_selector() {
        assert_eq!(CacheBackend::from_selector("redis"), CacheBackend::Redis);
        assert_eq!(CacheBackend::from_selector("inmemory"), CacheBackend::Memory);
        assert_eq!(CacheBackend::from_selector("Redis"), CacheBackend::Memory);
        assert_eq!(CacheBackend::from_selector(""), CacheBackend::Memory);
    }

    #[test]
    fn test_parse_yaml_config() {
        let config = from_yaml(
            r#"
cache: redis
redis:
  host: cache.internal
  password: hunter2
  db: 2
rate_limiter:
  default:
    requests: 100
    every: 60
  ip:
    - ip: 10.0.0.1
      requests: 5
      every: 10
  token:
    - token: tokA
      requests: 2
      every: 30
  on_backend_error: deny
"#,
        );

        assert_eq!(config.backend(), CacheBackend::Redis);
        assert_eq!(config.redis.url(), "redis://:hunter2@cache.internal:6379/2");
        assert_eq!(config.rate_limiter.default.requests, 100);
        assert_eq!(
            config.rate_limiter.ip,
            vec![IpQuota {
                ip: "10.0.0.1".to_string(),
                requests: 5,
                every: 10
            }]
        );
        assert_eq!(config.rate_limiter.token[0].token, "tokA");
        assert_eq!(config.rate_limiter.on_backend_error, BackendErrorPolicy::Deny);
    }

    #[test]
    fn test_flat_environment_keys() {
        let source = Config::builder()
            .set_override("cache", "redis")
            .unwrap()
            .set_override("redis_host", "redis.local")
            .unwrap()
            .set_override("redis_port", "6380")
            .unwrap()
            .set_override("rate_limit_default_requests", "100")
            .unwrap()
            .set_override("rate_limit_default_every", "30")
            .unwrap()
            .set_override("rate_limit_ip_0", "10.0.0.1")
            .unwrap()
            .set_override("rate_limit_ip_0_requests", "3")
            .unwrap()
            .set_override("rate_limit_ip_0_every", "15")
            .unwrap()
            .set_override("rate_limit_token_0", "tokA")
            .unwrap()
            .set_override("rate_limit_token_0_requests", "2")
            .unwrap()
            .set_override("rate_limit_token_0_every", "30")
            .unwrap()
            .set_override("rate_limit_token_1", "tokB")
            .unwrap()
            .set_override("rate_limit_on_backend_error", "deny")
            .unwrap()
            .build()
            .unwrap();

        let config = QuotagateConfig::from_source(&source).unwrap();

        assert_eq!(config.backend(), CacheBackend::Redis);
        assert_eq!(config.redis.host, "redis.local");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.rate_limiter.default, DefaultQuota { requests: 100, every: 30 });
        assert_eq!(config.rate_limiter.ip.len(), 1);
        assert_eq!(config.rate_limiter.ip[0].requests, 3);
        assert_eq!(config.rate_limiter.token.len(), 2);
        assert_eq!(config.rate_limiter.token[0].every, 30);
        // Missing request/window keys read as zero
        assert_eq!(config.rate_limiter.token[1].requests, 0);
        assert_eq!(config.rate_limiter.token[1].every, 0);
        assert_eq!(config.rate_limiter.on_backend_error, BackendErrorPolicy::Deny);
    }

    #[test]
    fn test_indexed_overrides_stop_at_first_gap() {
        let source = Config::builder()
            .set_override("rate_limit_ip_0", "10.0.0.1")
            .unwrap()
            .set_override("rate_limit_ip_2", "10.0.0.3")
            .unwrap()
            .build()
            .unwrap();

        let config = QuotagateConfig::from_source(&source).unwrap();
        assert_eq!(config.rate_limiter.ip.len(), 1);
        assert_eq!(config.rate_limiter.ip[0].ip, "10.0.0.1");
    }

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("quotagate-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// An environment source that sees none of the process variables.
    fn empty_environment() -> Environment {
        Environment::default().source(Some(Map::new()))
    }

    #[test]
    fn test_load_yaml_file_with_flat_key_overlay() {
        let yaml = temp_file(
            "layered.yaml",
            "cache: inmemory\nrate_limiter:\n  default:\n    requests: 7\n    every: 5\n",
        );
        let dotenv = temp_file("layered.env", "RATE_LIMIT_DEFAULT_EVERY=9\nCACHE=redis\n");

        let config =
            QuotagateConfig::load_layers(Some(&yaml), &dotenv, empty_environment()).unwrap();
        std::fs::remove_file(&yaml).unwrap();
        std::fs::remove_file(&dotenv).unwrap();

        assert_eq!(config.backend(), CacheBackend::Redis);
        assert_eq!(config.rate_limiter.default, DefaultQuota { requests: 7, every: 9 });
        assert!(config.rate_limiter.token.is_empty());
    }

    #[test]
    fn test_dotenv_file() {
        let dotenv = temp_file(
            "overrides.env",
            "# local overrides\nREDIS_HOST=redis.local\nRATE_LIMIT_TOKEN_0=tokA\n\
             RATE_LIMIT_TOKEN_0_REQUESTS=2\nRATE_LIMIT_TOKEN_0_EVERY=30\n",
        );

        let config = QuotagateConfig::load_layers(None, &dotenv, empty_environment()).unwrap();
        std::fs::remove_file(&dotenv).unwrap();

        assert_eq!(config.redis.host, "redis.local");
        assert_eq!(
            config.rate_limiter.token,
            vec![TokenQuota {
                token: "tokA".to_string(),
                requests: 2,
                every: 30
            }]
        );
    }

    #[test]
    fn test_environment_wins_over_dotenv() {
        let dotenv = temp_file("precedence.env", "REDIS_PORT=6380\nREDIS_DB=3\n");
        let mut vars = Map::new();
        vars.insert("REDIS_PORT".to_string(), "6390".to_string());

        let environment = Environment::default().source(Some(vars));
        let config = QuotagateConfig::load_layers(None, &dotenv, environment).unwrap();
        std::fs::remove_file(&dotenv).unwrap();

        assert_eq!(config.redis.port, 6390);
        assert_eq!(config.redis.db, 3);
    }

    #[test]
    fn test_missing_dotenv_is_ignored() {
        let missing = std::env::temp_dir().join("quotagate-does-not-exist.env");
        let config = QuotagateConfig::load_layers(None, &missing, empty_environment()).unwrap();
        assert_eq!(config.rate_limiter.default, DefaultQuota::default());
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        assert!("maybe".parse::<BackendErrorPolicy>().is_err());
        assert_eq!("CLOSED".parse::<BackendErrorPolicy>().unwrap(), BackendErrorPolicy::Deny);
    }
}
