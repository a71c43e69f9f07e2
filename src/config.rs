use crate::address::BackendAddress;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable toggling the bootstrap cache
pub const ENV_ENABLE_CACHE: &str = "WARMSTART_ENABLE_CACHE";
/// Environment variable holding a pre-started backend address for local development
pub const ENV_DEV_ADDRESS: &str = "WARMSTART_DEV_ADDRESS";
/// Environment variable naming the current environment
pub const ENV_ENVIRONMENT: &str = "WARMSTART_ENV";

/// Environment name that enables the dev address shortcut
pub const DEVELOPMENT: &str = "development";

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Local invocation host settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Bootstrap cache behaviour
    #[serde(default)]
    pub cache: CacheConfig,

    /// Timeouts and limits
    #[serde(default)]
    pub defaults: ProxyDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the invocation host listens on (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Serve the built-in backend over TLS with a self-signed certificate
    #[serde(default)]
    pub backend_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            backend_tls: false,
        }
    }
}

/// Controls whether a backend survives between invocations.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Keep the backend alive across invocations (default: true)
    #[serde(default = "default_enable_cache")]
    pub enable_cache: bool,

    /// Address of an already running backend, used instead of bootstrapping
    /// when `environment` is `development`
    pub dev_mode_address: Option<String>,

    /// Environment name (default: production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_cache: default_enable_cache(),
            dev_mode_address: None,
            environment: default_environment(),
        }
    }
}

impl CacheConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case(DEVELOPMENT)
    }

    /// The fixed backend address, if the dev shortcut applies
    pub fn dev_address(&self) -> anyhow::Result<Option<BackendAddress>> {
        if !self.is_development() {
            return Ok(None);
        }
        match self.dev_mode_address.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Ok(Some(raw.trim().parse()?)),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyDefaults {
    /// Max time for the factory, port allocation and bind together
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: u64,

    /// Max time to wait for the backend's response head
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Wait for in-flight exchanges before closing a backend
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Time open connections get to finish once the listener is closed
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Max time to wait for a dev backend to accept connections
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Delay between readiness probes in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Largest request body that will be buffered
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Query parameter injected by host rewrite rules, removed before forwarding
    #[serde(default = "default_rewrite_marker")]
    pub rewrite_marker: Option<String>,

    /// Maximum idle pooled connections to the backend
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle pooled connection timeout in seconds
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyDefaults {
    fn default() -> Self {
        Self {
            bootstrap_timeout_secs: default_bootstrap_timeout(),
            request_timeout_secs: default_request_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_interval_ms: default_readiness_interval(),
            max_body_bytes: default_max_body_bytes(),
            rewrite_marker: default_rewrite_marker(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ProxyDefaults {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_enable_cache() -> bool {
    true
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_bootstrap_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_readiness_timeout() -> u64 {
    10
}

fn default_readiness_interval() -> u64 {
    100
}

fn default_max_body_bytes() -> usize {
    6 * 1024 * 1024 // 6 MiB, the usual serverless payload ceiling
}

fn default_rewrite_marker() -> Option<String> {
    Some("match".to_string())
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

/// Parse a boolean the way environment flags are usually written
fn parse_flag(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{}: expected a boolean, got '{}'", key, other),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults, then
    /// apply the process environment.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment settings read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ENABLE_CACHE) {
            self.cache.enable_cache = parse_flag(ENV_ENABLE_CACHE, &value)?;
        }
        if let Some(value) = lookup(ENV_DEV_ADDRESS) {
            self.cache.dev_mode_address = Some(value).filter(|v| !v.trim().is_empty());
        }
        if let Some(value) = lookup(ENV_ENVIRONMENT) {
            self.cache.environment = value;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.cache.dev_address() {
            errors.push(format!("dev_mode_address: {}", e));
        }
        if self.defaults.bootstrap_timeout_secs == 0 {
            errors.push("bootstrap_timeout_secs must be greater than 0".to_string());
        }
        if self.defaults.request_timeout_secs == 0 {
            errors.push("request_timeout_secs must be greater than 0".to_string());
        }
        if self.defaults.readiness_interval_ms == 0 {
            errors.push("readiness_interval_ms must be greater than 0".to_string());
        }
        if self.defaults.max_body_bytes == 0 {
            errors.push("max_body_bytes must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "0.0.0.0"

[cache]
enable_cache = false
environment = "development"
dev_mode_address = "http://127.0.0.1:4000"

[defaults]
bootstrap_timeout_secs = 5
max_body_bytes = 1024
rewrite_marker = "route"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(!config.cache.enable_cache);
        assert!(config.cache.is_development());
        assert_eq!(config.defaults.bootstrap_timeout(), Duration::from_secs(5));
        assert_eq!(config.defaults.max_body_bytes, 1024);
        assert_eq!(config.defaults.rewrite_marker.as_deref(), Some("route"));

        let dev = config.cache.dev_address().unwrap().unwrap();
        assert_eq!(dev.port(), 4000);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.cache.enable_cache);
        assert_eq!(config.cache.environment, "production");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_proxy_defaults() {
        let defaults = ProxyDefaults::default();
        assert_eq!(defaults.bootstrap_timeout(), Duration::from_secs(30));
        assert_eq!(defaults.request_timeout(), Duration::from_secs(30));
        assert_eq!(defaults.drain_timeout(), Duration::from_secs(10));
        assert_eq!(defaults.shutdown_grace_period(), Duration::from_secs(5));
        assert_eq!(defaults.readiness_interval(), Duration::from_millis(100));
        assert_eq!(defaults.max_body_bytes, 6 * 1024 * 1024);
        assert_eq!(defaults.rewrite_marker.as_deref(), Some("match"));
    }

    #[test]
    fn test_dev_address_ignored_outside_development() {
        let cache = CacheConfig {
            enable_cache: true,
            dev_mode_address: Some("http://127.0.0.1:4000".to_string()),
            environment: "production".to_string(),
        };
        assert!(cache.dev_address().unwrap().is_none());
    }

    #[test]
    fn test_env_overlay() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                (ENV_ENABLE_CACHE, "false"),
                (ENV_DEV_ADDRESS, "http://localhost:5000"),
                (ENV_ENVIRONMENT, "Development"),
            ]))
            .unwrap();

        assert!(!config.cache.enable_cache);
        assert!(config.cache.is_development());
        let dev = config.cache.dev_address().unwrap().unwrap();
        assert_eq!(dev.to_string(), "http://localhost:5000");
    }

    #[test]
    fn test_env_overlay_rejects_bad_flag() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[(ENV_ENABLE_CACHE, "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_ENABLE_CACHE));
    }

    #[test]
    fn test_empty_dev_address_is_unset() {
        let mut config = Config::default();
        config
            .apply_env(env(&[(ENV_DEV_ADDRESS, "  "), (ENV_ENVIRONMENT, "development")]))
            .unwrap();
        assert!(config.cache.dev_mode_address.is_none());
        assert!(config.cache.dev_address().unwrap().is_none());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.cache.environment = DEVELOPMENT.to_string();
        config.cache.dev_mode_address = Some("ftp://nowhere".to_string());
        config.defaults.bootstrap_timeout_secs = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("dev_mode_address"));
        assert!(err.contains("bootstrap_timeout_secs"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warmstart.toml");
        std::fs::write(&path, "[cache]\nenable_cache = false\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.cache.enable_cache);
    }

    #[test]
    fn test_load_with_env_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with_env(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 3000);
    }
}
