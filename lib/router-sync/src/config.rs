//! Router configuration loaded from YAML with environment overrides

use crate::{CoordinatorError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming the YAML config file
pub const CONFIG_PATH_ENV: &str = "ROUTER_CONFIG";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Index of this instance within the fleet
    pub index: u32,
    /// Address announced to peers; discovered from the outbound interface when unset
    pub ip: Option<String>,
    /// Port the proxy listens on
    pub port: u16,
    pub pidfile: Option<PathBuf>,
    /// Runtime worker threads; 0 keeps the runtime default
    pub worker_threads: usize,
    pub bus: BusConfig,
    pub status: StatusConfig,
    /// Seconds between `router.start` heartbeats; also the startup warm-up pause
    pub publish_start_message_interval: u64,
    /// Seconds between active-apps snapshots; 0 disables them
    pub publish_active_apps_interval: u64,
    pub logging: LoggingConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// In-process bus, for single-node runs
    Local,
    Redis,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Port for the stats/health views; 0 leaves them unannounced
    pub port: u16,
    pub user: String,
    pub pass: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            index: 0,
            ip: None,
            port: 8081,
            pidfile: None,
            worker_threads: 0,
            bus: BusConfig::default(),
            status: StatusConfig::default(),
            publish_start_message_interval: 30,
            publish_active_apps_interval: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Redis,
            host: "127.0.0.1".to_string(),
            port: 6379,
            user: None,
            pass: None,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            port: 0,
            user: String::new(),
            pass: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RouterConfig {
    /// Load the file named by `ROUTER_CONFIG` (defaults when unset), then
    /// apply `ROUTER_*` environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| CoordinatorError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ROUTER_INDEX") {
            self.index = parse_value("ROUTER_INDEX", &value)?;
        }
        if let Some(value) = lookup("ROUTER_IP") {
            self.ip = Some(value);
        }
        if let Some(value) = lookup("ROUTER_PORT") {
            self.port = parse_value("ROUTER_PORT", &value)?;
        }
        if let Some(value) = lookup("ROUTER_BUS_HOST") {
            self.bus.host = value;
        }
        if let Some(value) = lookup("ROUTER_BUS_PORT") {
            self.bus.port = parse_value("ROUTER_BUS_PORT", &value)?;
        }
        if let Some(value) = lookup("ROUTER_BUS_USER") {
            self.bus.user = Some(value);
        }
        if let Some(value) = lookup("ROUTER_BUS_PASS") {
            self.bus.pass = Some(value);
        }
        if let Some(value) = lookup("ROUTER_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.publish_start_message_interval)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.publish_active_apps_interval)
    }

    /// Address the proxy listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// `ip:port` of the status views, if a status port is configured
    pub fn status_host(&self, ip: &str) -> Option<String> {
        (self.status.port != 0).then(|| format!("{}:{}", ip, self.status.port))
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| CoordinatorError::ConfigValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.port, 8081);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.snapshot_interval(), Duration::ZERO);
        assert_eq!(config.bus.kind, BusKind::Redis);
        assert_eq!(config.listen_addr(), "0.0.0.0:8081".parse().unwrap());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
index: 3
ip: 10.1.2.3
port: 9000
pidfile: /var/run/router.pid
bus:
  kind: local
  host: bus.internal
  port: 6380
  user: router
  pass: secret
status:
  port: 9001
  user: admin
  pass: hunter2
publish_start_message_interval: 5
publish_active_apps_interval: 15
logging:
  level: debug
  json: true
"#;
        let config = RouterConfig::from_yaml(yaml).expect("valid yaml");
        assert_eq!(config.index, 3);
        assert_eq!(config.ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(config.port, 9000);
        assert_eq!(config.pidfile, Some(PathBuf::from("/var/run/router.pid")));
        assert_eq!(config.bus.kind, BusKind::Local);
        assert_eq!(config.bus.user.as_deref(), Some("router"));
        assert_eq!(config.status.port, 9001);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.snapshot_interval(), Duration::from_secs(15));
        assert!(config.logging.json);
        assert_eq!(config.status_host("10.1.2.3").as_deref(), Some("10.1.2.3:9001"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = RouterConfig::from_yaml("port: 8888\n").expect("valid yaml");
        assert_eq!(config.port, 8888);
        assert_eq!(config.publish_start_message_interval, 30);
        assert_eq!(config.bus, BusConfig::default());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            RouterConfig::from_yaml("port: not-a-port\n"),
            Err(CoordinatorError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            RouterConfig::from_file("/nonexistent/router.yml"),
            Err(CoordinatorError::ConfigRead { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ROUTER_PORT", "9100"),
            ("ROUTER_BUS_HOST", "redis.internal"),
            ("ROUTER_IP", "10.9.9.9"),
        ]
        .into_iter()
        .collect();

        let mut config = RouterConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("valid overrides");
        assert_eq!(config.port, 9100);
        assert_eq!(config.bus.host, "redis.internal");
        assert_eq!(config.ip.as_deref(), Some("10.9.9.9"));
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = RouterConfig::default();
        let result = config.apply_overrides(|key| (key == "ROUTER_PORT").then(|| "99999".to_string()));
        assert!(matches!(result, Err(CoordinatorError::ConfigValue { .. })));
    }

    #[test]
    fn test_status_host_disabled_by_default() {
        let mut config = RouterConfig::default();
        assert_eq!(config.status_host("10.0.0.1"), None);

        config.status.port = 8082;
        assert_eq!(config.status_host("10.0.0.1").as_deref(), Some("10.0.0.1:8082"));
    }
}
