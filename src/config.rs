// src/config.rs
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FeederError, Result};

const ENV_CONFIG_FILE: &str = "CONFIG_FILE";
const DEFAULT_CONFIG_PATH: &str = "config/feeder.toml";

/// How a source receives updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMechanism {
    Polling,
    EventDriven,
    Hybrid,
}

impl UpdateMechanism {
    pub fn needs_polling(&self) -> bool {
        matches!(self, Self::Polling | Self::Hybrid)
    }

    pub fn needs_events(&self) -> bool {
        matches!(self, Self::EventDriven | Self::Hybrid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::EventDriven => "event_driven",
            Self::Hybrid => "hybrid",
        }
    }
}

fn default_interval_seconds() -> u64 {
    600
}
fn default_max_concurrent_requests() -> u32 {
    1
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_seconds() -> u64 {
    30
}
fn default_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            max_concurrent_requests: default_max_concurrent_requests(),
            retry_attempts: default_retry_attempts(),
            retry_delay_seconds: default_retry_delay_seconds(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl PollingConfig {
    fn validate(&self, source: &str) -> Result<()> {
        if self.interval_seconds < 60 {
            return Err(FeederError::Validation(format!(
                "source '{source}': polling interval must be at least 60 seconds"
            )));
        }
        if self.max_concurrent_requests < 1 {
            return Err(FeederError::Validation(format!(
                "source '{source}': max_concurrent_requests must be at least 1"
            )));
        }
        Ok(())
    }
}

fn default_webhook_path() -> String {
    "/webhook".to_string()
}
fn default_websocket_reconnect() -> bool {
    true
}
fn default_event_buffer_size() -> usize {
    1000
}
fn default_max_event_age_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub webhook_port: Option<u16>,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    #[serde(default = "default_websocket_reconnect")]
    pub websocket_reconnect: bool,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_max_event_age_seconds")]
    pub max_event_age_seconds: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            webhook_port: None,
            webhook_path: default_webhook_path(),
            websocket_reconnect: default_websocket_reconnect(),
            event_buffer_size: default_event_buffer_size(),
            max_event_age_seconds: default_max_event_age_seconds(),
        }
    }
}

impl EventConfig {
    fn validate(&self, source: &str) -> Result<()> {
        if let Some(port) = self.webhook_port {
            if port < 1024 {
                return Err(FeederError::Validation(format!(
                    "source '{source}': webhook port must be between 1024 and 65535"
                )));
            }
        }
        if !self.webhook_path.starts_with('/') {
            return Err(FeederError::Validation(format!(
                "source '{source}': webhook path must start with '/'"
            )));
        }
        if self.event_buffer_size < 1 {
            return Err(FeederError::Validation(format!(
                "source '{source}': event buffer size must be at least 1"
            )));
        }
        if self.max_event_age_seconds < 1 {
            return Err(FeederError::Validation(format!(
                "source '{source}': max event age must be at least 1 second"
            )));
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

/// Configuration for one news source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub name: String,
    pub url: String,
    pub update_mechanism: UpdateMechanism,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub polling_config: Option<PollingConfig>,
    #[serde(default)]
    pub event_config: Option<EventConfig>,
    /// Source-type-specific settings (API tokens, channel filters, ...).
    #[serde(default)]
    pub specific_config: serde_json::Map<String, serde_json::Value>,
}

impl SourceConfig {
    /// Fills in the mechanism-required sub-config with defaults so the
    /// required branch is never absent after validation.
    pub fn normalize(&mut self) {
        if self.update_mechanism.needs_polling() && self.polling_config.is_none() {
            self.polling_config = Some(PollingConfig::default());
        }
        if self.update_mechanism.needs_events() && self.event_config.is_none() {
            self.event_config = Some(EventConfig::default());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_type.is_empty() {
            return Err(FeederError::Validation("source type is required".into()));
        }
        if self.name.is_empty() {
            return Err(FeederError::Validation("source name is required".into()));
        }
        if self.url.is_empty() {
            return Err(FeederError::Validation(format!(
                "source '{}': url is required",
                self.name
            )));
        }
        if let Some(polling) = &self.polling_config {
            polling.validate(&self.name)?;
        }
        if let Some(event) = &self.event_config {
            event.validate(&self.name)?;
        }
        Ok(())
    }

    /// Polling sub-config, guaranteed present for polling/hybrid sources
    /// after `normalize()`.
    pub fn polling(&self) -> Result<&PollingConfig> {
        self.polling_config.as_ref().ok_or_else(|| {
            FeederError::ConfigMismatch(format!(
                "source '{}' requires a polling_config for mechanism '{}'",
                self.name,
                self.update_mechanism.as_str()
            ))
        })
    }

    pub fn events(&self) -> Result<&EventConfig> {
        self.event_config.as_ref().ok_or_else(|| {
            FeederError::ConfigMismatch(format!(
                "source '{}' requires an event_config for mechanism '{}'",
                self.name,
                self.update_mechanism.as_str()
            ))
        })
    }

    pub fn specific_str(&self, key: &str) -> Option<&str> {
        self.specific_config.get(key).and_then(|v| v.as_str())
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_dedup_ttl_hours() -> u64 {
    24
}
fn default_connect_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_dedup_ttl_hours")]
    pub dedup_ttl_hours: u64,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
            dedup_ttl_hours: default_dedup_ttl_hours(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(FeederError::Validation("redis port must be non-zero".into()));
        }
        if self.dedup_ttl_hours == 0 {
            return Err(FeederError::Validation(
                "dedup TTL must be at least one hour".into(),
            ));
        }
        Ok(())
    }
}

fn default_dispatch_base_url() -> String {
    "http://localhost:8233".to_string()
}
fn default_task_queue() -> String {
    "news-processing".to_string()
}
fn default_workflow_timeout_seconds() -> u64 {
    3600
}
fn default_max_submit_attempts() -> u32 {
    3
}

/// Connection settings for the external durable-workflow backend. The engine
/// itself (retries, persistence) lives behind its HTTP surface; the feeder
/// only submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_base_url")]
    pub base_url: String,
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
    #[serde(default = "default_workflow_timeout_seconds")]
    pub workflow_timeout_seconds: u64,
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_url: default_dispatch_base_url(),
            task_queue: default_task_queue(),
            workflow_timeout_seconds: default_workflow_timeout_seconds(),
            max_submit_attempts: default_max_submit_attempts(),
        }
    }
}

impl DispatchConfig {
    fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(FeederError::Validation(
                "dispatch base_url is required".into(),
            ));
        }
        if self.task_queue.is_empty() {
            return Err(FeederError::Validation(
                "dispatch task_queue is required".into(),
            ));
        }
        Ok(())
    }
}

fn default_service_name() -> String {
    "news-feeder".to_string()
}
fn default_shutdown_timeout_seconds() -> u64 {
    30
}
fn default_health_interval_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    #[serde(default = "default_health_interval_seconds")]
    pub health_interval_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            health_interval_seconds: default_health_interval_seconds(),
        }
    }
}

fn default_status_port() -> u16 {
    8090
}
fn default_prometheus_port() -> u16 {
    8091
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_status_port")]
    pub status_port: u16,
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            status_port: default_status_port(),
            prometheus_port: default_prometheus_port(),
            log_level: default_log_level(),
        }
    }
}

impl MonitoringConfig {
    fn validate(&self) -> Result<()> {
        if self.status_port < 1024 || self.prometheus_port < 1024 {
            return Err(FeederError::Validation(
                "monitoring ports must be between 1024 and 65535".into(),
            ));
        }
        let level = self.log_level.to_ascii_lowercase();
        if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(FeederError::Validation(format!(
                "invalid log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }
}

/// Complete service configuration: loaded once at startup, validated eagerly,
/// read-only afterwards (no hot reload).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeederConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl FeederConfig {
    /// Load from an explicit path, else `$CONFIG_FILE`, else
    /// `config/feeder.toml`. Env overrides are applied before validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match env::var(ENV_CONFIG_FILE) {
                Ok(p) => PathBuf::from(p),
                Err(_) => PathBuf::from(DEFAULT_CONFIG_PATH),
            },
        };

        let data = fs::read_to_string(&path).map_err(|e| {
            FeederError::Validation(format!("reading config from {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut config: FeederConfig = toml::from_str(data)
            .map_err(|e| FeederError::Validation(format!("parsing config: {e}")))?;
        config.apply_env_overrides();
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for source in &mut self.sources {
            source.normalize();
        }
    }

    /// Scalar overrides from the environment, applied before structural
    /// validation so an invalid override fails startup like any other value.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(port) = env_parse::<u16>("REDIS_PORT") {
            self.redis.port = port;
        }
        if let Some(db) = env_parse::<u32>("REDIS_DB") {
            self.redis.db = db;
        }
        if let Ok(password) = env::var("REDIS_PASSWORD") {
            if !password.is_empty() {
                self.redis.password = Some(password);
            }
        }
        if let Ok(url) = env::var("DISPATCH_BASE_URL") {
            self.dispatch.base_url = url;
        }
        if let Ok(queue) = env::var("DISPATCH_TASK_QUEUE") {
            self.dispatch.task_queue = queue;
        }
        if let Some(port) = env_parse::<u16>("STATUS_PORT") {
            self.monitoring.status_port = port;
        }
        if let Some(port) = env_parse::<u16>("PROMETHEUS_PORT") {
            self.monitoring.prometheus_port = port;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
        if let Some(secs) = env_parse::<u64>("FEEDER_SHUTDOWN_TIMEOUT_SECONDS") {
            self.service.shutdown_timeout_seconds = secs;
        }

        // Credential injection for sources that take them.
        for source in &mut self.sources {
            if source.source_type == "webhook" {
                if let Ok(token) = env::var("WEBHOOK_AUTH_TOKEN") {
                    source
                        .specific_config
                        .insert("auth_token".into(), token.into());
                }
            }
            if source.source_type == "chat_event" {
                if let Ok(token) = env::var("CHAT_API_TOKEN") {
                    source
                        .specific_config
                        .insert("api_token".into(), token.into());
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.redis.validate()?;
        self.dispatch.validate()?;
        self.monitoring.validate()?;

        let mut names = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !names.insert(source.name.clone()) {
                return Err(FeederError::Validation(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }

        // Port conflicts across status, prometheus and webhook listeners.
        let mut used_ports = HashSet::new();
        used_ports.insert(self.monitoring.status_port);
        if !used_ports.insert(self.monitoring.prometheus_port) {
            return Err(FeederError::Validation(format!(
                "port conflict: {}",
                self.monitoring.prometheus_port
            )));
        }
        for source in &self.sources {
            if let Some(event) = &source.event_config {
                if let Some(port) = event.webhook_port {
                    if !used_ports.insert(port) {
                        return Err(FeederError::Validation(format!(
                            "port conflict: {port} (source '{}')",
                            source.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn source_by_name(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = env::var(var).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/rss"
update_mechanism = "polling"
"#
    }

    #[test]
    fn polling_sub_config_is_auto_populated() {
        let config = FeederConfig::from_toml_str(minimal_toml()).unwrap();
        let source = &config.sources[0];
        let polling = source.polling_config.as_ref().expect("auto-populated");
        assert_eq!(polling.interval_seconds, 600);
        assert!(source.event_config.is_none());
    }

    #[test]
    fn hybrid_gets_both_sub_configs() {
        let toml = r#"
[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/rss"
update_mechanism = "hybrid"
"#;
        let config = FeederConfig::from_toml_str(toml).unwrap();
        let source = &config.sources[0];
        assert!(source.polling_config.is_some());
        assert!(source.event_config.is_some());
    }

    #[test]
    fn short_polling_interval_is_rejected() {
        let toml = r#"
[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/rss"
update_mechanism = "polling"
polling_config = { interval_seconds = 30 }
"#;
        let err = FeederConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("at least 60 seconds"));
    }

    #[test]
    fn duplicate_source_names_are_rejected() {
        let toml = r#"
[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/a"
update_mechanism = "polling"

[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/b"
update_mechanism = "polling"
"#;
        let err = FeederConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate source name"));
    }

    #[test]
    fn privileged_webhook_port_is_rejected() {
        let toml = r#"
[[sources]]
type = "webhook"
name = "push"
url = "https://example.com"
update_mechanism = "event_driven"
event_config = { webhook_port = 80 }
"#;
        let err = FeederConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("between 1024 and 65535"));
    }

    #[test]
    fn webhook_port_conflicts_are_rejected() {
        let toml = r#"
[[sources]]
type = "webhook"
name = "push-a"
url = "https://example.com/a"
update_mechanism = "event_driven"
event_config = { webhook_port = 9001 }

[[sources]]
type = "webhook"
name = "push-b"
url = "https://example.com/b"
update_mechanism = "event_driven"
event_config = { webhook_port = 9001 }
"#;
        let err = FeederConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("port conflict"));
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_take_precedence_over_file_values() {
        env::set_var("REDIS_HOST", "cache.internal");
        env::set_var("REDIS_PORT", "6380");
        env::set_var("STATUS_PORT", "not-a-port");
        let config = FeederConfig::from_toml_str(minimal_toml()).unwrap();
        env::remove_var("REDIS_HOST");
        env::remove_var("REDIS_PORT");
        env::remove_var("STATUS_PORT");

        assert_eq!(config.redis.host, "cache.internal");
        assert_eq!(config.redis.port, 6380);
        // unparsable override is ignored, file/default value stays
        assert_eq!(config.monitoring.status_port, 8090);
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://localhost:6379/0");
        redis.password = Some("secret".into());
        assert_eq!(redis.url(), "redis://:secret@localhost:6379/0");
    }

    #[test]
    fn disabled_sources_are_filtered() {
        let toml = r#"
[[sources]]
type = "rss"
name = "on"
url = "https://example.com/a"
update_mechanism = "polling"

[[sources]]
type = "rss"
name = "off"
url = "https://example.com/b"
update_mechanism = "polling"
enabled = false
"#;
        let config = FeederConfig::from_toml_str(toml).unwrap();
        let enabled: Vec<_> = config.enabled_sources().map(|s| s.name.as_str()).collect();
        assert_eq!(enabled, vec!["on"]);
    }
}
