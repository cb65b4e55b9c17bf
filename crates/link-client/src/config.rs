// Link configuration: role defaults, `LINK_*` env overrides, then an optional YAML file.
use link_transport::QoS;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_BASE_RECONNECT: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_RECONNECT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_MAX_INFLIGHT: usize = 64;
pub const DEFAULT_BUFFER_SIZE: usize = 1_000;
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);
pub const DEFAULT_PUBLISH_PERIOD: Duration = Duration::from_millis(1_000);
pub const DEFAULT_PAYLOAD_BYTES: usize = 80;

pub const TOPIC_LOCATION: &str = "/driver/location";
pub const TOPIC_OFFER: &str = "/driver/offer";
pub const TOPIC_RIDE: &str = "/driver/ride";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("read link config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse link config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Which side of the link this process plays. Only the defaults differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Agent,
    Backend,
}

impl LinkRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Backend => "backend",
        }
    }

    /// Env var naming the config file when no path is passed explicitly.
    pub fn config_env(self) -> &'static str {
        match self {
            Self::Agent => "AGENT_CONFIG",
            Self::Backend => "BACKEND_CONFIG",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive: Duration,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    pub base_reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub ping_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTopic {
    pub topic: String,
    pub period: Duration,
    pub qos: QoS,
    pub payload_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeTopic {
    pub topic: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    pub max_inflight: usize,
    pub enabled: bool,
    pub capacity: usize,
    pub drop_oldest: bool,
    /// Accepted for compatibility; buffers are memory-only.
    pub persist: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketConfig {
    pub read_buffer: Option<usize>,
    pub write_buffer: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub role: LinkRole,
    pub mqtt: BrokerEndpoint,
    pub retry: RetryConfig,
    pub publish: Vec<PublishTopic>,
    pub subscribe: Vec<SubscribeTopic>,
    pub buffer: BufferConfig,
    pub socket: SocketConfig,
    pub stats_interval: Duration,
    pub shutdown_grace: Duration,
    pub debug_logging: bool,
    pub metrics_bind: Option<SocketAddr>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct LinkConfigOverride {
    mqtt: Option<MqttOverride>,
    retry: Option<RetryOverride>,
    publish: Option<Vec<PublishTopicOverride>>,
    subscribe: Option<Vec<SubscribeTopicOverride>>,
    buffer_inflight: Option<BufferOverride>,
    socket: Option<SocketOverride>,
    stats: Option<StatsOverride>,
    shutdown: Option<ShutdownOverride>,
    log: Option<LogOverride>,
    metrics_bind: Option<SocketAddr>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct MqttOverride {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    keepalive_secs: Option<u64>,
    clean_session: Option<bool>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RetryOverride {
    enabled: Option<bool>,
    connect_timeout_ms: Option<u64>,
    base_reconnect_interval_ms: Option<u64>,
    max_reconnect_interval_ms: Option<u64>,
    ping_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PublishTopicOverride {
    topic: String,
    every_ms: Option<u64>,
    qos: Option<QoS>,
    payload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SubscribeTopicOverride {
    topic: String,
    qos: Option<QoS>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct BufferOverride {
    max_inflight: Option<usize>,
    buffer_enabled: Option<bool>,
    buffer_size: Option<usize>,
    drop_oldest: Option<bool>,
    persist: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SocketOverride {
    read_buffer: Option<usize>,
    write_buffer: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct StatsOverride {
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ShutdownOverride {
    grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct LogOverride {
    debug: Option<bool>,
}

impl LinkConfig {
    /// Built-in defaults for a role: the driver/backend topic plans.
    ///
    /// ```
    /// use link_client::config::{LinkConfig, LinkRole};
    ///
    /// let agent = LinkConfig::defaults_for(LinkRole::Agent);
    /// assert_eq!(agent.publish[0].topic, "/driver/location");
    /// assert!(agent.buffer.enabled);
    ///
    /// let backend = LinkConfig::defaults_for(LinkRole::Backend);
    /// assert_eq!(backend.publish.len(), 2);
    /// assert!(!backend.buffer.enabled);
    /// ```
    pub fn defaults_for(role: LinkRole) -> Self {
        let (publish, subscribe, buffer_enabled) = match role {
            LinkRole::Agent => (
                vec![publish_topic(TOPIC_LOCATION, 1_000, 80)],
                vec![subscribe_topic(TOPIC_OFFER), subscribe_topic(TOPIC_RIDE)],
                true,
            ),
            LinkRole::Backend => (
                vec![
                    publish_topic(TOPIC_OFFER, 1_000, 100),
                    publish_topic(TOPIC_RIDE, 2_000, 120),
                ],
                vec![subscribe_topic(TOPIC_LOCATION)],
                false,
            ),
        };
        Self {
            role,
            mqtt: BrokerEndpoint {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                client_id: format!("link-{}", role.as_str()),
                keepalive: DEFAULT_KEEPALIVE,
                clean_session: true,
                username: None,
                password: None,
            },
            retry: RetryConfig {
                auto_reconnect: true,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                base_reconnect_interval: DEFAULT_BASE_RECONNECT,
                max_reconnect_interval: DEFAULT_MAX_RECONNECT,
                ping_timeout: DEFAULT_PING_TIMEOUT,
                write_timeout: DEFAULT_WRITE_TIMEOUT,
            },
            publish,
            subscribe,
            buffer: BufferConfig {
                max_inflight: DEFAULT_MAX_INFLIGHT,
                enabled: buffer_enabled,
                capacity: DEFAULT_BUFFER_SIZE,
                drop_oldest: true,
                persist: false,
            },
            socket: SocketConfig::default(),
            stats_interval: DEFAULT_STATS_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            debug_logging: false,
            metrics_bind: None,
        }
    }

    /// Defaults, then `LINK_*` env vars, then the YAML file at `config_path` (or the
    /// role's config env var), then validation.
    pub fn from_env_or_yaml(
        role: LinkRole,
        config_path: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::from_env(role)?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var(role.config_env()).ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            config.apply_yaml(path, &contents)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply a YAML document on top of the current values.
    pub fn apply_yaml(&mut self, origin: &str, contents: &str) -> Result<(), ConfigError> {
        // An empty file deserializes as unit, not as an empty map.
        if contents.trim().is_empty() {
            return Ok(());
        }
        let override_cfg: LinkConfigOverride =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: origin.to_string(),
                source,
            })?;
        override_cfg.apply(self);
        Ok(())
    }

    fn from_env(role: LinkRole) -> Result<Self, ConfigError> {
        let mut config = Self::defaults_for(role);
        if let Some(value) = read_string_env("LINK_MQTT_HOST") {
            config.mqtt.host = value;
        }
        if let Some(value) = read_u64_env("LINK_MQTT_PORT") {
            config.mqtt.port = u16::try_from(value)
                .map_err(|_| ConfigError::invalid("LINK_MQTT_PORT", "out of range"))?;
        }
        if let Some(value) = read_string_env("LINK_CLIENT_ID") {
            config.mqtt.client_id = value;
        }
        if let Some(value) = read_u64_env("LINK_KEEPALIVE_SECS") {
            config.mqtt.keepalive = Duration::from_secs(value);
        }
        if let Some(value) = read_string_env("LINK_MQTT_USERNAME") {
            config.mqtt.username = Some(value);
        }
        if let Some(value) = read_string_env("LINK_MQTT_PASSWORD") {
            config.mqtt.password = Some(value);
        }
        if let Some(value) = read_bool_env("LINK_AUTO_RECONNECT") {
            config.retry.auto_reconnect = value;
        }
        if let Some(value) = read_u64_env("LINK_CONNECT_TIMEOUT_MS") {
            config.retry.connect_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("LINK_BASE_RECONNECT_MS") {
            config.retry.base_reconnect_interval = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("LINK_MAX_RECONNECT_MS") {
            config.retry.max_reconnect_interval = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("LINK_PING_TIMEOUT_MS") {
            config.retry.ping_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("LINK_WRITE_TIMEOUT_MS") {
            config.retry.write_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("LINK_MAX_INFLIGHT") {
            config.buffer.max_inflight = value;
        }
        if let Some(value) = read_bool_env("LINK_BUFFER_ENABLED") {
            config.buffer.enabled = value;
        }
        if let Some(value) = read_usize_env("LINK_BUFFER_SIZE") {
            config.buffer.capacity = value;
        }
        if let Some(value) = read_bool_env("LINK_DROP_OLDEST") {
            config.buffer.drop_oldest = value;
        }
        if let Some(value) = read_u64_env("LINK_STATS_INTERVAL_MS") {
            config.stats_interval = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("LINK_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(value);
        }
        if let Some(value) = read_bool_env("LINK_LOG_DEBUG") {
            config.debug_logging = value;
        }
        if let Some(value) = read_string_env("LINK_METRICS_BIND") {
            let addr: SocketAddr = value.parse().map_err(|_| {
                ConfigError::invalid("LINK_METRICS_BIND", format!("bad address {value}"))
            })?;
            config.metrics_bind = Some(addr);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.host", "must not be empty"));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::invalid("mqtt.port", "must be non-zero"));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(ConfigError::invalid("mqtt.client_id", "must not be empty"));
        }
        if self.mqtt.keepalive.is_zero() {
            return Err(ConfigError::invalid("mqtt.keepalive_secs", "must be positive"));
        }
        for (field, value) in [
            ("retry.connect_timeout_ms", self.retry.connect_timeout),
            ("retry.base_reconnect_interval_ms", self.retry.base_reconnect_interval),
            ("retry.max_reconnect_interval_ms", self.retry.max_reconnect_interval),
            ("retry.ping_timeout_ms", self.retry.ping_timeout),
            ("retry.write_timeout_ms", self.retry.write_timeout),
            ("stats.interval_ms", self.stats_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if self.retry.base_reconnect_interval > self.retry.max_reconnect_interval {
            return Err(ConfigError::invalid(
                "retry.base_reconnect_interval_ms",
                "must not exceed max_reconnect_interval_ms",
            ));
        }
        if self.buffer.max_inflight == 0 {
            return Err(ConfigError::invalid("buffer_inflight.max_inflight", "must be positive"));
        }
        if self.buffer.enabled && self.buffer.capacity == 0 {
            return Err(ConfigError::invalid(
                "buffer_inflight.buffer_size",
                "must be positive when buffering is enabled",
            ));
        }
        let mut seen = HashSet::new();
        for topic in &self.publish {
            validate_topic_name("publish.topic", &topic.topic)?;
            if topic.period.is_zero() {
                return Err(ConfigError::invalid(
                    format!("publish[{}].every_ms", topic.topic),
                    "must be positive",
                ));
            }
            if !seen.insert(topic.topic.as_str()) {
                return Err(ConfigError::invalid(
                    "publish.topic",
                    format!("duplicate topic {}", topic.topic),
                ));
            }
        }
        for topic in &self.subscribe {
            validate_topic_name("subscribe.topic", &topic.topic)?;
        }
        Ok(())
    }

    pub fn subscribed_topics(&self) -> impl Iterator<Item = &str> {
        self.subscribe.iter().map(|topic| topic.topic.as_str())
    }

    /// Log the settings in force after overrides. Credentials are reported only as present.
    pub fn log_effective(&self) {
        info!(
            role = self.role.as_str(),
            host = %self.mqtt.host,
            port = self.mqtt.port,
            client_id = %self.mqtt.client_id,
            keepalive_ms = self.mqtt.keepalive.as_millis() as u64,
            clean_session = self.mqtt.clean_session,
            credentials = self.mqtt.username.is_some(),
            "effective broker config"
        );
        info!(
            auto_reconnect = self.retry.auto_reconnect,
            connect_timeout_ms = self.retry.connect_timeout.as_millis() as u64,
            base_reconnect_ms = self.retry.base_reconnect_interval.as_millis() as u64,
            max_reconnect_ms = self.retry.max_reconnect_interval.as_millis() as u64,
            ping_timeout_ms = self.retry.ping_timeout.as_millis() as u64,
            write_timeout_ms = self.retry.write_timeout.as_millis() as u64,
            "effective retry config"
        );
        info!(
            max_inflight = self.buffer.max_inflight,
            buffer_enabled = self.buffer.enabled,
            buffer_capacity = self.buffer.capacity,
            drop_oldest = self.buffer.drop_oldest,
            stats_interval_ms = self.stats_interval.as_millis() as u64,
            "effective buffer config"
        );
        for topic in &self.publish {
            info!(
                topic = %topic.topic,
                every_ms = topic.period.as_millis() as u64,
                qos = %topic.qos,
                payload_bytes = topic.payload_bytes,
                "publish plan"
            );
        }
        for topic in &self.subscribe {
            info!(topic = %topic.topic, qos = %topic.qos, "subscribe plan");
        }
    }
}

impl LinkConfigOverride {
    fn apply(self, config: &mut LinkConfig) {
        if let Some(mqtt) = self.mqtt {
            if let Some(value) = mqtt.host {
                config.mqtt.host = value;
            }
            if let Some(value) = mqtt.port
                && value > 0
            {
                config.mqtt.port = value;
            }
            if let Some(value) = mqtt.client_id {
                config.mqtt.client_id = value;
            }
            if let Some(value) = mqtt.keepalive_secs
                && value > 0
            {
                config.mqtt.keepalive = Duration::from_secs(value);
            }
            if let Some(value) = mqtt.clean_session {
                config.mqtt.clean_session = value;
            }
            if let Some(value) = mqtt.username {
                config.mqtt.username = Some(value);
            }
            if let Some(value) = mqtt.password {
                config.mqtt.password = Some(value);
            }
        }
        if let Some(retry) = self.retry {
            if let Some(value) = retry.enabled {
                config.retry.auto_reconnect = value;
            }
            if let Some(value) = retry.connect_timeout_ms
                && value > 0
            {
                config.retry.connect_timeout = Duration::from_millis(value);
            }
            if let Some(value) = retry.base_reconnect_interval_ms
                && value > 0
            {
                config.retry.base_reconnect_interval = Duration::from_millis(value);
            }
            if let Some(value) = retry.max_reconnect_interval_ms
                && value > 0
            {
                config.retry.max_reconnect_interval = Duration::from_millis(value);
            }
            if let Some(value) = retry.ping_timeout_ms
                && value > 0
            {
                config.retry.ping_timeout = Duration::from_millis(value);
            }
            if let Some(value) = retry.write_timeout_ms
                && value > 0
            {
                config.retry.write_timeout = Duration::from_millis(value);
            }
        }
        // Topic lists replace the role plan wholesale.
        if let Some(publish) = self.publish {
            config.publish = publish
                .into_iter()
                .map(|entry| PublishTopic {
                    topic: entry.topic,
                    period: Duration::from_millis(
                        entry
                            .every_ms
                            .unwrap_or(DEFAULT_PUBLISH_PERIOD.as_millis() as u64),
                    ),
                    qos: entry.qos.unwrap_or(QoS::AtLeastOnce),
                    payload_bytes: entry.payload_bytes.unwrap_or(DEFAULT_PAYLOAD_BYTES),
                })
                .collect();
        }
        if let Some(subscribe) = self.subscribe {
            config.subscribe = subscribe
                .into_iter()
                .map(|entry| SubscribeTopic {
                    topic: entry.topic,
                    qos: entry.qos.unwrap_or(QoS::AtLeastOnce),
                })
                .collect();
        }
        if let Some(buffer) = self.buffer_inflight {
            if let Some(value) = buffer.max_inflight
                && value > 0
            {
                config.buffer.max_inflight = value;
            }
            if let Some(value) = buffer.buffer_enabled {
                config.buffer.enabled = value;
            }
            if let Some(value) = buffer.buffer_size
                && value > 0
            {
                config.buffer.capacity = value;
            }
            if let Some(value) = buffer.drop_oldest {
                config.buffer.drop_oldest = value;
            }
            if let Some(value) = buffer.persist {
                config.buffer.persist = value;
            }
        }
        if let Some(socket) = self.socket {
            if let Some(value) = socket.read_buffer
                && value > 0
            {
                config.socket.read_buffer = Some(value);
            }
            if let Some(value) = socket.write_buffer
                && value > 0
            {
                config.socket.write_buffer = Some(value);
            }
        }
        if let Some(stats) = self.stats
            && let Some(value) = stats.interval_ms
            && value > 0
        {
            config.stats_interval = Duration::from_millis(value);
        }
        if let Some(shutdown) = self.shutdown
            && let Some(value) = shutdown.grace_ms
        {
            config.shutdown_grace = Duration::from_millis(value);
        }
        if let Some(log) = self.log
            && let Some(value) = log.debug
        {
            config.debug_logging = value;
        }
        if let Some(value) = self.metrics_bind {
            config.metrics_bind = Some(value);
        }
    }
}

fn publish_topic(topic: &str, every_ms: u64, payload_bytes: usize) -> PublishTopic {
    PublishTopic {
        topic: topic.to_string(),
        period: Duration::from_millis(every_ms),
        qos: QoS::AtLeastOnce,
        payload_bytes,
    }
}

fn subscribe_topic(topic: &str) -> SubscribeTopic {
    SubscribeTopic {
        topic: topic.to_string(),
        qos: QoS::AtLeastOnce,
    }
}

fn validate_topic_name(field: &str, topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::invalid(field, "topic must not be empty"));
    }
    if topic.contains('\0') {
        return Err(ConfigError::invalid(field, format!("topic {topic:?} contains NUL")));
    }
    Ok(())
}

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
