// Broker session settings and their mapping onto rumqttc options.
use link_client::config::LinkConfig;
use link_transport::QoS;
use rumqttc::{MqttOptions, NetworkOptions};
use std::time::Duration;

/// Capacity of the request channel between `AsyncClient` and the event loop.
pub const REQUEST_CHANNEL_CAPACITY: usize = 256;

/// Everything the MQTT transport needs to open a session.
///
/// ```
/// use link_client::config::{LinkConfig, LinkRole};
/// use link_mqtt::MqttSettings;
///
/// let settings = MqttSettings::from_config(&LinkConfig::defaults_for(LinkRole::Agent));
/// assert_eq!(settings.port, 1883);
/// assert!(settings.watchdog_window() > settings.keepalive);
/// ```
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive: Duration,
    pub clean_session: bool,
    pub credentials: Option<(String, String)>,
    pub max_inflight: u16,
    pub ping_timeout: Duration,
    pub request_timeout: Duration,
    pub read_buffer: Option<u32>,
    pub write_buffer: Option<u32>,
}

impl MqttSettings {
    pub fn from_config(config: &LinkConfig) -> Self {
        let credentials = config
            .mqtt
            .username
            .clone()
            .map(|user| (user, config.mqtt.password.clone().unwrap_or_default()));
        Self {
            host: config.mqtt.host.clone(),
            port: config.mqtt.port,
            client_id: config.mqtt.client_id.clone(),
            keepalive: whole_seconds(config.mqtt.keepalive),
            clean_session: config.mqtt.clean_session,
            credentials,
            max_inflight: u16::try_from(config.buffer.max_inflight).unwrap_or(u16::MAX),
            ping_timeout: config.retry.ping_timeout,
            request_timeout: config.retry.connect_timeout,
            read_buffer: config.socket.read_buffer.map(clamp_u32),
            write_buffer: config.socket.write_buffer.map(clamp_u32),
        }
    }

    /// Silence longer than this means the broker stopped answering pings.
    pub fn watchdog_window(&self) -> Duration {
        self.keepalive + self.ping_timeout
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(self.keepalive)
            .set_clean_session(self.clean_session)
            .set_inflight(self.max_inflight.max(1))
            .set_request_channel_capacity(REQUEST_CHANNEL_CAPACITY);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }

    pub fn network_options(&self, connect_timeout: Duration) -> NetworkOptions {
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(connect_timeout.as_secs().max(1));
        if let Some(size) = self.write_buffer {
            network.set_tcp_send_buffer_size(size);
        }
        if let Some(size) = self.read_buffer {
            network.set_tcp_recv_buffer_size(size);
        }
        network
    }
}

// rumqttc rejects sub-second keepalives other than zero.
fn whole_seconds(keepalive: Duration) -> Duration {
    if keepalive.is_zero() {
        return keepalive;
    }
    Duration::from_secs(keepalive.as_secs().max(1))
}

fn clamp_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub(crate) fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub(crate) fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_client::config::LinkRole;

    #[test]
    fn keepalive_rounds_to_whole_seconds() {
        assert_eq!(whole_seconds(Duration::from_millis(1_500)), Duration::from_secs(1));
        assert_eq!(whole_seconds(Duration::from_millis(200)), Duration::from_secs(1));
        assert_eq!(whole_seconds(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn credentials_require_a_username() {
        let mut config = LinkConfig::defaults_for(LinkRole::Backend);
        config.mqtt.password = Some("secret".into());
        assert!(MqttSettings::from_config(&config).credentials.is_none());

        config.mqtt.username = Some("backend".into());
        let settings = MqttSettings::from_config(&config);
        assert_eq!(
            settings.credentials,
            Some(("backend".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn options_carry_session_settings() {
        let mut config = LinkConfig::defaults_for(LinkRole::Agent);
        config.mqtt.client_id = "agent-7".into();
        config.mqtt.clean_session = false;
        config.buffer.max_inflight = 100_000;
        let settings = MqttSettings::from_config(&config);
        assert_eq!(settings.max_inflight, u16::MAX);

        let options = settings.mqtt_options();
        assert_eq!(options.client_id(), "agent-7");
        assert!(!options.clean_session());
        assert_eq!(options.keep_alive(), settings.keepalive);
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn qos_maps_both_ways() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(from_mqtt_qos(to_mqtt_qos(qos)), qos);
        }
    }
}
