use crate::core::config::{AckEventMode, AuthenticationScheme, Config, Secret, TlsConfig};
use std::time::Duration;

/// Everything a session factory needs to open a session.
#[derive(Debug, Clone)]
pub struct SessionProperties {
    pub hosts: Vec<String>,
    pub vpn_name: String,
    pub client_name: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub authentication_scheme: AuthenticationScheme,
    pub tls: Option<TlsConfig>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub connect_retries: u32,
    pub reconnect_retries: u32,
    pub connect_retries_per_host: u32,
    pub reconnect_retry_wait: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_limit: u32,
    pub pub_window_size: usize,
    pub ack_event_mode: AckEventMode,
    pub multi_thread: bool,
    pub generate_send_timestamps: bool,
    pub generate_sequence_numbers: bool,
}

impl SessionProperties {
    pub fn from_config(config: &Config) -> Self {
        let session = &config.session;
        let client_name = session
            .client_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("sinkbridge-{}", uuid::Uuid::new_v4()));
        Self {
            hosts: config.hosts(),
            vpn_name: session.vpn_name.clone(),
            client_name,
            username: session.username.clone(),
            password: session.password.clone(),
            authentication_scheme: session.authentication_scheme,
            tls: session.tls.clone(),
            connect_timeout: Duration::from_millis(session.connect_timeout_ms),
            read_timeout: Duration::from_millis(session.read_timeout_ms),
            connect_retries: session.connect_retries,
            reconnect_retries: session.reconnect_retries,
            connect_retries_per_host: session.connect_retries_per_host,
            reconnect_retry_wait: Duration::from_millis(session.reconnect_retry_wait_ms),
            keep_alive_interval: Duration::from_millis(session.keep_alive_interval_ms),
            keep_alive_limit: session.keep_alive_limit,
            pub_window_size: config.publisher.window_size,
            ack_event_mode: config.publisher.ack_event_mode,
            multi_thread: config.publisher.multi_thread,
            generate_send_timestamps: session.generate_send_timestamps,
            generate_sequence_numbers: session.generate_sequence_numbers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> Config {
        let doc = format!(
            "[session]\nhosts = [\"tcp://a\", \"tcp://b\"]\nvpn_name = \"vpn1\"\n{extra}\n[destinations]\nqueue = \"q\"\n"
        );
        Config::parse(&doc, false).unwrap()
    }

    #[test]
    fn password_propagates_unchanged() {
        let props = SessionProperties::from_config(&config(
            "username = \"user\"\npassword = \"p@ss word\"",
        ));
        assert_eq!(props.username.as_deref(), Some("user"));
        assert_eq!(
            props.password.as_ref().map(Secret::expose),
            Some("p@ss word")
        );
        assert!(!format!("{props:?}").contains("p@ss word"));
    }

    #[test]
    fn absent_password_stays_absent() {
        let props = SessionProperties::from_config(&config("username = \"user\""));
        assert!(props.password.is_none());
    }

    #[test]
    fn client_name_is_generated_when_missing() {
        let generated = SessionProperties::from_config(&config(""));
        assert!(generated.client_name.starts_with("sinkbridge-"));

        let named = SessionProperties::from_config(&config("client_name = \"bridge-1\""));
        assert_eq!(named.client_name, "bridge-1");
        assert_eq!(named.vpn_name, "vpn1");
        assert_eq!(named.hosts, vec!["tcp://a", "tcp://b"]);
        assert_eq!(named.keep_alive_interval, Duration::from_millis(3_000));
    }
}
