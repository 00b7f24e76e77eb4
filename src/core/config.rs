use crate::delivery::message::Destination;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Hard ceiling on messages in one broker transaction.
pub const MAX_TRANSACTION_SIZE: usize = 255;
/// Largest autoflush threshold accepted; stays below [`MAX_TRANSACTION_SIZE`].
pub const MAX_AUTOFLUSH_SIZE: usize = 200;
/// Largest publisher window the broker negotiates.
pub const MAX_WINDOW_SIZE: usize = 255;

/// Top-level configuration for a sink task.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub session: SessionConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub destinations: DestinationConfig,
    #[serde(default)]
    pub record: RecordConfig,
    #[serde(default)]
    pub errors: ErrorFlags,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// String that never shows up in `Debug` output.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Ordered broker endpoints; failover walks them front to back.
    pub hosts: Vec<String>,
    #[serde(default = "default_vpn_name")]
    pub vpn_name: String,
    /// Unique client name within the VPN; generated when absent.
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub authentication_scheme: AuthenticationScheme,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Extra passes over the host list during the initial connect.
    #[serde(default)]
    pub connect_retries: u32,
    /// Extra passes over the host list after an established session drops.
    #[serde(default)]
    pub reconnect_retries: u32,
    /// Extra attempts against one host before moving to the next.
    #[serde(default)]
    pub connect_retries_per_host: u32,
    #[serde(default = "default_reconnect_retry_wait_ms")]
    pub reconnect_retry_wait_ms: u64,
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Consecutive unanswered keep-alives tolerated before the session is declared dead.
    #[serde(default = "default_keep_alive_limit")]
    pub keep_alive_limit: u32,
    #[serde(default)]
    pub generate_send_timestamps: bool,
    #[serde(default)]
    pub generate_sequence_numbers: bool,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationScheme {
    #[default]
    Basic,
    ClientCertificate,
    Kerberos,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub trust_store: Option<PathBuf>,
    #[serde(default)]
    pub trust_store_password: Option<Secret>,
    #[serde(default)]
    pub key_store: Option<PathBuf>,
    #[serde(default)]
    pub key_store_password: Option<Secret>,
    #[serde(default)]
    pub private_key_password: Option<Secret>,
    #[serde(default = "default_true")]
    pub validate_certificate: bool,
    #[serde(default = "default_true")]
    pub validate_certificate_date: bool,
    #[serde(default)]
    pub trusted_common_names: Vec<String>,
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckEventMode {
    /// Broker confirms a contiguous prefix of the publisher window.
    #[default]
    Windowed,
    /// Broker confirms every message individually.
    PerMessage,
}

impl AckEventMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckEventMode::Windowed => "windowed",
            AckEventMode::PerMessage => "per_message",
        }
    }
}

impl FromStr for AckEventMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "windowed" => Ok(Self::Windowed),
            "per_message" | "per-message" => Ok(Self::PerMessage),
            other => bail!("invalid publisher.ack_event_mode {}", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "PublisherConfig::default_window_size")]
    pub window_size: usize,
    #[serde(default)]
    pub ack_event_mode: AckEventMode,
    #[serde(default = "PublisherConfig::default_autoflush_size")]
    pub autoflush_size: usize,
    #[serde(default = "default_true")]
    pub use_transactions_for_queue: bool,
    #[serde(default)]
    pub use_transactions_for_topics: bool,
    /// Whether the session may be used from several tasks at once.
    #[serde(default = "default_true")]
    pub multi_thread: bool,
    #[serde(default = "PublisherConfig::default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Cycle-level resubmissions after a session failure.
    #[serde(default = "PublisherConfig::default_cycle_retries")]
    pub cycle_retries: u32,
}

impl PublisherConfig {
    const fn default_window_size() -> usize {
        18
    }

    const fn default_autoflush_size() -> usize {
        MAX_AUTOFLUSH_SIZE
    }

    const fn default_ack_timeout_ms() -> u64 {
        30_000
    }

    const fn default_cycle_retries() -> u32 {
        3
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            window_size: Self::default_window_size(),
            ack_event_mode: AckEventMode::default(),
            autoflush_size: Self::default_autoflush_size(),
            use_transactions_for_queue: true,
            use_transactions_for_topics: false,
            multi_thread: true,
            ack_timeout_ms: Self::default_ack_timeout_ms(),
            cycle_retries: Self::default_cycle_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationConfig {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub queue: Option<String>,
}

impl DestinationConfig {
    /// Fixed destinations in publish order: topics first, then the queue.
    pub fn resolve(&self) -> Vec<Destination> {
        let mut out: Vec<Destination> = self
            .topics
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(Destination::topic)
            .collect();
        if let Some(queue) = self.queue.as_deref().map(str::trim) {
            if !queue.is_empty() {
                out.push(Destination::queue(queue));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordProcessor {
    #[default]
    Simple,
    Keyed,
    Dynamic,
}

impl RecordProcessor {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordProcessor::Simple => "simple",
            RecordProcessor::Keyed => "keyed",
            RecordProcessor::Dynamic => "dynamic",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKeyMode {
    #[default]
    None,
    Key,
    ReplyTo,
    CorrelationId,
    CorrelationIdAsBytes,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RecordConfig {
    #[serde(default)]
    pub processor: RecordProcessor,
    #[serde(default)]
    pub message_key: MessageKeyMode,
    /// Copy record headers onto outbound messages.
    #[serde(default)]
    pub emit_headers: bool,
    /// Drop records the translator rejects instead of failing the task.
    #[serde(default)]
    pub ignore_processor_error: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct ErrorFlags {
    #[serde(default)]
    pub ignore_duplicate_subscription: bool,
    #[serde(default)]
    pub ignore_subscription_not_found: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
pub struct SourceConfig {
    /// Offset to start from on task start; `None` resumes from the checkpoint.
    #[serde(default)]
    pub replay_offset: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    pub metrics_bind: Option<String>,
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from a path resolved via SINKBRIDGE_CONFIG or defaults to `config/sinkbridge.toml`.
    /// Applies the SINKBRIDGE_HOSTS and SINKBRIDGE_PASSWORD overrides after parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        Self::parse(&data, is_json(path_ref))
            .with_context(|| format!("invalid config {}", path_ref.display()))
    }

    pub fn parse(data: &str, json: bool) -> Result<Self> {
        if json {
            Ok(serde_json::from_str(data)?)
        } else {
            Ok(toml::from_str(data)?)
        }
    }

    /// Validate ranges and cross-field consistency before a task is built.
    pub fn validate(&self) -> Result<()> {
        if self.session.hosts.iter().all(|h| h.trim().is_empty()) {
            bail!("session.hosts must list at least one host");
        }
        if self.session.vpn_name.is_empty() {
            bail!("session.vpn_name must be non-empty");
        }
        if self.session.keep_alive_interval_ms == 0 {
            bail!("session.keep_alive_interval_ms must be > 0");
        }
        if self.session.keep_alive_limit == 0 {
            bail!("session.keep_alive_limit must be > 0");
        }
        if self.session.authentication_scheme == AuthenticationScheme::ClientCertificate
            && self.session.tls.as_ref().and_then(|t| t.key_store.as_ref()).is_none()
        {
            bail!("client_certificate authentication requires session.tls.key_store");
        }
        let publisher = &self.publisher;
        if publisher.window_size == 0 || publisher.window_size > MAX_WINDOW_SIZE {
            bail!(
                "publisher.window_size must be in 1..={} (got {})",
                MAX_WINDOW_SIZE,
                publisher.window_size
            );
        }
        if publisher.autoflush_size == 0 || publisher.autoflush_size > MAX_AUTOFLUSH_SIZE {
            bail!(
                "publisher.autoflush_size must be in 1..={} (got {})",
                MAX_AUTOFLUSH_SIZE,
                publisher.autoflush_size
            );
        }
        if publisher.ack_timeout_ms == 0 {
            bail!("publisher.ack_timeout_ms must be > 0");
        }
        match self.record.processor {
            RecordProcessor::Dynamic => {}
            RecordProcessor::Simple | RecordProcessor::Keyed => {
                if self.destinations.resolve().is_empty() {
                    bail!("destinations must name at least one topic or a queue");
                }
            }
        }
        if self.record.processor != RecordProcessor::Keyed
            && self.record.message_key != MessageKeyMode::None
        {
            bail!("record.message_key requires record.processor = \"keyed\"");
        }
        Ok(())
    }

    /// Hosts with surrounding whitespace removed and empties dropped.
    pub fn hosts(&self) -> Vec<String> {
        self.session
            .hosts
            .iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect()
    }

    /// Apply SINKBRIDGE_HOSTS and SINKBRIDGE_PASSWORD if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(hosts) = std::env::var("SINKBRIDGE_HOSTS") {
            self.session.hosts = hosts.split(',').map(|h| h.trim().to_string()).collect();
        }
        if let Ok(password) = std::env::var("SINKBRIDGE_PASSWORD") {
            self.session.password = Some(Secret::new(password));
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SINKBRIDGE_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/sinkbridge.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_true() -> bool {
    true
}

fn default_vpn_name() -> String {
    "default".into()
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_retry_wait_ms() -> u64 {
    3_000
}

fn default_keep_alive_interval_ms() -> u64 {
    3_000
}

fn default_keep_alive_limit() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_doc() -> String {
        r#"
[session]
hosts = ["tcp://a:55555", " tcp://b:55555 ", ""]
username = "sink"
password = "hunter2"

[destinations]
topics = ["orders/created"]
queue = "orders"
"#
        .to_string()
    }

    #[test]
    fn defaults_follow_connector_conventions() {
        let cfg = Config::parse(&base_doc(), false).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.publisher.window_size, 18);
        assert_eq!(cfg.publisher.autoflush_size, 200);
        assert_eq!(cfg.publisher.ack_event_mode, AckEventMode::Windowed);
        assert!(cfg.publisher.use_transactions_for_queue);
        assert!(!cfg.publisher.use_transactions_for_topics);
        assert_eq!(cfg.session.keep_alive_limit, 10);
        assert_eq!(cfg.session.reconnect_retry_wait_ms, 3_000);
        assert_eq!(cfg.hosts(), vec!["tcp://a:55555", "tcp://b:55555"]);
        assert_eq!(
            cfg.destinations.resolve(),
            vec![Destination::topic("orders/created"), Destination::queue("orders")]
        );
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let cfg = Config::parse(&base_doc(), false).unwrap();
        let rendered = format!("{:?}", cfg.session);
        assert!(!rendered.contains("hunter2"));
        assert_eq!(cfg.session.password.unwrap().expose(), "hunter2");
    }

    #[test]
    fn autoflush_must_stay_below_transaction_ceiling() {
        let mut cfg = Config::parse(&base_doc(), false).unwrap();
        cfg.publisher.autoflush_size = 201;
        assert!(cfg.validate().is_err());
        cfg.publisher.autoflush_size = 0;
        assert!(cfg.validate().is_err());
        cfg.publisher.autoflush_size = 200;
        cfg.publisher.window_size = 256;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fixed_processors_need_a_destination() {
        let doc = "[session]\nhosts = [\"tcp://a\"]\n";
        let cfg = Config::parse(doc, false).unwrap();
        assert!(cfg.validate().is_err());

        let dynamic = format!("{doc}\n[record]\nprocessor = \"dynamic\"\n");
        let cfg = Config::parse(&dynamic, false).unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn message_key_requires_keyed_processor() {
        let doc = format!("{}\n[record]\nmessage_key = \"reply_to\"\n", base_doc());
        let cfg = Config::parse(&doc, false).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn client_certificate_needs_key_store() {
        let doc = base_doc().replace(
            "password = \"hunter2\"",
            "authentication_scheme = \"client_certificate\"",
        );
        let cfg = Config::parse(&doc, false).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_documents_parse() {
        let doc = r#"{"session": {"hosts": ["tcp://a"]}, "destinations": {"queue": "q"},
                      "publisher": {"ack_event_mode": "per_message"}}"#;
        let cfg = Config::parse(doc, true).unwrap();
        assert_eq!(cfg.publisher.ack_event_mode, AckEventMode::PerMessage);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn ack_mode_parses_from_cli_strings() {
        assert_eq!(
            AckEventMode::from_str("per-message").unwrap(),
            AckEventMode::PerMessage
        );
        assert!(AckEventMode::from_str("batched").is_err());
    }
}
