//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration. File: `--config <path>`, ~/.config/vox-edge/config.toml or
/// /etc/vox-edge/config.toml. Env overrides: MQTT_HOST, MQTT_PORT, MQTT_USER, MQTT_PASS,
/// CERT_NAME, CERT_PATH.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Empty means generate `vox-edge-<hex>`.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    /// Bound of the inbound message channel.
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "ultra96".into()
}
fn default_keep_alive_secs() -> u16 {
    60
}
fn default_inbound_capacity() -> usize {
    64
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Directory holding `<prefix>ca.crt`, `<prefix>client.crt`, `<prefix>client.key`.
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,
    #[serde(default)]
    pub cert_prefix: String,
    /// SNI / verification name; defaults to the broker host.
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("secrets")
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            secrets_dir: default_secrets_dir(),
            cert_prefix: String::new(),
            server_name: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicsConfig {
    #[serde(default = "default_fragments_topic")]
    pub fragments: String,
    #[serde(default = "default_control_topic")]
    pub control: String,
    #[serde(default = "default_results_topic")]
    pub results: String,
}

fn default_fragments_topic() -> String {
    "esp32/voice_data".into()
}
fn default_control_topic() -> String {
    "esp32/command".into()
}
fn default_results_topic() -> String {
    "ultra96/voice_result".into()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            fragments: default_fragments_topic(),
            control: default_control_topic(),
            results: default_results_topic(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,
    /// Deadline evaluation cadence.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_session_timeout_ms() -> u64 {
    2000
}
fn default_tick_ms() -> u64 {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_session_timeout_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfig {
    #[serde(default = "default_tx_device")]
    pub tx_device: PathBuf,
    #[serde(default = "default_rx_device")]
    pub rx_device: PathBuf,
    /// Bound on one hardware transaction.
    #[serde(default = "default_hardware_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_tx_device() -> PathBuf {
    PathBuf::from("/dev/dma_proxy_tx")
}
fn default_rx_device() -> PathBuf {
    PathBuf::from("/dev/dma_proxy_rx")
}
fn default_hardware_timeout_ms() -> u64 {
    5000
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            tx_device: default_tx_device(),
            rx_device: default_rx_device(),
            timeout_ms: default_hardware_timeout_ms(),
        }
    }
}

impl HardwareConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    /// One backoff unit.
    #[serde(default = "default_unit_ms")]
    pub unit_ms: u64,
    #[serde(default = "default_max_units")]
    pub max_units: u32,
}

fn default_unit_ms() -> u64 {
    1000
}
fn default_max_units() -> u32 {
    vox_core::backoff::DEFAULT_MAX_UNITS
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            unit_ms: default_unit_ms(),
            max_units: default_max_units(),
        }
    }
}

impl ReconnectConfig {
    pub fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}={value:?} is not a valid port")]
    BadPort { var: &'static str, value: String },
}

/// Load config: merge default, then config file (explicit path or first existing search path),
/// then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/vox-edge/config.toml"));
    }
    out.push(PathBuf::from("/etc/vox-edge/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply environment overrides through `get` (a lookup, so tests need not touch the process env).
fn apply_env(c: &mut Config, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = get("MQTT_HOST") {
        c.broker.host = s;
    }
    if let Some(s) = get("MQTT_PORT") {
        c.broker.port = s.parse().map_err(|_| ConfigError::BadPort {
            var: "MQTT_PORT",
            value: s.clone(),
        })?;
    }
    if let Some(s) = get("MQTT_USER").filter(|s| !s.is_empty()) {
        c.broker.username = Some(s);
    }
    if let Some(s) = get("MQTT_PASS").filter(|s| !s.is_empty()) {
        c.broker.password = Some(s);
    }
    if let Some(s) = get("CERT_NAME") {
        c.tls.cert_prefix = s;
    }
    if let Some(s) = get("CERT_PATH").filter(|s| !s.is_empty()) {
        c.tls.secrets_dir = PathBuf::from(s);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_deployment() {
        let c = Config::default();
        assert_eq!(c.broker.client_id, "ultra96");
        assert_eq!(c.broker.port, 1883);
        assert_eq!(c.topics.fragments, "esp32/voice_data");
        assert_eq!(c.topics.control, "esp32/command");
        assert_eq!(c.topics.results, "ultra96/voice_result");
        assert_eq!(c.session.timeout(), Duration::from_secs(2));
        assert_eq!(c.hardware.timeout(), Duration::from_secs(5));
        assert_eq!(c.reconnect.max_units, 30);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[broker]\nhost = \"broker.local\"\nport = 8883\n\n[hardware]\ntimeout_ms = 750"
        )
        .unwrap();
        let c = load_file(f.path()).unwrap();
        assert_eq!(c.broker.host, "broker.local");
        assert_eq!(c.broker.port, 8883);
        assert_eq!(c.broker.keep_alive_secs, 60);
        assert_eq!(c.hardware.timeout_ms, 750);
        assert_eq!(c.topics.results, "ultra96/voice_result");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[broker]\nhots = \"typo\"").unwrap();
        assert!(matches!(load_file(f.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("MQTT_HOST", "10.0.0.5"),
                ("MQTT_PORT", "8883"),
                ("MQTT_USER", "edge"),
                ("MQTT_PASS", ""),
                ("CERT_NAME", "ultra96-"),
                ("CERT_PATH", "/opt/certs"),
            ]),
        )
        .unwrap();
        assert_eq!(c.broker.host, "10.0.0.5");
        assert_eq!(c.broker.port, 8883);
        assert_eq!(c.broker.username.as_deref(), Some("edge"));
        assert_eq!(c.broker.password, None);
        assert_eq!(c.tls.cert_prefix, "ultra96-");
        assert_eq!(c.tls.secrets_dir, PathBuf::from("/opt/certs"));
    }

    #[test]
    fn bad_port_env_is_an_error() {
        let mut c = Config::default();
        let r = apply_env(&mut c, env(&[("MQTT_PORT", "eighty")]));
        assert!(matches!(r, Err(ConfigError::BadPort { var: "MQTT_PORT", .. })));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let r = load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(r, Err(ConfigError::Read { .. })));
    }
}
