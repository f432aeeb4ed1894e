//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Relay configuration. File: ~/.config/relay/config.toml or /etc/relay/config.toml.
/// Env overrides: RELAY_LISTEN_PORT, RELAY_BROADCAST_PORT, RELAY_NAME, RELAY_MAX_CLIENTS, ...
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Session listen port (default 8520).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Discovery UDP port (default 8521).
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,
    /// Display name advertised in discovery replies.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Group subscriptions kept per client.
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,
    /// Unsent bytes a session may queue before it is closed with `Overflow`.
    #[serde(default = "default_max_backlog_bytes")]
    pub max_backlog_bytes: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Per-endpoint connect timeout for direct transfers.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Announced transfers not claimed within this window are dropped.
    #[serde(default = "default_transfer_pending_timeout_secs")]
    pub transfer_pending_timeout_secs: u64,
    #[serde(default = "default_keepalive_time_secs")]
    pub keepalive_time_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

fn default_listen_port() -> u16 {
    8520
}
fn default_broadcast_port() -> u16 {
    8521
}
fn default_name() -> String {
    "relay".to_string()
}
fn default_max_clients() -> usize {
    64
}
fn default_max_groups() -> usize {
    32
}
fn default_max_backlog_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_transfer_pending_timeout_secs() -> u64 {
    300
}
fn default_keepalive_time_secs() -> u64 {
    30
}
fn default_keepalive_interval_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            broadcast_port: default_broadcast_port(),
            name: default_name(),
            max_clients: default_max_clients(),
            max_groups: default_max_groups(),
            max_backlog_bytes: default_max_backlog_bytes(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            transfer_pending_timeout_secs: default_transfer_pending_timeout_secs(),
            keepalive_time_secs: default_keepalive_time_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn transfer_pending_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_pending_timeout_secs)
    }

    pub fn keepalive(&self) -> Keepalive {
        Keepalive {
            time: Duration::from_secs(self.keepalive_time_secs),
            interval: Duration::from_secs(self.keepalive_interval_secs),
        }
    }
}

/// TCP keepalive probe parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub time: Duration,
    pub interval: Duration,
}

/// Load config: merge default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let mut c = match explicit {
        Some(p) => read_file(p).unwrap_or_default(),
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let raw = var(key)?;
        match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable environment override");
                None
            }
        }
    }

    if let Some(p) = parsed(&var, "RELAY_LISTEN_PORT") {
        c.listen_port = p;
    }
    if let Some(p) = parsed(&var, "RELAY_BROADCAST_PORT") {
        c.broadcast_port = p;
    }
    if let Some(n) = var("RELAY_NAME") {
        c.name = n;
    }
    if let Some(n) = parsed(&var, "RELAY_MAX_CLIENTS") {
        c.max_clients = n;
    }
    if let Some(n) = parsed(&var, "RELAY_MAX_GROUPS") {
        c.max_groups = n;
    }
    if let Some(n) = parsed(&var, "RELAY_MAX_BACKLOG_BYTES") {
        c.max_backlog_bytes = n;
    }
    if let Some(n) = parsed(&var, "RELAY_HANDSHAKE_TIMEOUT_MS") {
        c.handshake_timeout_ms = n;
    }
    if let Some(n) = parsed(&var, "RELAY_CONNECT_TIMEOUT_MS") {
        c.connect_timeout_ms = n;
    }
    if let Some(n) = parsed(&var, "RELAY_TRANSFER_PENDING_TIMEOUT_SECS") {
        c.transfer_pending_timeout_secs = n;
    }
    if let Some(n) = parsed(&var, "RELAY_KEEPALIVE_TIME_SECS") {
        c.keepalive_time_secs = n;
    }
    if let Some(n) = parsed(&var, "RELAY_KEEPALIVE_INTERVAL_SECS") {
        c.keepalive_interval_secs = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/relay/config.toml"));
    }
    out.push(PathBuf::from("/etc/relay/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    read_file(&path)
}

fn read_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file; using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file; using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("listen_port = 9000\nname = \"lab\"\n").unwrap();
        assert_eq!(c.listen_port, 9000);
        assert_eq!(c.name, "lab");
        assert_eq!(c.broadcast_port, 8521);
        assert_eq!(c.max_clients, 64);
        assert_eq!(c.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("RELAY_LISTEN_PORT", "7000"),
            ("RELAY_MAX_GROUPS", "4"),
            ("RELAY_MAX_CLIENTS", "many"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 7000);
        assert_eq!(c.max_groups, 4);
        assert_eq!(c.max_clients, 64);
    }

    #[test]
    fn explicit_path_is_read() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "max_backlog_bytes = 1024").unwrap();
        let c = read_file(f.path()).unwrap();
        assert_eq!(c.max_backlog_bytes, 1024);
    }

    #[test]
    fn broken_file_falls_back() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "listen_port = \"nope\"").unwrap();
        assert!(read_file(f.path()).is_none());
    }
}
