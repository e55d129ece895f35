//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Node configuration. File: ~/.config/cloak/config.toml or
/// /etc/cloak/config.toml. Env overrides: CLOAK_RELAY_ADDR,
/// CLOAK_LISTEN_PORT, CLOAK_DATA_DIR, CLOAK_ZERO_TRACE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Rendezvous relay address (host:port).
    #[serde(default = "default_relay_addr")]
    pub relay_addr: String,
    /// Direct transport listen port (default 45800).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Address advertised to remote peers in offers/answers. Defaults to
    /// 127.0.0.1:<listen_port> when unset.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Data directory for identity, chat logs and received files.
    /// Defaults to ~/.local/share/cloak.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// No-trace mode: nothing is persisted, only in-memory mirrors exist.
    #[serde(default)]
    pub zero_trace: bool,
    /// Room to join instead of registering a direct-messenger identity.
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub room_password: Option<String>,
    /// Accept incoming transfers without asking (daemon mode).
    #[serde(default = "default_true")]
    pub auto_accept_transfers: bool,
}

fn default_relay_addr() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_listen_port() -> u16 {
    45800
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_addr: default_relay_addr(),
            listen_port: default_listen_port(),
            advertise_addr: None,
            data_dir: None,
            zero_trace: false,
            room: None,
            room_password: None,
            auto_accept_transfers: true,
        }
    }
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        if let Some(d) = &self.data_dir {
            return d.clone();
        }
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|h| h.join(".local/share/cloak"))
            .unwrap_or_else(|| PathBuf::from("cloak-data"))
    }

    pub fn advertise_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.listen_port))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("CLOAK_RELAY_ADDR") {
        if !s.is_empty() {
            c.relay_addr = s;
        }
    }
    if let Ok(s) = std::env::var("CLOAK_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("CLOAK_DATA_DIR") {
        if !s.is_empty() {
            c.data_dir = Some(PathBuf::from(s));
        }
    }
    if let Ok(s) = std::env::var("CLOAK_ZERO_TRACE") {
        c.zero_trace = s == "1" || s.eq_ignore_ascii_case("true");
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/cloak/config.toml"));
    }
    out.push(PathBuf::from("/etc/cloak/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let c = Config::default();
        assert_eq!(c.listen_port, 45800);
        assert!(!c.zero_trace);
        assert!(c.auto_accept_transfers);
        assert_eq!(c.advertise_addr(), "127.0.0.1:45800");
    }

    #[test]
    fn toml_overrides_defaults() {
        let c: Config = toml::from_str(
            r#"
            relay_addr = "relay.example.net:9090"
            listen_port = 4000
            zero_trace = true
            "#,
        )
        .unwrap();
        assert_eq!(c.relay_addr, "relay.example.net:9090");
        assert_eq!(c.listen_port, 4000);
        assert!(c.zero_trace);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("mystery = 1").is_err());
    }
}
