//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use duo_core::{MacAddress, RadioType, Settings};
use serde::Deserialize;

/// Host configuration. File: ~/.config/duolink/config.toml or /etc/duolink/config.toml,
/// or the path given by `--config` / DUOLINK_CONFIG.
/// Env overrides: DUOLINK_RADIO, DUOLINK_BIND, DUOLINK_PEER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The device settings the engines read.
    #[serde(default)]
    pub settings: Settings,
    /// Local UDP socket standing in for this device's radio (default 127.0.0.1:47001).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Where the paired device's socket lives (default 127.0.0.1:47002).
    #[serde(default = "default_peer")]
    pub peer: SocketAddr,
    /// This device's short-range hardware address.
    #[serde(default = "default_my_mac")]
    pub my_mac: MacAddress,
    #[serde(default = "default_lora_frequency")]
    pub lora_frequency_mhz: f32,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 47001))
}
fn default_peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 47002))
}
fn default_my_mac() -> MacAddress {
    // Locally administered unicast.
    MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
}
fn default_lora_frequency() -> f32 {
    915.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            bind: default_bind(),
            peer: default_peer(),
            my_mac: default_my_mac(),
            lora_frequency_mhz: default_lora_frequency(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}={value:?}: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Load config: defaults, then the config file (explicit path, else the first standard
/// location that exists), then env vars.
pub fn load(explicit: Option<PathBuf>) -> Result<Config, ConfigError> {
    let explicit = explicit.or_else(|| std::env::var_os("DUOLINK_CONFIG").map(PathBuf::from));
    let mut c = match explicit {
        Some(path) => load_file(&path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/duolink/config.toml"));
    }
    out.push(PathBuf::from("/etc/duolink/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn apply_env(
    c: &mut Config,
    lookup: impl Fn(&'static str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(s) = lookup("DUOLINK_RADIO") {
        c.settings.radio = parse_radio(&s).ok_or_else(|| ConfigError::Env {
            var: "DUOLINK_RADIO",
            value: s.clone(),
            reason: "expected esp-now or lora".into(),
        })?;
    }
    if let Some(s) = lookup("DUOLINK_BIND") {
        c.bind = parse_addr("DUOLINK_BIND", s)?;
    }
    if let Some(s) = lookup("DUOLINK_PEER") {
        c.peer = parse_addr("DUOLINK_PEER", s)?;
    }
    Ok(())
}

fn parse_radio(s: &str) -> Option<RadioType> {
    match s.to_ascii_lowercase().as_str() {
        "esp-now" | "espnow" => Some(RadioType::EspNow),
        "lora" => Some(RadioType::Lora),
        _ => None,
    }
}

fn parse_addr(var: &'static str, value: String) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|e: std::net::AddrParseError| ConfigError::Env {
        var,
        reason: e.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use duo_core::LoraAddress;

    #[test]
    fn empty_file_gives_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.bind, default_bind());
        assert_eq!(c.peer, default_peer());
        assert_eq!(c.lora_frequency_mhz, 915.0);
        assert_eq!(c.settings, Settings::default());
    }

    #[test]
    fn full_file() {
        let c = parse(
            r#"
            bind = "0.0.0.0:5000"
            peer = "192.168.1.20:5000"
            my_mac = "7c:df:a1:94:8a:06"
            lora_frequency_mhz = 868.0

            [settings]
            radio = "lora"
            other_mac = "7C:DF:A1:94:8D:80"
            my_lora_address = 1
            other_lora_address = 2
            "#,
        )
        .unwrap();
        assert_eq!(c.bind.port(), 5000);
        assert_eq!(c.my_mac.to_string(), "7C:DF:A1:94:8A:06");
        assert_eq!(c.settings.radio, RadioType::Lora);
        assert_eq!(c.settings.my_lora_address, LoraAddress(1));
        assert_eq!(c.lora_frequency_mhz, 868.0);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(&mut c, |var| match var {
            "DUOLINK_RADIO" => Some("LoRa".into()),
            "DUOLINK_PEER" => Some("10.0.0.2:9000".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(c.settings.radio, RadioType::Lora);
        assert_eq!(c.peer, "10.0.0.2:9000".parse().unwrap());
        assert_eq!(c.bind, default_bind());
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut c = Config::default();
        let err = apply_env(&mut c, |var| (var == "DUOLINK_BIND").then(|| "nope".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "DUOLINK_BIND", .. }));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_file(Path::new("/nonexistent/duolink.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
