use serde::Deserialize;
use std::path::Path;

/// Bus-wide defaults loadable from a TOML file. Every field has a default,
/// so an empty file (or no file at all) yields a working configuration.
#[derive(Deserialize, Debug)]
pub struct BusConfig {
    #[serde(default = "defaults::channel")]
    pub channel: String,
    #[serde(default = "defaults::message_count")]
    pub message_count: u32,
    #[serde(default = "defaults::buffer_bytes")]
    pub buffer_bytes: u32,
    #[serde(default = "defaults::mtu")]
    pub mtu: usize,
    #[serde(default = "defaults::tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn channel() -> String {
        "shmbus".into()
    }

    pub fn message_count() -> u32 {
        256
    }

    pub fn buffer_bytes() -> u32 {
        8 * 1024 * 1024
    }

    pub fn mtu() -> usize {
        1500
    }

    pub fn tcp_port() -> u16 {
        5555
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes from defaults")
    }
}

impl BusConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: BusConfig = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BusConfig::default();
        assert_eq!(config.message_count, 256);
        assert_eq!(config.buffer_bytes, 8 * 1024 * 1024);
        assert_eq!(config.mtu, 1500);
    }

    #[test]
    fn partial_toml_fills_the_rest() {
        let config: BusConfig = toml::from_str("channel = \"prod\"\nmtu = 9000\n").unwrap();
        assert_eq!(config.channel, "prod");
        assert_eq!(config.mtu, 9000);
        assert_eq!(config.tcp_port, 5555);
    }
}
