//! Engine tuning knobs. Defaults match the deployed radio network; hosts can
//! deserialize overrides from their own config file.

use serde::Deserialize;

/// Channel and timing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// RF channel for paired-peer traffic (default 108).
    #[serde(default = "default_data_channel")]
    pub data_channel: u8,
    /// RF channel the pairing exchange runs on (default 109).
    #[serde(default = "default_config_channel")]
    pub config_channel: u8,
    /// Inter-fragment timeout before a partial message is discarded.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Overall budget for one pairing attempt.
    #[serde(default = "default_pairing_timeout_ms")]
    pub pairing_timeout_ms: u64,
    /// Minimum spacing between pairing transmissions.
    #[serde(default = "default_pairing_interval_ms")]
    pub pairing_interval_ms: u64,
    /// Listen time before a silent node escalates to the transmit role.
    #[serde(default = "default_pairing_listen_ms")]
    pub pairing_listen_ms: u64,
}

fn default_data_channel() -> u8 {
    108
}
fn default_config_channel() -> u8 {
    109
}
fn default_receive_timeout_ms() -> u64 {
    1000
}
fn default_pairing_timeout_ms() -> u64 {
    10_000
}
fn default_pairing_interval_ms() -> u64 {
    250
}
fn default_pairing_listen_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_channel: default_data_channel(),
            config_channel: default_config_channel(),
            receive_timeout_ms: default_receive_timeout_ms(),
            pairing_timeout_ms: default_pairing_timeout_ms(),
            pairing_interval_ms: default_pairing_interval_ms(),
            pairing_listen_ms: default_pairing_listen_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.data_channel, 108);
        assert_eq!(cfg.config_channel, 109);
        assert_eq!(cfg.receive_timeout_ms, 1000);
        assert_eq!(cfg.pairing_timeout_ms, 10_000);
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"data_channel": 90}"#).unwrap();
        assert_eq!(cfg.data_channel, 90);
        assert_eq!(cfg.config_channel, 109);
        assert_eq!(cfg.pairing_interval_ms, 250);
    }
}
