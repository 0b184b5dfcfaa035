use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use serialport::{DataBits, SerialPortBuilder, StopBits};

/// Parity setting for the RS-485 side.
///
/// Accepts both the long spelling (`none`/`even`/`odd`) and the single-letter
/// form (`N`/`E`/`O`) commonly found in serial tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[serde(alias = "N")]
    None,
    #[serde(alias = "E")]
    Even,
    #[serde(alias = "O")]
    Odd,
}

/// TCP listener settings (`[tcp]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Idle timeout (seconds) after which a silent client connection is closed
    pub idle_timeout_s: f64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 502,
            idle_timeout_s: 60.0,
        }
    }
}

/// Serial bus settings (`[rtu]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtuConfig {
    /// Serial device path
    pub port: String,
    /// Baud rate
    pub baud: u32,
    /// Data bits (7 or 8)
    #[serde(alias = "bytesize")]
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    #[serde(alias = "stopbits")]
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Per-attempt response timeout (seconds)
    pub response_timeout_s: f64,
    /// Number of bus attempts before a request is reported failed
    pub retry_count: u32,
    /// Silence inserted around frames (seconds)
    pub inter_frame_delay_s: f64,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            response_timeout_s: 1.0,
            retry_count: 3,
            inter_frame_delay_s: 0.05,
        }
    }
}

impl RtuConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.response_timeout_s)
    }

    pub fn inter_frame_delay(&self) -> Duration {
        Duration::from_secs_f64(self.inter_frame_delay_s)
    }

    /// Map the configured line parameters onto a serial port builder.
    pub fn apply_builder(&self, b: SerialPortBuilder) -> SerialPortBuilder {
        let b = b.data_bits(match self.data_bits {
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let b = b.stop_bits(match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        });

        b.parity(match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        })
    }
}

/// Root configuration structure.
///
/// Every key has a default, so a partial file (or no file at all) is fine.
/// Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub tcp: TcpConfig,
    pub rtu: RtuConfig,
}

impl GatewayConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Parsing gateway configuration")
    }

    /// Read configuration from a file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading configuration file {path}"))?;
        Self::from_toml(&content)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.tcp.host, self.tcp.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tcp.idle_timeout_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.tcp.port, 502);
        assert_eq!(config.tcp.host, "0.0.0.0");
        assert_eq!(config.rtu.baud, 9600);
        assert_eq!(config.rtu.retry_count, 3);
        assert_eq!(config.rtu.parity, Parity::None);
        assert_eq!(config.rtu.response_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_falls_back() {
        let config = GatewayConfig::from_toml(
            r#"
            [rtu]
            port = "/dev/ttyAMA0"
            baud = 19200
            "#,
        )
        .unwrap();
        assert_eq!(config.rtu.port, "/dev/ttyAMA0");
        assert_eq!(config.rtu.baud, 19200);
        // everything else keeps its default
        assert_eq!(config.tcp.port, 502);
        assert_eq!(config.rtu.retry_count, 3);
    }

    #[test]
    fn test_short_aliases() {
        let config = GatewayConfig::from_toml(
            r#"
            [rtu]
            port = "COM3"
            parity = "E"
            stopbits = 2
            bytesize = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.rtu.parity, Parity::Even);
        assert_eq!(config.rtu.stop_bits, 2);
        assert_eq!(config.rtu.data_bits, 7);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = GatewayConfig::from_toml(
            r#"
            [tcp]
            port = 1502
            color = "blue"

            [metrics]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.tcp.port, 1502);
    }

    #[test]
    fn test_roundtrip() {
        let config = GatewayConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = GatewayConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.listen_addr(), config.listen_addr());
        assert_eq!(parsed.rtu.port, config.rtu.port);
    }
}
