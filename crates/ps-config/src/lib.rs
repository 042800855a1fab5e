//! # ps-config
//!
//! Typed configuration for PacketStreamer. Both roles share one YAML file
//! format; the raw form is deserialized with serde and then resolved into a
//! [`Config`] with all defaults applied. Per-role validation lives in
//! [`validate_sensor`] and [`validate_receiver`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

mod error;
mod validate;

pub use error::ConfigError;
pub use validate::{validate_receiver, validate_sensor};

/// Kernel capture filter mode.
///
/// `Allow` captures only the configured ports, `Deny` captures everything
/// except the configured ports, `All` ignores the port lists entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcapMode {
    Allow,
    Deny,
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileOutputConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerOutputConfig {
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub file: Option<FileOutputConfig>,
    pub server: Option<ServerOutputConfig>,
    pub plugins: Option<PluginsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enable: bool,
    #[serde(rename = "certfile")]
    pub cert_file: String,
    #[serde(rename = "keyfile")]
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enable: bool,
    pub key: String,
}

/// Keep `max_pkts_to_write` out of every `max_total_pkts` captured packets.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SamplingRateConfig {
    #[serde(rename = "maxpktstowrite")]
    pub max_pkts_to_write: usize,
    #[serde(rename = "maxtotalpkts")]
    pub max_total_pkts: usize,
}

impl Default for SamplingRateConfig {
    fn default() -> Self {
        Self {
            max_pkts_to_write: 1,
            max_total_pkts: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub s3: Option<S3PluginConfig>,
    pub kafka: Option<KafkaPluginConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3PluginConfig {
    pub bucket: String,
    pub region: String,
    /// Bytes uploaded to one object before the upload is completed.
    #[serde(rename = "totalfilesize", default = "default_s3_total_file_size")]
    pub total_file_size: u64,
    /// Buffered bytes that trigger one part upload.
    #[serde(rename = "uploadchunksize", default = "default_s3_upload_chunk_size")]
    pub upload_chunk_size: u64,
    /// Idle seconds after which the current upload is finalized.
    #[serde(rename = "uploadtimeout", default = "default_s3_upload_timeout")]
    pub upload_timeout_secs: u64,
    #[serde(rename = "cannedacl", default)]
    pub canned_acl: Option<String>,
    /// strftime-style template for object keys.
    #[serde(rename = "keyformat", default = "default_s3_key_format")]
    pub key_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaPluginConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    /// Upper bound for one broker message body, in bytes.
    #[serde(rename = "messagesize", default = "default_kafka_message_size")]
    pub message_size: usize,
    /// Bytes published under one file id before rotating to a fresh id.
    #[serde(rename = "filesize", default = "default_kafka_file_size")]
    pub file_size: u64,
}

fn default_s3_total_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_s3_upload_chunk_size() -> u64 {
    5 * 1024 * 1024
}

fn default_s3_upload_timeout() -> u64 {
    60
}

fn default_s3_key_format() -> String {
    "%Y-%m-%d-%H-%S".to_string()
}

fn default_kafka_message_size() -> usize {
    1024 * 1024
}

fn default_kafka_file_size() -> u64 {
    100 * 1024 * 1024
}

/// The configuration file as written on disk, before defaults are applied.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    input: Option<InputConfig>,
    output: OutputConfig,
    tls: TlsConfig,
    auth: AuthConfig,
    #[serde(rename = "compressBlockSize")]
    compress_block_size: Option<usize>,
    #[serde(rename = "inputPacketLen")]
    input_packet_len: Option<usize>,
    #[serde(rename = "logFilename")]
    log_filename: Option<String>,
    #[serde(rename = "pcapMode")]
    pcap_mode: Option<String>,
    #[serde(rename = "capturePorts")]
    capture_ports: Vec<u16>,
    #[serde(rename = "captureInterfacesPorts")]
    capture_interfaces_ports: HashMap<String, Vec<u16>>,
    #[serde(rename = "ignorePorts")]
    ignore_ports: Vec<u16>,
    #[serde(rename = "samplingRate")]
    sampling_rate: Option<SamplingRateConfig>,
    #[serde(rename = "maxGatherWaitMillis")]
    max_gather_wait_millis: Option<u64>,
}

/// Resolved configuration with every default applied. Immutable after
/// startup; only the capture plan derived from it changes at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub input: Option<InputConfig>,
    pub output: OutputConfig,
    pub tls: TlsConfig,
    pub auth: AuthConfig,
    /// Compression block size in KiB.
    pub compress_block_size: usize,
    /// Capture snaplen in bytes.
    pub input_packet_len: usize,
    pub log_filename: Option<String>,
    pub pcap_mode: PcapMode,
    pub capture_ports: Vec<u16>,
    pub capture_interfaces_ports: HashMap<String, Vec<u16>>,
    /// Parsed for config-file compatibility; not consulted by the capture
    /// filter derivation.
    pub ignore_ports: Vec<u16>,
    pub sampling_rate: SamplingRateConfig,
    /// Longest time a partial batch may sit in the gather stage.
    pub max_gather_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input: None,
            output: OutputConfig::default(),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            compress_block_size: 65,
            input_packet_len: 65535,
            log_filename: None,
            pcap_mode: PcapMode::All,
            capture_ports: Vec::new(),
            capture_interfaces_ports: HashMap::new(),
            ignore_ports: Vec::new(),
            sampling_rate: SamplingRateConfig::default(),
            max_gather_wait: Duration::from_millis(1000),
        }
    }
}

impl Config {
    /// Read and resolve the YAML configuration file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        raw.resolve()
    }

    /// Resolve a configuration from a YAML string.
    pub fn from_yaml(contents: &str) -> Result<Config, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;
        raw.resolve()
    }

    /// Size of one gather batch, in bytes.
    pub fn max_gather_len(&self) -> usize {
        self.compress_block_size * 1024
    }
}

impl RawConfig {
    fn resolve(self) -> Result<Config, ConfigError> {
        let pcap_mode = match self.pcap_mode.as_deref() {
            Some("allow") => PcapMode::Allow,
            Some("deny") => PcapMode::Deny,
            Some("all") | Some("") | None => PcapMode::All,
            Some(other) => return Err(ConfigError::InvalidPcapMode(other.to_string())),
        };

        let mut sampling_rate = self.sampling_rate.unwrap_or_default();
        if sampling_rate.max_total_pkts == 0 {
            sampling_rate.max_total_pkts = 1;
        }
        if sampling_rate.max_pkts_to_write > sampling_rate.max_total_pkts {
            sampling_rate.max_pkts_to_write = sampling_rate.max_total_pkts;
        }

        Ok(Config {
            input: self.input,
            output: self.output,
            tls: self.tls,
            auth: self.auth,
            compress_block_size: self.compress_block_size.unwrap_or(65),
            input_packet_len: self.input_packet_len.unwrap_or(65535),
            log_filename: self.log_filename,
            pcap_mode,
            capture_ports: self.capture_ports,
            capture_interfaces_ports: self.capture_interfaces_ports,
            ignore_ports: self.ignore_ports,
            sampling_rate,
            max_gather_wait: Duration::from_millis(self.max_gather_wait_millis.unwrap_or(1000)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.compress_block_size, 65);
        assert_eq!(config.input_packet_len, 65535);
        assert_eq!(config.pcap_mode, PcapMode::All);
        assert_eq!(config.sampling_rate.max_pkts_to_write, 1);
        assert_eq!(config.sampling_rate.max_total_pkts, 1);
        assert_eq!(config.max_gather_wait, Duration::from_millis(1000));
        assert_eq!(config.max_gather_len(), 65 * 1024);
        assert!(config.input.is_none());
        assert!(config.output.file.is_none());
        assert!(!config.tls.enable);
        assert!(!config.auth.enable);
    }

    #[test]
    fn test_full_sensor_config() {
        let config = Config::from_yaml(
            r#"
output:
  server:
    address: receiver.example.com
    port: 8081
  plugins:
    s3:
      bucket: pcap-archive
      region: eu-west-1
    kafka:
      brokers:
        - broker-1:9092
        - broker-2:9092
      topic: packets
tls:
  enable: true
  certfile: /etc/packetstreamer/tls.crt
  keyfile: /etc/packetstreamer/tls.key
auth:
  enable: true
  key: secret
compressBlockSize: 128
inputPacketLen: 1500
pcapMode: allow
capturePorts:
  - 8000
  - 8001
captureInterfacesPorts:
  eth0:
    - 9000
ignorePorts:
  - 22
samplingRate:
  maxpktstowrite: 2
  maxtotalpkts: 5
"#,
        )
        .unwrap();

        let server = config.output.server.as_ref().unwrap();
        assert_eq!(server.address, "receiver.example.com");
        assert_eq!(server.port, Some(8081));
        assert_eq!(config.compress_block_size, 128);
        assert_eq!(config.input_packet_len, 1500);
        assert_eq!(config.pcap_mode, PcapMode::Allow);
        assert_eq!(config.capture_ports, vec![8000, 8001]);
        assert_eq!(config.capture_interfaces_ports["eth0"], vec![9000]);
        assert_eq!(config.ignore_ports, vec![22]);
        assert_eq!(config.sampling_rate.max_pkts_to_write, 2);
        assert_eq!(config.sampling_rate.max_total_pkts, 5);
        assert!(config.tls.enable);
        assert_eq!(config.auth.key, "secret");

        let plugins = config.output.plugins.as_ref().unwrap();
        let s3 = plugins.s3.as_ref().unwrap();
        assert_eq!(s3.bucket, "pcap-archive");
        assert_eq!(s3.total_file_size, 10 * 1024 * 1024);
        assert_eq!(s3.key_format, "%Y-%m-%d-%H-%S");
        let kafka = plugins.kafka.as_ref().unwrap();
        assert_eq!(kafka.brokers.len(), 2);
        assert_eq!(kafka.message_size, 1024 * 1024);
    }

    #[test]
    fn test_invalid_pcap_mode() {
        let err = Config::from_yaml("pcapMode: sometimes").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPcapMode(mode) if mode == "sometimes"));
    }

    #[test]
    fn test_sampling_rate_normalized() {
        let config = Config::from_yaml(
            r#"
samplingRate:
  maxpktstowrite: 9
  maxtotalpkts: 0
"#,
        )
        .unwrap();
        assert_eq!(config.sampling_rate.max_total_pkts, 1);
        assert_eq!(config.sampling_rate.max_pkts_to_write, 1);
    }
}
