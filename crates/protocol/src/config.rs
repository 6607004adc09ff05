use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastellanConfig {
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Cast channel TLS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Model string reported in DEVICE_INFO and mDNS
    #[serde(default = "default_device_model")]
    pub device_model: String,
    /// Name shown on sender devices
    #[serde(default = "default_friendly_name")]
    pub friendly_name: String,
    /// Only accept connections whose remote address starts with this prefix
    pub client_prefix: Option<String>,
    /// Advertise the receiver with mDNS
    #[serde(default)]
    pub enable_mdns: bool,
}

/// Where the certificate manifest comes from. Sources are tried in order:
/// explicit file, day-keyed file in a directory, certificate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Path to a manifest JSON file
    pub path: Option<String>,
    /// Directory holding `certs-YYYYMMDD.json` manifests
    pub dir: Option<String>,
    /// Base URL of a certificate service
    pub service_url: Option<String>,
    /// Salt for the certificate service probe checksum
    pub service_salt: Option<String>,
    /// Re-escape raw newlines so the manifest parses as JSON
    #[serde(default)]
    pub fix_newlines: bool,
}

/// When `host` is set the receiver proxies every non-auth message to
/// another receiver instead of handling it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Send a device-auth challenge to the relay target on connect
    #[serde(default)]
    pub auth_challenge: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            device_model: default_device_model(),
            friendly_name: default_friendly_name(),
            client_prefix: None,
            enable_mdns: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            auth_challenge: false,
        }
    }
}

impl Default for CastellanConfig {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            manifest: ManifestConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8009
}

fn default_device_model() -> String {
    "Castellan".to_string()
}

fn default_friendly_name() -> String {
    "Castellan Receiver".to_string()
}
