//! Bridge configuration
//!
//! Fully data-driven configuration for the provisioning bridge. Every
//! section has working defaults, so an empty file (or no file at all)
//! yields a usable bench setup on port 5000.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    /// TCP listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Serial link settings shared by all devices
    #[serde(default)]
    pub serial: SerialConfig,

    /// Logical device name to serial port path
    #[serde(default)]
    pub devices: BTreeMap<String, String>,

    /// Button token to the device that receives its click
    #[serde(default)]
    pub buttons: BTreeMap<String, String>,

    /// Flash tool settings
    #[serde(default)]
    pub flash: FlashConfig,

    /// Optional camera capture settings
    #[serde(default)]
    pub camera: CameraConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// TCP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port; 0 picks an ephemeral port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// The `host:port` string the listener binds
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Serial Configuration
// =============================================================================

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate for the relayed links
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Read poll period in milliseconds for each relay loop
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_baud() -> u32 {
    115_200
}

fn default_read_timeout_ms() -> u64 {
    1000
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

// =============================================================================
// Flash Configuration
// =============================================================================

/// Flash tool configuration
///
/// The `tool` vector is the program and its leading arguments; the bridge
/// appends chip, port and artifact arguments per flash run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Flash tool invocation, e.g. `["python3", "-m", "esptool"]`
    #[serde(default = "default_flash_tool")]
    pub tool: Vec<String>,

    /// Target chip family
    #[serde(default = "default_chip")]
    pub chip: String,

    /// Baud rate used while flashing
    #[serde(default = "default_flash_baud")]
    pub baud: u32,

    /// Reset behavior before flashing
    #[serde(default = "default_before")]
    pub before: String,

    /// Reset behavior after flashing
    #[serde(default = "default_after")]
    pub after: String,

    /// SPI flash mode
    #[serde(default = "default_flash_mode")]
    pub mode: String,

    /// SPI flash frequency
    #[serde(default = "default_flash_freq")]
    pub freq: String,

    /// SPI flash size
    #[serde(default = "default_flash_size")]
    pub size: String,
}

fn default_flash_tool() -> Vec<String> {
    vec![
        "python3".to_string(),
        "-m".to_string(),
        "esptool".to_string(),
    ]
}

fn default_chip() -> String {
    "esp32s3".to_string()
}

fn default_flash_baud() -> u32 {
    460_800
}

fn default_before() -> String {
    "default_reset".to_string()
}

fn default_after() -> String {
    "hard_reset".to_string()
}

fn default_flash_mode() -> String {
    "dio".to_string()
}

fn default_flash_freq() -> String {
    "80m".to_string()
}

fn default_flash_size() -> String {
    "8MB".to_string()
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            tool: default_flash_tool(),
            chip: default_chip(),
            baud: default_flash_baud(),
            before: default_before(),
            after: default_after(),
            mode: default_flash_mode(),
            freq: default_flash_freq(),
            size: default_flash_size(),
        }
    }
}

// =============================================================================
// Camera Configuration
// =============================================================================

/// Camera capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CameraConfig {
    /// Command whose stdout is one JPEG frame; empty disables GET_CAM
    #[serde(default)]
    pub capture_command: Vec<String>,
}
