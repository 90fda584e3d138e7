//! Configuration management for the QXL bridge
//!
//! Settings come from a TOML file with three sections: `[server]` for the
//! virtualization server endpoint, `[output]` for the virtual output geometry
//! and `[display]` for ring, surface and timing parameters. Every section
//! and field has a default, so an empty file is a valid configuration.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::display::builder::DEFAULT_MM_TIME_SKEW_MS;
use crate::display::ring::{DEFAULT_ENQUEUE_ATTEMPTS, DEFAULT_RING_CAPACITY};
use crate::display::surface::DEFAULT_SURFACE_CAPACITY;
use crate::error::{BridgeError, BridgeResult};
use crate::qxl::{argb, rgb};

/// Largest output the bridge will create a surface for
pub const MAX_OUTPUT_WIDTH: u32 = 4096;
pub const MAX_OUTPUT_HEIGHT: u32 = 4096;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BridgeConfig {
    /// Virtualization server endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Virtual output geometry
    #[serde(default)]
    pub output: OutputConfig,

    /// Command ring, surfaces and repaint timing
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub addr: String,

    /// Listen port
    pub port: u16,

    /// Client password; no password means no authentication
    pub password: Option<String>,

    /// Ticket expiry in seconds (only used with a password)
    pub ticket_lifetime_secs: Option<u32>,

    /// Image compression mode
    pub compression: CompressionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Position of the output in compositor space
    pub x: i32,
    pub y: i32,

    /// Output size (pixels)
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    /// Live surfaces allowed at once
    pub surface_capacity: usize,

    /// Command ring depth
    pub ring_capacity: usize,

    /// Retries against a full ring before a command is dropped
    pub enqueue_attempts: u32,

    /// Sleep between those retries (microseconds)
    pub enqueue_backoff_us: u64,

    /// Wakeup timer interval after each repaint (milliseconds)
    pub wakeup_interval_ms: u32,

    /// Lag of drawable times behind the server clock (milliseconds)
    pub mm_time_skew_ms: u32,

    /// Initial surface clear colour (hex: #RRGGBB or #AARRGGBB)
    pub background: String,
}

/// Image compression modes understood by the virtualization server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompressionMode {
    Off,
    AutoGlz,
    AutoLz,
    Quic,
    Glz,
    Lz,
    Lz4,
}

impl CompressionMode {
    pub const ALL: [CompressionMode; 7] = [
        CompressionMode::Off,
        CompressionMode::AutoGlz,
        CompressionMode::AutoLz,
        CompressionMode::Quic,
        CompressionMode::Glz,
        CompressionMode::Lz,
        CompressionMode::Lz4,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CompressionMode::Off => "off",
            CompressionMode::AutoGlz => "auto_glz",
            CompressionMode::AutoLz => "auto_lz",
            CompressionMode::Quic => "quic",
            CompressionMode::Glz => "glz",
            CompressionMode::Lz => "lz",
            CompressionMode::Lz4 => "lz4",
        }
    }

    /// Value of the server's image-compression enum
    pub fn to_spice_value(self) -> u32 {
        match self {
            CompressionMode::Off => 1,
            CompressionMode::AutoGlz => 2,
            CompressionMode::AutoLz => 3,
            CompressionMode::Quic => 4,
            CompressionMode::Glz => 5,
            CompressionMode::Lz => 6,
            CompressionMode::Lz4 => 7,
        }
    }
}

impl Default for CompressionMode {
    fn default() -> Self {
        CompressionMode::AutoGlz
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        CompressionMode::ALL
            .into_iter()
            .find(|mode| mode.name() == wanted)
            .ok_or_else(|| {
                let names: Vec<_> = CompressionMode::ALL.iter().map(|m| m.name()).collect();
                BridgeError::ConfigInvalid(format!(
                    "unknown compression mode '{s}' (expected one of {})",
                    names.join(", ")
                ))
            })
    }
}

impl TryFrom<String> for CompressionMode {
    type Error = BridgeError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CompressionMode> for String {
    fn from(mode: CompressionMode) -> Self {
        mode.name().to_string()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "localhost".to_string(),
            port: 5912,
            password: None,
            ticket_lifetime_secs: None,
            compression: CompressionMode::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1024,
            height: 480,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            surface_capacity: DEFAULT_SURFACE_CAPACITY,
            ring_capacity: DEFAULT_RING_CAPACITY,
            enqueue_attempts: DEFAULT_ENQUEUE_ATTEMPTS,
            enqueue_backoff_us: 1000,
            wakeup_interval_ms: 1,
            mm_time_skew_ms: DEFAULT_MM_TIME_SKEW_MS,
            background: "#000000".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.addr.trim().is_empty() {
            return Err(BridgeError::ConfigInvalid("server addr must not be empty".into()));
        }
        if self.port == 0 {
            return Err(BridgeError::ConfigInvalid("server port must be non-zero".into()));
        }
        if self.ticket_lifetime_secs.is_some() && self.password.is_none() {
            return Err(BridgeError::ConfigInvalid(
                "ticket_lifetime_secs requires a password".into(),
            ));
        }
        Ok(())
    }

    pub fn requires_auth(&self) -> bool {
        self.password.is_some()
    }
}

impl OutputConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(BridgeError::ConfigInvalid(format!(
                "output size {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.width > MAX_OUTPUT_WIDTH || self.height > MAX_OUTPUT_HEIGHT {
            return Err(BridgeError::ConfigInvalid(format!(
                "output size {}x{} exceeds {}x{}",
                self.width, self.height, MAX_OUTPUT_WIDTH, MAX_OUTPUT_HEIGHT
            )));
        }
        Ok(())
    }
}

impl DisplayConfig {
    pub fn validate(&self) -> BridgeResult<()> {
        if self.surface_capacity == 0 {
            return Err(BridgeError::ConfigInvalid("surface_capacity must be at least 1".into()));
        }
        if self.ring_capacity == 0 {
            return Err(BridgeError::ConfigInvalid("ring_capacity must be at least 1".into()));
        }
        if self.wakeup_interval_ms == 0 {
            return Err(BridgeError::ConfigInvalid("wakeup_interval_ms must be at least 1".into()));
        }
        self.background_color()?;
        Ok(())
    }

    /// The background colour as 0xAARRGGBB
    pub fn background_color(&self) -> BridgeResult<u32> {
        parse_color(&self.background)
    }
}

/// Parse `#RRGGBB` (opaque) or `#AARRGGBB`
pub fn parse_color(value: &str) -> BridgeResult<u32> {
    let invalid = || BridgeError::ConfigInvalid(format!("invalid colour '{value}'"));
    let hex = value.strip_prefix('#').ok_or_else(invalid)?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let raw = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
    match hex.len() {
        6 => Ok(rgb((raw >> 16) as u8, (raw >> 8) as u8, raw as u8)),
        8 => Ok(argb((raw >> 24) as u8, (raw >> 16) as u8, (raw >> 8) as u8, raw as u8)),
        _ => Err(invalid()),
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BridgeConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> BridgeResult<()> {
        self.server.validate()?;
        self.output.validate()?;
        self.display.validate()?;
        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

/// Expand a leading `~` to `$HOME`
pub fn expand_home(path: &Path) -> Result<std::path::PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Ok(Path::new(&home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}
