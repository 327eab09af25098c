//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use can_live_ingest::{ChannelDescriptor, ChannelHandle, IngestConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 500 kbit/s nominal bit rate
pub const DEFAULT_BTR0BTR1: u16 = 0x001C;

/// 500 kbit/s nominal, 2 Mbit/s data phase on a 20 MHz clock
pub const DEFAULT_BITRATE_FD: &str = "f_clock_mhz=20, nom_brp=5, nom_tseg1=2, nom_tseg2=1, nom_sjw=1, data_brp=2, data_tseg1=3, data_tseg2=1, data_sjw=1";

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DriverConfig {
    /// Explicit path to the PCAN-Basic library
    pub library: Option<PathBuf>,
    /// Use the in-memory bus with generated traffic instead of hardware
    #[serde(default)]
    pub simulate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Channel name (`usb1`) or handle (`0x51`)
    pub name: String,
    #[serde(default)]
    pub fd: bool,
    #[serde(default = "default_active")]
    pub active: bool,
    pub btr0btr1: Option<u16>,
    pub bitrate_fd: Option<String>,
}

fn default_active() -> bool {
    true
}

impl ChannelConfig {
    pub fn handle(&self) -> Result<ChannelHandle> {
        self.name
            .parse()
            .with_context(|| format!("Invalid channel name: {:?}", self.name))
    }

    pub fn descriptor(&self) -> Result<ChannelDescriptor> {
        let handle = self.handle()?;
        let descriptor = if self.fd {
            ChannelDescriptor::fd(handle)
        } else {
            ChannelDescriptor::classic(handle)
        };
        Ok(descriptor.with_active(self.active))
    }

    pub fn btr0btr1(&self) -> u16 {
        self.btr0btr1.unwrap_or(DEFAULT_BTR0BTR1)
    }

    pub fn bitrate_fd(&self) -> &str {
        self.bitrate_fd.as_deref().unwrap_or(DEFAULT_BITRATE_FD)
    }
}

impl FromStr for ChannelConfig {
    type Err = anyhow::Error;

    /// Parse a `--channel` argument: `usb1` or `usb1:fd`
    fn from_str(s: &str) -> Result<Self> {
        let (name, fd) = match s.split_once(':') {
            None => (s, false),
            Some((name, "fd")) => (name, true),
            Some((_, kind)) => bail!("Unknown channel kind {:?} (expected \"fd\")", kind),
        };

        let config = ChannelConfig {
            name: name.trim().to_string(),
            fd,
            active: true,
            btr0btr1: None,
            bitrate_fd: None,
        };
        config.handle()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DisplayConfig {
    #[serde(default = "default_refresh")]
    pub refresh_ms: u64,
    #[serde(default)]
    pub format: DisplayFormat,
}

fn default_refresh() -> u64 {
    1000
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_ms: default_refresh(),
            format: DisplayFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayFormat {
    #[default]
    Table,
    Json,
}

impl AppConfig {
    /// Check everything the monitor needs before touching the driver
    pub fn validate(&self) -> Result<()> {
        self.ingest.validate()?;

        if self.display.refresh_ms == 0 {
            bail!("display.refresh_ms must be greater than zero");
        }

        let mut seen = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let handle = channel.handle()?;
            if handle == ChannelHandle::NONE {
                bail!("Channel {:?} is not a connectable channel", channel.name);
            }
            if seen.contains(&handle) {
                bail!("Channel {} is configured twice", handle);
            }
            seen.push(handle);
        }

        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_live_ingest::ReadMode;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [driver]
            simulate = true

            [[channels]]
            name = "usb1"

            [[channels]]
            name = "0x52"
            fd = true
            active = false

            [ingest]
            mode = "event"
            timestamps = true

            [display]
            format = "json"
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert!(config.driver.simulate);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.ingest.mode, ReadMode::Event);
        assert_eq!(config.ingest.poll_interval_ms, 10);
        assert_eq!(config.display.format, DisplayFormat::Json);
        assert_eq!(config.display.refresh_ms, 1000);

        let fd = config.channels[1].descriptor().unwrap();
        assert_eq!(fd.handle, ChannelHandle(0x52));
        assert!(fd.is_fd);
        assert!(!fd.active);
        assert_eq!(config.channels[0].btr0btr1(), DEFAULT_BTR0BTR1);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.channels.is_empty());
        assert_eq!(config.ingest, IngestConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_channel_argument_parsing() {
        let classic: ChannelConfig = "usb2".parse().unwrap();
        assert_eq!(classic.handle().unwrap(), ChannelHandle(0x52));
        assert!(!classic.fd);

        let fd: ChannelConfig = "pci1:fd".parse().unwrap();
        assert_eq!(fd.handle().unwrap(), ChannelHandle(0x41));
        assert!(fd.fd);

        assert!("usb1:lin".parse::<ChannelConfig>().is_err());
        assert!("nonsense".parse::<ChannelConfig>().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[channels]]\nname = \"usb1\"\nbtr0btr1 = 0x0014").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.channels[0].btr0btr1(), 0x0014);
    }

    #[test]
    fn test_load_config_rejects_duplicates_and_zero_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[channels]]\nname = \"usb1\"\n[[channels]]\nname = \"0x51\"").unwrap();
        assert!(load_config(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ingest]\npoll_interval_ms = 0").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
