//! Command-line interface configuration
//!
//! [meshflash] reads `meshflash.toml` from the current directory, its
//! parent, or the user's configuration directory, in that order. The
//! [Config] type handles loading it and saving remembered USB devices back.
//!
//! [meshflash]: https://crates.io/crates/meshflash

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};
use serialport::UsbPortInfo;

use crate::error::Error;

const CONFIG_FILE: &str = "meshflash.toml";

/// Where the firmware catalog is published
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct CatalogConfig {
    /// Base URL of a web flasher deployment, or a local directory
    pub url: Option<String>,
    /// Location of the releases document, if it is not the default
    pub releases: Option<String>,
}

/// Serial settings used when none are given on the command line
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Port to use without asking
    pub serial: Option<String>,
    /// Baud rate used for ESP32 devices once connected
    pub baud: Option<u32>,
}

/// A USB device remembered as a MeshCore board
#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(with = "hex_id")]
    pub vid: u16,
    /// USB Product ID
    #[serde(with = "hex_id")]
    pub pid: u16,
}

impl UsbDevice {
    /// Whether `port` reports this vendor and product
    pub fn matches(&self, port: &UsbPortInfo) -> bool {
        (self.vid, self.pid) == (port.vid, port.pid)
    }
}

/// USB ids are written as four hex digits, `0x` prefix optional on input.
mod hex_id {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{id:04x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(&text);

        u16::from_str_radix(digits, 16).map_err(D::Error::custom)
    }
}

/// User configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub connection: Connection,
    /// Boards remembered in addition to the built-in list
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    /// Load configuration from the configuration file, if there is one.
    pub fn load() -> Result<Self> {
        let file = Self::config_path()?;

        let mut config = match read_to_string(&file) {
            Ok(data) => Self::parse(&data)
                .wrap_err_with(|| format!("Failed to load {}", file.display()))?,
            Err(_) => Self::default(),
        };
        config.save_path = file;
        debug!("Config: {:#?}", &config);

        Ok(config)
    }

    fn parse(data: &str) -> Result<Self, Error> {
        toml::from_str(data).map_err(|e| Error::InvalidConfig(e.message().to_owned()))
    }

    fn write_config(&self, path: &Path) -> Result<()> {
        let text = toml::to_string(self)
            .into_diagnostic()
            .wrap_err("Could not serialize the configuration")?;

        if let Some(dir) = path.parent() {
            create_dir_all(dir)
                .into_diagnostic()
                .wrap_err_with(|| format!("Could not create {}", dir.display()))?;
        }

        write(path, text)
            .into_diagnostic()
            .wrap_err_with(|| format!("Could not save the configuration to {}", path.display()))
    }

    /// Apply `change` to a copy of the configuration and save the copy.
    ///
    /// The loaded configuration is left untouched.
    pub fn save_with(&self, change: impl FnOnce(&mut Self)) -> Result<()> {
        let mut updated = self.clone();
        change(&mut updated);

        updated.write_config(&self.save_path)
    }

    fn config_path() -> Result<PathBuf, Error> {
        let cwd = std::env::current_dir()?;
        let existing = [Some(cwd.as_path()), cwd.parent()]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(CONFIG_FILE))
            .find(|path| path.exists());

        if let Some(path) = existing {
            return Ok(path);
        }

        ProjectDirs::from("org", "meshcore", "meshflash")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .ok_or_else(|| {
                Error::InvalidConfig("no home directory to store the configuration in".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct TestData {
        #[serde(with = "hex_id")]
        value: u16,
    }

    #[test]
    fn hex_ids() {
        let result: Result<TestData, _> = toml::from_str(r#"value = "239a""#);
        assert_eq!(result.unwrap().value, 0x239a);

        // Prefixed, uppercase and unpadded values
        let result: Result<TestData, _> = toml::from_str(r#"value = "0x10C4""#);
        assert_eq!(result.unwrap().value, 0x10c4);

        let result: Result<TestData, _> = toml::from_str(r#"value = "a""#);
        assert_eq!(result.unwrap().value, 0x0a);

        let result: Result<TestData, _> = toml::from_str(r#"value = "10gg""#);
        assert!(result.is_err());

        let serialized = toml::to_string(&TestData { value: 0x29 }).unwrap();
        assert_eq!(serialized.trim(), r#"value = "0029""#);
    }

    #[test]
    fn parse_full_config() {
        let config = Config::parse(
            r#"
            [catalog]
            url = "https://flasher.meshcore.co.uk"

            [connection]
            serial = "/dev/ttyACM0"
            baud = 921600

            [[usb_device]]
            vid = "239a"
            pid = "8029"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.catalog.url.as_deref(),
            Some("https://flasher.meshcore.co.uk")
        );
        assert_eq!(config.catalog.releases, None);
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(921_600));
        assert_eq!(
            config.usb_device,
            [UsbDevice {
                vid: 0x239a,
                pid: 0x8029
            }]
        );
    }

    #[test]
    fn empty_config() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn invalid_config() {
        assert!(matches!(
            Config::parse("[connection]\nbaud = \"fast\""),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn remembered_devices_are_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = Config {
            save_path: path.clone(),
            ..Config::default()
        };
        config
            .save_with(|config| {
                config.usb_device.push(UsbDevice {
                    vid: 0x1a86,
                    pid: 0x55d4,
                })
            })
            .unwrap();

        let saved = Config::parse(&read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.usb_device.len(), 1);
        assert_eq!(saved.usb_device[0].pid, 0x55d4);
        // The loaded configuration itself is left untouched
        assert!(config.usb_device.is_empty());
    }

    #[test]
    fn usb_device_matches_port() {
        let device = UsbDevice {
            vid: 0x303a,
            pid: 0x1001,
        };
        let port = UsbPortInfo {
            vid: 0x303a,
            pid: 0x1001,
            serial_number: None,
            manufacturer: None,
            product: None,
        };

        assert!(device.matches(&port));
        assert!(!UsbDevice::default().matches(&port));
    }
}
