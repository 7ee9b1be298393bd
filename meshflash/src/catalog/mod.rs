//! The device and firmware catalog
//!
//! The catalog is a static JSON document listing the supported devices and
//! the firmware which can be flashed onto each of them. Firmware whose
//! versions are published as releases carries a [GithubSource]; its version
//! list is rebuilt from the releases document when the catalog is loaded
//! (see [releases_for_role]).

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString, VariantNames};

pub use self::{
    releases::{releases_for_role, FilePattern, Release, ReleaseFile},
    source::{fetch_firmware, load_catalog, CatalogSource, FirmwareLocation},
};
use crate::error::Error;

mod releases;
mod source;

/// A string-keyed map which keeps the order of its document
pub type OrderedMap<V> = IndexMap<String, V>;

/// Versions of a firmware, keyed by version name, in catalog order
pub type Versions = OrderedMap<Version>;

/// The kind of device, which decides how it is flashed
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceType {
    /// Espressif ESP32 family, flashed through the ROM serial bootloader
    Esp32,
    /// Nordic nRF52 family, flashed through the serial DFU bootloader
    Nrf52,
}

impl DeviceType {
    /// Guess the device type from the name of a firmware image.
    ///
    /// ESP32 images are raw `.bin` files, nRF52 updates ship as DFU packages.
    pub fn from_file_name(name: &str) -> Self {
        if name.ends_with(".bin") {
            DeviceType::Esp32
        } else {
            DeviceType::Nrf52
        }
    }
}

/// The complete catalog document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Catalog {
    /// Location of firmware files whose names are relative
    #[serde(rename = "staticPath", default)]
    pub static_path: String,
    /// Shared display values for firmware, keyed by role name
    #[serde(default)]
    pub role: HashMap<String, Role>,
    /// Supported devices
    #[serde(default)]
    pub device: Vec<Device>,
}

/// Display values shared by all firmware of one role
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Role(pub BTreeMap<String, Value>);

/// A flashable device
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceType,
    #[serde(default)]
    pub firmware: Vec<Firmware>,
}

/// A firmware offered for a device
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Firmware {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubSource>,
    #[serde(default)]
    pub version: Versions,
    /// Any other display values, such as a description
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Where the versions of a firmware are published
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GithubSource {
    /// Release type in the releases document
    #[serde(rename = "type")]
    pub kind: String,
    /// File patterns, keyed by the catalog file type they produce
    #[serde(default)]
    pub files: Option<OrderedMap<FilePattern>>,
}

/// One version of a firmware
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Version {
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub files: Vec<FirmwareFile>,
    /// The version was loaded from a local file rather than the catalog
    #[serde(rename = "customFile", default, skip_serializing_if = "is_false")]
    pub custom_file: bool,
}

/// A file belonging to a firmware version
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FirmwareFile {
    /// Purpose of the file, `flash` marks the image to program
    #[serde(rename = "type")]
    pub kind: String,
    /// Path or URL of the file
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// A file on the local filesystem, used for custom firmware
    #[serde(skip)]
    pub local: Option<PathBuf>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl FirmwareFile {
    pub const FLASH: &'static str = "flash";

    pub fn is_flash(&self) -> bool {
        self.kind == Self::FLASH
    }
}

impl Version {
    /// The file holding the image to program
    pub fn flash_file(&self) -> Option<&FirmwareFile> {
        self.files.iter().find(|file| file.is_flash())
    }

    /// A string field of this version by name, empty if absent.
    pub fn value(&self, key: &str) -> &str {
        match key {
            "notes" => &self.notes,
            _ => "",
        }
    }
}

impl Firmware {
    /// Whether the firmware's first version has any files to flash.
    pub fn has_data(&self) -> bool {
        self.version
            .first()
            .is_some_and(|(_, version)| !version.files.is_empty())
    }

    /// The name of the first version, which is selected by default.
    pub fn default_version(&self) -> Option<&str> {
        self.version.first().map(|(name, _)| name.as_str())
    }

    /// A non-empty display value of this firmware by name
    pub fn value(&self, key: &str) -> Option<&str> {
        let value = match key {
            "title" => Some(self.title.as_str()),
            "icon" => Some(self.icon.as_str()),
            "role" => self.role.as_deref(),
            _ => self.extra.get(key).and_then(Value::as_str),
        };

        value.filter(|value| !value.is_empty())
    }
}

impl Role {
    pub fn value(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }
}

impl Catalog {
    /// Parse a catalog document.
    pub fn from_json(data: &str) -> Result<Self, Error> {
        serde_json::from_str(data).map_err(|source| Error::CatalogParse {
            document: "catalog",
            source,
        })
    }

    /// Replace the versions of every firmware published as releases with the
    /// versions found in `releases`.
    pub fn merge_releases(&mut self, releases: &[Release]) {
        for device in &mut self.device {
            for firmware in &mut device.firmware {
                let Some(GithubSource {
                    kind,
                    files: Some(files),
                }) = &firmware.github
                else {
                    continue;
                };

                firmware.version = releases_for_role(kind, files, releases);
            }
        }
    }

    /// A display value for `firmware`, falling back to its role's value and
    /// finally to an empty string.
    pub fn role_value<'a>(&'a self, firmware: &'a Firmware, key: &str) -> &'a str {
        firmware
            .value(key)
            .or_else(|| {
                firmware
                    .role
                    .as_deref()
                    .and_then(|role| self.role.get(role))
                    .and_then(|role| role.value(key))
            })
            .unwrap_or_default()
    }

    pub fn find_device(&self, name: &str) -> Result<&Device, Error> {
        self.device
            .iter()
            .find(|device| device.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::UnknownDevice(name.to_owned()))
    }
}

impl Device {
    pub fn find_firmware(&self, title: &str) -> Result<&Firmware, Error> {
        self.firmware
            .iter()
            .find(|firmware| {
                firmware.title.eq_ignore_ascii_case(title)
                    || firmware
                        .role
                        .as_deref()
                        .is_some_and(|role| role.eq_ignore_ascii_case(title))
            })
            .ok_or_else(|| Error::UnknownFirmware(title.to_owned()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) const CATALOG: &str = r#"{
        "staticPath": "/firmware",
        "role": {
            "repeater": { "title": "Repeater", "icon": "cell_tower", "description": "Extends the mesh" },
            "companion": { "title": "Companion", "icon": "smartphone" }
        },
        "device": [
            {
                "name": "Heltec V3",
                "type": "esp32",
                "firmware": [
                    {
                        "role": "repeater",
                        "github": { "type": "repeater", "files": { "flash": ["Heltec_v3_repeater", ".bin"] } }
                    },
                    {
                        "role": "companion",
                        "title": "Companion (USB)",
                        "version": {
                            "v1.1.0": { "notes": "newest", "files": [{ "type": "flash", "name": "heltec_companion_110.bin" }] },
                            "v1.0.0": { "notes": "older", "files": [{ "type": "flash", "name": "heltec_companion_100.bin" }] }
                        }
                    }
                ]
            },
            {
                "name": "RAK 4631",
                "type": "nrf52",
                "firmware": [
                    { "role": "repeater", "version": { "v1.0.0": { "files": [] } } }
                ]
            }
        ]
    }"#;

    #[test]
    fn parse_catalog() {
        let catalog = Catalog::from_json(CATALOG).unwrap();

        assert_eq!(catalog.static_path, "/firmware");
        assert_eq!(catalog.device.len(), 2);
        assert_eq!(catalog.device[0].kind, DeviceType::Esp32);
        assert_eq!(catalog.device[1].kind, DeviceType::Nrf52);

        let companion = &catalog.device[0].firmware[1];
        assert_eq!(
            companion.version.keys().collect::<Vec<_>>(),
            ["v1.1.0", "v1.0.0"]
        );
        assert_eq!(companion.default_version(), Some("v1.1.0"));
    }

    #[test]
    fn role_values_fall_back() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let repeater = &catalog.device[0].firmware[0];
        let companion = &catalog.device[0].firmware[1];

        assert_eq!(catalog.role_value(repeater, "title"), "Repeater");
        assert_eq!(catalog.role_value(repeater, "description"), "Extends the mesh");
        assert_eq!(catalog.role_value(companion, "title"), "Companion (USB)");
        assert_eq!(catalog.role_value(companion, "icon"), "smartphone");
        assert_eq!(catalog.role_value(companion, "description"), "");
    }

    #[test]
    fn firmware_has_data() {
        let catalog = Catalog::from_json(CATALOG).unwrap();

        // Releases have not been merged, so there are no versions yet
        assert!(!catalog.device[0].firmware[0].has_data());
        assert!(catalog.device[0].firmware[1].has_data());
        // First version exists but has no files
        assert!(!catalog.device[1].firmware[0].has_data());
    }

    #[test]
    fn find_by_name() {
        let catalog = Catalog::from_json(CATALOG).unwrap();

        let device = catalog.find_device("heltec v3").unwrap();
        assert_eq!(device.name, "Heltec V3");
        assert!(device.find_firmware("companion (usb)").is_ok());
        assert!(device.find_firmware("repeater").is_ok());
        assert!(matches!(
            device.find_firmware("room server"),
            Err(Error::UnknownFirmware(_))
        ));
        assert!(matches!(
            catalog.find_device("T-Beam"),
            Err(Error::UnknownDevice(_))
        ));
    }

    #[test]
    fn device_type_from_file_name() {
        assert_eq!(DeviceType::from_file_name("repeater.bin"), DeviceType::Esp32);
        assert_eq!(DeviceType::from_file_name("repeater.zip"), DeviceType::Nrf52);
        assert_eq!(DeviceType::from_file_name("repeater.hex"), DeviceType::Nrf52);
    }
}
