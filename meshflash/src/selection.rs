//! What the user has picked so far
//!
//! The wizard moves through device, firmware and version in that order;
//! [Selection] holds the choices and enforces how they relate, for example
//! that picking a firmware selects its first version.

use std::path::Path;

use log::debug;

use crate::{
    catalog::{Device, DeviceType, Firmware, FirmwareFile, Version},
    error::Error,
};

pub const CUSTOM_DEVICE_NAME: &str = "Custom device";
pub const CUSTOM_FIRMWARE_ICON: &str = "unknown_document";

/// The device, firmware and version chosen for flashing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub device: Option<Device>,
    pub firmware: Option<Firmware>,
    pub version: Option<String>,
    /// Erase the whole flash before programming
    pub wipe: bool,
    /// Serial port used for the last operation
    pub port: Option<String>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a device, dropping any firmware chosen for another one.
    pub fn select_device(&mut self, device: Device) {
        debug!("Selected device: {}", device.name);

        self.device = Some(device);
        self.firmware = None;
        self.version = None;
    }

    /// Select a firmware and its default (first) version.
    pub fn select_firmware(&mut self, firmware: Firmware) {
        self.version = firmware.default_version().map(str::to_owned);
        debug!(
            "Selected firmware: {} ({:?})",
            firmware.title, self.version
        );

        self.firmware = Some(firmware);
    }

    /// Select one of the selected firmware's versions.
    pub fn select_version(&mut self, name: &str) -> Result<(), Error> {
        let firmware = self
            .firmware
            .as_ref()
            .ok_or(Error::IncompleteSelection("firmware"))?;

        if !firmware.version.contains_key(name) {
            return Err(Error::UnknownVersion(name.to_owned()));
        }

        self.version = Some(name.to_owned());

        Ok(())
    }

    pub fn set_wipe(&mut self, wipe: bool) {
        self.wipe = wipe;
    }

    /// Undo the most recent step.
    ///
    /// A custom file selects its own device, so stepping back from one
    /// returns to the very beginning.
    pub fn step_back(&mut self) {
        if self.device.is_some() && self.firmware.is_some() {
            let custom = self.selected_version().is_some_and(|v| v.custom_file);

            self.firmware = None;
            if custom {
                self.device = None;
            }
            return;
        }

        if self.device.is_some() {
            self.device = None;
        }
    }

    /// Select a firmware image from the local filesystem.
    ///
    /// The device type is guessed from the file name, since a custom image
    /// is not described by the catalog.
    pub fn load_custom_firmware(&mut self, path: &Path) {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let kind = DeviceType::from_file_name(&file_name);
        debug!("Loading custom {kind} firmware from {}", path.display());

        let version = Version {
            custom_file: true,
            files: vec![FirmwareFile {
                kind: FirmwareFile::FLASH.to_owned(),
                name: file_name.clone(),
                title: file_name.clone(),
                local: Some(path.to_path_buf()),
            }],
            ..Version::default()
        };

        let mut firmware = Firmware {
            icon: CUSTOM_FIRMWARE_ICON.to_owned(),
            title: file_name.clone(),
            ..Firmware::default()
        };
        firmware.version.insert(file_name.clone(), version);

        self.device = Some(Device {
            name: CUSTOM_DEVICE_NAME.to_owned(),
            kind,
            firmware: Vec::new(),
        });
        self.firmware = Some(firmware);
        self.version = Some(file_name);
    }

    /// The selected version of the selected firmware
    pub fn selected_version(&self) -> Option<&Version> {
        let firmware = self.firmware.as_ref()?;
        firmware.version.get(self.version.as_deref()?)
    }

    /// A field of the selected version, empty if nothing is selected.
    pub fn selected_version_value(&self, key: &str) -> &str {
        self.selected_version()
            .map(|version| version.value(key))
            .unwrap_or_default()
    }

    /// The selected file to program.
    pub fn flash_file(&self) -> Result<&FirmwareFile, Error> {
        self.selected_version()
            .ok_or(Error::IncompleteSelection("version"))?
            .flash_file()
            .ok_or(Error::MissingFlashFile)
    }

    /// Check that everything needed to flash has been chosen.
    pub fn ready(&self) -> Result<&Device, Error> {
        let device = self
            .device
            .as_ref()
            .ok_or(Error::IncompleteSelection("device"))?;
        self.firmware
            .as_ref()
            .ok_or(Error::IncompleteSelection("firmware"))?;
        let version = self
            .selected_version()
            .ok_or(Error::IncompleteSelection("version"))?;

        if version.files.is_empty() {
            return Err(Error::EmptyVersion);
        }

        Ok(device)
    }

    /// Forget every choice.
    pub fn reset(&mut self) {
        self.device = None;
        self.firmware = None;
        self.version = None;
        self.wipe = false;
    }
}
