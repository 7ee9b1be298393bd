//! Interactive device, firmware and version selection

use std::path::PathBuf;

use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use log::warn;

use crate::{
    catalog::{Catalog, Firmware},
    error::Error,
    selection::Selection,
};

const BACK: &str = "« Back";
const CUSTOM_FILE: &str = "Custom firmware file…";

/// Walk the user through picking a device, firmware and version.
///
/// Steps already decided in `selection` are skipped.
pub fn choose(catalog: &Catalog, selection: &mut Selection) -> Result<(), Error> {
    let theme = ColorfulTheme::default();

    loop {
        if selection.device.is_none() {
            choose_device(&theme, catalog, selection)?;
        } else if selection.firmware.is_none() {
            choose_firmware(&theme, catalog, selection)?;
        } else if choose_version(&theme, selection)? {
            return Ok(());
        }
    }
}

fn choose_device(
    theme: &ColorfulTheme,
    catalog: &Catalog,
    selection: &mut Selection,
) -> Result<(), Error> {
    let mut items = catalog
        .device
        .iter()
        .map(|device| format!("{} ({})", device.name, device.kind))
        .collect::<Vec<_>>();
    items.push(CUSTOM_FILE.to_owned());

    let index = Select::with_theme(theme)
        .with_prompt("Device")
        .items(&items)
        .default(0)
        .interact_opt()?
        .ok_or(Error::Cancelled)?;

    match catalog.device.get(index) {
        Some(device) => selection.select_device(device.clone()),
        None => {
            let path: String = Input::with_theme(theme)
                .with_prompt("Path to a .bin (ESP32) or .zip (nRF52) image")
                .interact_text()?;
            selection.load_custom_firmware(&PathBuf::from(path.trim()));
        }
    }

    Ok(())
}

/// How a firmware is listed: its title and, if there is one, description
pub fn firmware_label(catalog: &Catalog, firmware: &Firmware) -> String {
    let title = catalog.role_value(firmware, "title");
    let description = catalog.role_value(firmware, "description");

    let mut label = if description.is_empty() {
        title.to_owned()
    } else {
        format!("{title} - {description}")
    };
    if !firmware.has_data() {
        label.push_str(" (no release available)");
    }

    label
}

fn choose_firmware(
    theme: &ColorfulTheme,
    catalog: &Catalog,
    selection: &mut Selection,
) -> Result<(), Error> {
    let Some(device) = selection.device.as_ref() else {
        return Ok(());
    };

    let mut items = device
        .firmware
        .iter()
        .map(|firmware| firmware_label(catalog, firmware))
        .collect::<Vec<_>>();
    items.push(BACK.to_owned());

    let index = Select::with_theme(theme)
        .with_prompt(format!("Firmware for {}", device.name))
        .items(&items)
        .default(0)
        .interact_opt()?
        .ok_or(Error::Cancelled)?;

    match device.firmware.get(index) {
        Some(firmware) if !firmware.has_data() => {
            warn!(
                "{} has no published files yet",
                catalog.role_value(firmware, "title")
            );
        }
        Some(firmware) => {
            let firmware = firmware.clone();
            selection.select_firmware(firmware);
        }
        None => selection.step_back(),
    }

    Ok(())
}

/// Returns whether a version was chosen, rather than stepping back.
fn choose_version(theme: &ColorfulTheme, selection: &mut Selection) -> Result<bool, Error> {
    let Some(firmware) = selection.firmware.as_ref() else {
        return Ok(false);
    };

    // A custom image has exactly one version, itself
    if selection.selected_version().is_some_and(|v| v.custom_file) {
        return Ok(true);
    }

    let names = firmware.version.keys().cloned().collect::<Vec<_>>();
    let mut items = firmware
        .version
        .iter()
        .map(|(name, version)| match version.notes.lines().next() {
            Some(note) if !note.is_empty() => format!("{name} - {note}"),
            _ => name.to_owned(),
        })
        .collect::<Vec<_>>();
    items.push(BACK.to_owned());

    let current = selection
        .version
        .as_deref()
        .and_then(|version| names.iter().position(|name| name == version))
        .unwrap_or(0);

    let index = Select::with_theme(theme)
        .with_prompt(format!("Version of {}", firmware.title))
        .items(&items)
        .default(current)
        .interact_opt()?
        .ok_or(Error::Cancelled)?;

    match names.get(index) {
        Some(name) => {
            selection.select_version(name)?;
            Ok(true)
        }
        None => {
            selection.step_back();
            Ok(false)
        }
    }
}

/// Ask whether the whole flash should be erased first.
pub fn confirm_wipe() -> Result<bool, Error> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Erase the entire flash before writing? (resets all device settings)")
        .default(false)
        .interact_opt()?
        .unwrap_or_default())
}
