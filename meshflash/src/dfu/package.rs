//! DFU packages
//!
//! nRF52 firmware is distributed as a zip archive holding the application
//! image, its init packet and a `manifest.json` naming the two.

use std::io::{Cursor, Read};

use log::debug;
use serde::Deserialize;
use zip::ZipArchive;

use super::packet::MAX_PAYLOAD_LEN;
use crate::error::DfuError;

const MANIFEST: &str = "manifest.json";
/// The init packet is sent after an opcode word and followed by two padding
/// bytes, all within one HCI packet
const MAX_INIT_PACKET_LEN: usize = MAX_PAYLOAD_LEN - 4 - 2;

#[derive(Debug, Deserialize)]
struct ManifestFile {
    manifest: Manifest,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    application: Option<ManifestImage>,
    softdevice: Option<ManifestImage>,
    bootloader: Option<ManifestImage>,
    softdevice_bootloader: Option<ManifestImage>,
}

#[derive(Debug, Deserialize)]
struct ManifestImage {
    bin_file: String,
    dat_file: String,
}

/// The contents of an application DFU package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuPackage {
    /// Init packet describing the image (`.dat`)
    pub init_packet: Vec<u8>,
    /// The application image (`.bin`)
    pub firmware: Vec<u8>,
}

impl DfuPackage {
    /// Read an application update out of a zip package.
    pub fn from_zip(data: &[u8]) -> Result<Self, DfuError> {
        let mut archive = ZipArchive::new(Cursor::new(data))?;

        let manifest: ManifestFile = serde_json::from_slice(&read_entry(&mut archive, MANIFEST)?)?;
        let manifest = manifest.manifest;

        if manifest.softdevice.is_some()
            || manifest.bootloader.is_some()
            || manifest.softdevice_bootloader.is_some()
        {
            return Err(DfuError::InvalidPackage(
                "only application updates are supported".into(),
            ));
        }

        let image = manifest.application.ok_or_else(|| {
            DfuError::InvalidPackage("the manifest does not describe an application".into())
        })?;
        debug!(
            "DFU package: image {}, init packet {}",
            image.bin_file, image.dat_file
        );

        let init_packet = read_entry(&mut archive, &image.dat_file)?;
        if init_packet.len() > MAX_INIT_PACKET_LEN {
            return Err(DfuError::InvalidPackage(format!(
                "{} is {} bytes, init packets are limited to {MAX_INIT_PACKET_LEN}",
                image.dat_file,
                init_packet.len()
            )));
        }

        Ok(Self {
            init_packet,
            firmware: read_entry(&mut archive, &image.bin_file)?,
        })
    }
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>, DfuError> {
    let mut file = archive
        .by_name(name)
        .map_err(|_| DfuError::InvalidPackage(format!("missing {name}")))?;

    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| DfuError::InvalidPackage(format!("failed to read {name}: {e}")))?;

    Ok(data)
}
