//! Library and application errors

use std::io;

use miette::Diagnostic;
use slip_codec::SlipError;
use thiserror::Error;

/// All possible errors returned by meshflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(meshflash::cancelled))]
    Cancelled,

    #[error("No firmware catalog has been configured")]
    #[diagnostic(
        code(meshflash::no_catalog),
        help("Pass `--catalog <URL|DIR>` or set `url` under `[catalog]` in meshflash.toml")
    )]
    NoCatalog,

    #[error("Failed to parse the {document} document")]
    #[diagnostic(code(meshflash::catalog::parse))]
    CatalogParse {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to fetch {url}")]
    #[diagnostic(
        code(meshflash::fetch),
        help("Check your network connection and the configured catalog URL")
    )]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("'{0}' is not a valid URL")]
    #[diagnostic(code(meshflash::invalid_url))]
    InvalidUrl(String),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(meshflash::file_open))]
    FileOpenError(String, #[source] io::Error),

    #[error("The catalog has no device named '{0}'")]
    #[diagnostic(
        code(meshflash::unknown_device),
        help("Run `meshflash list` to see the devices in the catalog")
    )]
    UnknownDevice(String),

    #[error("The device has no firmware titled '{0}'")]
    #[diagnostic(
        code(meshflash::unknown_firmware),
        help("Run `meshflash list` to see the firmware offered for each device")
    )]
    UnknownFirmware(String),

    #[error("The firmware has no version '{0}'")]
    #[diagnostic(code(meshflash::unknown_version))]
    UnknownVersion(String),

    #[error("No {0} has been selected")]
    #[diagnostic(code(meshflash::incomplete_selection))]
    IncompleteSelection(&'static str),

    #[error("The selected firmware version does not contain any files")]
    #[diagnostic(
        code(meshflash::empty_version),
        help("The release may still be building, try another version")
    )]
    EmptyVersion,

    #[error("Cannot find configuration for flash file")]
    #[diagnostic(
        code(meshflash::missing_flash_file),
        help("The catalog entry for this firmware is broken, please report it")
    )]
    MissingFlashFile,

    #[error("Cannot read flash file: {0}")]
    #[diagnostic(code(meshflash::read_flash_file))]
    ReadFlashFile(String),

    #[error("Failed to initialize. Did you place the device into firmware download mode? Detail: {0}")]
    #[diagnostic(
        code(meshflash::esp32::initialize),
        help("Hold the BOOT button while connecting the device, then try again")
    )]
    EspInitialize(String),

    #[error("ESP32 flashing failed: {0}")]
    #[diagnostic(code(meshflash::esp32::flashing))]
    EspFlashing(String),

    #[error("nRF flashing failed: {0}")]
    #[diagnostic(
        code(meshflash::nrf52::flashing),
        help("Double-tap the reset button to enter the bootloader, or run `meshflash dfu-mode`")
    )]
    NrfFlashing(String),

    #[error("Flashing is already in progress")]
    #[diagnostic(code(meshflash::busy))]
    Busy,

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(meshflash::no_serial),
        help("Make sure you have connected a device to the host system")
    )]
    NoSerial,

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(meshflash::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(meshflash::serial_error))]
    Serial(#[from] serialport::Error),

    #[error("The serial console is not connected")]
    #[diagnostic(code(meshflash::console::closed))]
    ConsoleClosed,

    #[error(transparent)]
    #[diagnostic(code(meshflash::esp32::loader))]
    Esp(#[from] espflash::error::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dfu(#[from] DfuError),

    #[error(transparent)]
    #[diagnostic(code(meshflash::io))]
    Io(#[from] io::Error),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(meshflash::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),

    #[error("The configuration file is invalid: {0}")]
    #[diagnostic(code(meshflash::config))]
    InvalidConfig(String),
}

/// Errors raised by the Nordic legacy serial DFU transfer
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum DfuError {
    #[error("The DFU package is invalid: {0}")]
    #[diagnostic(
        code(meshflash::dfu::invalid_package),
        help("nRF52 firmware must be a DFU .zip package containing manifest.json")
    )]
    InvalidPackage(String),

    #[error("Failed to read the DFU package")]
    #[diagnostic(code(meshflash::dfu::zip))]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to parse the DFU package manifest")]
    #[diagnostic(code(meshflash::dfu::manifest))]
    Manifest(#[from] serde_json::Error),

    #[error("Packet {sequence} was not acknowledged after {attempts} attempts")]
    #[diagnostic(
        code(meshflash::dfu::no_ack),
        help("Make sure the device is in DFU mode and nothing else is using the serial port")
    )]
    NotAcknowledged { sequence: u8, attempts: usize },

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(code(meshflash::dfu::slip_framing))]
    FramingError,

    #[error("Timeout while waiting for an acknowledgement")]
    #[diagnostic(code(meshflash::dfu::timeout))]
    Timeout,

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(meshflash::dfu::serial_error))]
    Serial(#[source] io::Error),
}

impl From<SlipError> for DfuError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError | SlipError::OversizedPacket | SlipError::EndOfStream => {
                Self::FramingError
            }
            SlipError::ReadError(io) => Self::from(io),
        }
    }
}

impl From<io::Error> for DfuError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Serial(err),
        }
    }
}

impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Dfu(err.into())
    }
}
