//! Programming ESP32 devices
//!
//! The ROM bootloader protocol itself (syncing, stub upload, compressed
//! flash writes, MD5 verification) is provided by [espflash]; this module
//! only adapts it to the options and progress reporting used by the
//! flashing dispatcher.

use espflash::{
    connection::reset::{ResetAfterOperation, ResetBeforeOperation},
    flasher::Flasher,
};
use log::{debug, info};
use serialport::{FlowControl, SerialPortType, UsbPortInfo};

use crate::{error::Error, progress::ProgressCallbacks};

/// Baud rate spoken by the ROM bootloader before the stub takes over
pub const ROM_BAUD: u32 = 115_200;

/// Options for programming an ESP32
///
/// Flash size, mode and frequency are left as they are in the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspFlashOptions {
    /// Baud rate used once connected
    pub baud: u32,
    /// Baud rate used to connect to the ROM bootloader
    pub rom_baud: u32,
    /// Erase the entire flash before writing
    pub erase_all: bool,
    /// Flash address of the image
    pub address: u32,
}

impl Default for EspFlashOptions {
    fn default() -> Self {
        Self {
            baud: ROM_BAUD,
            rom_baud: ROM_BAUD,
            erase_all: false,
            address: 0,
        }
    }
}

/// A connected ESP32 bootloader
pub trait EspLoader {
    /// Describe the connected chip.
    fn chip_description(&mut self) -> Result<String, Error>;

    /// Program `data` into flash.
    fn write_flash(
        &mut self,
        data: &[u8],
        options: &EspFlashOptions,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;

    /// Reset the chip into its application.
    fn hard_reset(&mut self) -> Result<(), Error>;

    /// Close the connection, releasing the serial port.
    fn disconnect(self: Box<Self>) {}
}

/// [EspLoader] backed by an [espflash::flasher::Flasher]
pub struct EspflashLoader {
    flasher: Flasher,
}

impl EspflashLoader {
    /// Open `port` and connect to the ROM bootloader of the device on it.
    ///
    /// The device must already be in download mode, or be wired for the
    /// usual DTR/RTS auto-reset.
    pub fn connect(port: &str, options: &EspFlashOptions) -> Result<Self, Error> {
        // `espflash` picks its reset strategy from the USB product ID, so
        // look up the USB information of the port if there is any.
        let port_info = serialport::available_ports()?
            .into_iter()
            .find(|info| info.port_name == port)
            .and_then(|info| match info.port_type {
                SerialPortType::UsbPort(usb_info) => Some(usb_info),
                _ => None,
            })
            .unwrap_or(UsbPortInfo {
                vid: 0,
                pid: 0,
                serial_number: None,
                manufacturer: None,
                product: None,
            });
        debug!("Port info: {port_info:?}");

        let serial = serialport::new(port, options.rom_baud)
            .flow_control(FlowControl::None)
            .open_native()?;

        let flasher = Flasher::connect(
            serial,
            port_info,
            Some(options.baud),
            true,
            false,
            false,
            None,
            ResetAfterOperation::HardReset,
            ResetBeforeOperation::DefaultReset,
        )?;

        Ok(Self { flasher })
    }
}

impl EspLoader for EspflashLoader {
    fn chip_description(&mut self) -> Result<String, Error> {
        let info = self.flasher.device_info()?;

        Ok(match info.revision {
            Some((major, minor)) => format!("{} (revision v{major}.{minor})", info.chip),
            None => info.chip.to_string(),
        })
    }

    fn write_flash(
        &mut self,
        data: &[u8],
        options: &EspFlashOptions,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        if options.erase_all {
            info!("Erasing the entire flash");
            self.flasher.erase_flash()?;
        }

        let mut progress = ProgressAdapter(progress);
        self.flasher
            .write_bin_to_flash(options.address, data, Some(&mut progress))?;

        Ok(())
    }

    fn hard_reset(&mut self) -> Result<(), Error> {
        self.flasher.connection().reset()?;

        Ok(())
    }

    fn disconnect(self: Box<Self>) {
        debug!("Closing the ESP32 bootloader connection");
        drop(self.flasher);
    }
}

/// Forwards espflash progress reports, which carry a flash address we do
/// not need.
struct ProgressAdapter<'a>(&'a mut dyn ProgressCallbacks);

impl espflash::flasher::ProgressCallbacks for ProgressAdapter<'_> {
    fn init(&mut self, _addr: u32, total: usize) {
        self.0.init(total);
    }

    fn update(&mut self, current: usize) {
        self.0.update(current);
    }

    fn finish(&mut self) {
        self.0.finish();
    }
}
