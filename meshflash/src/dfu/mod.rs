//! Updating nRF52 devices over the legacy serial DFU protocol
//!
//! This is the protocol spoken by the Adafruit nRF52 bootloader: the
//! application image is announced with a start packet, described by the
//! package's init packet, streamed in data packets and committed with a stop
//! packet. Every packet must be acknowledged before the next one is sent.
//!
//! A device is put into its bootloader either by double-tapping reset or by
//! opening its serial port at 1200 baud, see [force_dfu_mode].

use std::{
    io::{Read, Write},
    thread::sleep,
    time::Duration,
};

use log::{debug, info, warn};
use serialport::{FlowControl, SerialPort};
use slip_codec::SlipDecoder;

pub use self::package::DfuPackage;
use self::packet::{ack_number, payload, HciPacket, Opcode, SEQUENCE_MODULO};
use crate::{
    error::{DfuError, Error},
    progress::ProgressCallbacks,
};

mod package;
mod packet;

/// Baud rate of the bootloader's serial transport
pub const DFU_BAUD: u32 = 115_200;
/// Opening the port at this baud rate makes the application reboot into its
/// bootloader
pub const TOUCH_BAUD: u32 = 1200;

/// Largest payload carried by a single data packet
const PACKET_MAX_SIZE: usize = 512;
const FLASH_PAGE_SIZE: usize = 4096;
const PACKETS_PER_PAGE: usize = FLASH_PAGE_SIZE / PACKET_MAX_SIZE;
const FLASH_PAGE_ERASE_TIME: Duration = Duration::from_micros(89_700);
/// Writing a page takes 100µs per 32-bit word
const FLASH_PAGE_WRITE_TIME: Duration = Duration::from_micros(100 * (FLASH_PAGE_SIZE as u64 / 4));
const MIN_ERASE_TIME: Duration = Duration::from_millis(500);
const ACK_TIMEOUT: Duration = Duration::from_secs(1);
const SEND_ATTEMPTS: usize = 3;

/// Update mode announced in the start packet
const MODE_APPLICATION: u32 = 4;

/// A client able to update an nRF52 device
pub trait DfuClient {
    /// Transfer the application in the DFU zip `package` to the device.
    fn update(
        &mut self,
        package: &[u8],
        wipe: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;
}

/// Timing of the bootloader's flash operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashTiming {
    /// Pause after the start packet, while the bootloader erases
    pub erase: Duration,
    /// Pause after every flash page worth of data packets
    pub page_write: Duration,
    /// Pause after the stop packet, while the bootloader activates the image
    pub activate: Duration,
}

impl FlashTiming {
    /// Timing for an image of `image_size` bytes
    pub fn for_image(image_size: usize) -> Self {
        let pages = (image_size / FLASH_PAGE_SIZE) as u32 + 1;
        let erase = (FLASH_PAGE_ERASE_TIME * pages).max(MIN_ERASE_TIME);

        Self {
            erase,
            page_write: FLASH_PAGE_WRITE_TIME,
            activate: (FLASH_PAGE_WRITE_TIME * pages).max(erase),
        }
    }

    /// No pauses at all, for transports which are not real devices
    pub fn none() -> Self {
        Self {
            erase: Duration::ZERO,
            page_write: Duration::ZERO,
            activate: Duration::ZERO,
        }
    }
}

/// One DFU transfer over some byte transport
pub struct DfuSession<T: Read + Write> {
    transport: T,
    decoder: SlipDecoder,
    sequence: u8,
}

impl<T: Read + Write> DfuSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            decoder: SlipDecoder::new(),
            sequence: 0,
        }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Transfer `package` to the bootloader.
    pub fn run(
        &mut self,
        package: &DfuPackage,
        timing: FlashTiming,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), DfuError> {
        let image_size = package.firmware.len() as u32;
        info!("Starting DFU of a {image_size} byte application");

        // Soft device and bootloader sizes come first, neither is updated
        let mut start = Vec::with_capacity(16);
        start.extend_from_slice(&MODE_APPLICATION.to_le_bytes());
        start.extend_from_slice(&0u32.to_le_bytes());
        start.extend_from_slice(&0u32.to_le_bytes());
        start.extend_from_slice(&image_size.to_le_bytes());
        self.send(&payload(Opcode::StartPacket, &start))?;
        sleep(timing.erase);

        let mut init = package.init_packet.clone();
        init.extend_from_slice(&[0, 0]);
        self.send(&payload(Opcode::InitPacket, &init))?;

        progress.init(package.firmware.len());
        let mut sent = 0;
        for (index, chunk) in package.firmware.chunks(PACKET_MAX_SIZE).enumerate() {
            self.send(&payload(Opcode::DataPacket, chunk))?;
            sent += chunk.len();
            progress.update(sent);

            if (index + 1) % PACKETS_PER_PAGE == 0 {
                sleep(timing.page_write);
            }
        }

        self.send(&payload(Opcode::StopDataPacket, &[]))?;
        progress.finish();

        debug!("Waiting {:?} for the image to be activated", timing.activate);
        sleep(timing.activate);

        Ok(())
    }

    fn next_packet(&mut self, payload: &[u8]) -> Result<HciPacket, DfuError> {
        self.sequence = (self.sequence + 1) % SEQUENCE_MODULO;
        HciPacket::new(self.sequence, payload)
    }

    /// Send a packet and wait for its acknowledgement, retrying if needed.
    fn send(&mut self, payload: &[u8]) -> Result<(), DfuError> {
        let packet = self.next_packet(payload)?;

        let mut frame = Vec::with_capacity(packet.as_bytes().len() + 8);
        packet.write_to(&mut frame)?;

        for attempt in 1..=SEND_ATTEMPTS {
            self.transport.write_all(&frame)?;
            self.transport.flush()?;

            match self.read_ack() {
                Ok(ack) if ack == packet.expected_ack() => return Ok(()),
                Ok(ack) => warn!(
                    "Packet {} answered with ack {ack} (attempt {attempt})",
                    packet.sequence
                ),
                Err(DfuError::Timeout) => {
                    warn!("No ack for packet {} (attempt {attempt})", packet.sequence)
                }
                Err(e) => return Err(e),
            }
        }

        Err(DfuError::NotAcknowledged {
            sequence: packet.sequence,
            attempts: SEND_ATTEMPTS,
        })
    }

    fn read_ack(&mut self) -> Result<u8, DfuError> {
        let mut reply = Vec::new();
        self.decoder.decode(&mut self.transport, &mut reply)?;

        ack_number(&reply).ok_or(DfuError::FramingError)
    }
}

/// [DfuClient] talking to a bootloader on a serial port
pub struct SerialDfu {
    port: Box<dyn SerialPort>,
}

impl SerialDfu {
    /// Open the serial port of a device which is already in DFU mode.
    pub fn open(port: &str) -> Result<Self, Error> {
        let port = serialport::new(port, DFU_BAUD)
            .flow_control(FlowControl::None)
            .timeout(ACK_TIMEOUT)
            .open()?;

        Ok(Self { port })
    }
}

impl DfuClient for SerialDfu {
    fn update(
        &mut self,
        package: &[u8],
        wipe: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        if wipe {
            warn!("The nRF52 bootloader cannot erase the whole flash, only the application is replaced");
        }

        let package = DfuPackage::from_zip(package)?;
        let timing = FlashTiming::for_image(package.firmware.len());

        DfuSession::new(&mut self.port).run(&package, timing, progress)?;

        Ok(())
    }
}

/// Reboot the device on `port` into its DFU bootloader.
pub fn force_dfu_mode(port: &str) -> Result<(), Error> {
    info!("Forcing {port} into DFU mode");

    let serial = serialport::new(port, TOUCH_BAUD)
        .flow_control(FlowControl::None)
        .open()?;
    sleep(Duration::from_millis(100));
    drop(serial);

    // Give the bootloader time to enumerate
    sleep(Duration::from_millis(1500));

    Ok(())
}
