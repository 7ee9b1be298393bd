//! Dispatching a selected firmware to the right programming protocol
//!
//! ESP32 devices are programmed through their ROM bootloader, nRF52 devices
//! through the DFU bootloader. Either way the [Dispatcher] keeps a
//! [FlashingState] describing what is going on, which front-ends render.

use std::fmt;

use log::{debug, error, info, warn};

use crate::{
    catalog::{DeviceType, FirmwareFile},
    dfu::{self, DfuClient, SerialDfu},
    error::Error,
    esp::{EspFlashOptions, EspLoader, EspflashLoader, ROM_BAUD},
    progress::{percentage, ProgressCallbacks},
    selection::Selection,
};

/// Messages written while flashing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashLog(String);

impl FlashLog {
    pub fn clean(&mut self) {
        self.0.clear();
    }

    pub fn write(&mut self, text: &str) {
        info!("{}", text.trim_end());
        self.0.push_str(text);
    }

    pub fn write_line(&mut self, line: &str) {
        self.write(line);
        self.0.push('\n');
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlashLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a front-end needs to show about a flashing run
#[derive(Debug, Clone, PartialEq)]
pub struct FlashingState {
    /// Whether serial access is available at all
    pub supported: bool,
    pub active: bool,
    pub percentage: f32,
    pub log: FlashLog,
    /// Message of the last failure, empty if there was none
    pub error: String,
    /// Set once an nRF52 has been forced into DFU mode
    pub dfu_complete: bool,
}

impl Default for FlashingState {
    fn default() -> Self {
        Self {
            supported: true,
            active: false,
            percentage: 0.0,
            log: FlashLog::default(),
            error: String::new(),
            dfu_complete: false,
        }
    }
}

impl FlashingState {
    fn reset(&mut self) {
        *self = Self {
            supported: self.supported,
            ..Self::default()
        };
    }
}

/// Opens connections to devices
pub trait Backend {
    /// Connect to the ROM bootloader of an ESP32.
    fn connect_esp(
        &mut self,
        port: &str,
        options: &EspFlashOptions,
    ) -> Result<Box<dyn EspLoader>, Error>;

    /// Open the DFU bootloader of an nRF52.
    fn open_dfu(&mut self, port: &str) -> Result<Box<dyn DfuClient>, Error>;

    /// Reboot an nRF52 into its DFU bootloader.
    fn enter_dfu_mode(&mut self, port: &str) -> Result<(), Error>;
}

/// [Backend] talking to real devices over serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialBackend;

impl Backend for SerialBackend {
    fn connect_esp(
        &mut self,
        port: &str,
        options: &EspFlashOptions,
    ) -> Result<Box<dyn EspLoader>, Error> {
        Ok(Box::new(EspflashLoader::connect(port, options)?))
    }

    fn open_dfu(&mut self, port: &str) -> Result<Box<dyn DfuClient>, Error> {
        Ok(Box::new(SerialDfu::open(port)?))
    }

    fn enter_dfu_mode(&mut self, port: &str) -> Result<(), Error> {
        dfu::force_dfu_mode(port)
    }
}

/// Keeps [FlashingState::percentage] current while passing progress on
struct Tracker<'a> {
    percentage: &'a mut f32,
    total: usize,
    observer: &'a mut dyn ProgressCallbacks,
}

impl ProgressCallbacks for Tracker<'_> {
    fn init(&mut self, total: usize) {
        self.total = total;
        *self.percentage = 0.0;
        self.observer.init(total);
    }

    fn update(&mut self, current: usize) {
        *self.percentage = percentage(current, self.total);
        self.observer.update(current);
    }

    fn finish(&mut self) {
        *self.percentage = 100.0;
        self.observer.finish();
    }
}

/// Programs the selected firmware onto a device
pub struct Dispatcher<B = SerialBackend> {
    pub selection: Selection,
    pub state: FlashingState,
    /// Baud rate used for ESP32 devices once connected
    pub baud: u32,
    backend: B,
    /// ESP32 connection kept after flashing until [Dispatcher::cleanup]
    instance: Option<Box<dyn EspLoader>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_backend(SerialBackend)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Dispatcher<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            selection: Selection::new(),
            state: FlashingState::default(),
            baud: ROM_BAUD,
            backend,
            instance: None,
        }
    }

    /// Flash the selected firmware onto the device on `port`.
    ///
    /// `read_image` loads the contents of the selected flash file. Failures
    /// are recorded in [FlashingState::error] as well as returned.
    pub fn flash<F>(
        &mut self,
        port: &str,
        read_image: F,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>
    where
        F: FnOnce(&FirmwareFile) -> Result<Vec<u8>, Error>,
    {
        if self.state.active {
            return Err(Error::Busy);
        }

        let kind = self.selection.ready()?.kind;
        let file = self.selection.flash_file()?.clone();
        let wipe = self.selection.wipe;

        self.state.log.clean();
        self.state.error.clear();
        self.state.percentage = 0.0;
        self.state.active = true;
        self.selection.port = Some(port.to_owned());

        let image = match read_image(&file) {
            Ok(image) => image,
            Err(e) => return Err(self.fail(Error::ReadFlashFile(e.to_string()))),
        };
        self.state
            .log
            .write_line(&format!("Read {} ({} bytes)", file.name, image.len()));

        // The held connection may own the very port we are about to open
        self.release_instance();

        let result = match kind {
            DeviceType::Esp32 => self.flash_esp32(port, &image, wipe, progress),
            DeviceType::Nrf52 => self.flash_nrf52(port, &image, wipe, progress),
        };

        match result {
            Ok(()) => {
                self.state.active = false;
                self.state.log.write_line("Done");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn flash_esp32(
        &mut self,
        port: &str,
        image: &[u8],
        wipe: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let options = EspFlashOptions {
            baud: self.baud,
            erase_all: wipe,
            ..EspFlashOptions::default()
        };

        self.state
            .log
            .write_line(&format!("Connecting to {port}..."));
        let mut loader = self
            .backend
            .connect_esp(port, &options)
            .map_err(|e| Error::EspInitialize(e.to_string()))?;

        match loader.chip_description() {
            Ok(chip) => self.state.log.write_line(&format!("Connected to {chip}")),
            Err(e) => warn!("Could not identify the chip: {e}"),
        }
        if wipe {
            self.state.log.write_line("Erasing flash...");
        }

        let mut tracker = Tracker {
            percentage: &mut self.state.percentage,
            total: 0,
            observer: progress,
        };
        if let Err(e) = loader.write_flash(image, &options, &mut tracker) {
            if let Err(reset) = loader.hard_reset() {
                warn!("Failed to reset the device: {reset}");
            }
            loader.disconnect();

            return Err(Error::EspFlashing(e.to_string()));
        }

        if let Err(e) = loader.hard_reset() {
            loader.disconnect();
            return Err(Error::EspFlashing(e.to_string()));
        }
        self.instance = Some(loader);

        Ok(())
    }

    fn flash_nrf52(
        &mut self,
        port: &str,
        image: &[u8],
        wipe: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.state
            .log
            .write_line(&format!("Starting DFU on {port}..."));

        let mut tracker = Tracker {
            percentage: &mut self.state.percentage,
            total: 0,
            observer: progress,
        };

        self.backend
            .open_dfu(port)
            .and_then(|mut client| client.update(image, wipe, &mut tracker))
            .map_err(|e| Error::NrfFlashing(e.to_string()))
    }

    fn fail(&mut self, error: Error) -> Error {
        error!("{error}");

        self.state.active = false;
        self.state.error = error.to_string();
        error
    }

    /// Reboot the nRF52 on `port` into its DFU bootloader.
    pub fn enter_dfu_mode(&mut self, port: &str) -> Result<(), Error> {
        self.backend.enter_dfu_mode(port)?;

        self.selection.port = Some(port.to_owned());
        self.state.dfu_complete = true;

        Ok(())
    }

    /// Forget the last run and the selection, releasing any held device.
    pub fn cleanup(&mut self) {
        self.state.reset();
        self.selection.reset();
        self.release_instance();
    }

    fn release_instance(&mut self) {
        if let Some(mut loader) = self.instance.take() {
            debug!("Releasing the ESP32 connection");
            if let Err(e) = loader.hard_reset() {
                warn!("Failed to reset the device: {e}");
            }
            loader.disconnect();
        }
    }

    /// Whether an ESP32 connection is still held
    pub fn holds_connection(&self) -> bool {
        self.instance.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        catalog::{tests::CATALOG, Catalog},
        progress::NoProgress,
    };

    type Calls = Rc<RefCell<Vec<String>>>;

    struct FakeLoader {
        calls: Calls,
        fail_write: bool,
        fail_reset: bool,
    }

    impl EspLoader for FakeLoader {
        fn chip_description(&mut self) -> Result<String, Error> {
            Ok("esp32s3".into())
        }

        fn write_flash(
            &mut self,
            data: &[u8],
            options: &EspFlashOptions,
            progress: &mut dyn ProgressCallbacks,
        ) -> Result<(), Error> {
            self.calls.borrow_mut().push(format!(
                "write {} erase={} at {:#x}",
                data.len(),
                options.erase_all,
                options.address
            ));
            if self.fail_write {
                return Err(Error::ConsoleClosed);
            }

            progress.init(data.len());
            progress.update(data.len() / 2);
            Ok(())
        }

        fn hard_reset(&mut self) -> Result<(), Error> {
            self.calls.borrow_mut().push("reset".into());
            if self.fail_reset {
                return Err(Error::ConsoleClosed);
            }
            Ok(())
        }

        fn disconnect(self: Box<Self>) {
            self.calls.borrow_mut().push("disconnect".into());
        }
    }

    struct FakeDfu {
        calls: Calls,
    }

    impl DfuClient for FakeDfu {
        fn update(
            &mut self,
            package: &[u8],
            wipe: bool,
            progress: &mut dyn ProgressCallbacks,
        ) -> Result<(), Error> {
            self.calls
                .borrow_mut()
                .push(format!("dfu {} wipe={wipe}", package.len()));

            progress.init(package.len());
            progress.update(package.len());
            progress.finish();
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        calls: Calls,
        refuse_connection: bool,
        fail_write: bool,
        fail_reset: bool,
    }

    impl Backend for FakeBackend {
        fn connect_esp(
            &mut self,
            port: &str,
            _options: &EspFlashOptions,
        ) -> Result<Box<dyn EspLoader>, Error> {
            self.calls.borrow_mut().push(format!("connect {port}"));
            if self.refuse_connection {
                return Err(Error::SerialNotFound(port.into()));
            }

            Ok(Box::new(FakeLoader {
                calls: self.calls.clone(),
                fail_write: self.fail_write,
                fail_reset: self.fail_reset,
            }))
        }

        fn open_dfu(&mut self, port: &str) -> Result<Box<dyn DfuClient>, Error> {
            self.calls.borrow_mut().push(format!("open {port}"));

            Ok(Box::new(FakeDfu {
                calls: self.calls.clone(),
            }))
        }

        fn enter_dfu_mode(&mut self, port: &str) -> Result<(), Error> {
            self.calls.borrow_mut().push(format!("touch {port}"));
            Ok(())
        }
    }

    fn dispatcher(backend: FakeBackend, device: usize, firmware: usize) -> Dispatcher<FakeBackend> {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let device = catalog.device[device].clone();
        let firmware = device.firmware[firmware].clone();

        let mut dispatcher = Dispatcher::with_backend(backend);
        dispatcher.selection.select_device(device);
        dispatcher.selection.select_firmware(firmware);
        dispatcher
    }

    fn image(_file: &FirmwareFile) -> Result<Vec<u8>, Error> {
        Ok(vec![0xE9; 64])
    }

    #[test]
    fn flash_esp32() {
        let backend = FakeBackend::default();
        let calls = backend.calls.clone();
        let mut dispatcher = dispatcher(backend, 0, 1);
        dispatcher.selection.set_wipe(true);

        dispatcher
            .flash("/dev/ttyUSB0", image, &mut NoProgress)
            .unwrap();

        assert_eq!(
            *calls.borrow(),
            ["connect /dev/ttyUSB0", "write 64 erase=true at 0x0", "reset"]
        );
        assert_eq!(dispatcher.state.percentage, 50.0);
        assert!(!dispatcher.state.active);
        assert!(dispatcher.state.error.is_empty());
        assert!(dispatcher.state.log.as_str().contains("Connected to esp32s3"));
        assert_eq!(dispatcher.selection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert!(dispatcher.holds_connection());

        dispatcher.cleanup();

        assert_eq!(calls.borrow()[3..], ["reset", "disconnect"]);
        assert!(!dispatcher.holds_connection());
        assert!(dispatcher.selection.device.is_none());
        assert_eq!(dispatcher.state, FlashingState::default());
    }

    #[test]
    fn esp32_connection_failure() {
        let backend = FakeBackend {
            refuse_connection: true,
            ..FakeBackend::default()
        };
        let mut dispatcher = dispatcher(backend, 0, 1);

        let result = dispatcher.flash("COM3", image, &mut NoProgress);

        assert!(matches!(result, Err(Error::EspInitialize(_))));
        assert!(dispatcher.state.error.starts_with(
            "Failed to initialize. Did you place the device into firmware download mode? Detail: "
        ));
        assert!(!dispatcher.state.active);
    }

    #[test]
    fn esp32_write_failure_resets_device() {
        let backend = FakeBackend {
            fail_write: true,
            ..FakeBackend::default()
        };
        let calls = backend.calls.clone();
        let mut dispatcher = dispatcher(backend, 0, 1);

        let result = dispatcher.flash("COM3", image, &mut NoProgress);

        assert!(matches!(result, Err(Error::EspFlashing(_))));
        assert!(dispatcher.state.error.starts_with("ESP32 flashing failed: "));
        assert_eq!(calls.borrow()[2..], ["reset", "disconnect"]);
        assert!(!dispatcher.holds_connection());
    }

    #[test]
    fn esp32_reset_failure_after_write() {
        let backend = FakeBackend {
            fail_reset: true,
            ..FakeBackend::default()
        };
        let calls = backend.calls.clone();
        let mut dispatcher = dispatcher(backend, 0, 1);

        let result = dispatcher.flash("COM3", image, &mut NoProgress);

        assert!(matches!(result, Err(Error::EspFlashing(_))));
        assert!(dispatcher.state.error.starts_with("ESP32 flashing failed: "));
        assert_eq!(calls.borrow()[2..], ["reset", "disconnect"]);
        assert!(!dispatcher.holds_connection());
    }

    #[test]
    fn second_flash_releases_held_connection() {
        let backend = FakeBackend::default();
        let calls = backend.calls.clone();
        let mut dispatcher = dispatcher(backend, 0, 1);

        dispatcher
            .flash("/dev/ttyUSB0", image, &mut NoProgress)
            .unwrap();
        dispatcher
            .flash("/dev/ttyUSB0", image, &mut NoProgress)
            .unwrap();

        assert_eq!(
            calls.borrow()[3..],
            [
                "reset",
                "disconnect",
                "connect /dev/ttyUSB0",
                "write 64 erase=false at 0x0",
                "reset"
            ]
        );
        assert!(dispatcher.holds_connection());
    }

    #[test]
    fn unreadable_image() {
        let mut dispatcher = dispatcher(FakeBackend::default(), 0, 1);

        let result = dispatcher.flash(
            "COM3",
            |file| Err(Error::SerialNotFound(file.name.clone())),
            &mut NoProgress,
        );

        assert!(matches!(result, Err(Error::ReadFlashFile(_))));
        assert_eq!(
            dispatcher.state.error,
            "Cannot read flash file: The serial port 'heltec_companion_110.bin' could not be found"
        );
    }

    #[test]
    fn flash_nrf52() {
        let backend = FakeBackend::default();
        let calls = backend.calls.clone();

        let mut dispatcher = Dispatcher::with_backend(backend);
        dispatcher
            .selection
            .load_custom_firmware(std::path::Path::new("RAK_4631_companion.zip"));
        dispatcher.selection.set_wipe(true);

        dispatcher
            .flash("/dev/ttyACM0", image, &mut NoProgress)
            .unwrap();

        assert_eq!(*calls.borrow(), ["open /dev/ttyACM0", "dfu 64 wipe=true"]);
        assert_eq!(dispatcher.state.percentage, 100.0);
        assert!(!dispatcher.holds_connection());
    }

    #[test]
    fn incomplete_selection_is_rejected() {
        let mut dispatcher = dispatcher(FakeBackend::default(), 1, 0);

        let result = dispatcher.flash("COM3", image, &mut NoProgress);

        assert!(matches!(result, Err(Error::EmptyVersion)));
        assert!(dispatcher.state.log.as_str().is_empty());
    }

    #[test]
    fn busy_dispatcher_refuses_second_flash() {
        let mut dispatcher = dispatcher(FakeBackend::default(), 0, 1);
        dispatcher.state.active = true;

        let result = dispatcher.flash("COM3", image, &mut NoProgress);

        assert!(matches!(result, Err(Error::Busy)));
    }

    #[test]
    fn enter_dfu_mode() {
        let backend = FakeBackend::default();
        let calls = backend.calls.clone();
        let mut dispatcher = Dispatcher::with_backend(backend);

        dispatcher.enter_dfu_mode("/dev/ttyACM0").unwrap();

        assert!(dispatcher.state.dfu_complete);
        assert_eq!(*calls.borrow(), ["touch /dev/ttyACM0"]);
    }

    #[test]
    fn flash_log() {
        let mut log = FlashLog::default();
        log.write("Erasing ");
        log.write_line("flash");
        log.write_line("Done");

        assert_eq!(log.as_str(), "Erasing flash\nDone\n");

        log.clean();
        assert_eq!(log.to_string(), "");
    }
}
