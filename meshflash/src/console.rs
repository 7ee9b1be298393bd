//! Serial console bridge
//!
//! MeshCore firmware accepts text commands on its serial port. A
//! [SerialConsole] forwards whatever the device prints to an output sink
//! from a background reader thread, while commands are written from the
//! caller's thread.

use std::{
    io::{ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error};
use serialport::FlowControl;

use crate::error::Error;

/// Baud rate of the MeshCore command interface
pub const CONSOLE_BAUD: u32 = 115_200;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Printed when a console is opened
pub const WELCOME: &[&str] = &[
    "Welcome to MeshCore serial console.",
    "If you came here right after flashing, please restart your device.",
    "Press TAB to complete a command, type `help` to list all supported commands.",
];

/// Known commands, as the prefix typed on the console and a description
pub const COMMAND_REFERENCE: &[(&str, &str)] = &[
    ("time ", "Set time {epoch-secs}"),
    ("erase", "Erase filesystem"),
    ("advert", "Send Advertisment packet"),
    ("reboot", "Reboot device"),
    ("clock", "Display current time"),
    ("password ", "Set new password"),
    ("log", "Ouput log"),
    ("log start", "Start packet logging to file system"),
    ("log stop", "Stop packet logging to file system"),
    ("log erase", "Erase the packet logs from file system"),
    ("ver", "Show device version"),
    ("set freq ", "Set frequency {Mhz}"),
    ("set af ", "Set Air-time factor"),
    ("set tx ", "Set Tx power {dBm}"),
    ("set repeat ", "Set repeater mode {on|off}"),
    ("set advert.interval ", "Set advert rebroadcast interval {minutes}"),
    ("set guest.password ", "Set guest password"),
    ("set name ", "Set advertisement name"),
    ("set lat", "Set the advertisement map latitude"),
    ("set lon", "Set the advertisement map longitude"),
    ("get freq ", "Get frequency (Mhz)"),
    ("get af", "Get Air-time factor"),
    ("get tx", "Get Tx power (dBm)"),
    ("get repeat", "Get repeater mode"),
    ("get advert.interval", "Get advert rebroadcast interval (minutes)"),
    ("get name", "Get advertisement name"),
    ("get lat", "Get the advertisement map latitude"),
    ("get lon", "Get the advertisement map longitude"),
];

/// Complete a partially typed command.
///
/// Returns the first known command extending `input`, nothing if `input`
/// is empty or already a complete command.
pub fn complete_command(input: &str) -> Option<&'static str> {
    if input.is_empty() {
        return None;
    }

    COMMAND_REFERENCE
        .iter()
        .map(|(command, _)| *command)
        .find(|command| command.starts_with(input) && *command != input)
}

/// Receives text printed by the device
pub type OutputSink = Box<dyn FnMut(&str) + Send>;

/// An open console session
pub struct SerialConsole {
    writer: Box<dyn Write + Send>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialConsole {
    /// Open the console on `port`, forwarding device output to `on_output`.
    pub fn connect(port: &str, on_output: OutputSink) -> Result<Self, Error> {
        debug!("Opening serial console on {port}");

        let serial = serialport::new(port, CONSOLE_BAUD)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader = serial.try_clone()?;

        Ok(Self::with_transport(reader, serial, on_output))
    }

    /// Run a console over an already open transport.
    pub fn with_transport<R, W>(mut reader: R, writer: W, mut on_output: OutputSink) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));

        let stopped = stop.clone();
        let handle = thread::spawn(move || {
            let mut decoder = TextDecoder::default();
            let mut buff = [0; 1024];

            while !stopped.load(Ordering::Relaxed) {
                let read_count = match reader.read(&mut buff) {
                    Ok(0) => break,
                    Ok(count) => count,
                    Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                        continue
                    }
                    Err(e) => {
                        error!("Serial console read failed: {e}");
                        break;
                    }
                };

                let text = decoder.decode(&buff[..read_count]);
                if !text.is_empty() {
                    on_output(&text);
                }
            }

            debug!("Serial console reader stopped");
        });

        Self {
            writer: Box::new(writer),
            stop,
            reader: Some(handle),
        }
    }

    /// Send one command line to the device.
    pub fn send_command(&mut self, text: &str) -> Result<(), Error> {
        if self.reader.is_none() {
            return Err(Error::ConsoleClosed);
        }
        debug!("Sending command: {text}");

        self.writer.write_all(text.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;

        Ok(())
    }

    /// Stop the reader and close the port.
    pub fn disconnect(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                error!("Serial console reader panicked");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }
}

impl Drop for SerialConsole {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Turns a byte stream into text, keeping multi-byte characters which are
/// split across reads intact
#[derive(Debug, Default)]
struct TextDecoder {
    pending: Vec<u8>,
    prev_was_cr: bool,
}

impl TextDecoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        // Invalid bytes are flushed as replacement characters, only an
        // incomplete sequence at the very end is kept for the next read
        let mut start = 0;
        let complete = loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(_) => break self.pending.len(),
                Err(e) => match e.error_len() {
                    Some(len) => start += e.valid_up_to() + len,
                    None => break start + e.valid_up_to(),
                },
            }
        };

        let rest = self.pending.split_off(complete);
        let chunk = std::mem::replace(&mut self.pending, rest);

        let text = normalized(chunk.into_iter(), &mut self.prev_was_cr).collect::<Vec<_>>();
        String::from_utf8_lossy(&text).into_owned()
    }
}

struct Normalized<'a, I> {
    iter: I,
    prev_was_cr: &'a mut bool,
}

impl<I> Iterator for Normalized<'_, I>
where
    I: Iterator<Item = u8>,
{
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        loop {
            match self.iter.next() {
                Some(b'\n') if *self.prev_was_cr => {
                    *self.prev_was_cr = false;
                }
                Some(b'\r') => {
                    *self.prev_was_cr = true;
                    return Some(b'\n');
                }
                Some(byte) => {
                    *self.prev_was_cr = false;
                    return Some(byte);
                }
                None => return None,
            }
        }
    }
}

/// Normalize CRLF and lone CR line endings to LF.
///
/// `prev_was_cr` carries state across chunks, so a CRLF split between two
/// reads still yields a single line break.
fn normalized<'a>(
    iter: impl Iterator<Item = u8> + 'a,
    prev_was_cr: &'a mut bool,
) -> impl Iterator<Item = u8> + 'a {
    Normalized { iter, prev_was_cr }
}
