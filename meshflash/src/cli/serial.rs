use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::warn;
use serialport::{available_ports, SerialPortInfo, SerialPortType, UsbPortInfo};

use super::{config::Config, ConnectArgs};
use crate::{cli::config::UsbDevice, error::Error};

/// Pick the serial port of the device to work with.
///
/// A port given on the command line takes precedence over the configured
/// one. Without either, the user picks from the detected ports; ports of
/// known MeshCore boards are highlighted and selected without asking when
/// they are the only one.
pub fn get_serial_port_info(args: &ConnectArgs, config: &Config) -> Result<SerialPortInfo, Error> {
    let ports = detect_serial_ports(args.list_all_ports)?;

    if let Some(serial) = &args.port {
        find_serial_port(&ports, serial)
    } else if let Some(serial) = &config.connection.serial {
        find_serial_port(&ports, serial)
    } else {
        let (port, known) = select_serial_port(ports, config)?;

        if let Some(info) = usb_info(&port).filter(|_| !known) {
            if remember_port()? {
                let device = UsbDevice {
                    vid: info.vid,
                    pid: info.pid,
                };
                if let Err(e) = config.save_with(|config| config.usb_device.push(device)) {
                    warn!("Could not remember {:04x}:{:04x}: {e}", device.vid, device.pid);
                }
            }
        }

        Ok(port)
    }
}

fn remember_port() -> Result<bool, Error> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this serial port for future use?")
        .interact_opt()?
        .unwrap_or_default())
}

/// Find the port named `name`, which may also be a symlink to it.
fn find_serial_port(ports: &[SerialPortInfo], name: &str) -> Result<SerialPortInfo, Error> {
    // Windows port names such as `COM4` cannot be canonicalized
    #[cfg(not(target_os = "windows"))]
    let name = std::fs::canonicalize(name)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| name.to_owned());
    #[cfg(target_os = "windows")]
    let name = name.to_owned();

    match ports
        .iter()
        .find(|port| port.port_name.eq_ignore_ascii_case(&name))
    {
        Some(port) => Ok(port.to_owned()),
        None => Err(Error::SerialNotFound(name)),
    }
}

/// Serial ports which may have a device behind them
pub fn detect_serial_ports(list_all_ports: bool) -> Result<Vec<SerialPortInfo>, Error> {
    let ports = available_ports()?
        .into_iter()
        .filter(|port_info| {
            list_all_ports
                || matches!(
                    &port_info.port_type,
                    SerialPortType::UsbPort(..) | SerialPortType::Unknown
                )
        })
        .collect::<Vec<_>>();

    Ok(ports)
}

/// USB devices of boards commonly running MeshCore
const KNOWN_DEVICES: &[UsbDevice] = &[
    UsbDevice {
        vid: 0x10c4,
        pid: 0xea60,
    }, // Silicon Labs CP210x UART Bridge
    UsbDevice {
        vid: 0x1a86,
        pid: 0x7523,
    }, // QinHeng Electronics CH340 serial converter
    UsbDevice {
        vid: 0x1a86,
        pid: 0x55d4,
    }, // QinHeng Electronics CH9102 serial converter
    UsbDevice {
        vid: 0x303a,
        pid: 0x1001,
    }, // Espressif USB JTAG/serial debug unit
    UsbDevice {
        vid: 0x239a,
        pid: 0x8029,
    }, // RAK4631 application
    UsbDevice {
        vid: 0x239a,
        pid: 0x0029,
    }, // Adafruit nRF52 bootloader
];

/// Whether `info` belongs to a known or remembered device
pub fn is_known_device(info: &UsbPortInfo, config: &Config) -> bool {
    config
        .usb_device
        .iter()
        .chain(KNOWN_DEVICES.iter())
        .any(|dev| dev.matches(info))
}

fn usb_info(port: &SerialPortInfo) -> Option<&UsbPortInfo> {
    match &port.port_type {
        SerialPortType::UsbPort(info) => Some(info),
        _ => None,
    }
}

/// Port name followed by the USB product, bold for known boards
fn port_label(port: &SerialPortInfo, config: &Config) -> String {
    let Some(info) = usb_info(port) else {
        return port.port_name.clone();
    };

    let name = if is_known_device(info, config) {
        port.port_name.as_str().bold().to_string()
    } else {
        port.port_name.clone()
    };

    match &info.product {
        Some(product) => format!("{name} - {product}"),
        None => name,
    }
}

/// Returns the chosen port and whether it is a known board.
fn select_serial_port(
    ports: Vec<SerialPortInfo>,
    config: &Config,
) -> Result<(SerialPortInfo, bool), Error> {
    let known = |port: &SerialPortInfo| {
        usb_info(port).is_some_and(|info| is_known_device(info, config))
    };

    match ports.as_slice() {
        [] => Err(Error::NoSerial),
        [port] if known(port) => Ok((port.clone(), true)),
        [port] => {
            let product = usb_info(port).and_then(|info| info.product.as_deref());
            if confirm_port(&port.port_name, product)? {
                Ok((port.clone(), false))
            } else {
                Err(Error::SerialNotFound(port.port_name.clone()))
            }
        }
        _ => {
            println!(
                "Found {} serial ports, known MeshCore boards are shown in bold.\n",
                ports.len()
            );

            let labels = ports
                .iter()
                .map(|port| port_label(port, config))
                .collect::<Vec<_>>();

            let index = Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Serial port")
                .items(&labels)
                .default(0)
                .interact_opt()?
                .ok_or(Error::Cancelled)?;

            let port = ports[index].clone();
            let matches = known(&port);
            Ok((port, matches))
        }
    }
}

fn confirm_port(port_name: &str, product: Option<&str>) -> Result<bool, Error> {
    let prompt = match product {
        Some(product) => format!("Use serial port '{port_name}' ({product})?"),
        None => format!("Use serial port '{port_name}'?"),
    };

    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .interact_opt()?
        .ok_or(Error::Cancelled)
}
