//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use with the [meshflash]
//! command-line application, and are likely not of much use otherwise.
//!
//! Important note: The contents of this module DO NOT follow SemVer, as they
//! are only intended for use with the command-line application.
//!
//! [meshflash]: https://crates.io/crates/meshflash

use std::{
    io::{stdout, Write},
    path::PathBuf,
    str::FromStr,
};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use dialoguer::{theme::ColorfulTheme, BasicHistory, Completion, Input};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use miette::{IntoDiagnostic, Result, WrapErr};
use serialport::SerialPortType;

use self::{config::Config, serial::get_serial_port_info};
use crate::{
    catalog::{fetch_firmware, load_catalog, Catalog, CatalogSource, DeviceType},
    console::{complete_command, SerialConsole, COMMAND_REFERENCE, WELCOME},
    error::Error,
    flashing::Dispatcher,
    progress::ProgressCallbacks,
    selection::Selection,
};

pub mod config;
pub mod serial;
pub mod wizard;

/// Establish a connection with a target device
#[derive(Debug, Args, Clone)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "MESHFLASH_PORT")]
    pub port: Option<String>,
    /// List all available ports, not only USB serial ports
    #[arg(long)]
    pub list_all_ports: bool,
}

/// Where to load the firmware catalog from
#[derive(Debug, Args, Clone)]
#[non_exhaustive]
pub struct CatalogArgs {
    /// Base URL of a web flasher deployment, or a local catalog directory
    #[arg(short = 'c', long, env = "MESHFLASH_CATALOG")]
    pub catalog: Option<String>,
    /// Location of the releases document, relative to the catalog
    #[arg(long)]
    pub releases: Option<String>,
}

/// List the devices and firmware in the catalog
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ListArgs {
    /// Only list the firmware of this device
    #[arg(short = 'd', long)]
    pub device: Option<String>,
    #[clap(flatten)]
    pub catalog_args: CatalogArgs,
}

/// Flash firmware from the catalog
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashArgs {
    /// Device to flash, as named in the catalog
    #[arg(short = 'd', long)]
    pub device: Option<String>,
    /// Firmware title or role
    #[arg(short = 'f', long, requires = "device")]
    pub firmware: Option<String>,
    /// Firmware version, the newest one if omitted
    #[arg(short = 'v', long, requires = "firmware")]
    pub version: Option<String>,
    #[clap(flatten)]
    pub flash_args: FlashOptionArgs,
    #[clap(flatten)]
    pub catalog_args: CatalogArgs,
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
}

/// Flash a firmware image from the local filesystem
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct FlashFileArgs {
    /// Image to flash: a .bin for ESP32 or a DFU .zip package for nRF52
    pub image: PathBuf,
    #[clap(flatten)]
    pub flash_args: FlashOptionArgs,
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
}

/// Options shared by the flashing commands
#[derive(Debug, Args, Clone)]
#[non_exhaustive]
pub struct FlashOptionArgs {
    /// Erase the entire flash before writing
    #[arg(long)]
    pub wipe: bool,
    /// Never prompt, fail instead of asking
    #[arg(long)]
    pub non_interactive: bool,
    /// Open the serial console after flashing
    #[arg(long)]
    pub console: bool,
}

/// Shows progress of a device operation as a progress bar
#[derive(Default)]
pub struct FlashProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, total: usize) {
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.set_message("Flashing");

        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(ref pb) = self.pb {
            pb.finish_with_message("Done");
        }
    }
}

/// Resolve the catalog source from the arguments and configuration.
pub fn catalog_source(args: &CatalogArgs, config: &Config) -> Result<CatalogSource, Error> {
    let location = args
        .catalog
        .as_deref()
        .or(config.catalog.url.as_deref())
        .ok_or(Error::NoCatalog)?;

    CatalogSource::from_str(location)
}

fn open_catalog(args: &CatalogArgs, config: &Config) -> Result<(CatalogSource, Catalog)> {
    let source = catalog_source(args, config)?;
    let releases = args
        .releases
        .as_deref()
        .or(config.catalog.releases.as_deref());

    let catalog = load_catalog(&source, releases)
        .wrap_err_with(|| format!("Failed to load the catalog from {source}"))?;

    Ok((source, catalog))
}

fn header(title: &str, color: Color) -> Cell {
    Cell::new(title).fg(color).add_attribute(Attribute::Bold)
}

/// Render the firmware offered for each device.
pub fn catalog_table(catalog: &Catalog, device: Option<&str>) -> Result<Table, Error> {
    let devices = match device {
        Some(name) => vec![catalog.find_device(name)?],
        None => catalog.device.iter().collect(),
    };

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            header("Device", Color::Green),
            header("Type", Color::Cyan),
            header("Firmware", Color::Magenta),
            header("Versions", Color::Yellow),
        ]);

    for device in devices {
        for firmware in &device.firmware {
            let versions = firmware.version.keys().map(String::as_str).collect::<Vec<_>>();

            table.add_row(vec![
                Cell::new(&device.name),
                Cell::new(device.kind),
                Cell::new(catalog.role_value(firmware, "title")),
                Cell::new(if versions.is_empty() {
                    "-".to_owned()
                } else {
                    versions.join(", ")
                }),
            ]);
        }
    }

    Ok(table)
}

/// List the catalog
pub fn list(args: ListArgs, config: &Config) -> Result<()> {
    let (_, catalog) = open_catalog(&args.catalog_args, config)?;

    println!("{}", catalog_table(&catalog, args.device.as_deref())?);

    Ok(())
}

/// List the serial ports of the host
pub fn list_ports(args: ConnectArgs, config: &Config) -> Result<()> {
    let ports = serial::detect_serial_ports(args.list_all_ports)?;
    if ports.is_empty() {
        return Err(Error::NoSerial.into());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            header("Port", Color::Green),
            header("VID:PID", Color::Cyan),
            header("Product", Color::Magenta),
            header("Known", Color::Yellow),
        ]);

    for port in ports {
        let (ids, product, known) = match &port.port_type {
            SerialPortType::UsbPort(info) => (
                format!("{:04x}:{:04x}", info.vid, info.pid),
                info.product.clone().unwrap_or_default(),
                serial::is_known_device(info, config),
            ),
            _ => (String::new(), String::new(), false),
        };

        table.add_row(vec![
            Cell::new(port.port_name),
            Cell::new(ids),
            Cell::new(product),
            Cell::new(if known { "yes" } else { "" }),
        ]);
    }

    println!("{table}");

    Ok(())
}

/// Flash firmware chosen from the catalog
pub fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let (source, catalog) = open_catalog(&args.catalog_args, config)?;

    let mut dispatcher = Dispatcher::new();
    preselect(&args, &catalog, &mut dispatcher.selection)?;

    if !args.flash_args.non_interactive {
        wizard::choose(&catalog, &mut dispatcher.selection)?;
    }

    run_flash(
        &mut dispatcher,
        &args.flash_args,
        &args.connect_args,
        config,
        |file| fetch_firmware(&source, &catalog, file),
    )
}

/// Apply the selection given on the command line.
fn preselect(args: &FlashArgs, catalog: &Catalog, selection: &mut Selection) -> Result<(), Error> {
    let Some(device) = &args.device else {
        return Ok(());
    };
    let device = catalog.find_device(device)?;
    selection.select_device(device.clone());

    let Some(firmware) = &args.firmware else {
        return Ok(());
    };
    selection.select_firmware(device.find_firmware(firmware)?.clone());

    if let Some(version) = &args.version {
        selection.select_version(version)?;
    }

    Ok(())
}

/// Flash an image from the local filesystem
pub fn flash_file(args: FlashFileArgs, config: &Config) -> Result<()> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.selection.load_custom_firmware(&args.image);

    run_flash(
        &mut dispatcher,
        &args.flash_args,
        &args.connect_args,
        config,
        |file| match &file.local {
            Some(path) => std::fs::read(path)
                .map_err(|e| Error::FileOpenError(path.display().to_string(), e)),
            None => Err(Error::MissingFlashFile),
        },
    )
}

fn run_flash<F>(
    dispatcher: &mut Dispatcher,
    flash_args: &FlashOptionArgs,
    connect_args: &ConnectArgs,
    config: &Config,
    read_image: F,
) -> Result<()>
where
    F: FnOnce(&crate::catalog::FirmwareFile) -> Result<Vec<u8>, Error>,
{
    let device = dispatcher.selection.ready()?;
    let kind = device.kind;
    info!(
        "Flashing {} {} onto {}",
        dispatcher
            .selection
            .firmware
            .as_ref()
            .map(|firmware| firmware.title.as_str())
            .unwrap_or_default(),
        dispatcher.selection.version.as_deref().unwrap_or_default(),
        device.name
    );

    let wipe = if flash_args.wipe || flash_args.non_interactive {
        flash_args.wipe
    } else {
        wizard::confirm_wipe()?
    };
    dispatcher.selection.set_wipe(wipe);
    if let Some(baud) = config.connection.baud {
        dispatcher.baud = baud;
    }

    if kind == DeviceType::Nrf52 {
        println!("Make sure the device is in DFU mode: double-tap its reset button, or run `meshflash dfu-mode`.");
    }

    let port = get_serial_port_info(connect_args, config)?.port_name;
    debug!("Using serial port {port}");

    dispatcher.flash(&port, read_image, &mut FlashProgress::default())?;
    println!("Flashing has completed!");

    if flash_args.console {
        // The ESP32 connection holds the port until it is released
        dispatcher.cleanup();
        run_console(&port)?;
    }

    Ok(())
}

/// Reboot an nRF52 into its DFU bootloader
pub fn dfu_mode(args: ConnectArgs, config: &Config) -> Result<()> {
    let port = get_serial_port_info(&args, config)?.port_name;

    let mut dispatcher = Dispatcher::new();
    dispatcher.enter_dfu_mode(&port)?;

    if dispatcher.state.dfu_complete {
        println!("{port} has been switched to DFU mode, the device may now show up under a new port name.");
    }

    Ok(())
}

struct CommandCompletion;

impl Completion for CommandCompletion {
    fn get(&self, input: &str) -> Option<String> {
        complete_command(input).map(str::to_owned)
    }
}

/// The command reference as a table
pub fn command_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            header("Command", Color::Green),
            header("Description", Color::Cyan),
        ]);

    for (command, description) in COMMAND_REFERENCE {
        table.add_row(vec![Cell::new(command.trim_end()), Cell::new(description)]);
    }

    table
}

/// Open the serial console
pub fn console(args: ConnectArgs, config: &Config) -> Result<()> {
    let port = get_serial_port_info(&args, config)?.port_name;

    run_console(&port)
}

fn run_console(port: &str) -> Result<()> {
    let mut console = SerialConsole::connect(
        port,
        Box::new(|text: &str| {
            print!("{text}");
            stdout().flush().ok();
        }),
    )?;

    for line in WELCOME {
        println!("{line}");
    }
    println!("Type `exit` or press Esc to leave.\n");

    let theme = ColorfulTheme::default();
    let completion = CommandCompletion;
    let mut history = BasicHistory::new().max_entries(32).no_duplicates(true);

    loop {
        let command = Input::<String>::with_theme(&theme)
            .allow_empty(true)
            .completion_with(&completion)
            .history_with(&mut history)
            .interact_text()
            .into_diagnostic()
            .wrap_err("Failed to read a command")?;

        match command.trim() {
            "" => continue,
            "exit" | "quit" => break,
            "help" => println!("{}", command_table()),
            command => console.send_command(command)?,
        }
    }

    console.disconnect();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::CATALOG;

    fn catalog_args(catalog: Option<&str>) -> CatalogArgs {
        CatalogArgs {
            catalog: catalog.map(str::to_owned),
            releases: None,
        }
    }

    #[test]
    fn catalog_source_precedence() {
        let mut config = Config::default();
        assert!(matches!(
            catalog_source(&catalog_args(None), &config),
            Err(Error::NoCatalog)
        ));

        config.catalog.url = Some("https://flasher.meshcore.co.uk".into());
        assert_eq!(
            catalog_source(&catalog_args(None), &config)
                .unwrap()
                .to_string(),
            "https://flasher.meshcore.co.uk/"
        );
        assert_eq!(
            catalog_source(&catalog_args(Some("catalog")), &config).unwrap(),
            CatalogSource::Local(PathBuf::from("catalog"))
        );
    }

    #[test]
    fn preselect_from_arguments() {
        let catalog = Catalog::from_json(CATALOG).unwrap();
        let args = FlashArgs {
            device: Some("heltec v3".into()),
            firmware: Some("companion".into()),
            version: Some("v1.0.0".into()),
            flash_args: FlashOptionArgs {
                wipe: false,
                non_interactive: true,
                console: false,
            },
            catalog_args: catalog_args(None),
            connect_args: ConnectArgs {
                port: None,
                list_all_ports: false,
            },
        };

        let mut selection = Selection::new();
        preselect(&args, &catalog, &mut selection).unwrap();

        assert_eq!(selection.device.unwrap().name, "Heltec V3");
        assert_eq!(selection.firmware.unwrap().title, "Companion (USB)");
        assert_eq!(selection.version.as_deref(), Some("v1.0.0"));
    }

    #[test]
    fn catalog_table_lists_firmware() {
        let catalog = Catalog::from_json(CATALOG).unwrap();

        let table = catalog_table(&catalog, None).unwrap().to_string();
        assert!(table.contains("Heltec V3"));
        assert!(table.contains("v1.1.0, v1.0.0"));
        assert!(table.contains("RAK 4631"));

        let table = catalog_table(&catalog, Some("rak 4631")).unwrap().to_string();
        assert!(!table.contains("Heltec V3"));

        assert!(matches!(
            catalog_table(&catalog, Some("T-Beam")),
            Err(Error::UnknownDevice(_))
        ));
    }

    #[test]
    fn command_completion() {
        assert_eq!(
            CommandCompletion.get("set na").as_deref(),
            Some("set name ")
        );
        assert!(command_table().to_string().contains("set guest.password"));
    }
}
