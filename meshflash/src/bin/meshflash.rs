use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};
use meshflash::{
    cli::{self, config::Config, ConnectArgs, FlashArgs, FlashFileArgs, ListArgs},
    logging::initialize_logger,
};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info", env = "MESHFLASH_LOG")]
    log_level: LevelFilter,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the devices and firmware offered by the catalog
    List(ListArgs),
    /// Pick a firmware from the catalog and flash it onto a device
    ///
    /// Without `--non-interactive`, a wizard asks for everything not given
    /// on the command line.
    #[command(disable_version_flag = true)]
    Flash(FlashArgs),
    /// Flash a firmware image from the local filesystem
    ///
    /// `.bin` images are written to ESP32 devices, anything else is treated
    /// as an nRF52 DFU package.
    FlashFile(FlashFileArgs),
    /// Open a serial console on a device
    Console(ConnectArgs),
    /// Reboot an nRF52 device into its DFU bootloader
    DfuMode(ConnectArgs),
    /// List the serial ports of this host
    ListPorts(ConnectArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Parse the arguments first, so that the log level applies to everything
    // below, or print the help message and exit.
    let args = Cli::parse();
    initialize_logger(args.log_level);
    debug!("{:#?}", args.subcommand);

    // Load any user configuration, if present.
    let config = Config::load()?;

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    match args.subcommand {
        Commands::List(args) => cli::list(args, &config),
        Commands::Flash(args) => cli::flash(args, &config),
        Commands::FlashFile(args) => cli::flash_file(args, &config),
        Commands::Console(args) => cli::console(args, &config),
        Commands::DfuMode(args) => cli::dfu_mode(args, &config),
        Commands::ListPorts(args) => cli::list_ports(args, &config),
    }
}
