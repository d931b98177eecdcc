//! Command line surface of the firmware updater tool.

use clap::Parser;
use log::{error, Level};

use crate::config;
use crate::crossystem::HostEnv;
use crate::flashrom::Flashrom;
use crate::quirks;
use crate::updater::{self, UpdateError, UpdaterArgs, UpdaterConfig};

/// Update AP (and EC/PD) firmware on vboot devices
#[derive(Parser)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,

    /// Firmware image to update the main (AP) flash from
    #[arg(short, long)]
    image: Option<String>,

    /// Firmware image for the embedded controller
    #[arg(long)]
    ec_image: Option<String>,

    /// Firmware image for the power delivery controller
    #[arg(long)]
    pd_image: Option<String>,

    /// Read images from an archive (a directory or a ZIP file)
    #[arg(short, long)]
    archive: Option<String>,

    /// Firmware quirks to apply, as a NAME[=VALUE] list
    #[arg(long)]
    quirks: Option<String>,

    /// List the supported quirks and exit
    #[arg(long)]
    list_quirks: bool,

    /// Update mode (autoupdate, recovery, legacy, factory)
    #[arg(short, long)]
    mode: Option<String>,

    /// Stage the new firmware to be tried on the next boot
    #[arg(short = 't', long = "try")]
    try_update: bool,

    /// Proceed even if the compatibility checks fail
    #[arg(long)]
    force: bool,

    /// Run as factory install (needs write protection disabled)
    #[arg(long)]
    factory: bool,

    /// Change the flashrom programmer for the main image
    #[arg(short, long)]
    programmer: Option<String>,

    /// Redirect all writes into an emulation image file
    #[arg(long)]
    emulation: Option<String>,

    /// Override system properties, as a list of integers
    #[arg(long)]
    sys_props: Option<String>,

    /// Override the write protection state (0 or 1)
    #[arg(long)]
    wp: Option<String>,
}

pub fn run_with_args(args: &[String]) -> i32 {
    let cli = Cli::parse_from(args);

    env_logger::Builder::new()
        .filter_level(cli.verbosity.log_level_filter())
        .format_target(false)
        .format_timestamp(None)
        .init();

    let flashrom_verbosity = match cli.verbosity.log_level() {
        Some(Level::Trace) => 2,
        Some(Level::Debug) => 1,
        _ => 0,
    };
    let mut cfg = UpdaterConfig::new(
        Box::new(HostEnv),
        Box::new(Flashrom {
            verbosity: flashrom_verbosity,
        }),
    );

    if cli.list_quirks {
        quirks::print_supported(&cfg.quirks);
        return 0;
    }

    let file_config = config::load_config().unwrap_or_default();
    let updater_args = UpdaterArgs {
        image: cli.image,
        ec_image: cli.ec_image,
        pd_image: cli.pd_image,
        archive: cli.archive.or(file_config.archive),
        quirks: cli.quirks.or(file_config.quirks),
        mode: cli.mode,
        programmer: cli.programmer.or(file_config.programmer),
        emulation: cli.emulation,
        sys_props: cli.sys_props,
        write_protection: cli.wp,
        is_factory: cli.factory,
        try_update: cli.try_update,
        force_update: cli.force,
    };

    if let Err(err) = cfg.setup(&updater_args) {
        error!("Failed to set up the updater: {:?}", err);
        return 1;
    }

    let result = updater::update_firmware(&mut cfg);
    if result == UpdateError::Done {
        println!(">> Update completed.");
    } else {
        error!("{}", result.message());
    }
    result as i32
}
