use clap::{value_parser, ArgAction, Parser};

/// Bring up a UFS host controller and the device behind it.
///
/// The controller is emulated; its shape is set by the options below.
#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose output. Can be repeated to increase verbosity.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Number of transfer request slots the controller reports.
    #[arg(long, default_value_t = 32, value_parser = value_parser!(u8).range(1..=32))]
    pub slots: u8,

    /// Highest HS gear the driver switches the link to.
    #[arg(long, value_name = "GEAR", default_value_t = 4)]
    pub max_hs_gear: u32,

    /// Highest HS gear the device's receiver supports. 0 means no HS support.
    #[arg(long, value_name = "GEAR", default_value_t = 4)]
    pub peer_max_hs_gear: u32,

    /// Number of connected data lanes per direction.
    #[arg(long, default_value_t = 2, value_parser = value_parser!(u32).range(1..=4))]
    pub lanes: u32,

    /// Keep the link in its start-up power mode.
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_power_mode: bool,

    /// Logical unit for READ CAPACITY and --read-lba.
    #[arg(long, default_value_t = 0)]
    pub lun: u8,

    /// Dump the block at this address.
    #[arg(long, value_name = "LBA")]
    pub read_lba: Option<u32>,
}
